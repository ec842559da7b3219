//! Junction - building blocks for TCP and unix-domain network services.
//!
//! The crate stacks up from byte streams to protocols: a connection
//! [`Server`] accepts streams and runs handlers, a protocol
//! [`mux`](crate::mux) routes connections by their first bytes, tunnels and
//! proxies splice streams together, and the [`http`] module layers an
//! HTTP/1.x engine on top.

pub mod config;
pub mod conn;
pub mod copy;
pub mod error;
pub mod handler;
pub mod http;
pub mod listen;
pub mod mux;
pub mod poll;
pub mod proxy;
pub mod server;
pub mod tunnel;

pub use conn::{MultiAddr, NetAddr, PrefixStream, Stream};
pub use copy::{copy, copy_stream};
pub use handler::{
    Echo, EchoLine, Handler, HandlerFn, PacketHandler, Pass, ProxyHandler, TunnelHandler,
};
pub use listen::{listen, listen_packet, Accept, Listener, MultiListener, PacketConn};
pub use mux::{
    Probe, Proto, ProtoMux, ProxyProto, ProxyProtoMux, Sniffer, TunnelProto, TunnelProtoMux,
    UnsupportedProtocol,
};
pub use proxy::{original_target_addr, Proxy, TransparentProxy};
pub use server::{listen_and_serve, serve_packets, Server};
pub use tunnel::{dial_default, DialFn, Forwarder, Tunnel, TunnelLine};
