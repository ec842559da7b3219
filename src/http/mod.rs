//! HTTP/1.x engine.
//!
//! This module implements an HTTP/1.0 and HTTP/1.1 server and a
//! single-connection client transport over the crate's [`Stream`]
//! abstraction.
//!
//! # Architecture
//!
//! - **`connection`**: the per-connection pipeline driving parse, dispatch,
//!   response and keep-alive reuse; home of [`HttpServer`]
//! - **`request`** / **`response`**: head representations and parsers
//! - **`header`**: the case-insensitive multi-valued header map
//! - **`body`**: body framing (fixed length, chunked, close-delimited)
//! - **`writer`**: the response writer state machine and the chunked
//!   encoder
//! - **`conn`**: the buffered halves of the connection
//! - **`transport`**: one-connection round trips for clients
//! - **`upgrade`**: dispatch of `Connection: Upgrade` handshakes
//!
//! # Connection lifecycle
//!
//! ```text
//!   idle wait ──► read head ──► run handler ──► flush response ─┐
//!       ▲                                                       │
//!       │                  keep-alive                           │
//!       └────────────── drain request body ◄────────────────────┤
//!                                                               │
//!                      close / error / hijack ──► connection ends
//! ```
//!
//! An upgrade handshake runs a dedicated handler which answers `101`,
//! hijacks the connection away from the engine, and continues with the new
//! protocol on the raw stream.
//!
//! [`Stream`]: crate::conn::Stream
//! [`HttpServer`]: connection::HttpServer

pub mod body;
pub mod conn;
pub mod connection;
pub mod header;
pub mod request;
pub mod response;
pub mod transport;
pub mod upgrade;
pub mod writer;

pub use body::Body;
pub use connection::{HttpHandler, HttpServer, Request, StatusHandler, DEFAULT_MAX_HEADER_BYTES};
pub use header::HeaderMap;
pub use request::{parse_request_head, Method, ParseError, RequestHead};
pub use response::{body_forbidden, parse_response_head, status_text, ResponseHead};
pub use transport::{ClientRequest, ClientResponse, ConnTransport};
pub use upgrade::UpgradeMux;
pub use writer::{Hijacked, ResponseWriter, WriteError};
