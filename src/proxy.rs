//! Proxy handlers.
//!
//! A [`Proxy`] forwards every connection to a fixed target. A
//! [`TransparentProxy`] serves connections that were redirected to the
//! listener by a firewall rule, recovering the address the peer was
//! actually trying to reach from the intercepted socket.

use std::io;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::conn::{NetAddr, Stream};
use crate::handler::{Handler, ProxyHandler};

use std::sync::Arc;

/// A connection handler that forwards its connections to a proxy handler
/// with a fixed target address.
pub struct Proxy {
    /// Target network, e.g. `tcp` or `unix`.
    pub network: String,

    /// Target address.
    pub address: String,

    /// Proxy handler receiving the connections.
    pub handler: Arc<dyn ProxyHandler>,
}

#[async_trait]
impl Handler for Proxy {
    async fn serve_conn(
        &self,
        ctx: CancellationToken,
        conn: Box<dyn Stream>,
    ) -> anyhow::Result<()> {
        let target = NetAddr::new(self.network.clone(), self.address.clone());
        self.handler.serve_proxy(ctx, conn, target).await
    }
}

/// A connection handler for intercepted connections.
///
/// Using it requires firewall rules redirecting TCP connections to the
/// listener it is attached to; the pre-redirect destination is recovered
/// from the socket and passed to the proxy handler as the target.
pub struct TransparentProxy {
    pub handler: Arc<dyn ProxyHandler>,
}

#[async_trait]
impl Handler for TransparentProxy {
    async fn serve_conn(
        &self,
        ctx: CancellationToken,
        conn: Box<dyn Stream>,
    ) -> anyhow::Result<()> {
        let target = original_target_addr(conn.as_ref())?;
        debug!(target = %target, "intercepted connection");
        self.handler.serve_proxy(ctx, conn, target).await
    }
}

/// Returns the original address that an intercepted connection intended to
/// reach.
///
/// Only available for TCP sockets on Linux; everywhere else, and for
/// streams not backed by a descriptor, the lookup fails.
pub fn original_target_addr(conn: &dyn Stream) -> io::Result<NetAddr> {
    let fd = conn.raw_fd().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::Unsupported,
            "stream is not backed by an OS descriptor",
        )
    })?;
    original_target_addr_fd(fd)
}

#[cfg(target_os = "linux")]
fn original_target_addr_fd(fd: std::os::fd::RawFd) -> io::Result<NetAddr> {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

    // Defined by netfilter; absent from the libc bindings.
    const SO_ORIGINAL_DST: libc::c_int = 80;

    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IP,
            SO_ORIGINAL_DST,
            &mut storage as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    let addr = match i32::from(storage.ss_family) {
        libc::AF_INET => {
            let sa = unsafe { &*(&storage as *const _ as *const libc::sockaddr_in) };
            SocketAddr::new(
                IpAddr::V4(Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr))),
                u16::from_be(sa.sin_port),
            )
        }
        libc::AF_INET6 => {
            let sa = unsafe { &*(&storage as *const _ as *const libc::sockaddr_in6) };
            SocketAddr::new(
                IpAddr::V6(Ipv6Addr::from(sa.sin6_addr.s6_addr)),
                u16::from_be(sa.sin6_port),
            )
        }
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unsupported socket family on intercepted connection",
            ))
        }
    };

    Ok(NetAddr::tcp(addr))
}

#[cfg(not(target_os = "linux"))]
fn original_target_addr_fd(_fd: std::os::fd::RawFd) -> io::Result<NetAddr> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "intercepted-destination lookup is only available on linux",
    ))
}
