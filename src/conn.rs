//! Connection primitives.
//!
//! Everything in the crate that moves bytes goes through the [`Stream`]
//! trait: a bidirectional byte stream with addresses, an optional OS
//! descriptor capability, and read-readiness notification. Concrete
//! implementations are provided for TCP and unix-domain sockets; wrappers
//! such as [`PrefixStream`] forward the capabilities of the stream they
//! decorate.

use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixStream};

/// A network address as a `(network, address)` pair of strings, e.g.
/// `("tcp", "127.0.0.1:4242")` or `("unix", "/var/run/app.sock")`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetAddr {
    pub net: String,
    pub addr: String,
}

impl NetAddr {
    pub fn new(net: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            net: net.into(),
            addr: addr.into(),
        }
    }

    /// Address of a TCP socket.
    pub fn tcp(addr: std::net::SocketAddr) -> Self {
        Self::new("tcp", addr.to_string())
    }

    /// Address of a unix-domain socket. Unnamed sockets render as `@`.
    pub fn unix(addr: &tokio::net::unix::SocketAddr) -> Self {
        let s = addr
            .as_pathname()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| "@".to_string());
        Self::new("unix", s)
    }
}

impl fmt::Display for NetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.addr)
    }
}

/// A compound address, produced by listeners that are bound to more than one
/// endpoint. Renders as the comma-separated list of its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiAddr(pub Vec<NetAddr>);

impl MultiAddr {
    /// The comma-separated list of networks, mirroring the address form.
    pub fn net(&self) -> String {
        self.0
            .iter()
            .map(|a| a.net.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for MultiAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, a) in self.0.iter().enumerate() {
            if i != 0 {
                f.write_str(",")?;
            }
            write!(f, "{a}")?;
        }
        Ok(())
    }
}

/// A reliable bidirectional byte stream.
///
/// `raw_fd` is a capability: it returns the OS descriptor backing the stream
/// when there is one. Wrappers forward it to the stream they decorate, so a
/// caller holding any number of decoration layers can still reach the
/// socket underneath (the readiness poller and the intercepted-destination
/// lookup both need it). Streams with no descriptor return `None` and the
/// caller falls back to a portable path.
#[async_trait]
pub trait Stream: AsyncRead + AsyncWrite + Send + Sync + Unpin {
    fn local_addr(&self) -> io::Result<NetAddr>;

    fn peer_addr(&self) -> io::Result<NetAddr>;

    /// The OS descriptor backing this stream, if any.
    fn raw_fd(&self) -> Option<RawFd> {
        None
    }

    /// Bytes the stream holds ahead of the socket, waiting to be replayed
    /// by the next reads. Anyone waiting on descriptor readiness must
    /// consume these first: they were already taken off the wire, so the
    /// socket will not signal for them again.
    fn read_ahead(&self) -> &[u8] {
        &[]
    }

    /// Direct-write capability: a stream that can deliver everything it
    /// will produce straight to `w`, without the caller borrowing an
    /// intermediate buffer. `None` means no direct path exists and the
    /// caller falls back to buffered copying.
    async fn write_to(
        &mut self,
        _w: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Option<io::Result<u64>> {
        None
    }

    /// Direct-read capability, the mirror of [`write_to`](Stream::write_to):
    /// a stream that can pull everything `r` produces straight in.
    async fn read_from(
        &mut self,
        _r: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Option<io::Result<u64>> {
        None
    }

    /// Waits until a read can be performed without blocking. The default
    /// implementation reports the stream as immediately readable, which is
    /// the right degenerate answer for in-memory streams.
    async fn readable(&self) -> io::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Stream for TcpStream {
    fn local_addr(&self) -> io::Result<NetAddr> {
        TcpStream::local_addr(self).map(NetAddr::tcp)
    }

    fn peer_addr(&self) -> io::Result<NetAddr> {
        TcpStream::peer_addr(self).map(NetAddr::tcp)
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.as_raw_fd())
    }

    async fn readable(&self) -> io::Result<()> {
        TcpStream::readable(self).await
    }
}

#[async_trait]
impl Stream for UnixStream {
    fn local_addr(&self) -> io::Result<NetAddr> {
        UnixStream::local_addr(self).map(|a| NetAddr::unix(&a))
    }

    fn peer_addr(&self) -> io::Result<NetAddr> {
        UnixStream::peer_addr(self).map(|a| NetAddr::unix(&a))
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.as_raw_fd())
    }

    async fn readable(&self) -> io::Result<()> {
        UnixStream::readable(self).await
    }
}

/// A stream preloaded with bytes that were already consumed from the wire.
///
/// Reads drain the preloaded bytes first, then fall through to the inner
/// stream, so the consumer observes the byte sequence exactly as the peer
/// sent it. The protocol multiplexer uses this to replay sniffed bytes to
/// the handler it selects.
pub struct PrefixStream {
    inner: Box<dyn Stream>,
    head: Vec<u8>,
    pos: usize,
}

impl PrefixStream {
    pub fn new(inner: Box<dyn Stream>, head: Vec<u8>) -> Self {
        Self {
            inner,
            head,
            pos: 0,
        }
    }

    /// Bytes still pending replay.
    pub fn pending(&self) -> &[u8] {
        &self.head[self.pos..]
    }
}

impl AsyncRead for PrefixStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.pos < this.head.len() {
            let n = (this.head.len() - this.pos).min(buf.remaining());
            buf.put_slice(&this.head[this.pos..this.pos + n]);
            this.pos += n;
            if this.pos == this.head.len() {
                // Release the buffer.
                this.head = Vec::new();
                this.pos = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PrefixStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[async_trait]
impl Stream for PrefixStream {
    fn local_addr(&self) -> io::Result<NetAddr> {
        self.inner.local_addr()
    }

    fn peer_addr(&self) -> io::Result<NetAddr> {
        self.inner.peer_addr()
    }

    fn raw_fd(&self) -> Option<RawFd> {
        self.inner.raw_fd()
    }

    fn read_ahead(&self) -> &[u8] {
        self.pending()
    }

    async fn write_to(
        &mut self,
        w: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Option<io::Result<u64>> {
        // The replay buffer goes straight out; the rest of the stream
        // follows the inner stream's own preference.
        let mut total = 0u64;
        if self.pos < self.head.len() {
            if let Err(e) = w.write_all(&self.head[self.pos..]).await {
                return Some(Err(e));
            }
            total = (self.head.len() - self.pos) as u64;
            self.head = Vec::new();
            self.pos = 0;
        }
        let rest = match self.inner.write_to(w).await {
            Some(res) => res,
            None => crate::copy::copy(&mut self.inner, w).await,
        };
        Some(rest.map(|n| n + total))
    }

    async fn readable(&self) -> io::Result<()> {
        if self.pos < self.head.len() {
            return Ok(());
        }
        self.inner.readable().await
    }
}

/// Returns both ends of a TCP connection over the loopback interface.
pub async fn tcp_pair() -> io::Result<(TcpStream, TcpStream)> {
    let lstn = TcpListener::bind("127.0.0.1:0").await?;
    let addr = lstn.local_addr()?;
    let connect = TcpStream::connect(addr);
    let accept = lstn.accept();
    let (c1, (c2, _)) = tokio::try_join!(connect, accept)?;
    c1.set_nodelay(true)?;
    c2.set_nodelay(true)?;
    Ok((c1, c2))
}

/// Returns both ends of an unnamed unix-domain socket pair.
pub fn unix_pair() -> io::Result<(UnixStream, UnixStream)> {
    UnixStream::pair()
}
