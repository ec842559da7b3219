//! Dynamic protocol detection.
//!
//! A mux looks at the first bytes a peer sends and routes the connection to
//! the first registered protocol that recognizes them. Probing happens
//! through a [`Sniffer`], which records everything it reads so that a failed
//! probe costs nothing: the next probe replays the same bytes, and the
//! handler that finally wins receives a connection that reads as if no
//! sniffing had occurred.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use crate::conn::{NetAddr, PrefixStream, Stream};
use crate::error::timeout as timeout_error;
use crate::handler::{Handler, ProxyHandler, TunnelHandler};
use crate::poll::{poll_read, ReadEvent};

/// No registered protocol claimed the stream.
#[derive(Debug, Error)]
#[error("unsupported protocol")]
pub struct UnsupportedProtocol;

/// A protocol's ability to recognize its own traffic.
///
/// `can_read` inspects the first bytes of a stream through the sniffer and
/// reports whether the prefix it saw is enough to claim the connection. A
/// probe may read as far ahead as it needs; bytes it consumes are replayed
/// to the next probe and, eventually, to the chosen handler.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn can_read(&self, sniff: &mut Sniffer<'_>) -> io::Result<bool>;
}

/// A connection-oriented protocol that can be plugged into a [`ProtoMux`].
pub trait Proto: Probe + Handler {}
impl<T: Probe + Handler> Proto for T {}

/// A proxying protocol that can be plugged into a [`ProxyProtoMux`].
pub trait ProxyProto: Probe + ProxyHandler {}
impl<T: Probe + ProxyHandler> ProxyProto for T {}

/// A tunneling protocol that can be plugged into a [`TunnelProtoMux`].
pub trait TunnelProto: Probe + TunnelHandler {}
impl<T: Probe + TunnelHandler> TunnelProto for T {}

/// A recording reader over the first bytes of a connection.
///
/// Bytes read from the underlying stream are captured; [`rewind`] moves the
/// replay position back to the first captured byte without discarding
/// anything. The capture buffer only grows while probing: once a protocol
/// is chosen the buffer is frozen into a [`PrefixStream`].
///
/// [`rewind`]: Sniffer::rewind
pub struct Sniffer<'a> {
    conn: &'a mut Box<dyn Stream>,
    buf: Vec<u8>,
    pos: usize,
}

impl<'a> Sniffer<'a> {
    fn new(conn: &'a mut Box<dyn Stream>) -> Self {
        Self {
            conn,
            buf: Vec::with_capacity(1024),
            pos: 0,
        }
    }

    /// Moves the replay position back to the start of the capture.
    pub fn rewind(&mut self) {
        self.pos = 0;
    }

    /// Reads into `dst`, draining replayed bytes before touching the
    /// socket. Returns 0 only at end of stream.
    pub async fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        if self.pos < self.buf.len() {
            let n = (self.buf.len() - self.pos).min(dst.len());
            dst[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
            self.pos += n;
            return Ok(n);
        }
        let n = self.conn.read(dst).await?;
        self.buf.extend_from_slice(&dst[..n]);
        self.pos += n;
        Ok(n)
    }

    /// Returns the next `n` bytes without consuming them. The slice is
    /// shorter than `n` only when the stream ended first.
    pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        while self.buf.len() - self.pos < n {
            let mut chunk = [0u8; 512];
            let m = self.conn.read(&mut chunk).await?;
            if m == 0 {
                break;
            }
            self.buf.extend_from_slice(&chunk[..m]);
        }
        let end = (self.pos + n).min(self.buf.len());
        Ok(&self.buf[self.pos..end])
    }

    /// Consumes `n` replayed bytes.
    pub fn advance(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.buf.len());
    }

    fn into_captured(self) -> Vec<u8> {
        self.buf
    }
}

/// A connection handler that routes each connection to the first protocol
/// recognizing its initial bytes.
pub struct ProtoMux {
    /// Protocols, probed in order.
    pub protocols: Vec<Arc<dyn Proto>>,

    /// How long the peer has to identify itself. `None` waits forever.
    pub read_timeout: Option<Duration>,
}

#[async_trait]
impl Handler for ProtoMux {
    async fn serve_conn(
        &self,
        ctx: CancellationToken,
        mut conn: Box<dyn Stream>,
    ) -> anyhow::Result<()> {
        let probing = async {
            let mut sniff = Sniffer::new(&mut conn);
            let mut choice = None;
            for (i, proto) in self.protocols.iter().enumerate() {
                sniff.rewind();
                if proto.can_read(&mut sniff).await? {
                    choice = Some(i);
                    break;
                }
            }
            Ok::<_, io::Error>((choice, sniff.into_captured()))
        };

        let (choice, captured) = run_probes(&ctx, self.read_timeout, probing).await?;
        let conn = Box::new(PrefixStream::new(conn, captured)) as Box<dyn Stream>;

        match choice {
            Some(i) => self.protocols[i].serve_conn(ctx, conn).await,
            None => Err(UnsupportedProtocol.into()),
        }
    }
}

/// A proxy handler that routes each connection to the first protocol
/// recognizing its initial bytes, forwarding the original target.
pub struct ProxyProtoMux {
    pub protocols: Vec<Arc<dyn ProxyProto>>,
    pub read_timeout: Option<Duration>,
}

#[async_trait]
impl ProxyHandler for ProxyProtoMux {
    async fn serve_proxy(
        &self,
        ctx: CancellationToken,
        mut conn: Box<dyn Stream>,
        target: NetAddr,
    ) -> anyhow::Result<()> {
        let probing = async {
            let mut sniff = Sniffer::new(&mut conn);
            let mut choice = None;
            for (i, proto) in self.protocols.iter().enumerate() {
                sniff.rewind();
                if proto.can_read(&mut sniff).await? {
                    choice = Some(i);
                    break;
                }
            }
            Ok::<_, io::Error>((choice, sniff.into_captured()))
        };

        let (choice, captured) = run_probes(&ctx, self.read_timeout, probing).await?;
        let conn = Box::new(PrefixStream::new(conn, captured)) as Box<dyn Stream>;

        match choice {
            Some(i) => self.protocols[i].serve_proxy(ctx, conn, target).await,
            None => Err(UnsupportedProtocol.into()),
        }
    }
}

/// A tunnel handler that sniffs whichever end of the tunnel speaks first
/// and routes both ends to the protocol that recognizes the traffic.
pub struct TunnelProtoMux {
    pub protocols: Vec<Arc<dyn TunnelProto>>,
    pub read_timeout: Option<Duration>,
}

#[async_trait]
impl TunnelHandler for TunnelProtoMux {
    async fn serve_tunnel(
        &self,
        ctx: CancellationToken,
        mut from: Box<dyn Stream>,
        mut to: Box<dyn Stream>,
    ) -> anyhow::Result<()> {
        #[derive(Clone, Copy)]
        enum Side {
            From,
            To,
        }

        // A side that already carries replayed bytes is readable by
        // definition; the descriptor race is only for untouched sockets.
        let side = if !from.read_ahead().is_empty() {
            Side::From
        } else if !to.read_ahead().is_empty() {
            Side::To
        } else {
            // Either side may talk first; watch both without consuming and
            // sniff whichever wakes up. The other side's registration is
            // released right away.
            let (ready_from, guard_from) = poll_read(from.as_ref())?;
            let (ready_to, guard_to) = poll_read(to.as_ref())?;

            let quiet = async {
                match self.read_timeout {
                    Some(t) => tokio::time::sleep(t).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                ev = ready_from.wait() => {
                    drop(guard_to);
                    match ev? {
                        ReadEvent::Ready => Side::From,
                        ReadEvent::Cancelled => return Ok(()),
                    }
                }
                ev = ready_to.wait() => {
                    drop(guard_from);
                    match ev? {
                        ReadEvent::Ready => Side::To,
                        ReadEvent::Cancelled => return Ok(()),
                    }
                }
                _ = quiet => {
                    return Err(
                        timeout_error("i/o timeout waiting for either end of the tunnel").into()
                    );
                }
                _ = ctx.cancelled() => return Ok(()),
            }
        };

        let conn = match side {
            Side::From => &mut from,
            Side::To => &mut to,
        };

        let probing = async {
            let mut sniff = Sniffer::new(conn);
            let mut choice = None;
            for (i, proto) in self.protocols.iter().enumerate() {
                sniff.rewind();
                if proto.can_read(&mut sniff).await? {
                    choice = Some(i);
                    break;
                }
            }
            Ok::<_, io::Error>((choice, sniff.into_captured()))
        };

        let (choice, captured) = run_probes(&ctx, self.read_timeout, probing).await?;

        let (from, to) = match side {
            Side::From => (
                Box::new(PrefixStream::new(from, captured)) as Box<dyn Stream>,
                to,
            ),
            Side::To => (
                from,
                Box::new(PrefixStream::new(to, captured)) as Box<dyn Stream>,
            ),
        };

        match choice {
            Some(i) => self.protocols[i].serve_tunnel(ctx, from, to).await,
            None => Err(UnsupportedProtocol.into()),
        }
    }
}

/// Bounds a probing pass by the configured read timeout and the
/// cancellation token. The connection is abandoned (and therefore closed by
/// the caller dropping it) on either.
async fn run_probes<T>(
    ctx: &CancellationToken,
    read_timeout: Option<Duration>,
    probing: impl std::future::Future<Output = io::Result<T>>,
) -> io::Result<T> {
    let bounded = async {
        match read_timeout {
            Some(t) => match tokio::time::timeout(t, probing).await {
                Ok(res) => res,
                Err(_) => Err(timeout_error("i/o timeout while identifying the protocol")),
            },
            None => probing.await,
        }
    };

    tokio::select! {
        res = bounded => res,
        _ = ctx.cancelled() => Err(io::Error::new(
            io::ErrorKind::Interrupted,
            "cancelled while identifying the protocol",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::tcp_pair;
    use tokio::io::AsyncWriteExt;

    struct StartsWith(&'static [u8]);

    #[async_trait]
    impl Probe for StartsWith {
        async fn can_read(&self, sniff: &mut Sniffer<'_>) -> io::Result<bool> {
            Ok(sniff.peek(self.0.len()).await? == self.0)
        }
    }

    #[tokio::test]
    async fn failed_probes_replay_to_the_next_one() {
        let (a, mut b) = tcp_pair().await.unwrap();
        b.write_all(b"HELLO stream").await.unwrap();

        let mut conn: Box<dyn Stream> = Box::new(a);
        let mut sniff = Sniffer::new(&mut conn);

        assert!(!StartsWith(b"GET ").can_read(&mut sniff).await.unwrap());
        sniff.rewind();
        assert!(StartsWith(b"HELLO").can_read(&mut sniff).await.unwrap());

        // The chosen handler sees the stream from its first byte.
        let captured = sniff.into_captured();
        use tokio::io::AsyncReadExt;
        let mut replayed = PrefixStream::new(conn, captured);
        let mut buf = [0u8; 12];
        replayed.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"HELLO stream");
    }

    #[tokio::test]
    async fn sniffer_read_consumes_replay_before_socket() {
        let (a, mut b) = tcp_pair().await.unwrap();
        b.write_all(b"abcdef").await.unwrap();

        let mut conn: Box<dyn Stream> = Box::new(a);
        let mut sniff = Sniffer::new(&mut conn);

        let mut buf = [0u8; 4];
        let n = sniff.read(&mut buf).await.unwrap();
        assert!(n > 0);
        sniff.rewind();

        let mut again = vec![0u8; n];
        sniff.read(&mut again).await.unwrap();
        assert_eq!(&again[..], &b"abcdef"[..n]);
    }
}
