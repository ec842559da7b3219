//! Connection handler capabilities and built-in handlers.

use std::future::Future;
use std::io;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

use crate::conn::{NetAddr, Stream};
use crate::copy::copy;
use crate::error::LineError;
use crate::listen::PacketConn;

/// Maximum line length accepted by the line-based handlers.
pub const MAX_LINE_BYTES: usize = 8192;

/// A handler manages one network connection.
///
/// `serve_conn` is called by a server for every connection it accepts; the
/// cancellation token signals that the server is shutting down. The server
/// logs errors and panics escaping the handler, and the connection is closed
/// when the handler returns.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn serve_conn(&self, ctx: CancellationToken, conn: Box<dyn Stream>)
        -> anyhow::Result<()>;
}

/// A handler for connections whose intended destination is known, typically
/// because they were intercepted on their way to `target`.
#[async_trait]
pub trait ProxyHandler: Send + Sync {
    async fn serve_proxy(
        &self,
        ctx: CancellationToken,
        conn: Box<dyn Stream>,
        target: NetAddr,
    ) -> anyhow::Result<()>;
}

/// A handler for both ends of an established tunnel.
#[async_trait]
pub trait TunnelHandler: Send + Sync {
    async fn serve_tunnel(
        &self,
        ctx: CancellationToken,
        from: Box<dyn Stream>,
        to: Box<dyn Stream>,
    ) -> anyhow::Result<()>;
}

/// A handler for individual datagrams.
#[async_trait]
pub trait PacketHandler: Send + Sync {
    async fn serve_packet(
        &self,
        ctx: CancellationToken,
        conn: &PacketConn,
        from: NetAddr,
        data: Vec<u8>,
    ) -> anyhow::Result<()>;
}

/// Adapts a plain async function into a [`Handler`].
pub struct HandlerFn<F>(pub F);

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(CancellationToken, Box<dyn Stream>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn serve_conn(
        &self,
        ctx: CancellationToken,
        conn: Box<dyn Stream>,
    ) -> anyhow::Result<()> {
        (self.0)(ctx, conn).await
    }
}

/// Sends everything it receives back to the peer.
pub struct Echo;

#[async_trait]
impl Handler for Echo {
    async fn serve_conn(
        &self,
        ctx: CancellationToken,
        mut conn: Box<dyn Stream>,
    ) -> anyhow::Result<()> {
        use tokio::io::AsyncReadExt;

        // Bytes a sniffer already captured have a direct path: echo them
        // back before the copy loop takes the socket. An echo aliases its
        // reader and its writer, so the stream's own direct-transfer
        // capabilities cannot be delegated to here.
        let mut replayed = Vec::new();
        while !conn.read_ahead().is_empty() {
            let mut chunk = [0u8; 1024];
            let n = conn.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            replayed.extend_from_slice(&chunk[..n]);
        }
        if !replayed.is_empty() {
            conn.write_all(&replayed).await?;
            conn.flush().await?;
        }

        let (mut r, mut w) = tokio::io::split(conn);
        tokio::select! {
            res = copy(&mut r, &mut w) => {
                res?;
                w.shutdown().await.ok();
            }
            _ = ctx.cancelled() => {}
        }
        Ok(())
    }
}

/// Reads `\n`-terminated lines and echoes them back, one at a time. The
/// peer must not send a second line before the first was answered.
pub struct EchoLine;

#[async_trait]
impl Handler for EchoLine {
    async fn serve_conn(
        &self,
        ctx: CancellationToken,
        mut conn: Box<dyn Stream>,
    ) -> anyhow::Result<()> {
        let mut lines = LineReader::new(MAX_LINE_BYTES);

        loop {
            let line = match lines.read_line(&ctx, &mut conn).await? {
                Some(line) => line,
                None => return Ok(()),
            };
            conn.write_all(&line).await?;
            conn.flush().await?;
        }
    }
}

/// Accepts the connection and does nothing with it.
pub struct Pass;

#[async_trait]
impl Handler for Pass {
    async fn serve_conn(
        &self,
        _ctx: CancellationToken,
        _conn: Box<dyn Stream>,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Cancellation-aware line reader shared by the line-based handlers.
///
/// Reads wake up once per second to observe cancellation, so a quiet peer
/// cannot pin a handler past shutdown. Lines keep their terminator; the
/// size cap and the no-pipelining rule are enforced here.
pub(crate) struct LineReader {
    buf: Vec<u8>,
    max: usize,
}

impl LineReader {
    pub(crate) fn new(max: usize) -> Self {
        Self {
            buf: Vec::new(),
            max,
        }
    }

    /// Returns the next full line, or `None` on end of stream or
    /// cancellation.
    pub(crate) async fn read_line(
        &mut self,
        ctx: &CancellationToken,
        conn: &mut Box<dyn Stream>,
    ) -> io::Result<Option<Vec<u8>>> {
        use tokio::io::AsyncReadExt;

        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                if pos + 1 != self.buf.len() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        LineError::NoPipeline,
                    ));
                }
                let line = std::mem::take(&mut self.buf);
                return Ok(Some(line));
            }
            if self.buf.len() >= self.max {
                return Err(io::Error::new(io::ErrorKind::InvalidData, LineError::TooLong));
            }

            if ctx.is_cancelled() {
                return Ok(None);
            }

            let mut chunk = [0u8; 1024];
            match timeout(Duration::from_secs(1), conn.read(&mut chunk)).await {
                Err(_) => continue, // check cancellation and poll again
                Ok(Ok(0)) => return Ok(None),
                Ok(Ok(n)) => self.buf.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::tcp_pair;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn echo_round_trips_bytes() {
        let (a, b) = tcp_pair().await.unwrap();
        let ctx = CancellationToken::new();
        let task = tokio::spawn(async move { Echo.serve_conn(ctx, Box::new(a)).await });

        let mut b = b;
        b.write_all(b"Hello World!").await.unwrap();
        let mut buf = [0u8; 12];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"Hello World!");

        drop(b);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn echo_line_answers_one_line_at_a_time() {
        let (a, mut b) = tcp_pair().await.unwrap();
        let ctx = CancellationToken::new();
        let task = tokio::spawn(async move { EchoLine.serve_conn(ctx, Box::new(a)).await });

        b.write_all(b"Hello World!\r\n").await.unwrap();
        let mut buf = [0u8; 14];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"Hello World!\r\n");

        drop(b);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn echo_line_rejects_pipelining() {
        let (a, mut b) = tcp_pair().await.unwrap();
        let ctx = CancellationToken::new();
        let task = tokio::spawn(async move { EchoLine.serve_conn(ctx, Box::new(a)).await });

        b.write_all(b"one\ntwo\n").await.unwrap();
        let err = task.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("pipelining"));
    }

    #[tokio::test]
    async fn echo_line_caps_line_length() {
        let (a, mut b) = tcp_pair().await.unwrap();
        let ctx = CancellationToken::new();
        let task = tokio::spawn(async move { EchoLine.serve_conn(ctx, Box::new(a)).await });

        b.write_all(&vec![b'x'; MAX_LINE_BYTES + 1]).await.unwrap();
        let err = task.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("too long"));
    }
}
