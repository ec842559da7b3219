//! Tunnels: dialing a second leg and relaying bytes between two ends.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::conn::{NetAddr, Stream};
use crate::copy::copy;
use crate::handler::{LineReader, ProxyHandler, TunnelHandler, MAX_LINE_BYTES};
use crate::mux::{Probe, Sniffer};

/// A dialing function: opens a connection to a `(network, address)` target.
pub type DialFn = Arc<
    dyn Fn(NetAddr) -> Pin<Box<dyn Future<Output = io::Result<Box<dyn Stream>>> + Send>>
        + Send
        + Sync,
>;

/// Upper bound applied to the default dialer so a dead target cannot park a
/// tunnel forever.
const DIAL_SAFEGUARD: Duration = Duration::from_secs(10);

/// A proxy handler that opens a second connection to the target address for
/// every incoming connection, then hands both ends to its tunnel handler.
pub struct Tunnel {
    /// Invoked once the target connection is established.
    pub handler: Arc<dyn TunnelHandler>,

    /// How new connections are established. `None` uses the default dialer
    /// with a safeguard timeout.
    pub dial: Option<DialFn>,
}

impl Tunnel {
    pub fn new(handler: Arc<dyn TunnelHandler>) -> Self {
        Self {
            handler,
            dial: None,
        }
    }
}

#[async_trait]
impl ProxyHandler for Tunnel {
    async fn serve_proxy(
        &self,
        ctx: CancellationToken,
        from: Box<dyn Stream>,
        target: NetAddr,
    ) -> anyhow::Result<()> {
        debug!(net = %target.net, addr = %target, "dialing tunnel target");

        let to = match &self.dial {
            Some(dial) => dial(target).await?,
            None => dial_default(&target).await?,
        };

        self.handler.serve_tunnel(ctx, from, to).await
    }
}

/// Dials `target` over TCP or a unix domain, bounded by the safeguard
/// timeout.
pub async fn dial_default(target: &NetAddr) -> io::Result<Box<dyn Stream>> {
    let connect = async {
        match target.net.as_str() {
            "unix" => UnixStream::connect(&target.addr)
                .await
                .map(|c| Box::new(c) as Box<dyn Stream>),
            _ => TcpStream::connect(target.addr.as_str())
                .await
                .map(|c| Box::new(c) as Box<dyn Stream>),
        }
    };
    match tokio::time::timeout(DIAL_SAFEGUARD, connect).await {
        Ok(res) => res,
        Err(_) => Err(crate::error::timeout(&format!(
            "i/o timeout dialing {}/{}",
            target.net, target.addr
        ))),
    }
}

/// A tunnel handler that passes bytes between the two ends untouched.
///
/// As a probe it claims every stream, which makes it the natural catch-all
/// at the end of a tunnel mux's protocol list.
pub struct Forwarder;

#[async_trait]
impl Probe for Forwarder {
    async fn can_read(&self, _sniff: &mut Sniffer<'_>) -> io::Result<bool> {
        Ok(true)
    }
}

#[async_trait]
impl TunnelHandler for Forwarder {
    async fn serve_tunnel(
        &self,
        ctx: CancellationToken,
        mut from: Box<dyn Stream>,
        mut to: Box<dyn Stream>,
    ) -> anyhow::Result<()> {
        // Direct paths first: bytes either end holds in memory (a
        // sniffer's replay buffer) cross without touching the pool. The
        // full direct-transfer delegation of `copy_stream` would run one
        // direction to end of stream and serialize the relay, so after
        // this handover both directions run concurrently on the split
        // halves.
        relay_read_ahead(&mut from, &mut to).await?;
        relay_read_ahead(&mut to, &mut from).await?;

        let (mut from_r, mut from_w) = tokio::io::split(from);
        let (mut to_r, mut to_w) = tokio::io::split(to);

        let outbound = async {
            let n = copy(&mut from_r, &mut to_w).await;
            to_w.shutdown().await.ok();
            n
        };
        let inbound = async {
            let n = copy(&mut to_r, &mut from_w).await;
            from_w.shutdown().await.ok();
            n
        };

        // The first direction to finish tears the tunnel down: one end
        // going away means the conversation is over, and closing both
        // connections is what unblocks the opposite copy.
        tokio::select! {
            sent = outbound => {
                debug!(sent = sent.unwrap_or(0), "tunnel source drained");
            }
            received = inbound => {
                debug!(received = received.unwrap_or(0), "tunnel target drained");
            }
            _ = ctx.cancelled() => {}
        }

        // Both ends drop here, closing them.
        Ok(())
    }
}

/// Sends a stream's replayed bytes straight to `dst`. The reads are
/// served from memory, so this returns as soon as the replay buffer is
/// drained and never waits on the source socket.
async fn relay_read_ahead(
    src: &mut Box<dyn Stream>,
    dst: &mut Box<dyn Stream>,
) -> io::Result<u64> {
    use tokio::io::AsyncReadExt;

    let mut total = 0u64;
    while !src.read_ahead().is_empty() {
        let mut chunk = [0u8; 1024];
        let n = src.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        dst.write_all(&chunk[..n]).await?;
        total += n as u64;
    }
    if total != 0 {
        dst.flush().await?;
    }
    Ok(total)
}

/// A tunnel handler that relays a line-based protocol, one exchange at a
/// time: a line from the client is forwarded to the target, the target's
/// line is forwarded back. Pipelining is refused and lines are capped the
/// same way the line echo handler caps them.
pub struct TunnelLine;

#[async_trait]
impl Probe for TunnelLine {
    async fn can_read(&self, sniff: &mut Sniffer<'_>) -> io::Result<bool> {
        // A line protocol is plain text: claim the stream when the first
        // bytes look printable.
        let head = sniff.peek(4).await?;
        Ok(!head.is_empty()
            && head
                .iter()
                .all(|&b| b == b'\r' || b == b'\n' || b == b'\t' || (0x20..0x7f).contains(&b)))
    }
}

#[async_trait]
impl TunnelHandler for TunnelLine {
    async fn serve_tunnel(
        &self,
        ctx: CancellationToken,
        mut from: Box<dyn Stream>,
        mut to: Box<dyn Stream>,
    ) -> anyhow::Result<()> {
        let mut client_lines = LineReader::new(MAX_LINE_BYTES);
        let mut target_lines = LineReader::new(MAX_LINE_BYTES);

        // Once a line is in flight the exchange must complete; only the
        // wait for the next client line observes cancellation.
        let detached = CancellationToken::new();

        loop {
            let line = match client_lines.read_line(&ctx, &mut from).await? {
                Some(line) => line,
                None => return Ok(()),
            };
            to.write_all(&line).await?;
            to.flush().await?;

            let reply = match target_lines.read_line(&detached, &mut to).await? {
                Some(reply) => reply,
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "tunnel target closed mid-exchange",
                    )
                    .into())
                }
            };
            from.write_all(&reply).await?;
            from.flush().await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::tcp_pair;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn forwarder_relays_both_directions_and_closes_on_eof() {
        let (client, a) = tcp_pair().await.unwrap();
        let (b, server) = tcp_pair().await.unwrap();

        let ctx = CancellationToken::new();
        let task = tokio::spawn(async move {
            Forwarder
                .serve_tunnel(ctx, Box::new(a), Box::new(b))
                .await
        });

        let mut client = client;
        let mut server = server;

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // Closing the client tears the whole tunnel down.
        drop(client);
        task.await.unwrap().unwrap();
        assert_eq!(server.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn line_tunnel_round_trips_one_exchange() {
        let (mut client, a) = tcp_pair().await.unwrap();
        let (b, mut target) = tcp_pair().await.unwrap();

        let ctx = CancellationToken::new();
        let task = tokio::spawn(async move {
            TunnelLine
                .serve_tunnel(ctx, Box::new(a), Box::new(b))
                .await
        });

        client.write_all(b"marco\n").await.unwrap();

        let mut buf = [0u8; 6];
        target.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"marco\n");

        target.write_all(b"polo!\n").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"polo!\n");

        drop(client);
        task.await.unwrap().unwrap();
    }
}
