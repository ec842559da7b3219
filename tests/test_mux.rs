//! Protocol detection: probing, replay, fallbacks, and timeouts.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use junction::conn::{NetAddr, Stream};
use junction::handler::{Handler, ProxyHandler};
use junction::mux::{Probe, Proto, ProtoMux, Sniffer};
use junction::server::Server;
use junction::tunnel::{Forwarder, Tunnel};

/// `/rev ` line protocol: answers each line with its payload reversed.
struct Reverser;

#[async_trait]
impl Probe for Reverser {
    async fn can_read(&self, sniff: &mut Sniffer<'_>) -> io::Result<bool> {
        Ok(sniff.peek(5).await? == b"/rev ")
    }
}

#[async_trait]
impl Handler for Reverser {
    async fn serve_conn(
        &self,
        _ctx: CancellationToken,
        mut conn: Box<dyn Stream>,
    ) -> anyhow::Result<()> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 256];
        while !buf.contains(&b'\n') {
            let n = conn.read(&mut chunk).await?;
            if n == 0 {
                return Ok(());
            }
            buf.extend_from_slice(&chunk[..n]);
        }

        let line = String::from_utf8(buf)?;
        let payload = line
            .trim_end_matches(['\r', '\n'])
            .strip_prefix("/rev ")
            .unwrap_or_default();
        let reversed: String = payload.chars().rev().collect();

        conn.write_all(reversed.as_bytes()).await?;
        conn.write_all(b"\n").await?;
        conn.flush().await?;
        Ok(())
    }
}

/// Catch-all protocol that mirrors the stream.
struct EchoFallback;

#[async_trait]
impl Probe for EchoFallback {
    async fn can_read(&self, _sniff: &mut Sniffer<'_>) -> io::Result<bool> {
        Ok(true)
    }
}

#[async_trait]
impl Handler for EchoFallback {
    async fn serve_conn(
        &self,
        ctx: CancellationToken,
        conn: Box<dyn Stream>,
    ) -> anyhow::Result<()> {
        junction::handler::Echo.serve_conn(ctx, conn).await
    }
}

async fn mux_server(
    protocols: Vec<Arc<dyn Proto>>,
    read_timeout: Option<Duration>,
) -> (std::net::SocketAddr, CancellationToken) {
    let lstn = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = lstn.local_addr().unwrap();
    let shutdown = CancellationToken::new();

    let mux = ProtoMux {
        protocols,
        read_timeout,
    };
    let server = Server::new(addr.to_string(), Arc::new(mux)).with_shutdown(shutdown.clone());
    tokio::spawn(async move { server.serve(lstn).await });

    (addr, shutdown)
}

#[tokio::test]
async fn routes_by_prefix_and_replays_sniffed_bytes() {
    let (addr, shutdown) = mux_server(
        vec![Arc::new(Reverser), Arc::new(EchoFallback)],
        None,
    )
    .await;

    // The reverser claims its prefix.
    let mut conn = TcpStream::connect(addr).await.unwrap();
    conn.write_all(b"/rev Hello World!\n").await.unwrap();
    let mut buf = [0u8; 13];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"!dlroW olleH\n");
    drop(conn);

    // Anything else falls through to the echo, byte for byte.
    let mut conn = TcpStream::connect(addr).await.unwrap();
    conn.write_all(b"Hello World!").await.unwrap();
    let mut buf = [0u8; 12];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"Hello World!");

    shutdown.cancel();
}

#[tokio::test]
async fn unclaimed_streams_are_closed() {
    let (addr, shutdown) = mux_server(vec![Arc::new(Reverser)], None).await;

    let mut conn = TcpStream::connect(addr).await.unwrap();
    conn.write_all(b"nope, not that protocol\n").await.unwrap();

    let mut buf = [0u8; 16];
    assert_eq!(conn.read(&mut buf).await.unwrap(), 0);

    shutdown.cancel();
}

/// A proxying protocol that claims everything and pipes the connection to
/// its target.
struct RelayAll;

#[async_trait]
impl Probe for RelayAll {
    async fn can_read(&self, _sniff: &mut Sniffer<'_>) -> io::Result<bool> {
        Ok(true)
    }
}

#[async_trait]
impl ProxyHandler for RelayAll {
    async fn serve_proxy(
        &self,
        ctx: CancellationToken,
        conn: Box<dyn Stream>,
        target: NetAddr,
    ) -> anyhow::Result<()> {
        Tunnel::new(Arc::new(Forwarder))
            .serve_proxy(ctx, conn, target)
            .await
    }
}

#[tokio::test]
async fn proxy_muxes_forward_the_target_to_the_chosen_protocol() {
    use junction::mux::ProxyProtoMux;
    use junction::proxy::Proxy;

    // An echo server is the proxy target.
    let target_lstn = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target_addr = target_lstn.local_addr().unwrap();
    let target_stop = CancellationToken::new();
    let target_srv = Server::new(target_addr.to_string(), Arc::new(junction::handler::Echo))
        .with_shutdown(target_stop.clone());
    tokio::spawn(async move { target_srv.serve(target_lstn).await });

    let front = Proxy {
        network: "tcp".to_string(),
        address: target_addr.to_string(),
        handler: Arc::new(ProxyProtoMux {
            protocols: vec![Arc::new(RelayAll)],
            read_timeout: None,
        }),
    };
    let lstn = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = lstn.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let srv = Server::new(addr.to_string(), Arc::new(front)).with_shutdown(shutdown.clone());
    tokio::spawn(async move { srv.serve(lstn).await });

    let mut conn = TcpStream::connect(addr).await.unwrap();
    conn.write_all(b"through the relay").await.unwrap();
    let mut buf = [0u8; 17];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"through the relay");

    shutdown.cancel();
    target_stop.cancel();
}

#[tokio::test]
async fn silent_clients_run_into_the_read_timeout() {
    let (addr, shutdown) = mux_server(
        vec![Arc::new(Reverser), Arc::new(EchoFallback)],
        Some(Duration::from_millis(100)),
    )
    .await;

    let started = std::time::Instant::now();
    let mut conn = TcpStream::connect(addr).await.unwrap();

    // Say nothing; the mux must give up and close.
    let mut buf = [0u8; 1];
    assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
    assert!(started.elapsed() >= Duration::from_millis(90));
    assert!(started.elapsed() < Duration::from_secs(5));

    shutdown.cancel();
}
