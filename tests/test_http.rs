//! The HTTP pipeline end to end: framing, keep-alive, deadlines, upgrade
//! and hijack, and the transparent-proxy rewrite.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use junction::conn::tcp_pair;
use junction::http::{
    ClientRequest, ConnTransport, HttpHandler, HttpServer, Method, Request, ResponseWriter,
    WriteError,
};
use junction::server::Server;
use junction::ProxyHandler;

async fn spawn_http(server: HttpServer) -> (std::net::SocketAddr, CancellationToken) {
    let lstn = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = lstn.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let srv = Server::new(addr.to_string(), Arc::new(server)).with_shutdown(shutdown.clone());
    tokio::spawn(async move { srv.serve(lstn).await });
    (addr, shutdown)
}

/// Responds with the request target as a fixed-length body.
struct TargetEcho;

#[async_trait]
impl HttpHandler for TargetEcho {
    async fn serve_http(
        &self,
        res: &mut ResponseWriter<'_>,
        req: &mut Request<'_>,
    ) -> anyhow::Result<()> {
        let body = req.head.target.clone().into_bytes();
        res.header().set("Content-Length", body.len().to_string());
        res.write_header(200);
        res.write(&body).await?;
        Ok(())
    }
}

/// Streams `count` chunks of `size` bytes without declaring a length.
struct ChunkStreamer {
    count: usize,
    size: usize,
}

#[async_trait]
impl HttpHandler for ChunkStreamer {
    async fn serve_http(
        &self,
        res: &mut ResponseWriter<'_>,
        _req: &mut Request<'_>,
    ) -> anyhow::Result<()> {
        res.write_header(200);
        let chunk = vec![b'z'; self.size];
        for _ in 0..self.count {
            res.write(&chunk).await?;
            res.flush().await?;
        }
        Ok(())
    }
}

#[tokio::test]
async fn chunked_streaming_delivers_every_byte() {
    let (addr, shutdown) = spawn_http(HttpServer::new(Arc::new(ChunkStreamer {
        count: 100,
        size: 128,
    })))
    .await;

    let conn = TcpStream::connect(addr).await.unwrap();
    let mut transport = ConnTransport::new(Box::new(conn));
    let mut res = transport
        .round_trip(ClientRequest::get(addr.to_string(), "/stream"))
        .await
        .unwrap();

    assert_eq!(res.head.status, 200);
    assert!(res.head.is_chunked());
    let body = res.body.read_to_end().await.unwrap();
    assert_eq!(body.len(), 12_800);
    assert!(body.iter().all(|&b| b == b'z'));

    shutdown.cancel();
}

#[tokio::test]
async fn content_length_overruns_are_cut_off() {
    struct Overrun;

    #[async_trait]
    impl HttpHandler for Overrun {
        async fn serve_http(
            &self,
            res: &mut ResponseWriter<'_>,
            _req: &mut Request<'_>,
        ) -> anyhow::Result<()> {
            res.header().set("Content-Length", "1");
            res.write_header(200);
            let err = res.write(b"Hello World!").await.unwrap_err();
            assert_eq!(err, WriteError::ContentLengthExceeded);
            // Misbehave some more; the writer keeps refusing.
            let err = res.write(b"more").await.unwrap_err();
            assert_eq!(err, WriteError::ContentLengthExceeded);
            Ok(())
        }
    }

    let (addr, shutdown) = spawn_http(HttpServer::new(Arc::new(Overrun))).await;

    let conn = TcpStream::connect(addr).await.unwrap();
    let mut transport = ConnTransport::new(Box::new(conn));
    let mut res = transport
        .round_trip(ClientRequest::get(addr.to_string(), "/"))
        .await
        .unwrap();

    assert_eq!(res.head.status, 200);
    let body = res.body.read_to_end().await.unwrap();
    assert_eq!(body, b"H");

    shutdown.cancel();
}

#[tokio::test]
async fn pipelined_requests_are_answered_in_order() {
    let (addr, shutdown) = spawn_http(HttpServer::new(Arc::new(TargetEcho))).await;

    let mut conn = TcpStream::connect(addr).await.unwrap();
    conn.write_all(
        b"GET /first HTTP/1.1\r\nHost: h\r\n\r\nGET /second HTTP/1.1\r\nHost: h\r\n\r\n",
    )
    .await
    .unwrap();

    let mut collected = Vec::new();
    let mut buf = [0u8; 4096];
    while !find_in_order(&collected, &[b"/first", b"/second"]) {
        let n = conn.read(&mut buf).await.unwrap();
        assert!(n > 0, "connection closed before both responses arrived");
        collected.extend_from_slice(&buf[..n]);
    }

    let text = String::from_utf8_lossy(&collected);
    let first = text.find("/first").unwrap();
    let second = text.find("/second").unwrap();
    assert!(first < second);

    shutdown.cancel();
}

fn find_in_order(haystack: &[u8], needles: &[&[u8]]) -> bool {
    let mut from = 0;
    for needle in needles {
        match haystack[from..]
            .windows(needle.len())
            .position(|w| w == *needle)
        {
            Some(pos) => from += pos + needle.len(),
            None => return false,
        }
    }
    true
}

#[tokio::test]
async fn slow_request_heads_run_into_the_read_timeout() {
    let mut server = HttpServer::new(Arc::new(TargetEcho));
    server.read_timeout = Some(Duration::from_millis(100));
    let (addr, shutdown) = spawn_http(server).await;

    let mut conn = TcpStream::connect(addr).await.unwrap();
    conn.write_all(b"GET / HTTP/1.1").await.unwrap();

    // Never finish the head; the server must give up and close.
    let mut buf = [0u8; 1];
    assert_eq!(conn.read(&mut buf).await.unwrap(), 0);

    shutdown.cancel();
}

#[tokio::test]
async fn keep_alive_connections_carry_the_idle_budget_header() {
    let mut server = HttpServer::new(Arc::new(TargetEcho));
    server.idle_timeout = Some(Duration::from_secs(30));
    server.server_name = "junction-test".to_string();
    let (addr, shutdown) = spawn_http(server).await;

    let conn = TcpStream::connect(addr).await.unwrap();
    let mut transport = ConnTransport::new(Box::new(conn));

    for target in ["/one", "/two"] {
        let mut res = transport
            .round_trip(ClientRequest::get(addr.to_string(), target))
            .await
            .unwrap();
        assert_eq!(res.head.status, 200);
        assert_eq!(res.head.headers.get("Keep-Alive"), Some("timeout=30"));
        assert_eq!(res.head.headers.get("Server"), Some("junction-test"));
        assert_eq!(res.body.read_to_end().await.unwrap(), target.as_bytes());
    }

    shutdown.cancel();
}

#[tokio::test]
async fn http_10_closes_unless_asked_to_stay() {
    let (addr, shutdown) = spawn_http(HttpServer::new(Arc::new(TargetEcho))).await;

    // Plain 1.0: served, then closed.
    let mut conn = TcpStream::connect(addr).await.unwrap();
    conn.write_all(b"GET /only HTTP/1.0\r\n\r\n").await.unwrap();
    let mut raw = Vec::new();
    conn.read_to_end(&mut raw).await.unwrap();
    let text = String::from_utf8_lossy(&raw);
    assert!(text.contains("/only"));

    // 1.0 with keep-alive: the server answers in kind and stays.
    let mut conn = TcpStream::connect(addr).await.unwrap();
    conn.write_all(b"GET /a HTTP/1.0\r\nConnection: keep-alive\r\n\r\n")
        .await
        .unwrap();
    let mut collected = Vec::new();
    let mut buf = [0u8; 4096];
    while !find_in_order(&collected, &[b"keep-alive", b"/a"]) {
        let n = conn.read(&mut buf).await.unwrap();
        assert!(n > 0);
        collected.extend_from_slice(&buf[..n]);
    }

    conn.write_all(b"GET /b HTTP/1.0\r\nConnection: keep-alive\r\n\r\n")
        .await
        .unwrap();
    let mut collected = Vec::new();
    while !find_in_order(&collected, &[b"/b"]) {
        let n = conn.read(&mut buf).await.unwrap();
        assert!(n > 0);
        collected.extend_from_slice(&buf[..n]);
    }

    shutdown.cancel();
}

#[tokio::test]
async fn expectations_fail_and_upgrades_need_an_upgrader() {
    let (addr, shutdown) = spawn_http(HttpServer::new(Arc::new(TargetEcho))).await;

    let conn = TcpStream::connect(addr).await.unwrap();
    let mut transport = ConnTransport::new(Box::new(conn));

    let mut req = ClientRequest::get(addr.to_string(), "/");
    req.headers.set("Expect", "100-continue");
    let res = transport.round_trip(req).await.unwrap();
    assert_eq!(res.head.status, 417);

    let mut req = ClientRequest::get(addr.to_string(), "/");
    req.headers.set("Connection", "Upgrade");
    req.headers.set("Upgrade", "echo");
    let res = transport.round_trip(req).await.unwrap();
    assert_eq!(res.head.status, 501);

    shutdown.cancel();
}

/// Answers the handshake, takes the connection, and echoes raw bytes.
struct EchoUpgrader;

#[async_trait]
impl HttpHandler for EchoUpgrader {
    async fn serve_http(
        &self,
        res: &mut ResponseWriter<'_>,
        req: &mut Request<'_>,
    ) -> anyhow::Result<()> {
        res.header().set("Connection", "Upgrade");
        res.header()
            .set("Upgrade", req.head.upgrade().unwrap_or("raw").to_string());
        res.write_header(101);
        res.flush().await?;

        let hijacked = res.hijack(&mut req.body).await?;
        let mut conn = hijacked.into_stream();

        let mut buf = [0u8; 256];
        loop {
            let n = conn.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            conn.write_all(&buf[..n]).await?;
        }
    }
}

#[tokio::test]
async fn upgrades_switch_the_connection_to_the_new_protocol() {
    let mut server = HttpServer::new(Arc::new(TargetEcho));
    server.upgrader = Some(Arc::new(EchoUpgrader));
    let (addr, shutdown) = spawn_http(server).await;

    let mut conn = TcpStream::connect(addr).await.unwrap();
    conn.write_all(b"GET /chat HTTP/1.1\r\nHost: h\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\n")
        .await
        .unwrap();

    // Read the 101 head.
    let mut collected = Vec::new();
    let mut buf = [0u8; 4096];
    while !find_in_order(&collected, &[b"\r\n\r\n"]) {
        let n = conn.read(&mut buf).await.unwrap();
        assert!(n > 0);
        collected.extend_from_slice(&buf[..n]);
    }
    let text = String::from_utf8_lossy(&collected);
    assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
    assert!(text.contains("Upgrade: echo\r\n"));

    // The connection now speaks the upgraded protocol.
    conn.write_all(b"raw bytes after the handshake").await.unwrap();
    let mut echoed = [0u8; 29];
    conn.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"raw bytes after the handshake");

    shutdown.cancel();
}

#[tokio::test]
async fn upgrade_mux_routes_by_protocol_name() {
    use junction::http::UpgradeMux;

    let mux = UpgradeMux::new();
    mux.handle("echo", Arc::new(EchoUpgrader));

    let mut server = HttpServer::new(Arc::new(TargetEcho));
    server.upgrader = Some(Arc::new(mux));
    let (addr, shutdown) = spawn_http(server).await;

    // A protocol with a handler upgrades.
    let mut conn = TcpStream::connect(addr).await.unwrap();
    conn.write_all(b"GET / HTTP/1.1\r\nHost: h\r\nConnection: Upgrade\r\nUpgrade: ECHO\r\n\r\n")
        .await
        .unwrap();
    let mut collected = Vec::new();
    let mut buf = [0u8; 4096];
    while !find_in_order(&collected, &[b"\r\n\r\n"]) {
        let n = conn.read(&mut buf).await.unwrap();
        assert!(n > 0);
        collected.extend_from_slice(&buf[..n]);
    }
    assert!(collected.starts_with(b"HTTP/1.1 101"));

    // A protocol nobody registered gets 501.
    let conn = TcpStream::connect(addr).await.unwrap();
    let mut transport = ConnTransport::new(Box::new(conn));
    let mut req = ClientRequest::get(addr.to_string(), "/");
    req.headers.set("Connection", "Upgrade");
    req.headers.set("Upgrade", "nope");
    let res = transport.round_trip(req).await.unwrap();
    assert_eq!(res.head.status, 501);

    shutdown.cancel();
}

#[tokio::test]
async fn idle_connections_are_closed_after_the_idle_budget() {
    let mut server = HttpServer::new(Arc::new(TargetEcho));
    server.idle_timeout = Some(Duration::from_millis(100));
    let (addr, shutdown) = spawn_http(server).await;

    let mut conn = TcpStream::connect(addr).await.unwrap();
    conn.write_all(b"GET /once HTTP/1.1\r\nHost: h\r\n\r\n")
        .await
        .unwrap();

    let mut collected = Vec::new();
    let mut buf = [0u8; 4096];
    while !find_in_order(&collected, &[b"/once"]) {
        let n = conn.read(&mut buf).await.unwrap();
        assert!(n > 0);
        collected.extend_from_slice(&buf[..n]);
    }

    // Say nothing; the server hangs up once the idle budget elapses.
    let started = std::time::Instant::now();
    loop {
        let n = conn.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
    }
    assert!(started.elapsed() >= Duration::from_millis(90));
    assert!(started.elapsed() < Duration::from_secs(5));

    shutdown.cancel();
}

#[tokio::test]
async fn oversized_request_heads_are_refused() {
    let mut server = HttpServer::new(Arc::new(TargetEcho));
    server.max_header_bytes = 128;
    let (addr, shutdown) = spawn_http(server).await;

    let mut conn = TcpStream::connect(addr).await.unwrap();
    let mut req = b"GET / HTTP/1.1\r\n".to_vec();
    req.extend_from_slice(format!("X-Filler: {}\r\n\r\n", "x".repeat(512)).as_bytes());
    conn.write_all(&req).await.unwrap();

    // Closed without a response; the parser never saw a full head.
    let mut buf = [0u8; 1];
    assert_eq!(conn.read(&mut buf).await.unwrap(), 0);

    shutdown.cancel();
}

#[tokio::test]
async fn request_bodies_are_framed_and_drained() {
    struct BodyReader;

    #[async_trait]
    impl HttpHandler for BodyReader {
        async fn serve_http(
            &self,
            res: &mut ResponseWriter<'_>,
            req: &mut Request<'_>,
        ) -> anyhow::Result<()> {
            let body = req.body.read_to_end().await?;
            let reply = format!("got {} bytes", body.len()).into_bytes();
            res.header().set("Content-Length", reply.len().to_string());
            res.write_header(200);
            res.write(&reply).await?;
            Ok(())
        }
    }

    let (addr, shutdown) = spawn_http(HttpServer::new(Arc::new(BodyReader))).await;

    let conn = TcpStream::connect(addr).await.unwrap();
    let mut transport = ConnTransport::new(Box::new(conn));

    let mut req = ClientRequest::new(Method::POST, addr.to_string(), "/ingest");
    req.body = vec![b'p'; 2048];
    let mut res = transport.round_trip(req).await.unwrap();
    assert_eq!(res.body.read_to_end().await.unwrap(), b"got 2048 bytes");

    // The same connection serves the next request, so the body was fully
    // consumed by the pipeline.
    let mut req = ClientRequest::new(Method::POST, addr.to_string(), "/again");
    req.body = b"tail".to_vec();
    let mut res = transport.round_trip(req).await.unwrap();
    assert_eq!(res.body.read_to_end().await.unwrap(), b"got 4 bytes");

    shutdown.cancel();
}

#[tokio::test]
async fn transparent_mode_still_dispatches_upgrades() {
    // Proxy mode rewrites the request's origin but leaves upgrade
    // dispatch alone: with no upgrader configured the handshake gets 501
    // instead of reaching the request handler.
    let server = HttpServer::new(Arc::new(TargetEcho));
    let (ours, theirs) = tcp_pair().await.unwrap();

    let ctx = CancellationToken::new();
    let target = junction::conn::NetAddr::new("tcp", "203.0.113.9:8080");
    let serve_ctx = ctx.clone();
    tokio::spawn(async move {
        server
            .serve_proxy(serve_ctx, Box::new(ours), target)
            .await
    });

    let mut transport = ConnTransport::new(Box::new(theirs));
    let mut req = ClientRequest::get("original.example", "/");
    req.headers.set("Connection", "Upgrade");
    req.headers.set("Upgrade", "echo");
    let res = transport.round_trip(req).await.unwrap();
    assert_eq!(res.head.status, 501);

    ctx.cancel();
}

#[tokio::test]
async fn sniffed_bytes_still_count_against_the_header_cap() {
    use junction::handler::Handler;
    use junction::mux::{Probe, ProtoMux, Sniffer};

    // An HTTP server behind a protocol mux: the sniffer consumes the
    // first bytes and replays them to the engine, which must still hold
    // the header block to its cap.
    struct HttpProto(HttpServer);

    #[async_trait]
    impl Probe for HttpProto {
        async fn can_read(&self, sniff: &mut Sniffer<'_>) -> std::io::Result<bool> {
            Ok(sniff.peek(4).await? == b"GET ")
        }
    }

    #[async_trait]
    impl Handler for HttpProto {
        async fn serve_conn(
            &self,
            ctx: CancellationToken,
            conn: Box<dyn junction::conn::Stream>,
        ) -> anyhow::Result<()> {
            self.0.serve_conn(ctx, conn).await
        }
    }

    let mut server = HttpServer::new(Arc::new(TargetEcho));
    server.max_header_bytes = 128;

    let lstn = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = lstn.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let mux = ProtoMux {
        protocols: vec![Arc::new(HttpProto(server))],
        read_timeout: None,
    };
    let srv = Server::new(addr.to_string(), Arc::new(mux)).with_shutdown(shutdown.clone());
    tokio::spawn(async move { srv.serve(lstn).await });

    let mut conn = TcpStream::connect(addr).await.unwrap();
    let mut req = b"GET / HTTP/1.1\r\n".to_vec();
    req.extend_from_slice(format!("X-Filler: {}\r\n\r\n", "x".repeat(512)).as_bytes());
    conn.write_all(&req).await.unwrap();

    // Closed without a response, exactly as without the mux in front.
    let mut buf = [0u8; 1];
    assert_eq!(conn.read(&mut buf).await.unwrap(), 0);

    shutdown.cancel();
}

#[tokio::test]
async fn transparent_mode_rewrites_the_request_authority() {
    struct AuthorityEcho;

    #[async_trait]
    impl HttpHandler for AuthorityEcho {
        async fn serve_http(
            &self,
            res: &mut ResponseWriter<'_>,
            req: &mut Request<'_>,
        ) -> anyhow::Result<()> {
            let body = format!("{}://{}", req.scheme, req.authority).into_bytes();
            res.header().set("Content-Length", body.len().to_string());
            res.write_header(200);
            res.write(&body).await?;
            Ok(())
        }
    }

    let server = HttpServer::new(Arc::new(AuthorityEcho));
    let (ours, theirs) = tcp_pair().await.unwrap();

    let ctx = CancellationToken::new();
    let target = junction::conn::NetAddr::new("tcp", "203.0.113.9:8080");
    let serve_ctx = ctx.clone();
    tokio::spawn(async move {
        server
            .serve_proxy(serve_ctx, Box::new(ours), target)
            .await
    });

    let mut transport = ConnTransport::new(Box::new(theirs));
    let mut res = transport
        .round_trip(ClientRequest::get("original.example", "/"))
        .await
        .unwrap();
    assert_eq!(
        res.body.read_to_end().await.unwrap(),
        b"http://203.0.113.9:8080"
    );

    ctx.cancel();
}
