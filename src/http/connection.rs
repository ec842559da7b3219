//! The per-connection HTTP pipeline.
//!
//! One connection serves requests strictly in arrival order: wait for the
//! next request with the idle budget, read the head under the byte cap and
//! the read deadline, run the handler, flush the response, drain whatever
//! the handler left of the body, and go again — until the exchange asks to
//! close, a write fails, or the connection is hijacked.

use std::future::pending;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::conn::{NetAddr, Stream};
use crate::error::timeout as timeout_error;
use crate::handler::{Handler, ProxyHandler};
use crate::http::body::{Body, BodyState};
use crate::http::conn::{ConnReader, ConnWriter};
use crate::http::header::HeaderMap;
use crate::http::request::{parse_request_head, ParseError, RequestHead};
use crate::http::writer::{ResponseWriter, WriteError};
use crate::poll::{poll_read_fd, ReadEvent};

/// Default cap on the request line plus header block.
pub const DEFAULT_MAX_HEADER_BYTES: usize = 1_048_576;

/// One HTTP request, as seen by a request handler.
pub struct Request<'a> {
    pub head: RequestHead,

    /// The request body, decoded from its wire framing.
    pub body: Body<'a>,

    /// Address of the socket the request arrived on.
    pub local_addr: Option<NetAddr>,

    /// Address of the peer that sent the request.
    pub remote_addr: Option<NetAddr>,

    /// URL scheme the client used to reach this server: taken from an
    /// absolute request-target when there is one, guessed from the
    /// listening socket otherwise. In transparent-proxy mode the guess is
    /// authoritative.
    pub scheme: String,

    /// The authority this request is addressed to: the intercepted
    /// destination in transparent-proxy mode, the `Host` header otherwise.
    pub authority: String,

    /// True when this exchange ends the connection.
    pub close: bool,
}

/// A request handler.
#[async_trait]
pub trait HttpHandler: Send + Sync {
    async fn serve_http(
        &self,
        res: &mut ResponseWriter<'_>,
        req: &mut Request<'_>,
    ) -> anyhow::Result<()>;
}

/// A handler that responds with a fixed status and no body.
pub struct StatusHandler(pub u16);

#[async_trait]
impl HttpHandler for StatusHandler {
    async fn serve_http(
        &self,
        res: &mut ResponseWriter<'_>,
        _req: &mut Request<'_>,
    ) -> anyhow::Result<()> {
        res.header().set("Content-Length", "0");
        res.write_header(self.0);
        Ok(())
    }
}

/// An HTTP/1.x server over one byte stream at a time. Plug it into a
/// [`Server`](crate::server::Server) to serve a listener.
pub struct HttpServer {
    /// Called for every parsed request.
    pub handler: Arc<dyn HttpHandler>,

    /// Called instead of `handler` when a request carries
    /// `Connection: Upgrade`. Without one, upgrades get 501.
    pub upgrader: Option<Arc<dyn HttpHandler>>,

    /// Wait budget for the next request on an idle connection.
    pub idle_timeout: Option<Duration>,

    /// Deadline for reading one request head, from its first byte.
    pub read_timeout: Option<Duration>,

    /// Deadline applied to response writes.
    pub write_timeout: Option<Duration>,

    /// Cap on the request line plus headers.
    pub max_header_bytes: usize,

    /// Value of the `Server` response header. Empty omits the header.
    pub server_name: String,
}

impl HttpServer {
    pub fn new(handler: Arc<dyn HttpHandler>) -> Self {
        Self {
            handler,
            upgrader: None,
            idle_timeout: None,
            read_timeout: None,
            write_timeout: None,
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
            server_name: String::new(),
        }
    }
}

#[async_trait]
impl Handler for HttpServer {
    async fn serve_conn(
        &self,
        ctx: CancellationToken,
        conn: Box<dyn Stream>,
    ) -> anyhow::Result<()> {
        self.serve(ctx, conn, None).await
    }
}

#[async_trait]
impl ProxyHandler for HttpServer {
    /// Serves intercepted connections: the client believes it is talking
    /// to `target` directly, so each request is rewritten to carry the
    /// scheme and authority it was actually addressed to before the
    /// handler runs.
    async fn serve_proxy(
        &self,
        ctx: CancellationToken,
        conn: Box<dyn Stream>,
        target: NetAddr,
    ) -> anyhow::Result<()> {
        self.serve(ctx, conn, Some(target)).await
    }
}

impl HttpServer {
    async fn serve(
        &self,
        ctx: CancellationToken,
        mut conn: Box<dyn Stream>,
        proxy_target: Option<NetAddr>,
    ) -> anyhow::Result<()> {
        let local_addr = conn.local_addr().ok();
        let remote_addr = conn.peer_addr().ok();
        let fd = conn.raw_fd();

        // Bytes a sniffer already pulled off the wire will never trigger
        // descriptor readiness again; consume them up front so they go
        // through the read buffer instead.
        let mut read_ahead = Vec::new();
        while !conn.read_ahead().is_empty() {
            let mut chunk = [0u8; 1024];
            let n = tokio::io::AsyncReadExt::read(&mut conn, &mut chunk).await?;
            if n == 0 {
                break;
            }
            read_ahead.extend_from_slice(&chunk[..n]);
        }

        let (rh, wh) = tokio::io::split(conn);
        let mut reader = Some(ConnReader::new(rh));
        if !read_ahead.is_empty() {
            reader.as_mut().expect("reader present").seed(&read_ahead);
        }
        let mut writer = Some(ConnWriter::new(wh, self.write_timeout));

        let mut base_header = HeaderMap::new();
        base_header.set("Content-Type", "application/octet-stream");
        if !self.server_name.is_empty() {
            base_header.set("Server", self.server_name.clone());
        }
        if let Some(idle) = self.idle_timeout {
            base_header.set("Connection", "Keep-Alive");
            base_header.set("Keep-Alive", format!("timeout={}", idle.as_secs()));
        }

        loop {
            {
                let r = reader.as_mut().expect("reader present");

                if wait_ready_read(r, fd, self.idle_timeout, &ctx).await.is_err() {
                    return Ok(());
                }
            }

            let head = {
                let r = reader.as_mut().expect("reader present");
                match read_request_head(r, self.max_header_bytes, self.read_timeout).await {
                    Ok(head) => head,
                    Err(e) => {
                        // The peer is desynchronized or gone; responding
                        // would only confuse it further.
                        debug!(error = %e, "dropping connection without a response");
                        return Ok(());
                    }
                }
            };

            let mut close = head.headers.has_token("Connection", "close")
                || (head.version == (1, 0) && !head.headers.has_token("Connection", "keep-alive"));

            let mut head = head;
            // close and keep-alive are connection management, handled here;
            // handlers only see the remaining Connection tokens.
            head.headers.remove_tokens("Connection", &["close", "keep-alive"]);

            let body_state = match BodyState::for_request(&head) {
                Ok(state) => state,
                Err(e) => {
                    debug!(error = %e, "unreadable request body framing");
                    return Ok(());
                }
            };

            let mut header = base_header.clone();
            if close {
                if head.proto_at_least(1, 1) {
                    header.add("Connection", "close");
                }
            } else if head.version == (1, 0) {
                header.add("Connection", "keep-alive");
            }

            let (scheme, authority) =
                request_origin(&head, local_addr.as_ref(), proxy_target.as_ref());

            let version = head.version;
            let wants_upgrade = head.upgrade().is_some();
            let has_expect = head.headers.contains("Expect");

            let mut req = Request {
                head,
                body: Body::new(&mut reader, body_state),
                local_addr: local_addr.clone(),
                remote_addr: remote_addr.clone(),
                scheme,
                authority,
                close,
            };
            let mut res = ResponseWriter::new(&mut writer, header, version);

            let handler: Arc<dyn HttpHandler> = if has_expect {
                Arc::new(StatusHandler(417))
            } else if wants_upgrade {
                match &self.upgrader {
                    Some(upgrader) => Arc::clone(upgrader),
                    None => Arc::new(StatusHandler(501)),
                }
            } else {
                Arc::clone(&self.handler)
            };

            let outcome = std::panic::AssertUnwindSafe(handler.serve_http(&mut res, &mut req))
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(error = %format!("{e:#}"), "request handler failed");
                    if res.status() == 0 {
                        res.write_header(500);
                    } else {
                        close = true;
                    }
                }
                Err(panic) => {
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!(panic = %msg, "request handler panicked");
                    if res.status() == 0 {
                        res.write_header(500);
                    } else {
                        close = true;
                    }
                }
            }

            if res.hijacked() {
                // The connection now belongs to whoever took it.
                return Ok(());
            }

            let _ = res.finish().await;
            let flushed = res.flush().await;
            let errored = res.error().cloned();
            drop(res);

            match errored {
                None => {
                    if flushed.is_err() {
                        return Ok(());
                    }
                }
                // The wire is still framed correctly after an overrun; the
                // validly written bytes go out before the connection ends.
                Some(WriteError::ContentLengthExceeded) => {
                    if let Some(w) = writer.as_mut() {
                        let _ = w.flush().await;
                    }
                    return Ok(());
                }
                Some(_) => return Ok(()),
            }
            // Handlers may flip `close` on the request to drop the
            // connection once their response is out.
            if close || req.close {
                return Ok(());
            }

            if req.body.drain().await.is_err() {
                return Ok(());
            }
            drop(req);
        }
    }
}

/// Scheme and authority a request was addressed to.
fn request_origin(
    head: &RequestHead,
    local_addr: Option<&NetAddr>,
    proxy_target: Option<&NetAddr>,
) -> (String, String) {
    // An absolute request-target names both explicitly.
    let (target_scheme, target_authority) = match head.target.find("://") {
        Some(off) => {
            let scheme = &head.target[..off];
            let rest = &head.target[off + 3..];
            let authority = rest.split('/').next().unwrap_or("");
            (Some(scheme), Some(authority))
        }
        None => (None, None),
    };

    let scheme = match target_scheme {
        Some(s) => s.to_string(),
        // The client did not say; infer from the socket it connected to.
        None => match local_addr {
            Some(a) if a.net == "tls" => "https".to_string(),
            _ => "http".to_string(),
        },
    };

    let authority = match proxy_target {
        Some(target) => target.to_string(),
        None => target_authority
            .map(str::to_string)
            .or_else(|| head.headers.get("Host").map(str::to_string))
            .unwrap_or_default(),
    };

    (scheme, authority)
}

/// Waits until the connection has request bytes to read.
///
/// Uses the readiness poller when the connection is backed by an OS
/// descriptor; otherwise falls back to polling reads with a one-second
/// deadline so cancellation is observed on quiet connections.
async fn wait_ready_read(
    r: &mut ConnReader,
    fd: Option<RawFd>,
    idle: Option<Duration>,
    ctx: &CancellationToken,
) -> io::Result<()> {
    if !r.buffered().is_empty() {
        return Ok(());
    }

    if let Some(fd) = fd {
        let (ready, _guard) = poll_read_fd(fd)?;
        let idle_wait = async {
            match idle {
                Some(t) => sleep(t).await,
                None => pending().await,
            }
        };
        return tokio::select! {
            ev = ready.wait() => match ev? {
                ReadEvent::Ready => Ok(()),
                ReadEvent::Cancelled => Err(io::ErrorKind::Interrupted.into()),
            },
            _ = idle_wait => Err(timeout_error("i/o timeout waiting for a request")),
            _ = ctx.cancelled() => Err(io::ErrorKind::Interrupted.into()),
        };
    }

    let deadline = idle.map(|t| Instant::now() + t);
    loop {
        if ctx.is_cancelled() {
            return Err(io::ErrorKind::Interrupted.into());
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return Err(timeout_error("i/o timeout waiting for a request"));
            }
        }
        match timeout(Duration::from_secs(1), r.fill()).await {
            Err(_) => continue,
            Ok(Ok(0)) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(Ok(_)) => return Ok(()),
            Ok(Err(e)) => return Err(e),
        }
    }
}

/// Reads and parses one request head, applying the byte cap and the read
/// deadline.
async fn read_request_head(
    r: &mut ConnReader,
    max_header_bytes: usize,
    read_timeout: Option<Duration>,
) -> io::Result<RequestHead> {
    r.set_limit(max_header_bytes);

    let parse = async {
        loop {
            match parse_request_head(r.buffered()) {
                Ok((head, consumed)) => {
                    // Bytes handed over by a sniffer are already buffered,
                    // so the byte budget alone cannot bound them; the
                    // parsed head is measured as well.
                    if consumed > max_header_bytes {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "request header over the configured cap",
                        ));
                    }
                    r.consume(consumed);
                    return Ok(head);
                }
                Err(ParseError::Incomplete) => {
                    if r.buffered().len() >= max_header_bytes {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "request header over the configured cap",
                        ));
                    }
                    if r.fill().await? == 0 {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "request header truncated or over the configured cap",
                        ));
                    }
                }
                Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
            }
        }
    };

    let res = match read_timeout {
        Some(t) => timeout(t, parse)
            .await
            .unwrap_or_else(|_| Err(timeout_error("i/o timeout reading the request header"))),
        None => parse.await,
    };

    // Body reads are not header reads; lift the cap whatever happened.
    r.clear_limit();
    res
}
