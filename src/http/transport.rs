//! A round-tripper bound to a single connection.
//!
//! [`ConnTransport`] sends one request and reads one response over a
//! pre-established stream, or dials a fresh connection per request when it
//! was built without one. Responses stream their body; when the transport
//! dialed, dropping the body closes the dialed connection.

use std::io;
use std::time::Duration;

use crate::conn::{NetAddr, Stream};
use crate::error::timeout as timeout_error;
use crate::http::body::BodyState;
use crate::http::conn::{ConnReader, ConnWriter};
use crate::http::header::HeaderMap;
use crate::http::request::{Method, ParseError, RequestHead};
use crate::http::response::{parse_response_head, ResponseHead};
use crate::tunnel::{dial_default, DialFn};

/// Default cap on response head bytes.
pub const DEFAULT_MAX_RESPONSE_HEADER_BYTES: usize = 1_048_576;

/// An outgoing request.
pub struct ClientRequest {
    pub method: Method,
    /// Request-target as it goes on the request line, e.g. `/status`.
    pub target: String,
    /// Authority the request is addressed to; also the default dial
    /// target, as `host:port`.
    pub host: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl ClientRequest {
    pub fn new(method: Method, host: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            method,
            target: target.into(),
            host: host.into(),
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    pub fn get(host: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(Method::GET, host, target)
    }
}

/// A response being read from the connection.
#[derive(Debug)]
pub struct ClientResponse<'a> {
    pub head: ResponseHead,
    pub body: ClientBody<'a>,
}

#[derive(Debug)]
enum BodyIo<'a> {
    /// The transport's own connection, reused across round trips.
    Reused(&'a mut ConnReader),
    /// A connection dialed for this request; dies with the body.
    Owned(ConnReader, #[allow(dead_code)] ConnWriter),
}

/// Streams the response body.
#[derive(Debug)]
pub struct ClientBody<'a> {
    io: BodyIo<'a>,
    state: BodyState,
}

impl ClientBody<'_> {
    /// Reads decoded body bytes; 0 means the body ended.
    pub async fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        let reader = match &mut self.io {
            BodyIo::Reused(r) => &mut **r,
            BodyIo::Owned(r, _) => r,
        };
        self.state.read(reader, dst).await
    }

    /// Reads the entire remaining body into memory.
    pub async fn read_to_end(&mut self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = self.read(&mut chunk).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Performs HTTP round trips over one connection at a time.
pub struct ConnTransport {
    buffer: Option<(ConnReader, ConnWriter)>,
    dial: Option<DialFn>,

    /// Wait budget for the response head after the request was written.
    pub response_header_timeout: Option<Duration>,

    /// Cap on response head bytes. Zero means the default.
    pub max_response_header_bytes: usize,
}

impl ConnTransport {
    /// A transport bound to an existing connection. The buffered halves are
    /// kept across round trips.
    pub fn new(conn: Box<dyn Stream>) -> Self {
        let (rh, wh) = tokio::io::split(conn);
        Self {
            buffer: Some((ConnReader::new(rh), ConnWriter::new(wh, None))),
            dial: None,
            response_header_timeout: None,
            max_response_header_bytes: 0,
        }
    }

    /// A transport that dials `dial` for every request.
    pub fn with_dial(dial: DialFn) -> Self {
        Self {
            buffer: None,
            dial: Some(dial),
            response_header_timeout: None,
            max_response_header_bytes: 0,
        }
    }

    /// A transport that dials the request host over TCP for every request.
    pub fn dial_on_demand() -> Self {
        Self {
            buffer: None,
            dial: None,
            response_header_timeout: None,
            max_response_header_bytes: 0,
        }
    }

    /// Sends `req` and reads the response head. The returned response
    /// borrows the transport until its body is dropped.
    pub async fn round_trip(&mut self, req: ClientRequest) -> io::Result<ClientResponse<'_>> {
        let mut owned = None;
        if self.buffer.is_none() {
            let target = NetAddr::new("tcp", req.host.clone());
            let conn = match &self.dial {
                Some(dial) => dial(target).await?,
                None => dial_default(&target).await?,
            };
            let (rh, wh) = tokio::io::split(conn);
            owned = Some((ConnReader::new(rh), ConnWriter::new(wh, None)));
        }

        let (r, w) = match owned.as_mut().or(self.buffer.as_mut()) {
            Some((r, w)) => (r, w),
            None => unreachable!("either a dialed or a kept connection exists"),
        };

        write_request(w, &req).await?;
        let head = read_response_head(
            r,
            effective_cap(self.max_response_header_bytes),
            self.response_header_timeout,
        )
        .await?;

        let state = BodyState::for_response(&req.method, &head)
            .map_err(|e: ParseError| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let body = match owned {
            Some((r, w)) => ClientBody {
                io: BodyIo::Owned(r, w),
                state,
            },
            None => {
                let (r, _) = self.buffer.as_mut().expect("kept connection");
                ClientBody {
                    io: BodyIo::Reused(r),
                    state,
                }
            }
        };

        Ok(ClientResponse { head, body })
    }
}

fn effective_cap(configured: usize) -> usize {
    if configured == 0 {
        DEFAULT_MAX_RESPONSE_HEADER_BYTES
    } else {
        configured
    }
}

async fn write_request(w: &mut ConnWriter, req: &ClientRequest) -> io::Result<()> {
    let mut head = RequestHead {
        method: req.method.clone(),
        target: req.target.clone(),
        version: (1, 1),
        headers: req.headers.clone(),
    };
    if !head.headers.contains("Host") {
        head.headers.set("Host", req.host.clone());
    }
    if !req.body.is_empty() && !head.headers.contains("Content-Length") {
        head.headers.set("Content-Length", req.body.len().to_string());
    }

    let mut out = Vec::with_capacity(256);
    head.write_to(&mut out);
    w.append(&out);
    w.write(&req.body).await?;
    w.flush().await
}

async fn read_response_head(
    r: &mut ConnReader,
    cap: usize,
    header_timeout: Option<Duration>,
) -> io::Result<ResponseHead> {
    r.set_limit(cap);

    let parse = async {
        loop {
            match parse_response_head(r.buffered()) {
                Ok((head, consumed)) => {
                    r.consume(consumed);
                    return Ok(head);
                }
                Err(ParseError::Incomplete) => {
                    if r.fill().await? == 0 {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "response header truncated or over the configured cap",
                        ));
                    }
                }
                Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
            }
        }
    };

    let res = match header_timeout {
        Some(t) => tokio::time::timeout(t, parse)
            .await
            .unwrap_or_else(|_| Err(timeout_error("i/o timeout reading the response header"))),
        None => parse.await,
    };

    r.clear_limit();
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::tcp_pair;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn round_trip_over_an_existing_connection() {
        let (a, mut peer) = tcp_pair().await.unwrap();

        let server = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let n = peer.read(&mut buf).await.unwrap();
            let text = String::from_utf8_lossy(&buf[..n]).to_string();
            peer.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                .await
                .unwrap();
            text
        });

        let mut transport = ConnTransport::new(Box::new(a));
        let mut res = transport
            .round_trip(ClientRequest::get("example.com:80", "/status"))
            .await
            .unwrap();

        assert_eq!(res.head.status, 200);
        assert_eq!(res.body.read_to_end().await.unwrap(), b"ok");

        let sent = server.await.unwrap();
        assert!(sent.starts_with("GET /status HTTP/1.1\r\n"));
        assert!(sent.contains("Host: example.com:80\r\n"));
    }

    #[tokio::test]
    async fn response_header_cap_is_enforced() {
        let (a, mut peer) = tcp_pair().await.unwrap();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let _ = peer.read(&mut buf).await;
            let mut res = b"HTTP/1.1 200 OK\r\n".to_vec();
            res.extend_from_slice(format!("X-Filler: {}\r\n", "y".repeat(512)).as_bytes());
            res.extend_from_slice(b"\r\n");
            let _ = peer.write_all(&res).await;
            // Keep the connection open so the failure comes from the cap,
            // not from an early close.
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(peer);
        });

        let mut transport = ConnTransport::new(Box::new(a));
        transport.max_response_header_bytes = 64;
        let err = transport
            .round_trip(ClientRequest::get("example.com:80", "/"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn header_timeout_bounds_a_silent_server() {
        let (a, _peer) = tcp_pair().await.unwrap();

        let mut transport = ConnTransport::new(Box::new(a));
        transport.response_header_timeout = Some(Duration::from_millis(50));
        let err = transport
            .round_trip(ClientRequest::get("example.com:80", "/"))
            .await
            .unwrap_err();
        assert!(crate::error::is_timeout(&err));
    }
}
