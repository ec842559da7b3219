//! HTTP request representation and head parsing.

use thiserror::Error;

use crate::http::header::HeaderMap;

/// Request methods. Anything outside the registered set is carried through
/// as an extension token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    GET,
    HEAD,
    POST,
    PUT,
    DELETE,
    OPTIONS,
    PATCH,
    CONNECT,
    TRACE,
    Extension(String),
}

impl Method {
    pub fn parse(s: &str) -> Self {
        match s {
            "GET" => Method::GET,
            "HEAD" => Method::HEAD,
            "POST" => Method::POST,
            "PUT" => Method::PUT,
            "DELETE" => Method::DELETE,
            "OPTIONS" => Method::OPTIONS,
            "PATCH" => Method::PATCH,
            "CONNECT" => Method::CONNECT,
            "TRACE" => Method::TRACE,
            _ => Method::Extension(s.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::GET => "GET",
            Method::HEAD => "HEAD",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::OPTIONS => "OPTIONS",
            Method::PATCH => "PATCH",
            Method::CONNECT => "CONNECT",
            Method::TRACE => "TRACE",
            Method::Extension(s) => s,
        }
    }
}

/// Errors that can occur while parsing a request or response head.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// The start line is malformed.
    #[error("malformed start line")]
    InvalidStartLine,

    /// The protocol version is not `HTTP/major.minor`.
    #[error("malformed protocol version")]
    InvalidVersion,

    /// A header line is malformed.
    #[error("malformed header field")]
    InvalidHeader,

    /// The `Content-Length` value is not a number.
    #[error("malformed content length")]
    InvalidContentLength,

    /// More data is needed before the head can be parsed.
    #[error("incomplete head")]
    Incomplete,
}

/// The parsed request line and header block of one HTTP request.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    /// The request-target exactly as it appeared on the request line.
    pub target: String,
    /// Protocol version as `(major, minor)`.
    pub version: (u8, u8),
    pub headers: HeaderMap,
}

impl RequestHead {
    /// True when the version is at least `major.minor`.
    pub fn proto_at_least(&self, major: u8, minor: u8) -> bool {
        self.version.0 > major || (self.version.0 == major && self.version.1 >= minor)
    }

    /// The declared body length, if any.
    pub fn content_length(&self) -> Result<Option<u64>, ParseError> {
        match self.headers.get("Content-Length") {
            None => Ok(None),
            Some(v) => v
                .trim()
                .parse::<u64>()
                .map(Some)
                .map_err(|_| ParseError::InvalidContentLength),
        }
    }

    /// True when the body uses the chunked transfer encoding.
    pub fn is_chunked(&self) -> bool {
        self.headers.has_token("Transfer-Encoding", "chunked")
    }

    /// The protocol the peer wants to switch to, when the request is an
    /// upgrade handshake.
    pub fn upgrade(&self) -> Option<&str> {
        if !self.headers.has_token("Connection", "Upgrade") {
            return None;
        }
        self.headers.get("Upgrade")
    }

    /// Serializes the head as it goes on the wire.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.method.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.target.as_bytes());
        out.extend_from_slice(
            format!(" HTTP/{}.{}\r\n", self.version.0, self.version.1).as_bytes(),
        );
        self.headers.write_to(out);
        out.extend_from_slice(b"\r\n");
    }
}

/// Parses a request head from the start of `buf`.
///
/// Returns the head and the number of bytes it occupied, including the
/// blank line. [`ParseError::Incomplete`] means the header block is not
/// fully buffered yet and the caller should read more.
pub fn parse_request_head(buf: &[u8]) -> Result<(RequestHead, usize), ParseError> {
    let head_end = find_head_end(buf).ok_or(ParseError::Incomplete)?;
    let head = std::str::from_utf8(&buf[..head_end]).map_err(|_| ParseError::InvalidStartLine)?;

    let mut lines = head.split("\r\n");
    let request_line = lines.next().ok_or(ParseError::InvalidStartLine)?;

    let mut parts = request_line.split(' ');
    let method = parts.next().filter(|s| !s.is_empty());
    let target = parts.next().filter(|s| !s.is_empty());
    let version = parts.next().filter(|s| !s.is_empty());
    if parts.next().is_some() {
        return Err(ParseError::InvalidStartLine);
    }

    let (method, target, version) = match (method, target, version) {
        (Some(m), Some(t), Some(v)) => (m, t, v),
        _ => return Err(ParseError::InvalidStartLine),
    };

    let head = RequestHead {
        method: Method::parse(method),
        target: target.to_string(),
        version: parse_version(version)?,
        headers: parse_header_lines(lines)?,
    };

    Ok((head, head_end + 4))
}

pub(crate) fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

pub(crate) fn parse_version(s: &str) -> Result<(u8, u8), ParseError> {
    let rest = s.strip_prefix("HTTP/").ok_or(ParseError::InvalidVersion)?;
    let (major, minor) = rest.split_once('.').ok_or(ParseError::InvalidVersion)?;
    Ok((
        major.parse().map_err(|_| ParseError::InvalidVersion)?,
        minor.parse().map_err(|_| ParseError::InvalidVersion)?,
    ))
}

pub(crate) fn parse_header_lines<'a>(
    lines: impl Iterator<Item = &'a str>,
) -> Result<HeaderMap, ParseError> {
    let mut headers = HeaderMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line.split_once(':').ok_or(ParseError::InvalidHeader)?;
        let name = name.trim();
        if name.is_empty() || name.contains(' ') {
            return Err(ParseError::InvalidHeader);
        }
        headers.add(name, value.trim().to_string());
    }
    Ok(headers)
}
