//! HTTP response representation and head parsing.

use crate::http::header::HeaderMap;
use crate::http::request::{find_head_end, parse_header_lines, parse_version, ParseError};

/// Standard reason phrase for `status`, or an empty string for codes
/// outside the registered set.
pub fn status_text(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        417 => "Expectation Failed",
        426 => "Upgrade Required",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "",
    }
}

/// True when `status` forbids a response body.
pub fn body_forbidden(status: u16) -> bool {
    (100..200).contains(&status) || status == 204 || status == 304
}

/// The parsed status line and header block of one HTTP response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: (u8, u8),
    pub status: u16,
    pub reason: String,
    pub headers: HeaderMap,
}

impl ResponseHead {
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

    pub fn is_chunked(&self) -> bool {
        self.headers.has_token("Transfer-Encoding", "chunked")
    }
}

/// Parses a response head from the start of `buf`. The contract mirrors
/// [`parse_request_head`](crate::http::request::parse_request_head).
pub fn parse_response_head(buf: &[u8]) -> Result<(ResponseHead, usize), ParseError> {
    let head_end = find_head_end(buf).ok_or(ParseError::Incomplete)?;
    let head = std::str::from_utf8(&buf[..head_end]).map_err(|_| ParseError::InvalidStartLine)?;

    let mut lines = head.split("\r\n");
    let status_line = lines.next().ok_or(ParseError::InvalidStartLine)?;

    // The reason phrase may contain spaces, or be missing entirely.
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().ok_or(ParseError::InvalidStartLine)?;
    let status = parts.next().ok_or(ParseError::InvalidStartLine)?;
    let reason = parts.next().unwrap_or("");

    let status: u16 = status.parse().map_err(|_| ParseError::InvalidStartLine)?;
    if !(100..1000).contains(&status) {
        return Err(ParseError::InvalidStartLine);
    }

    let head = ResponseHead {
        version: parse_version(version)?,
        status,
        reason: reason.to_string(),
        headers: parse_header_lines(lines)?,
    };

    Ok((head, head_end + 4))
}
