//! Message body framing.
//!
//! A body is read through the connection's buffered reader with one of
//! three framings: a fixed `Content-Length` budget, the chunked transfer
//! encoding, or (for responses only) everything until the peer closes.

use std::io;

use crate::http::conn::ConnReader;
use crate::http::request::RequestHead;
use crate::http::response::{body_forbidden, ResponseHead};
use crate::http::Method;

const CHUNK_SIZE_LINE_MAX: usize = 32;

/// How the body's end is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyKind {
    Empty,
    Length(u64),
    Chunked,
    /// Close-delimited; only valid for responses.
    ToEof,
}

#[derive(Debug)]
enum ChunkPhase {
    Size,
    Data(u64),
    DataEnd,
    Trailer,
}

/// Framing state machine, shared between the server's request bodies and
/// the transport's response bodies.
#[derive(Debug)]
pub(crate) struct BodyState {
    kind: BodyKind,
    remaining: u64,
    phase: ChunkPhase,
    done: bool,
}

impl BodyState {
    pub(crate) fn new(kind: BodyKind) -> Self {
        let remaining = match kind {
            BodyKind::Length(n) => n,
            _ => 0,
        };
        Self {
            kind,
            remaining,
            phase: ChunkPhase::Size,
            done: matches!(kind, BodyKind::Empty) || matches!(kind, BodyKind::Length(0)),
        }
    }

    /// Framing of a request body.
    pub(crate) fn for_request(head: &RequestHead) -> Result<Self, crate::http::ParseError> {
        if head.is_chunked() {
            return Ok(Self::new(BodyKind::Chunked));
        }
        match head.content_length()? {
            Some(n) => Ok(Self::new(BodyKind::Length(n))),
            None => Ok(Self::new(BodyKind::Empty)),
        }
    }

    /// Framing of a response body, which depends on the request method and
    /// the response status as well as the headers.
    pub(crate) fn for_response(
        method: &Method,
        head: &ResponseHead,
    ) -> Result<Self, crate::http::ParseError> {
        if *method == Method::HEAD || body_forbidden(head.status) {
            return Ok(Self::new(BodyKind::Empty));
        }
        if head.is_chunked() {
            return Ok(Self::new(BodyKind::Chunked));
        }
        match head.content_length()? {
            Some(n) => Ok(Self::new(BodyKind::Length(n))),
            None => Ok(Self::new(BodyKind::ToEof)),
        }
    }

    pub(crate) async fn read(
        &mut self,
        r: &mut ConnReader,
        dst: &mut [u8],
    ) -> io::Result<usize> {
        if self.done || dst.is_empty() {
            return Ok(0);
        }
        match self.kind {
            BodyKind::Empty => Ok(0),
            BodyKind::ToEof => {
                let n = r.read(dst).await?;
                if n == 0 {
                    self.done = true;
                }
                Ok(n)
            }
            BodyKind::Length(_) => {
                let want = (self.remaining.min(dst.len() as u64)) as usize;
                let n = r.read(&mut dst[..want]).await?;
                if n == 0 {
                    return Err(io::ErrorKind::UnexpectedEof.into());
                }
                self.remaining -= n as u64;
                if self.remaining == 0 {
                    self.done = true;
                }
                Ok(n)
            }
            BodyKind::Chunked => self.read_chunked(r, dst).await,
        }
    }

    async fn read_chunked(&mut self, r: &mut ConnReader, dst: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.phase {
                ChunkPhase::Size => {
                    let line = r.read_crlf_line(CHUNK_SIZE_LINE_MAX).await?;
                    let size = parse_chunk_size(&line)?;
                    if size == 0 {
                        self.phase = ChunkPhase::Trailer;
                    } else {
                        self.phase = ChunkPhase::Data(size);
                    }
                }
                ChunkPhase::Data(remaining) => {
                    let want = (remaining.min(dst.len() as u64)) as usize;
                    let n = r.read(&mut dst[..want]).await?;
                    if n == 0 {
                        return Err(io::ErrorKind::UnexpectedEof.into());
                    }
                    let left = remaining - n as u64;
                    self.phase = if left == 0 {
                        ChunkPhase::DataEnd
                    } else {
                        ChunkPhase::Data(left)
                    };
                    return Ok(n);
                }
                ChunkPhase::DataEnd => {
                    let line = r.read_crlf_line(2).await?;
                    if !line.is_empty() {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "missing chunk terminator",
                        ));
                    }
                    self.phase = ChunkPhase::Size;
                }
                ChunkPhase::Trailer => {
                    // Trailer fields are read and discarded.
                    let line = r.read_crlf_line(8192).await?;
                    if line.is_empty() {
                        self.done = true;
                        return Ok(0);
                    }
                }
            }
        }
    }

    pub(crate) async fn drain(&mut self, r: &mut ConnReader) -> io::Result<()> {
        let mut sink = [0u8; 4096];
        while self.read(r, &mut sink).await? != 0 {}
        Ok(())
    }
}

fn parse_chunk_size(line: &[u8]) -> io::Result<u64> {
    // Chunk extensions after ';' are tolerated and ignored.
    let digits = match line.iter().position(|&b| b == b';') {
        Some(pos) => &line[..pos],
        None => line,
    };
    let s = std::str::from_utf8(digits)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "malformed chunk size"))?;
    u64::from_str_radix(s.trim(), 16)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "malformed chunk size"))
}

/// A request body handed to the request handler.
///
/// The handler reads at most `Content-Length` bytes, or the decoded chunk
/// payloads for chunked requests; the framing never exposes the wire
/// encoding. After a hijack the body is detached and reads fail.
pub struct Body<'a> {
    reader: &'a mut Option<ConnReader>,
    state: BodyState,
}

impl<'a> Body<'a> {
    pub(crate) fn new(reader: &'a mut Option<ConnReader>, state: BodyState) -> Self {
        Self { reader, state }
    }

    /// Reads decoded body bytes. Returns 0 at the end of the body.
    pub async fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        let reader = self.reader.as_mut().ok_or_else(detached)?;
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

    /// Consumes whatever the handler left unread, so the connection is
    /// positioned at the next request.
    pub(crate) async fn drain(&mut self) -> io::Result<()> {
        match self.reader.as_mut() {
            Some(reader) => self.state.drain(reader).await,
            None => Ok(()),
        }
    }

    /// Takes the connection's read half out of the body. Used by hijack.
    pub(crate) fn detach(&mut self) -> Option<ConnReader> {
        self.reader.take()
    }
}

fn detached() -> io::Error {
    io::Error::new(
        io::ErrorKind::NotConnected,
        "the connection has been hijacked",
    )
}
