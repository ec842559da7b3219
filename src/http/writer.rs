//! The response writer.
//!
//! One [`ResponseWriter`] serves one request. The write strategy is fixed
//! by the first header write: statuses that forbid a body reject writes, a
//! declared `Content-Length` streams bytes through with the budget
//! enforced, and everything else switches to the chunked transfer encoding
//! through a small aggregation buffer. Errors stick: after the first
//! failure every operation short-circuits with the same error.

use thiserror::Error;

use crate::conn::{PrefixStream, Stream};
use crate::http::body::Body;
use crate::http::conn::{reunite, ConnWriter};
use crate::http::header::HeaderMap;
use crate::http::response::{body_forbidden, status_text};

/// Size of the chunk aggregation buffer. Small writes coalesce into one
/// chunk; anything larger goes out as a chunk of its own.
const CHUNK_BUFFER_SIZE: usize = 512;

/// Errors returned by response-write operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteError {
    /// The response status forbids a body.
    #[error("the response status does not allow a body")]
    BodyNotAllowed,

    /// More body bytes were written than `Content-Length` declared.
    #[error("the response body exceeds the declared content length")]
    ContentLengthExceeded,

    /// The connection was taken over and no longer carries HTTP.
    #[error("the connection has already been hijacked")]
    Hijacked,

    /// The connection failed while writing.
    #[error("{0}")]
    Io(String),
}

impl From<std::io::Error> for WriteError {
    fn from(e: std::io::Error) -> Self {
        WriteError::Io(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Unwritten,
    NoBody,
    Identity,
    Chunked,
}

/// A connection taken over from the HTTP engine.
///
/// `read_buf` holds bytes the engine had read ahead; they belong to the new
/// protocol and must be consumed before the stream itself.
pub struct Hijacked {
    pub stream: Box<dyn Stream>,
    pub read_buf: Vec<u8>,
}

impl Hijacked {
    /// The raw connection with any read-ahead bytes replayed first.
    pub fn into_stream(self) -> Box<dyn Stream> {
        if self.read_buf.is_empty() {
            self.stream
        } else {
            Box::new(PrefixStream::new(self.stream, self.read_buf))
        }
    }
}

/// Writes one HTTP response.
pub struct ResponseWriter<'a> {
    writer: &'a mut Option<ConnWriter>,
    header: HeaderMap,
    version: (u8, u8),
    status: u16,
    mode: Mode,
    remaining: u64,
    chunk: ChunkWriter,
    err: Option<WriteError>,
}

impl<'a> ResponseWriter<'a> {
    pub(crate) fn new(
        writer: &'a mut Option<ConnWriter>,
        header: HeaderMap,
        version: (u8, u8),
    ) -> Self {
        Self {
            writer,
            header,
            version,
            status: 0,
            mode: Mode::Unwritten,
            remaining: 0,
            chunk: ChunkWriter::new(),
            err: None,
        }
    }

    /// The response headers. Changes made after the header block went out
    /// have no effect on the wire.
    pub fn header(&mut self) -> &mut HeaderMap {
        &mut self.header
    }

    /// The status that was sent, or 0 while the header is unwritten.
    pub fn status(&self) -> u16 {
        self.status
    }

    pub(crate) fn error(&self) -> Option<&WriteError> {
        self.err.as_ref()
    }

    pub(crate) fn hijacked(&self) -> bool {
        self.writer.is_none()
    }

    /// Sends the status line and header block. The first call wins; any
    /// later call is a no-op. A zero status stands for 200.
    pub fn write_header(&mut self, status: u16) {
        if self.status != 0 || self.err.is_some() {
            return;
        }
        let writer = match self.writer.as_mut() {
            Some(w) => w,
            None => return,
        };
        let status = if status == 0 { 200 } else { status };
        self.status = status;

        if body_forbidden(status) {
            self.mode = Mode::NoBody;
            self.header.remove("Transfer-Encoding");
            self.header.remove("Content-Length");
        } else {
            match self
                .header
                .get("Content-Length")
                .and_then(|v| v.trim().parse::<u64>().ok())
            {
                Some(n) => {
                    self.mode = Mode::Identity;
                    self.remaining = n;
                }
                None => {
                    // An unparsable length cannot frame the body; chunked
                    // framing replaces it.
                    self.header.remove("Content-Length");
                    self.header.set("Transfer-Encoding", "chunked");
                    self.mode = Mode::Chunked;
                }
            }
        }

        if !self.header.contains("Date") {
            self.header.set("Date", http_date());
        }

        let mut head = Vec::with_capacity(256);
        head.extend_from_slice(
            format!("HTTP/{}.{} {} ", self.version.0, self.version.1, status).as_bytes(),
        );
        head.extend_from_slice(status_text(status).as_bytes());
        head.extend_from_slice(b"\r\n");
        self.header.write_to(&mut head);
        head.extend_from_slice(b"\r\n");
        writer.append(&head);
    }

    /// Writes body bytes with the strategy fixed by [`write_header`].
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, WriteError> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        if self.writer.is_none() {
            return Err(WriteError::Hijacked);
        }
        self.write_header(0);

        let res = match self.mode {
            Mode::Unwritten => unreachable!("header is written above"),
            Mode::NoBody => Err(WriteError::BodyNotAllowed),
            Mode::Identity => {
                let writer = self.writer.as_mut().expect("writer present");
                let allowed = (self.remaining.min(buf.len() as u64)) as usize;
                match writer.write(&buf[..allowed]).await {
                    Err(e) => Err(WriteError::from(e)),
                    Ok(()) => {
                        self.remaining -= allowed as u64;
                        if allowed < buf.len() {
                            Err(WriteError::ContentLengthExceeded)
                        } else {
                            Ok(allowed)
                        }
                    }
                }
            }
            Mode::Chunked => {
                let writer = self.writer.as_mut().expect("writer present");
                self.chunk
                    .write(writer, buf)
                    .await
                    .map_err(WriteError::from)
            }
        };

        match res {
            Ok(n) => Ok(n),
            Err(err) => {
                // Refusing a body write does not poison the writer; losing
                // the connection or overrunning the length does.
                if !matches!(err, WriteError::BodyNotAllowed) {
                    self.err = Some(err.clone());
                }
                Err(err)
            }
        }
    }

    /// Sends the header block if it has not gone out yet and pushes
    /// everything buffered to the socket.
    pub async fn flush(&mut self) -> Result<(), WriteError> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        if self.writer.is_none() {
            return Err(WriteError::Hijacked);
        }
        self.write_header(0);

        let chunked = self.mode == Mode::Chunked;
        let writer = self.writer.as_mut().expect("writer present");

        let mut res = Ok(());
        if chunked {
            res = self.chunk.flush(writer).await;
        }
        if res.is_ok() {
            res = writer.flush().await;
        }

        if let Err(e) = res {
            let err = WriteError::from(e);
            self.err = Some(err.clone());
            return Err(err);
        }
        Ok(())
    }

    /// Ends the response body. In chunked mode this emits the terminating
    /// zero-length chunk.
    pub(crate) async fn finish(&mut self) -> Result<(), WriteError> {
        if self.err.is_some() || self.writer.is_none() {
            return Ok(());
        }
        self.write_header(0);
        if self.mode == Mode::Chunked {
            let writer = self.writer.as_mut().expect("writer present");
            if let Err(e) = self.chunk.close(writer).await {
                let err = WriteError::from(e);
                self.err = Some(err.clone());
                return Err(err);
            }
        }
        Ok(())
    }

    /// Takes the connection over from the HTTP engine.
    ///
    /// Pending chunk data is flushed, the buffered halves are reunited, and
    /// the raw stream is returned together with any bytes the engine read
    /// ahead. Every later operation on the writer or the body fails with
    /// [`WriteError::Hijacked`].
    pub async fn hijack(&mut self, body: &mut Body<'_>) -> Result<Hijacked, WriteError> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        if self.mode == Mode::Chunked {
            let writer = self.writer.as_mut().ok_or(WriteError::Hijacked)?;
            if let Err(e) = self.chunk.flush(writer).await {
                let err = WriteError::from(e);
                self.err = Some(err.clone());
                return Err(err);
            }
        }

        let mut writer = self.writer.take().ok_or(WriteError::Hijacked)?;
        let reader = match body.detach() {
            Some(r) => r,
            None => return Err(WriteError::Hijacked),
        };

        // Everything queued so far (typically a 101 response) must reach
        // the wire before the new protocol takes over.
        if let Err(e) = writer.flush().await {
            let err = WriteError::from(e);
            self.err = Some(err.clone());
            return Err(err);
        }

        self.err = Some(WriteError::Hijacked);
        let (stream, read_buf) = reunite(reader, writer);
        Ok(Hijacked { stream, read_buf })
    }
}

/// Chunked transfer encoding with small-write aggregation.
struct ChunkWriter {
    len: usize,
    buf: [u8; CHUNK_BUFFER_SIZE],
}

impl ChunkWriter {
    fn new() -> Self {
        Self {
            len: 0,
            buf: [0u8; CHUNK_BUFFER_SIZE],
        }
    }

    async fn write(&mut self, out: &mut ConnWriter, mut src: &[u8]) -> std::io::Result<usize> {
        let mut written = 0;
        while !src.is_empty() {
            let space = CHUNK_BUFFER_SIZE - self.len;
            if src.len() >= space {
                if self.len == 0 {
                    // Large write with nothing buffered: skip the copy and
                    // emit the input as one chunk.
                    write_chunk(out, src).await?;
                    return Ok(written + src.len());
                }
                self.buf[self.len..].copy_from_slice(&src[..space]);
                self.len = CHUNK_BUFFER_SIZE;
                written += space;
                src = &src[space..];
                self.flush(out).await?;
            } else {
                self.buf[self.len..self.len + src.len()].copy_from_slice(src);
                self.len += src.len();
                written += src.len();
                src = &[];
            }
        }
        Ok(written)
    }

    async fn flush(&mut self, out: &mut ConnWriter) -> std::io::Result<()> {
        if self.len != 0 {
            write_chunk(out, &self.buf[..self.len]).await?;
            self.len = 0;
        }
        Ok(())
    }

    async fn close(&mut self, out: &mut ConnWriter) -> std::io::Result<()> {
        self.flush(out).await?;
        out.write(b"0\r\n\r\n").await
    }
}

/// Emits one chunk. Empty input is suppressed: a zero-length chunk would
/// read as the end of the stream.
async fn write_chunk(out: &mut ConnWriter, data: &[u8]) -> std::io::Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    out.write(format!("{:x}\r\n", data.len()).as_bytes()).await?;
    out.write(data).await?;
    out.write(b"\r\n").await
}

fn http_date() -> String {
    chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}
