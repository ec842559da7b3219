//! Buffered halves of an HTTP connection.
//!
//! The engine splits a stream into a read half and a write half so that a
//! request body and a response writer can be borrowed independently during
//! one exchange. [`ConnReader`] adds the input buffer and the byte budget
//! used to cap header reads; [`ConnWriter`] adds output buffering and the
//! write deadline. Hijacking reunites the halves into the original stream.

use std::io;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::conn::Stream;
use crate::error::timeout as timeout_error;

const READ_CHUNK: usize = 4096;
const WRITE_SPILL: usize = 8192;

/// Buffered reading side of a connection.
pub struct ConnReader {
    r: ReadHalf<Box<dyn Stream>>,
    buf: BytesMut,
    limit: Option<usize>,
    seeded: usize,
}

impl std::fmt::Debug for ConnReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnReader")
            .field("buf", &self.buf)
            .field("limit", &self.limit)
            .field("seeded", &self.seeded)
            .finish()
    }
}

impl ConnReader {
    pub fn new(r: ReadHalf<Box<dyn Stream>>) -> Self {
        Self {
            r,
            buf: BytesMut::with_capacity(READ_CHUNK),
            limit: None,
            seeded: 0,
        }
    }

    /// Bytes read from the socket but not consumed yet.
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// Preloads bytes that were consumed from the wire before this reader
    /// took over, e.g. by a protocol sniffer. They came off the wire like
    /// any other bytes, so they are charged against the next byte budget.
    pub(crate) fn seed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        self.seeded += bytes.len();
    }

    /// Drops `n` buffered bytes.
    pub fn consume(&mut self, n: usize) {
        self.buf.advance(n);
    }

    /// Caps how many more bytes may be read from the socket. When the
    /// budget reaches zero further fills report end of stream, which is how
    /// an oversized header block surfaces to the parser. Seeded bytes that
    /// were never budgeted are deducted here.
    pub fn set_limit(&mut self, limit: usize) {
        self.limit = Some(limit.saturating_sub(self.seeded));
        self.seeded = 0;
    }

    pub fn clear_limit(&mut self) {
        self.limit = None;
    }

    /// Reads more bytes from the socket into the buffer. Returns how many
    /// arrived; 0 means end of stream or an exhausted byte budget.
    pub async fn fill(&mut self) -> io::Result<usize> {
        let want = match self.limit {
            Some(0) => return Ok(0),
            Some(budget) => budget.min(READ_CHUNK),
            None => READ_CHUNK,
        };

        let mut chunk = [0u8; READ_CHUNK];
        let n = self.r.read(&mut chunk[..want]).await?;
        if let Some(budget) = &mut self.limit {
            *budget -= n;
        }
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    /// Reads into `dst`, draining the buffer before touching the socket.
    pub async fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        if !self.buf.is_empty() {
            let n = self.buf.len().min(dst.len());
            dst[..n].copy_from_slice(&self.buf[..n]);
            self.buf.advance(n);
            return Ok(n);
        }
        if dst.is_empty() {
            return Ok(0);
        }
        match self.limit {
            Some(0) => Ok(0),
            Some(budget) => {
                let want = budget.min(dst.len());
                let n = self.r.read(&mut dst[..want]).await?;
                self.limit = Some(budget - n);
                Ok(n)
            }
            None => self.r.read(dst).await,
        }
    }

    /// Fills until at least one full line terminated by CRLF is buffered,
    /// then consumes and returns it without the terminator. Lines longer
    /// than `max` are refused.
    pub async fn read_crlf_line(&mut self, max: usize) -> io::Result<Vec<u8>> {
        loop {
            if let Some(pos) = self
                .buf
                .windows(2)
                .position(|w| w == b"\r\n")
            {
                let line = self.buf[..pos].to_vec();
                self.buf.advance(pos + 2);
                return Ok(line);
            }
            if self.buf.len() > max {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "line exceeds the configured maximum",
                ));
            }
            if self.fill().await? == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
        }
    }

    fn into_parts(self) -> (ReadHalf<Box<dyn Stream>>, BytesMut) {
        (self.r, self.buf)
    }
}

/// Buffered writing side of a connection.
pub struct ConnWriter {
    w: WriteHalf<Box<dyn Stream>>,
    buf: Vec<u8>,
    timeout: Option<Duration>,
}

impl std::fmt::Debug for ConnWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnWriter")
            .field("buf", &self.buf)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ConnWriter {
    pub fn new(w: WriteHalf<Box<dyn Stream>>, timeout: Option<Duration>) -> Self {
        Self {
            w,
            buf: Vec::with_capacity(WRITE_SPILL),
            timeout,
        }
    }

    /// Queues bytes without touching the socket.
    pub fn append(&mut self, b: &[u8]) {
        self.buf.extend_from_slice(b);
    }

    /// Queues bytes, spilling the buffer to the socket once it grows past
    /// the spill threshold.
    pub async fn write(&mut self, b: &[u8]) -> io::Result<()> {
        self.buf.extend_from_slice(b);
        if self.buf.len() >= WRITE_SPILL {
            self.flush().await?;
        }
        Ok(())
    }

    /// Sends everything buffered, bounded by the write deadline.
    pub async fn flush(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let res = match self.timeout {
            Some(t) => tokio::time::timeout(t, drain(&mut self.w, &self.buf))
                .await
                .unwrap_or_else(|_| Err(timeout_error("i/o timeout writing the response"))),
            None => drain(&mut self.w, &self.buf).await,
        };
        self.buf.clear();
        res
    }

    fn into_write_half(self) -> WriteHalf<Box<dyn Stream>> {
        self.w
    }
}

async fn drain(w: &mut WriteHalf<Box<dyn Stream>>, buf: &[u8]) -> io::Result<()> {
    w.write_all(buf).await?;
    w.flush().await
}

/// Reunites the two halves into the stream they were split from, returning
/// any bytes that were read ahead and must be replayed by the new owner.
pub fn reunite(reader: ConnReader, writer: ConnWriter) -> (Box<dyn Stream>, Vec<u8>) {
    let (r, buf) = reader.into_parts();
    let stream = r.unsplit(writer.into_write_half());
    (stream, buf.to_vec())
}
