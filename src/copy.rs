//! Byte copying.
//!
//! [`copy_stream`] moves everything from one stream to another, probing
//! the ends for a direct-transfer capability before it reaches for a
//! buffer: a reader that can push its bytes straight out is delegated to
//! first, then a writer that can pull them straight in, and only when
//! neither offers a direct path does the generic loop run. That loop
//! borrows its buffer from a free list, so repeated copies put no
//! pressure on the allocator.

use std::io;
use std::sync::Mutex;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::conn::Stream;

const BUFFER_SIZE: usize = 8192;

static POOL: Mutex<Vec<Vec<u8>>> = Mutex::new(Vec::new());

/// A copy buffer checked out of the pool, returned on drop.
struct PooledBuf(Vec<u8>);

impl PooledBuf {
    fn get() -> Self {
        let buf = POOL
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| vec![0u8; BUFFER_SIZE]);
        Self(buf)
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        POOL.lock().unwrap().push(std::mem::take(&mut self.0));
    }
}

/// Copies everything from one stream to another.
///
/// The ends are probed for their direct-transfer capabilities in order:
/// the reader's [`write_to`](Stream::write_to), then the writer's
/// [`read_from`](Stream::read_from), and finally the pooled-buffer loop
/// of [`copy`] when neither claims the transfer.
pub async fn copy_stream(
    from: &mut Box<dyn Stream>,
    to: &mut Box<dyn Stream>,
) -> io::Result<u64> {
    if let Some(res) = from.write_to(to).await {
        return res;
    }
    if let Some(res) = to.read_from(from).await {
        return res;
    }
    copy(from, to).await
}

/// Copies bytes from `r` to `w` until end of stream, using a pooled
/// intermediate buffer.
///
/// Returns the number of bytes transferred. End of stream is a normal
/// completion, not an error; any other read or write failure is returned
/// along with the byte count accumulated so far being lost to the caller.
pub async fn copy<R, W>(r: &mut R, w: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = PooledBuf::get();
    let mut total = 0u64;

    loop {
        let n = r.read(&mut buf.0).await?;
        if n == 0 {
            return Ok(total);
        }
        w.write_all(&buf.0[..n]).await?;
        total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::{tcp_pair, PrefixStream};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn stream_copies_take_the_direct_path_when_one_exists() {
        let (a, mut a_peer) = tcp_pair().await.unwrap();
        let (b, mut b_peer) = tcp_pair().await.unwrap();

        let mut from: Box<dyn Stream> =
            Box::new(PrefixStream::new(Box::new(a), b"replayed ".to_vec()));
        let mut to: Box<dyn Stream> = Box::new(b);

        a_peer.write_all(b"socket bytes").await.unwrap();
        drop(a_peer);

        let n = copy_stream(&mut from, &mut to).await.unwrap();
        assert_eq!(n, 21);

        let mut buf = [0u8; 21];
        b_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..], b"replayed socket bytes");
    }

    #[tokio::test]
    async fn plain_streams_fall_back_to_the_pooled_buffer() {
        let (a, mut a_peer) = tcp_pair().await.unwrap();
        let (b, mut b_peer) = tcp_pair().await.unwrap();

        let mut from: Box<dyn Stream> = Box::new(a);
        let mut to: Box<dyn Stream> = Box::new(b);

        a_peer.write_all(b"no capability here").await.unwrap();
        drop(a_peer);

        let n = copy_stream(&mut from, &mut to).await.unwrap();
        assert_eq!(n, 18);

        let mut buf = [0u8; 18];
        b_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..], b"no capability here");
    }

    #[tokio::test]
    async fn copies_everything_and_reports_the_count() {
        let data: Vec<u8> = (0..100_000u32).map(|i| i as u8).collect();
        let mut src = io::Cursor::new(data.clone());
        let mut dst = Vec::new();
        let n = copy(&mut src, &mut dst).await.unwrap();
        assert_eq!(n, data.len() as u64);
        assert_eq!(dst, data);
    }

    #[tokio::test]
    async fn buffers_are_returned_to_the_pool() {
        let mut src = io::Cursor::new(vec![0u8; 64]);
        let mut dst = Vec::new();
        copy(&mut src, &mut dst).await.unwrap();

        // Other tests share the pool, so only a lower bound is stable.
        assert!(!POOL.lock().unwrap().is_empty());
    }
}
