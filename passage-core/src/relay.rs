//! The byte-relay primitive.
//!
//! A relay session is two concurrent half-copies over a pair of byte streams.
//! The session ends as soon as either half observes end-of-stream or an
//! error; returning drops both endpoints, which terminates the other half.
//! End-of-stream and errors are treated uniformly and are not reported.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::buffer::BufferPool;

/// Copy bytes from `src` to `dst` until end-of-stream or error.
///
/// Uses one pooled buffer for the lifetime of the copy; short writes are
/// absorbed by `write_all`. Returns the number of bytes copied.
pub async fn copy_half<R, W>(mut src: R, mut dst: W) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = BufferPool::global().acquire();
    let mut total = 0u64;
    loop {
        let n = src.read(&mut buf[..]).await?;
        if n == 0 {
            return Ok(total);
        }
        dst.write_all(&buf[..n]).await?;
        dst.flush().await?;
        total += n as u64;
    }
}

/// Full-duplex relay between two byte streams.
///
/// Runs both half-copies concurrently and returns when the first one ends,
/// dropping both endpoints so the surviving half terminates too.
pub async fn relay_bidirectional<A, B>(a: A, b: B)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);
    tokio::select! {
        _ = copy_half(a_read, b_write) => {}
        _ = copy_half(b_read, a_write) => {}
    }
}
