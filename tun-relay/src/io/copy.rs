//! One-directional copy with per-operation deadlines
//!
//! A TCP relay runs two of these loops, one per direction. Each read and
//! each write must complete within the supplied timeout; an idle peer
//! therefore ends the loop after one timeout period instead of pinning the
//! flow forever.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time;

/// How a copy loop finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyEnd {
    /// Reader returned EOF
    Eof,
    /// A read or write exceeded its deadline
    Timeout,
    /// A read or write failed
    Error(io::ErrorKind),
    /// The owner stopped the loop from outside
    Cancelled,
}

/// Outcome of one copy direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyResult {
    /// Bytes written to the destination
    pub bytes: u64,
    pub end: CopyEnd,
}

/// Copy from `reader` to `writer` through `buf` until EOF, an error, or a
/// deadline expiry.
///
/// Progress is added to `counter` as it happens so that a loop which is
/// cancelled mid-flight still reports what it moved.
pub async fn copy_with_deadline<R, W>(
    reader: &mut R,
    writer: &mut W,
    buf: &mut [u8],
    timeout: Duration,
    counter: &std::sync::atomic::AtomicU64,
) -> CopyResult
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    use std::sync::atomic::Ordering;

    let mut bytes = 0u64;
    loop {
        let n = match time::timeout(timeout, reader.read(buf)).await {
            Err(_) => return CopyResult { bytes, end: CopyEnd::Timeout },
            Ok(Err(e)) => return CopyResult { bytes, end: CopyEnd::Error(e.kind()) },
            Ok(Ok(0)) => return CopyResult { bytes, end: CopyEnd::Eof },
            Ok(Ok(n)) => n,
        };

        match time::timeout(timeout, writer.write_all(&buf[..n])).await {
            Err(_) => return CopyResult { bytes, end: CopyEnd::Timeout },
            Ok(Err(e)) => return CopyResult { bytes, end: CopyEnd::Error(e.kind()) },
            Ok(Ok(())) => {}
        }

        bytes += n as u64;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}
