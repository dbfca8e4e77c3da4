//! Timeout wrappers over `compio`'s read/write primitives, used by the
//! handshake and connection proxy to bound how long a stalled peer gets
//! before being treated as a `peer_timeout` (§5, §7).

use compio::buf::{IoBuf, IoBufMut};
use compio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use compio::time::timeout;
use std::io;
use std::time::Duration;

/// Reads whatever is available into `buf`, bounded by `duration` when
/// given. Unlike `read_exact_with_timeout`, this may return fewer bytes
/// than `buf`'s capacity.
pub async fn read_with_timeout<S, B>(
    stream: &mut S,
    buf: B,
    duration: Option<Duration>,
) -> io::Result<compio::BufResult<usize, B>>
where
    S: AsyncRead + Unpin,
    B: IoBufMut,
{
    match duration {
        None => Ok(stream.read(buf).await),
        Some(d) => match timeout(d, stream.read(buf)).await {
            Ok(result) => Ok(result),
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out")),
        },
    }
}

/// Reads exactly `buf`'s capacity, bounded by `duration` when given.
pub async fn read_exact_with_timeout<S, B>(
    stream: &mut S,
    buf: B,
    duration: Option<Duration>,
) -> io::Result<compio::BufResult<(), B>>
where
    S: AsyncRead + Unpin,
    B: IoBufMut,
{
    match duration {
        None => Ok(stream.read_exact(buf).await),
        Some(d) => match timeout(d, stream.read_exact(buf)).await {
            Ok(result) => Ok(result),
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out")),
        },
    }
}

/// Writes all of `buf`, bounded by `duration` when given.
pub async fn write_all_with_timeout<S, B>(
    stream: &mut S,
    buf: B,
    duration: Option<Duration>,
) -> io::Result<compio::BufResult<(), B>>
where
    S: AsyncWrite + Unpin,
    B: IoBuf,
{
    match duration {
        None => Ok(stream.write_all(buf).await),
        Some(d) => match timeout(d, stream.write_all(buf)).await {
            Ok(result) => Ok(result),
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out")),
        },
    }
}
