//! Byte transports a connection proxy (C5) can run over.
//!
//! `Transport` is deliberately the same shape as the teacher's
//! `SocketActor<S>` bound (`AsyncRead + AsyncWrite + Unpin + Send`), so the
//! proxy's read/write pumps are transport-agnostic: a real `compio`
//! `TcpStream` and the in-memory `MemTransport` used by tests satisfy the
//! same trait.
//!
//! `MemTransport`'s read path calls `IoBufMut::set_buf_init`, an unsafe
//! contract (the caller must have actually initialized that many bytes);
//! it is encapsulated here exactly as written, never exposed to callers.

#![allow(unsafe_code)]

use compio::io::{AsyncRead, AsyncWrite};
use flume::{Receiver, Sender};
use std::io;

/// Anything the connection proxy can read from and write to.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// A TCP-backed transport; thin alias so call sites don't spell out the
/// full `compio` type.
pub type TcpTransport = compio::net::TcpStream;

/// One half of an in-memory duplex byte pipe: bytes written on one end
/// arrive, in order, on the other end's reads. Used by integration tests
/// to run a multi-node overlay without binding real sockets (§8, "the same
/// role the teacher's `inproc` transport plays for its own tests").
pub struct MemTransport {
    read_buf: Vec<u8>,
    read_pos: usize,
    rx: Receiver<Vec<u8>>,
    tx: Sender<Vec<u8>>,
}

impl MemTransport {
    /// Builds a connected pair: writes to `.0` are readable from `.1` and
    /// vice versa.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = flume::unbounded();
        let (tx_b, rx_b) = flume::unbounded();
        (
            Self { read_buf: Vec::new(), read_pos: 0, rx: rx_b, tx: tx_a },
            Self { read_buf: Vec::new(), read_pos: 0, rx: rx_a, tx: tx_b },
        )
    }
}

impl AsyncRead for MemTransport {
    async fn read<B: compio::buf::IoBufMut>(&mut self, mut buf: B) -> compio::BufResult<usize, B> {
        if self.read_pos >= self.read_buf.len() {
            match self.rx.recv_async().await {
                Ok(chunk) => {
                    self.read_buf = chunk;
                    self.read_pos = 0;
                }
                Err(_) => return compio::BufResult(Ok(0), buf),
            }
        }
        let remaining = &self.read_buf[self.read_pos..];
        let slice = buf.as_mut_slice();
        let n = remaining.len().min(slice.len());
        slice[..n].copy_from_slice(&remaining[..n]);
        self.read_pos += n;
        unsafe {
            buf.set_buf_init(n);
        }
        compio::BufResult(Ok(n), buf)
    }
}

impl AsyncWrite for MemTransport {
    async fn write<B: compio::buf::IoBuf>(&mut self, buf: B) -> compio::BufResult<usize, B> {
        let bytes = buf.as_slice().to_vec();
        let n = bytes.len();
        let sent = self.tx.send(bytes).is_ok();
        compio::BufResult(if sent { Ok(n) } else { Err(io::ErrorKind::BrokenPipe.into()) }, buf)
    }

    async fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        Ok(())
    }
}
