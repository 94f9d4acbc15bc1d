//! A peekable buffered stream whose read-ahead is recoverable.
//!
//! The server needs to peek the first bytes of an accepted connection to
//! detect the HTTP masquerade, then consume header lines, and — if the
//! handshake later fails — hand *every* unconsumed byte over for replay
//! into the fallback target. `tokio::io::BufReader` discards its buffer
//! on deconstruction, so this adapter keeps its own.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

use crate::error::{Error, Result};

/// Upper bound on a single header line; beyond this the connection is
/// not speaking our masquerade.
const MAX_LINE: usize = 8 * 1024;

/// Buffered reader with peek, line consumption, and recoverable
/// leftover bytes. Writes pass through untouched.
pub struct BufferedStream<S> {
    inner: S,
    buf: Vec<u8>,
    pos: usize,
}

impl<S> BufferedStream<S> {
    /// Wrap a transport.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            pos: 0,
        }
    }

    /// Bytes read from the transport but not yet consumed.
    pub fn leftover(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    /// Deconstruct into the transport and the unconsumed read-ahead.
    pub fn into_parts(mut self) -> (S, Vec<u8>) {
        let leftover = self.buf.split_off(self.pos);
        (self.inner, leftover)
    }

    fn compact(&mut self) {
        if self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        }
    }
}

impl<S: AsyncRead + Unpin> BufferedStream<S> {
    /// Pull more bytes from the transport into the buffer. Returns the
    /// number added; zero means EOF.
    async fn fill(&mut self) -> io::Result<usize> {
        let mut chunk = [0u8; 4096];
        let n = self.inner.read(&mut chunk).await?;
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    /// Peek at up to `n` unconsumed bytes, filling from the transport as
    /// needed. Returns fewer than `n` only at EOF.
    pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        while self.buf.len() - self.pos < n {
            if self.fill().await? == 0 {
                break;
            }
        }
        let end = (self.pos + n).min(self.buf.len());
        Ok(&self.buf[self.pos..end])
    }

    /// Consume one line through its `\n` terminator, appending it
    /// (terminator included) to `out`.
    pub async fn read_line(&mut self, out: &mut Vec<u8>) -> Result<usize> {
        let mut scanned = 0;
        loop {
            if let Some(idx) = self.buf[self.pos + scanned..].iter().position(|&b| b == b'\n') {
                let end = self.pos + scanned + idx + 1;
                out.extend_from_slice(&self.buf[self.pos..end]);
                let n = end - self.pos;
                self.pos = end;
                self.compact();
                return Ok(n);
            }
            scanned = self.buf.len() - self.pos;
            if scanned > MAX_LINE {
                return Err(Error::Transport(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "header line too long",
                )));
            }
            if self.fill().await? == 0 {
                return Err(Error::Transport(io::ErrorKind::UnexpectedEof.into()));
            }
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for BufferedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.pos < this.buf.len() {
            let available = &this.buf[this.pos..];
            let n = available.len().min(buf.remaining());
            buf.put_slice(&available[..n]);
            this.pos += n;
            this.compact();
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for BufferedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn peek_does_not_consume() {
        let mut stream = BufferedStream::new(Cursor::new(b"POST /path".to_vec()));
        assert_eq!(stream.peek(4).await.unwrap(), b"POST");
        assert_eq!(stream.peek(4).await.unwrap(), b"POST");

        let mut out = [0u8; 10];
        stream.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"POST /path");
    }

    #[tokio::test]
    async fn peek_short_at_eof() {
        let mut stream = BufferedStream::new(Cursor::new(b"ab".to_vec()));
        assert_eq!(stream.peek(4).await.unwrap(), b"ab");
    }

    #[tokio::test]
    async fn read_line_keeps_terminator() {
        let mut stream = BufferedStream::new(Cursor::new(b"one\r\ntwo\nrest".to_vec()));
        let mut out = Vec::new();
        stream.read_line(&mut out).await.unwrap();
        assert_eq!(out, b"one\r\n");
        stream.read_line(&mut out).await.unwrap();
        assert_eq!(out, b"one\r\ntwo\n");
        assert_eq!(stream.leftover(), b"");
    }

    #[tokio::test]
    async fn into_parts_returns_readahead() {
        let mut stream = BufferedStream::new(Cursor::new(b"headbody".to_vec()));
        stream.peek(8).await.unwrap();
        let mut out = [0u8; 4];
        stream.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"head");

        let (_, leftover) = stream.into_parts();
        assert_eq!(leftover, b"body");
    }

    #[tokio::test]
    async fn read_line_errors_at_eof_without_newline() {
        let mut stream = BufferedStream::new(Cursor::new(b"no newline".to_vec()));
        let mut out = Vec::new();
        assert!(stream.read_line(&mut out).await.is_err());
    }
}
