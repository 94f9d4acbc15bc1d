//! AEAD record framing over an inner byte stream.
//!
//! The write side splits plaintext into records of at most
//! [`MAX_RECORD_SIZE`](crate::crypto::MAX_RECORD_SIZE) bytes, seals each
//! one, and emits `len_be(2) || ciphertext` where the length counts the
//! sealed ciphertext (plaintext plus tag). The read side reassembles and
//! opens records in order; the per-direction nonce counters advance
//! strictly, so a dropped or reordered record fails authentication and
//! kills the connection.
//!
//! With [`AeadMethod::None`] the adapter is a verbatim passthrough.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::config::AeadMethod;
use crate::crypto::{Nonce, RecordCipher, MAX_RECORD_SIZE, TAG_SIZE};
use crate::error::Error;
use crate::IO_BUFFER_SIZE;

/// Length-prefixed sealed-record framer.
pub struct AeadStream<S> {
    inner: S,
    cipher: Option<RecordCipher>,
    seal_nonce: Nonce,
    open_nonce: Nonce,

    // Read side: raw ciphertext accumulation and decrypted plaintext
    // not yet handed to the caller.
    rbuf: BytesMut,
    pending: Vec<u8>,
    pending_pos: usize,
    scratch: Box<[u8]>,

    // Write side: encoded records awaiting delivery to the inner stream.
    wbuf: Vec<u8>,
    wbuf_pos: usize,
}

impl<S> AeadStream<S> {
    /// Wrap `inner`, deriving the record cipher from `seed`.
    pub fn new(inner: S, method: AeadMethod, seed: &str) -> crate::Result<Self> {
        let cipher = RecordCipher::new(method, seed)?;
        Ok(Self::with_cipher(inner, cipher))
    }

    /// Wrap `inner` with an already-validated cipher (`None` for
    /// passthrough). Lets a caller keep ownership of `inner` across
    /// cipher validation failures.
    pub fn with_cipher(inner: S, cipher: Option<RecordCipher>) -> Self {
        Self {
            inner,
            cipher,
            seal_nonce: Nonce::default(),
            open_nonce: Nonce::default(),
            rbuf: BytesMut::new(),
            pending: Vec::new(),
            pending_pos: 0,
            scratch: vec![0u8; IO_BUFFER_SIZE].into_boxed_slice(),
            wbuf: Vec::new(),
            wbuf_pos: 0,
        }
    }

    /// Consume the framer and return the stream beneath it.
    pub fn into_inner(self) -> S {
        self.inner
    }

    /// Access the stream beneath the framer.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Mutable access to the stream beneath the framer.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Open every complete record sitting in `rbuf` into `pending`.
    fn open_buffered_records(&mut self) -> io::Result<()> {
        let cipher = match &self.cipher {
            Some(c) => c,
            None => return Ok(()),
        };
        while self.rbuf.len() >= 2 {
            let len = u16::from_be_bytes([self.rbuf[0], self.rbuf[1]]) as usize;
            if len < TAG_SIZE {
                return Err(Error::Decrypt.into_io());
            }
            if self.rbuf.len() < 2 + len {
                break;
            }
            let plaintext = cipher
                .open(&self.open_nonce, &self.rbuf[2..2 + len])
                .map_err(Error::into_io)?;
            self.open_nonce.increment();

            if self.pending_pos == self.pending.len() {
                self.pending.clear();
                self.pending_pos = 0;
            }
            self.pending.extend_from_slice(&plaintext);
            self.rbuf.advance(2 + len);
        }
        Ok(())
    }

    /// Drive queued record bytes into the inner stream.
    fn poll_flush_wbuf(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>>
    where
        S: AsyncWrite + Unpin,
    {
        while self.wbuf_pos < self.wbuf.len() {
            let n = match Pin::new(&mut self.inner).poll_write(cx, &self.wbuf[self.wbuf_pos..]) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                }
                Poll::Ready(Ok(n)) => n,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };
            self.wbuf_pos += n;
        }
        self.wbuf.clear();
        self.wbuf_pos = 0;
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for AeadStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.cipher.is_none() {
            return Pin::new(&mut this.inner).poll_read(cx, buf);
        }

        loop {
            if this.pending_pos < this.pending.len() {
                let available = &this.pending[this.pending_pos..];
                let n = available.len().min(buf.remaining());
                buf.put_slice(&available[..n]);
                this.pending_pos += n;
                return Poll::Ready(Ok(()));
            }

            let mut tmp = ReadBuf::new(&mut this.scratch);
            match Pin::new(&mut this.inner).poll_read(cx, &mut tmp) {
                Poll::Ready(Ok(())) => {
                    if tmp.filled().is_empty() {
                        if !this.rbuf.is_empty() {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "stream ended inside a sealed record",
                            )));
                        }
                        return Poll::Ready(Ok(()));
                    }
                    this.rbuf.extend_from_slice(tmp.filled());
                    this.open_buffered_records()?;
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for AeadStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.cipher.is_none() {
            return Pin::new(&mut this.inner).poll_write(cx, buf);
        }

        // The previous record must be fully handed down before sealing
        // another; this bounds buffering to one record.
        match this.poll_flush_wbuf(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }

        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let chunk = &buf[..buf.len().min(MAX_RECORD_SIZE)];
        let ciphertext = match &this.cipher {
            Some(cipher) => cipher
                .seal(&this.seal_nonce, chunk)
                .map_err(Error::into_io)?,
            None => return Pin::new(&mut this.inner).poll_write(cx, buf),
        };
        this.seal_nonce.increment();

        this.wbuf
            .extend_from_slice(&(ciphertext.len() as u16).to_be_bytes());
        this.wbuf.extend_from_slice(&ciphertext);

        // Best-effort delivery; remaining bytes go out on the next write
        // or flush. A transport error is fatal, so surfacing it is safe.
        match this.poll_flush_wbuf(cx) {
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) | Poll::Pending => {}
        }
        Poll::Ready(Ok(chunk.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_flush_wbuf(cx) {
            Poll::Ready(Ok(())) => {}
            other => return other,
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_flush_wbuf(cx) {
            Poll::Ready(Ok(())) => {}
            other => return other,
        }
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
