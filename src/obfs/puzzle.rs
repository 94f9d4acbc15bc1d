//! The puzzle codec stream.
//!
//! Write side: each plaintext byte becomes a randomly chosen codeword
//! from the shared [`Table`], its four hint bytes emitted in a random
//! order with padding bytes interleaved at the connection's padding rate.
//! Read side: padding is discarded by the stateless classifier, hint
//! bytes accumulate into a 4-slot buffer and decode through the table; an
//! unknown 4-tuple is fatal.
//!
//! Either direction can be upgraded independently to the *boost* carrier:
//! plaintext is AES-128-CTR encrypted and streamed 6 bits per wire byte,
//! packed so the same classifier (and therefore the same padding
//! discipline) still applies.
//!
//! While an upgrade is pending on the read direction the decoder runs in
//! *cautious* mode: it decodes just far enough to make progress and
//! retains the rest of the raw input undecoded, so the mode switch lands
//! exactly at the acknowledgement boundary even when carrier bytes arrive
//! in the same transport chunk.
//!
//! In recording mode every raw byte read is retained so a failed server
//! handshake can replay the connection byte-for-byte into a fallback
//! target.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use aes::cipher::{KeyIvInit, StreamCipher};
use aes::Aes128;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::Error;
use crate::obfs::table::{classify_padding, Table};
use crate::IO_BUFFER_SIZE;

/// Plaintext consumed per write pass; bounds the encode buffer.
const WRITE_CHUNK: usize = 8 * 1024;

type BoostCipher = ctr::Ctr128BE<Aes128>;

/// Shared boost state for one connection. The write-side bit accumulator
/// is mutated by both `poll_write` and the close-time flush, and the
/// controller layer toggles the mode from the read path, so everything
/// lives behind one mutex.
struct BoostState {
    ascii: bool,
    write_on: bool,
    read_on: bool,
    read_reset: bool,
    cautious: bool,
    enc: Option<BoostCipher>,
    dec: Option<BoostCipher>,
    enc_bit_buf: u64,
    enc_bits: u32,
    dec_bit_buf: u64,
    dec_bits: u32,
}

/// Cloneable handle to a connection's boost state. The control layer
/// holds one of these instead of a reference into the codec stack, which
/// keeps the layering acyclic.
#[derive(Clone)]
pub struct BoostHandle(Arc<Mutex<BoostState>>);

impl BoostHandle {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(BoostState {
            ascii: false,
            write_on: false,
            read_on: false,
            read_reset: false,
            cautious: false,
            enc: None,
            dec: None,
            enc_bit_buf: 0,
            enc_bits: 0,
            dec_bit_buf: 0,
            dec_bits: 0,
        })))
    }

    /// Activate the high-bandwidth carrier for the given directions.
    /// `write`/`read` select which half of this side switches over; both
    /// peers must use the same `key`, `iv`, and classifier mode.
    pub fn enable(
        &self,
        write: bool,
        read: bool,
        key: &[u8],
        iv: &[u8],
        ascii: bool,
    ) -> crate::Result<()> {
        if key.len() < 16 {
            return Err(Error::cipher_setup("boost key too short"));
        }
        if iv.len() < 16 {
            return Err(Error::cipher_setup("boost iv too short"));
        }

        let mut st = self.0.lock();
        if write {
            let cipher = BoostCipher::new_from_slices(&key[..16], &iv[..16])
                .map_err(|_| Error::cipher_setup("boost ctr init"))?;
            st.enc = Some(cipher);
            st.enc_bit_buf = 0;
            st.enc_bits = 0;
            st.write_on = true;
            st.ascii = ascii;
        }
        if read {
            let cipher = BoostCipher::new_from_slices(&key[..16], &iv[..16])
                .map_err(|_| Error::cipher_setup("boost ctr init"))?;
            st.dec = Some(cipher);
            st.dec_bit_buf = 0;
            st.dec_bits = 0;
            st.read_on = true;
            st.ascii = ascii;
            st.cautious = false;
            // The decoder drops any half-assembled codeword on switch.
            st.read_reset = true;
        }
        Ok(())
    }

    /// Put the decoder into (or out of) cautious mode: minimal decode
    /// steps while a read-side upgrade is in flight.
    pub fn set_cautious(&self, on: bool) {
        self.0.lock().cautious = on;
    }

    /// Whether the write direction is on the boost carrier.
    pub fn write_enabled(&self) -> bool {
        self.0.lock().write_on
    }

    /// Whether the read direction is on the boost carrier.
    pub fn read_enabled(&self) -> bool {
        self.0.lock().read_on
    }
}

fn pack_boost_byte(bits: u8, ascii: bool) -> u8 {
    if ascii {
        0x40 | (bits & 0x3f)
    } else {
        ((bits & 0x30) << 1) | (bits & 0x0f)
    }
}

fn unpack_boost_byte(b: u8, ascii: bool) -> u8 {
    if ascii {
        b & 0x3f
    } else {
        ((b & 0x60) >> 1) | (b & 0x0f)
    }
}

/// The puzzle codec as a stream adapter. Owns the transport beneath it.
pub struct PuzzleStream<S> {
    inner: S,
    table: Arc<Table>,
    padding_rate: f32,
    rng: Mutex<StdRng>,
    recorder: Mutex<Option<Vec<u8>>>,
    boost: BoostHandle,

    // Read path: raw undecoded bytes, decoded plaintext, and the
    // codeword accumulator.
    raw: Vec<u8>,
    raw_pos: usize,
    pending: Vec<u8>,
    pending_pos: usize,
    hint: [u8; 4],
    hint_len: usize,
    scratch: Box<[u8]>,

    // Write path.
    out: Vec<u8>,
    out_pos: usize,
}

impl<S> PuzzleStream<S> {
    /// Wrap `inner`. The padding rate is drawn once, uniformly from
    /// `[padding_min, padding_max]` percent, and fixed for the
    /// connection's life. With `record` set, every raw byte read is
    /// retained until [`stop_recording`](Self::stop_recording).
    pub fn new(inner: S, table: Arc<Table>, padding_min: u8, padding_max: u8, record: bool) -> Self {
        let mut rng = StdRng::from_entropy();
        let lo = f32::from(padding_min) / 100.0;
        let hi = f32::from(padding_max) / 100.0;
        let padding_rate = if hi > lo { rng.gen_range(lo..hi) } else { lo };

        Self {
            inner,
            table,
            padding_rate,
            rng: Mutex::new(rng),
            recorder: Mutex::new(record.then(Vec::new)),
            boost: BoostHandle::new(),
            raw: Vec::new(),
            raw_pos: 0,
            pending: Vec::with_capacity(4096),
            pending_pos: 0,
            hint: [0u8; 4],
            hint_len: 0,
            scratch: vec![0u8; IO_BUFFER_SIZE].into_boxed_slice(),
            out: Vec::new(),
            out_pos: 0,
        }
    }

    /// Handle for toggling the boost carrier from an outer layer.
    pub fn boost_handle(&self) -> BoostHandle {
        self.boost.clone()
    }

    /// Stop retaining raw bytes and release the recording buffer.
    pub fn stop_recording(&self) {
        *self.recorder.lock() = None;
    }

    /// Every raw byte read so far while recording was active.
    pub fn recorded(&self) -> Vec<u8> {
        self.recorder.lock().clone().unwrap_or_default()
    }

    /// Deconstruct into the inner stream and the recorded raw bytes
    /// (which include any bytes read but not yet decoded).
    pub fn into_parts(self) -> (S, Vec<u8>) {
        let recorded = self.recorder.lock().take().unwrap_or_default();
        (self.inner, recorded)
    }

    fn coin(&self, rng: &mut StdRng) -> bool {
        rng.gen::<f32>() < self.padding_rate
    }

    fn pad_byte(&self, rng: &mut StdRng) -> u8 {
        let pool = self.table.padding_pool();
        pool[rng.gen_range(0..pool.len())]
    }

    /// Encode a plaintext chunk with the 4-byte codec into `self.out`.
    fn encode_plain(&mut self, chunk: &[u8]) {
        let mut rng = self.rng.lock();
        for &b in chunk {
            if self.coin(&mut rng) {
                let pad = self.pad_byte(&mut rng);
                self.out.push(pad);
            }

            let words = self.table.codewords(b);
            let word = words[rng.gen_range(0..words.len())];

            let mut perm = [0usize, 1, 2, 3];
            perm.shuffle(&mut *rng);
            for &idx in &perm {
                if self.coin(&mut rng) {
                    let pad = self.pad_byte(&mut rng);
                    self.out.push(pad);
                }
                self.out.push(word[idx]);
            }
        }
        if self.coin(&mut rng) {
            let pad = self.pad_byte(&mut rng);
            self.out.push(pad);
        }
    }

    /// Encode a plaintext chunk with the boost carrier into `self.out`.
    /// Caller holds the boost lock; the RNG is locked second, matching
    /// the fixed lock order everywhere else.
    fn encode_boost(&mut self, st: &mut BoostState, chunk: &[u8]) -> io::Result<()> {
        let cipher = st
            .enc
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "boost encoder missing"))?;
        let mut enc = chunk.to_vec();
        cipher.apply_keystream(&mut enc);

        let mut rng = self.rng.lock();
        for &b in &enc {
            st.enc_bit_buf = (st.enc_bit_buf << 8) | u64::from(b);
            st.enc_bits += 8;

            while st.enc_bits >= 6 {
                st.enc_bits -= 6;
                let bits = ((st.enc_bit_buf >> st.enc_bits) & 0x3f) as u8;
                let carrier = pack_boost_byte(bits, st.ascii);

                if self.coin(&mut rng) {
                    let pad = self.pad_byte(&mut rng);
                    self.out.push(pad);
                }
                self.out.push(carrier);

                if st.enc_bits == 0 {
                    st.enc_bit_buf = 0;
                } else {
                    st.enc_bit_buf &= (1 << st.enc_bits) - 1;
                }
            }
        }
        if self.coin(&mut rng) {
            let pad = self.pad_byte(&mut rng);
            self.out.push(pad);
        }
        Ok(())
    }

    /// Emit the residual (< 6) encode bits as one final carrier byte,
    /// left-shifted to the top of the 6-bit field. The receiver's
    /// trailing sub-byte bits are discarded by design.
    fn flush_boost_residual(&mut self) {
        let boost = self.boost.clone();
        let mut st = boost.0.lock();
        if !st.write_on || st.enc_bits == 0 {
            return;
        }

        let bits = ((st.enc_bit_buf << (6 - st.enc_bits)) & 0x3f) as u8;
        let carrier = pack_boost_byte(bits, st.ascii);
        st.enc_bit_buf = 0;
        st.enc_bits = 0;
        drop(st);

        let mut rng = self.rng.lock();
        if self.coin(&mut rng) {
            let pad = self.pad_byte(&mut rng);
            self.out.push(pad);
        }
        self.out.push(carrier);
        if self.coin(&mut rng) {
            let pad = self.pad_byte(&mut rng);
            self.out.push(pad);
        }
    }

    /// Decode some of the retained raw bytes into `self.pending`.
    ///
    /// Normally consumes everything available. In cautious mode (a read
    /// upgrade is in flight) it stops as soon as any plaintext is
    /// produced, leaving the remainder raw so a mode switch triggered by
    /// the bytes just delivered still applies to the rest.
    fn decode_available(&mut self) -> io::Result<()> {
        if self.pending_pos == self.pending.len() {
            self.pending.clear();
            self.pending_pos = 0;
        }

        let boost = self.boost.clone();
        let mut st = boost.0.lock();
        if st.read_reset {
            st.read_reset = false;
            self.hint_len = 0;
        }

        if st.read_on {
            self.decode_boost_locked(&mut st)
        } else {
            let cautious = st.cautious;
            drop(st);
            self.decode_plain(cautious)
        }
    }

    fn decode_plain(&mut self, cautious: bool) -> io::Result<()> {
        let ascii = self.table.is_ascii();
        while self.raw_pos < self.raw.len() {
            if cautious && self.pending_pos < self.pending.len() {
                return Ok(());
            }
            let b = self.raw[self.raw_pos];
            self.raw_pos += 1;

            if classify_padding(b, ascii) {
                continue;
            }

            self.hint[self.hint_len] = b;
            self.hint_len += 1;
            if self.hint_len == 4 {
                self.hint_len = 0;
                match self.table.decode(self.hint) {
                    Some(plain) => self.pending.push(plain),
                    None => return Err(Error::InvalidCodeword.into_io()),
                }
            }
        }
        self.compact_raw();
        Ok(())
    }

    fn decode_boost_locked(&mut self, st: &mut BoostState) -> io::Result<()> {
        while self.raw_pos < self.raw.len() {
            let b = self.raw[self.raw_pos];
            self.raw_pos += 1;

            if classify_padding(b, st.ascii) {
                continue;
            }

            let bits = unpack_boost_byte(b, st.ascii);
            st.dec_bit_buf = (st.dec_bit_buf << 6) | u64::from(bits);
            st.dec_bits += 6;

            while st.dec_bits >= 8 {
                st.dec_bits -= 8;
                let mut byte = [((st.dec_bit_buf >> st.dec_bits) & 0xff) as u8];
                if st.dec_bits == 0 {
                    st.dec_bit_buf = 0;
                } else {
                    st.dec_bit_buf &= (1 << st.dec_bits) - 1;
                }

                let cipher = st.dec.as_mut().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::Other, "boost decoder missing")
                })?;
                cipher.apply_keystream(&mut byte);
                self.pending.push(byte[0]);
            }
        }
        self.compact_raw();
        Ok(())
    }

    fn compact_raw(&mut self) {
        if self.raw_pos == self.raw.len() {
            self.raw.clear();
            self.raw_pos = 0;
        }
    }

    /// Drive queued encoded bytes into the inner stream.
    fn poll_flush_out(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>>
    where
        S: AsyncWrite + Unpin,
    {
        while self.out_pos < self.out.len() {
            let n = match Pin::new(&mut self.inner).poll_write(cx, &self.out[self.out_pos..]) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                }
                Poll::Ready(Ok(n)) => n,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };
            self.out_pos += n;
        }
        self.out.clear();
        self.out_pos = 0;
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PuzzleStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if this.pending_pos < this.pending.len() {
                let available = &this.pending[this.pending_pos..];
                let n = available.len().min(buf.remaining());
                buf.put_slice(&available[..n]);
                this.pending_pos += n;
                return Poll::Ready(Ok(()));
            }

            if this.raw_pos < this.raw.len() {
                this.decode_available()?;
                continue;
            }

            let mut tmp = ReadBuf::new(&mut this.scratch);
            match Pin::new(&mut this.inner).poll_read(cx, &mut tmp) {
                Poll::Ready(Ok(())) => {
                    let n = tmp.filled().len();
                    if n == 0 {
                        // EOF; a half-assembled codeword is dropped.
                        return Poll::Ready(Ok(()));
                    }
                    {
                        let mut recorder = this.recorder.lock();
                        if let Some(rec) = recorder.as_mut() {
                            rec.extend_from_slice(tmp.filled());
                        }
                    }
                    this.raw.extend_from_slice(tmp.filled());
                    this.decode_available()?;
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PuzzleStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        match this.poll_flush_out(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }

        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let chunk_len = buf.len().min(WRITE_CHUNK);
        let chunk = &buf[..chunk_len];

        let boost = this.boost.clone();
        let mut st = boost.0.lock();
        if st.write_on {
            this.encode_boost(&mut st, chunk)?;
            drop(st);
        } else {
            drop(st);
            this.encode_plain(chunk);
        }

        // Best-effort drain; remaining bytes go out on the next write or
        // flush. A transport error is fatal, so surfacing it now is safe.
        match this.poll_flush_out(cx) {
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) | Poll::Pending => {}
        }
        Poll::Ready(Ok(chunk_len))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_flush_out(cx) {
            Poll::Ready(Ok(())) => {}
            other => return other,
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.flush_boost_residual();
        match this.poll_flush_out(cx) {
            Poll::Ready(Ok(())) => {}
            other => return other,
        }
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
