//! In-band control multiplexer.
//!
//! Sits on top of the AEAD stream. The read side scans the decrypted
//! byte flow for the 4-byte control magic; bytes before a match are
//! forwarded to the application untouched. A complete frame that passes
//! the version and HMAC checks is dispatched to the boost controller and
//! consumed; a failed check re-emits one byte as data and rescans, so a
//! chance occurrence of the magic inside application data degrades
//! gracefully instead of wedging the stream.
//!
//! Frame layout:
//! `MAGIC(4) || VERSION(1) || CMD(1) || LEN_BE(2) || PAYLOAD || HMAC(16)`
//! where the HMAC is the first 16 bytes of HMAC-SHA256 over everything
//! after the magic, keyed by the control key.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use zeroize::Zeroizing;

use crate::crypto::CONTROL_MAC_SIZE;
use crate::error::Error;
use crate::tunnel::boost::{BoostController, BoostParams};
use crate::{IO_BUFFER_SIZE, PROTOCOL_VERSION};

/// Control command: request the downlink boost upgrade.
pub const CMD_BOOST_REQUEST: u8 = 0x01;
/// Control command: acknowledge the downlink boost upgrade.
pub const CMD_BOOST_ACK: u8 = 0x02;

/// Frame magic.
pub(crate) const CONTROL_MAGIC: [u8; 4] = [0xf7, b'H', b'B', b'C'];

/// Magic + version + cmd + length.
const HEADER_LEN: usize = 4 + 1 + 1 + 2;
/// Smallest possible complete frame.
const MIN_FRAME: usize = HEADER_LEN + CONTROL_MAC_SIZE;

type HmacSha256 = Hmac<Sha256>;

/// The control multiplexer stream adapter.
pub struct ControlStream<S> {
    inner: S,
    hmac_key: Zeroizing<[u8; 32]>,
    controller: BoostController,

    /// Bytes read from below, not yet classified.
    scan: BytesMut,
    /// Classified application data awaiting the caller.
    data: Vec<u8>,
    data_pos: usize,
    /// Framed control bytes awaiting the stream below.
    ctrl_out: Vec<u8>,
    ctrl_pos: usize,
    /// A queued frame must reach the wire even if the application never
    /// writes; set on queue, cleared once the layers below have flushed.
    ctrl_needs_flush: bool,
    /// Write-side boost parameters to apply once `ctrl_out` and the
    /// layers below have drained — guarantees no plain-encoded byte
    /// follows the ACK on the wire.
    deferred_write_boost: Option<BoostParams>,
    scratch: Box<[u8]>,
}

impl<S> ControlStream<S> {
    /// Wrap `inner` with the given control HMAC key and controller.
    pub fn new(inner: S, hmac_key: [u8; 32], controller: BoostController) -> Self {
        Self {
            inner,
            hmac_key: Zeroizing::new(hmac_key),
            controller,
            scan: BytesMut::new(),
            data: Vec::new(),
            data_pos: 0,
            ctrl_out: Vec::new(),
            ctrl_pos: 0,
            ctrl_needs_flush: false,
            deferred_write_boost: None,
            scratch: vec![0u8; IO_BUFFER_SIZE].into_boxed_slice(),
        }
    }

    /// The boost controller (state inspection).
    pub fn controller(&self) -> &BoostController {
        &self.controller
    }

    fn mac(&self, body: &[u8]) -> [u8; CONTROL_MAC_SIZE] {
        let mut mac = HmacSha256::new_from_slice(&*self.hmac_key).expect("hmac accepts any key");
        mac.update(body);
        let digest = mac.finalize().into_bytes();
        let mut out = [0u8; CONTROL_MAC_SIZE];
        out.copy_from_slice(&digest[..CONTROL_MAC_SIZE]);
        out
    }

    fn verify_mac(&self, body: &[u8], tag: &[u8]) -> bool {
        let mut mac = HmacSha256::new_from_slice(&*self.hmac_key).expect("hmac accepts any key");
        mac.update(body);
        mac.verify_truncated_left(tag).is_ok()
    }

    fn build_frame(&self, cmd: u8, payload: &[u8]) -> io::Result<Vec<u8>> {
        if payload.len() > 0xffff {
            return Err(Error::ControlFrame("payload too large".into()).into_io());
        }
        let mut frame = Vec::with_capacity(MIN_FRAME + payload.len());
        frame.extend_from_slice(&CONTROL_MAGIC);
        frame.push(PROTOCOL_VERSION);
        frame.push(cmd);
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        frame.extend_from_slice(payload);
        let tag = self.mac(&frame[CONTROL_MAGIC.len()..]);
        frame.extend_from_slice(&tag);
        Ok(frame)
    }

    /// Queue a control frame for transmission. Delivery is atomic with
    /// respect to user data: queued frames always go out before the next
    /// user write is accepted.
    pub fn queue_control(&mut self, cmd: u8, payload: &[u8]) -> io::Result<()> {
        let frame = self.build_frame(cmd, payload)?;
        self.ctrl_out.extend_from_slice(&frame);
        self.ctrl_needs_flush = true;
        Ok(())
    }

    /// Forward classified data bytes and feed the controller.
    fn push_data(&mut self, range_end: usize) -> io::Result<()> {
        if range_end == 0 {
            return Ok(());
        }
        if self.data_pos == self.data.len() {
            self.data.clear();
            self.data_pos = 0;
        }
        self.data.extend_from_slice(&self.scan[..range_end]);
        self.scan.advance(range_end);

        if let Some((cmd, payload)) = self.controller.on_data(range_end) {
            self.queue_control(cmd, &payload)?;
        }
        Ok(())
    }

    /// Classify everything currently in `scan`.
    fn process_scan(&mut self) -> io::Result<()> {
        loop {
            let idx = self
                .scan
                .windows(CONTROL_MAGIC.len())
                .position(|w| w == CONTROL_MAGIC);
            let idx = match idx {
                // No complete magic anywhere: it is all data. A frame can
                // never straddle this boundary because control frames are
                // written in one AEAD-layer write (one sealed record).
                None => {
                    let len = self.scan.len();
                    self.push_data(len)?;
                    return Ok(());
                }
                Some(idx) => idx,
            };

            if idx > 0 {
                self.push_data(idx)?;
            }
            if self.scan.len() < MIN_FRAME {
                // Wait for the rest of the frame.
                return Ok(());
            }

            let version = self.scan[4];
            let cmd = self.scan[5];
            let payload_len = u16::from_be_bytes([self.scan[6], self.scan[7]]) as usize;
            let total = HEADER_LEN + payload_len + CONTROL_MAC_SIZE;
            if self.scan.len() < total {
                return Ok(());
            }

            let body = &self.scan[CONTROL_MAGIC.len()..total - CONTROL_MAC_SIZE];
            let tag = &self.scan[total - CONTROL_MAC_SIZE..total];
            if version == PROTOCOL_VERSION && self.verify_mac(body, tag) {
                let payload = self.scan[HEADER_LEN..HEADER_LEN + payload_len].to_vec();
                let action = self.controller.on_control(cmd, &payload);
                if let Some((cmd, reply)) = action.reply {
                    self.queue_control(cmd, &reply)?;
                }
                if let Some(params) = action.enable_write {
                    self.deferred_write_boost = Some(params);
                }
                self.scan.advance(total);
                continue;
            }

            // Not a real frame: emit one byte as data and rescan.
            self.push_data(1)?;
        }
    }

    /// Drive queued control frames down, then apply a deferred boost
    /// switch once the layers below have fully drained.
    fn poll_flush_ctrl(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>>
    where
        S: AsyncWrite + Unpin,
    {
        while self.ctrl_pos < self.ctrl_out.len() {
            let n = match Pin::new(&mut self.inner).poll_write(cx, &self.ctrl_out[self.ctrl_pos..])
            {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                }
                Poll::Ready(Ok(n)) => n,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };
            self.ctrl_pos += n;
        }
        self.ctrl_out.clear();
        self.ctrl_pos = 0;

        if self.ctrl_needs_flush || self.deferred_write_boost.is_some() {
            match Pin::new(&mut self.inner).poll_flush(cx) {
                Poll::Ready(Ok(())) => {
                    self.ctrl_needs_flush = false;
                    if let Some(params) = self.deferred_write_boost.take() {
                        self.controller
                            .enable_write(params)
                            .map_err(Error::into_io)?;
                    }
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        Poll::Ready(Ok(()))
    }

    /// Send a control frame and wait until it has left this layer.
    pub async fn send_control(&mut self, cmd: u8, payload: &[u8]) -> io::Result<()>
    where
        S: AsyncWrite + Unpin,
    {
        self.queue_control(cmd, payload)?;
        std::future::poll_fn(|cx| self.poll_flush_ctrl(cx)).await
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for ControlStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            // Control frames produced by the read path (boost requests
            // and ACKs) must make progress even when the application
            // only ever reads. Pending is fine; the waker is registered
            // for write readiness too.
            match this.poll_flush_ctrl(cx) {
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Ready(Ok(())) | Poll::Pending => {}
            }

            if this.data_pos < this.data.len() {
                let available = &this.data[this.data_pos..];
                let n = available.len().min(buf.remaining());
                buf.put_slice(&available[..n]);
                this.data_pos += n;
                return Poll::Ready(Ok(()));
            }

            let mut tmp = ReadBuf::new(&mut this.scratch);
            match Pin::new(&mut this.inner).poll_read(cx, &mut tmp) {
                Poll::Ready(Ok(())) => {
                    let n = tmp.filled().len();
                    if n == 0 {
                        // EOF. An incomplete frame in `scan` is dropped,
                        // matching the sender having died mid-frame.
                        return Poll::Ready(Ok(()));
                    }
                    this.scan.extend_from_slice(tmp.filled());
                    this.process_scan()?;
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for ControlStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match this.poll_flush_ctrl(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_flush_ctrl(cx) {
            Poll::Ready(Ok(())) => {}
            other => return other,
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_flush_ctrl(cx) {
            Poll::Ready(Ok(())) => {}
            other => return other,
        }
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableMode;
    use crate::crypto::kdf;
    use crate::obfs::{PuzzleStream, Table};
    use crate::tunnel::monitor::BandwidthMonitor;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn controller_pair() -> (BoostController, BoostController) {
        let table = Arc::new(Table::new("ctl", TableMode::PreferAscii));
        let (a, b) = tokio::io::duplex(64);
        let ha = PuzzleStream::new(a, table.clone(), 0, 0, false).boost_handle();
        let hb = PuzzleStream::new(b, table, 0, 0, false).boost_handle();
        let key = kdf::boost_key("ctl");
        (
            BoostController::client(ha, key, true),
            BoostController::server(hb, key),
        )
    }

    #[tokio::test]
    async fn data_passes_through_unmodified() {
        let (left, right) = tokio::io::duplex(64 * 1024);
        let (client_ctl, server_ctl) = controller_pair();
        let key = kdf::control_key("ctl");
        let mut tx = ControlStream::new(left, key, client_ctl);
        let mut rx = ControlStream::new(right, key, server_ctl);

        tx.write_all(b"ordinary data bytes").await.unwrap();
        tx.flush().await.unwrap();

        let mut got = [0u8; 19];
        rx.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"ordinary data bytes");
    }

    #[tokio::test]
    async fn control_frame_is_consumed_not_forwarded() {
        let (left, right) = tokio::io::duplex(64 * 1024);
        let (client_ctl, server_ctl) = controller_pair();
        let key = kdf::control_key("ctl");
        let mut tx = ControlStream::new(left, key, client_ctl);
        let mut rx = ControlStream::new(right, key, server_ctl);

        // Data, then a verified frame, then more data: the reader must
        // see only the data, in order.
        tx.write_all(b"before").await.unwrap();
        let payload = {
            let mut p = vec![1u8];
            p.extend_from_slice(&[0x55u8; 16]);
            p
        };
        tx.send_control(CMD_BOOST_REQUEST, &payload).await.unwrap();
        tx.write_all(b"after").await.unwrap();
        tx.flush().await.unwrap();

        let mut got = [0u8; 11];
        rx.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"beforeafter");
        // The server answered the request with an ACK on its queue.
        let mut ack = [0u8; 1];
        let _ = tokio::time::timeout(Duration::from_millis(50), tx.read_exact(&mut ack)).await;
    }

    #[tokio::test]
    async fn chance_magic_in_data_degrades_gracefully() {
        let (left, right) = tokio::io::duplex(64 * 1024);
        let (client_ctl, server_ctl) = controller_pair();
        let key = kdf::control_key("ctl");
        let mut tx = ControlStream::new(left, key, client_ctl);
        let mut rx = ControlStream::new(right, key, server_ctl);

        // The magic followed by garbage long enough to parse as a frame
        // header, but with an invalid HMAC.
        let mut wire = Vec::new();
        wire.extend_from_slice(&CONTROL_MAGIC);
        wire.push(PROTOCOL_VERSION);
        wire.push(CMD_BOOST_REQUEST);
        wire.extend_from_slice(&2u16.to_be_bytes());
        wire.extend_from_slice(b"xy");
        wire.extend_from_slice(&[0u8; CONTROL_MAC_SIZE]); // wrong mac
        wire.extend_from_slice(b" trailing");

        tx.write_all(&wire).await.unwrap();
        tx.flush().await.unwrap();

        let mut got = vec![0u8; wire.len()];
        rx.read_exact(&mut got).await.unwrap();
        assert_eq!(got, wire, "all bytes surface as data");
    }

    #[tokio::test]
    async fn wrong_version_is_not_dispatched() {
        let (left, right) = tokio::io::duplex(64 * 1024);
        let (client_ctl, server_ctl) = controller_pair();
        let key = kdf::control_key("ctl");
        let tx = ControlStream::new(left, key, client_ctl);
        let mut rx = ControlStream::new(right, key, server_ctl);

        // Hand-build a frame with a bad version but a valid HMAC.
        let mut frame = Vec::new();
        frame.extend_from_slice(&CONTROL_MAGIC);
        frame.push(0x7f);
        frame.push(CMD_BOOST_ACK);
        frame.extend_from_slice(&0u16.to_be_bytes());
        let tag = tx.mac(&frame[CONTROL_MAGIC.len()..]);
        frame.extend_from_slice(&tag);

        let mut inner = tx.inner;
        inner.write_all(&frame).await.unwrap();
        inner.flush().await.unwrap();

        let mut got = vec![0u8; frame.len()];
        rx.read_exact(&mut got).await.unwrap();
        assert_eq!(got, frame, "bad version degrades to data");
    }

    #[tokio::test]
    async fn boost_request_flows_end_to_end() {
        let (left, right) = tokio::io::duplex(64 * 1024);
        let table = Arc::new(Table::new("e2e", TableMode::PreferAscii));
        let (a, b) = tokio::io::duplex(64);
        let client_handle = PuzzleStream::new(a, table.clone(), 0, 0, false).boost_handle();
        let server_handle = PuzzleStream::new(b, table, 0, 0, false).boost_handle();
        let aes = kdf::boost_key("e2e");
        let key = kdf::control_key("e2e");

        let monitor = BandwidthMonitor::new(64, Duration::from_secs(5));
        let client_ctl =
            BoostController::client_with_monitor(client_handle.clone(), aes, true, monitor);
        let server_ctl = BoostController::server(server_handle.clone(), aes);

        let mut client = ControlStream::new(left, key, client_ctl);
        let mut server = ControlStream::new(right, key, server_ctl);

        // Server pushes enough data to fire the client's monitor.
        let pump = tokio::spawn(async move {
            for _ in 0..8 {
                server.write_all(&[0u8; 64]).await.unwrap();
                server.flush().await.unwrap();
                // Let the client's request frame arrive and be handled.
                let mut sink = [0u8; 256];
                let _ = tokio::time::timeout(
                    Duration::from_millis(20),
                    server.read(&mut sink),
                )
                .await;
            }
            server
        });

        let mut sink = vec![0u8; 64];
        for _ in 0..8 {
            let _ = tokio::time::timeout(
                Duration::from_millis(100),
                client.read_exact(&mut sink),
            )
            .await;
        }
        let server = pump.await.unwrap();

        assert!(server_handle.write_enabled(), "server write side boosted");
        assert!(client_handle.read_enabled(), "client read side boosted");
        assert!(client.controller().activated());
    }
}
