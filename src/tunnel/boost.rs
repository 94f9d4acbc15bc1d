//! Downlink boost controller.
//!
//! The client watches delivered data through the bandwidth monitor; on
//! sustained throughput it sends `BOOST_REQUEST` with a fresh IV. The
//! server enables the boost carrier on its write side and answers
//! `BOOST_ACK`; the client enables its read side on the ACK. The uplink
//! stays on the 4-byte codec — the upgrade is one-way.

use rand::RngCore;
use rand_core::OsRng;
use zeroize::Zeroizing;

use crate::obfs::BoostHandle;
use crate::tunnel::control::{CMD_BOOST_ACK, CMD_BOOST_REQUEST};
use crate::tunnel::monitor::BandwidthMonitor;

/// Parameters carried by a boost request/ack payload:
/// `mode_byte(1) || iv(16)` where mode 0 selects the ASCII classifier.
#[derive(Clone, Copy)]
pub struct BoostParams {
    /// Classifier mode for the carrier.
    pub ascii: bool,
    /// AES-CTR IV for this upgrade.
    pub iv: [u8; 16],
}

impl BoostParams {
    fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(17);
        payload.push(if self.ascii { 0 } else { 1 });
        payload.extend_from_slice(&self.iv);
        payload
    }

    fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() < 17 {
            return None;
        }
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&payload[1..17]);
        Some(Self {
            ascii: payload[0] == 0,
            iv,
        })
    }
}

/// What the control stream should do after a controller event.
pub(crate) struct ControlAction {
    /// A frame to send: `(cmd, payload)`.
    pub reply: Option<(u8, Vec<u8>)>,
    /// Boost parameters to apply to the write direction once every byte
    /// queued before them has left this side.
    pub enable_write: Option<BoostParams>,
}

impl ControlAction {
    fn none() -> Self {
        Self {
            reply: None,
            enable_write: None,
        }
    }
}

enum Role {
    Client,
    Server,
}

/// Per-connection boost state machine, owned by the control stream.
pub struct BoostController {
    role: Role,
    handle: BoostHandle,
    aes_key: Zeroizing<[u8; 16]>,
    ascii: bool,
    monitor: BandwidthMonitor,
    requested: bool,
    activated: bool,
}

impl BoostController {
    /// Client side: requests the upgrade when the monitor fires and
    /// enables the read carrier on ACK. `ascii` is the local table mode
    /// advertised in the request.
    pub fn client(handle: BoostHandle, aes_key: [u8; 16], ascii: bool) -> Self {
        Self {
            role: Role::Client,
            handle,
            aes_key: Zeroizing::new(aes_key),
            ascii,
            monitor: BandwidthMonitor::default(),
            requested: false,
            activated: false,
        }
    }

    /// Client side with a custom monitor (tests and tuning).
    pub fn client_with_monitor(
        handle: BoostHandle,
        aes_key: [u8; 16],
        ascii: bool,
        monitor: BandwidthMonitor,
    ) -> Self {
        Self {
            monitor,
            ..Self::client(handle, aes_key, ascii)
        }
    }

    /// Server side: answers requests and enables the write carrier.
    pub fn server(handle: BoostHandle, aes_key: [u8; 16]) -> Self {
        Self {
            role: Role::Server,
            handle,
            aes_key: Zeroizing::new(aes_key),
            ascii: false,
            monitor: BandwidthMonitor::default(),
            requested: false,
            activated: false,
        }
    }

    /// Whether the local read side has switched to the carrier.
    pub fn activated(&self) -> bool {
        self.activated
    }

    /// Data bytes were forwarded to the application. May yield a frame
    /// to queue.
    pub(crate) fn on_data(&mut self, n: usize) -> Option<(u8, Vec<u8>)> {
        let trigger = self.monitor.add(n);
        if !matches!(self.role, Role::Client) || self.activated || self.requested {
            return None;
        }
        if !trigger {
            return None;
        }

        let mut iv = [0u8; 16];
        OsRng.fill_bytes(&mut iv);
        let params = BoostParams {
            ascii: self.ascii,
            iv,
        };
        self.requested = true;
        // Downlink bytes between this request and the ACK must decode
        // under whichever mode was current when the server emitted them;
        // cautious decoding holds undecoded bytes back so the switch
        // lands exactly on the ACK boundary.
        self.handle.set_cautious(true);
        tracing::debug!("requesting downlink boost upgrade");
        Some((CMD_BOOST_REQUEST, params.encode()))
    }

    /// A verified control frame arrived.
    pub(crate) fn on_control(&mut self, cmd: u8, payload: &[u8]) -> ControlAction {
        match (&self.role, cmd) {
            (Role::Server, CMD_BOOST_REQUEST) => {
                // A repeat request while the carrier is already on is
                // ignored; no second ACK.
                if self.handle.write_enabled() {
                    return ControlAction::none();
                }
                let params = match BoostParams::decode(payload) {
                    Some(p) => p,
                    None => return ControlAction::none(),
                };
                tracing::debug!(ascii = params.ascii, "acknowledging boost upgrade");
                ControlAction {
                    reply: Some((CMD_BOOST_ACK, payload.to_vec())),
                    enable_write: Some(params),
                }
            }
            (Role::Client, CMD_BOOST_ACK) => {
                if self.activated {
                    return ControlAction::none();
                }
                let params = match BoostParams::decode(payload) {
                    Some(p) => p,
                    None => return ControlAction::none(),
                };
                if self
                    .handle
                    .enable(false, true, &*self.aes_key, &params.iv, params.ascii)
                    .is_ok()
                {
                    self.activated = true;
                    tracing::debug!("downlink boost active");
                }
                ControlAction::none()
            }
            _ => ControlAction::none(),
        }
    }

    /// Apply deferred write-side parameters (server, post-ACK-flush).
    pub(crate) fn enable_write(&mut self, params: BoostParams) -> crate::Result<()> {
        self.handle
            .enable(true, false, &*self.aes_key, &params.iv, params.ascii)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableMode;
    use crate::obfs::{PuzzleStream, Table};
    use std::sync::Arc;
    use std::time::Duration;

    fn handle() -> BoostHandle {
        let (a, _b) = tokio::io::duplex(64);
        let table = Arc::new(Table::new("ctl", TableMode::PreferAscii));
        PuzzleStream::new(a, table, 0, 0, false).boost_handle()
    }

    #[test]
    fn client_requests_once_when_monitor_fires() {
        let monitor = BandwidthMonitor::new(100, Duration::from_secs(5));
        let mut ctl = BoostController::client_with_monitor(handle(), [1u8; 16], true, monitor);

        assert!(ctl.on_data(150).is_none(), "monitor armed only");
        let frame = ctl.on_data(1).expect("second admission requests");
        assert_eq!(frame.0, CMD_BOOST_REQUEST);
        assert_eq!(frame.1.len(), 17);
        assert_eq!(frame.1[0], 0, "ascii mode byte");

        assert!(ctl.on_data(500).is_none(), "no duplicate request");
    }

    #[test]
    fn server_acks_and_defers_write_enable() {
        let mut ctl = BoostController::server(handle(), [2u8; 16]);
        let payload = BoostParams {
            ascii: false,
            iv: [9u8; 16],
        }
        .encode();

        let action = ctl.on_control(CMD_BOOST_REQUEST, &payload);
        let (cmd, reply) = action.reply.expect("ack queued");
        assert_eq!(cmd, CMD_BOOST_ACK);
        assert_eq!(reply, payload);
        let params = action.enable_write.expect("write enable deferred");
        assert!(!params.ascii);

        ctl.enable_write(params).unwrap();
        // A duplicate request is ignored now that write boost is on.
        let action = ctl.on_control(CMD_BOOST_REQUEST, &payload);
        assert!(action.reply.is_none());
        assert!(action.enable_write.is_none());
    }

    #[test]
    fn client_activates_read_on_ack() {
        let h = handle();
        let mut ctl = BoostController::client(h.clone(), [3u8; 16], false);
        let payload = BoostParams {
            ascii: false,
            iv: [7u8; 16],
        }
        .encode();

        ctl.on_control(CMD_BOOST_ACK, &payload);
        assert!(ctl.activated());
        assert!(h.read_enabled());

        // Duplicate ACKs are ignored.
        let action = ctl.on_control(CMD_BOOST_ACK, &payload);
        assert!(action.reply.is_none());
    }

    #[test]
    fn short_payloads_are_ignored() {
        let mut ctl = BoostController::server(handle(), [4u8; 16]);
        let action = ctl.on_control(CMD_BOOST_REQUEST, &[0u8; 5]);
        assert!(action.reply.is_none());
        assert!(action.enable_write.is_none());
    }
}
