//! Client dial state machine.
//!
//! Dialing runs: TCP connect → HTTP masquerade → puzzle codec → AEAD
//! framer → handshake payload → target address (or UoT preface) →
//! optional control multiplexer. Any failure before the tunnel is handed
//! back drops the stack, which closes the socket. The returned future is
//! the cancellation surface: dropping it (or racing it against
//! `tokio::time::timeout`) aborts the dial at its current step.

use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::ProtocolConfig;
use crate::crypto::{kdf, keys, AeadStream};
use crate::error::Result;
use crate::obfs::{httpmask, PuzzleStream};
use crate::tunnel::address::{write_address, write_uot_preface};
use crate::tunnel::boost::BoostController;
use crate::tunnel::buffered::BufferedStream;
use crate::tunnel::control::ControlStream;
use crate::tunnel::{Stack, Tunnel};

/// Build the 16-byte handshake payload:
/// `timestamp_be(8) || sha256(key)[..8]`.
pub(crate) fn build_handshake_payload(key: &str) -> [u8; 16] {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();

    let mut payload = [0u8; 16];
    payload[..8].copy_from_slice(&now.to_be_bytes());
    payload[8..].copy_from_slice(&kdf::handshake_tag(key));
    payload
}

/// Connect, mask, and stack the codec layers; write the handshake
/// payload. The common prefix of [`dial`] and [`dial_uot`]. Returns the
/// stack and the normalized seed (all wire keys derive from it, so an
/// asymmetric client agrees with a server configured with the point).
async fn open_stack(cfg: &ProtocolConfig, server_addr: &str) -> Result<(Stack, String)> {
    cfg.validate()?;

    let mut raw = TcpStream::connect(server_addr).await?;
    raw.set_nodelay(true)?;

    // The masquerade is the outermost dressing, before any encoding.
    if !cfg.disable_http_mask {
        httpmask::write_masquerade(&mut raw, server_addr).await?;
    }

    let puzzle = PuzzleStream::new(
        BufferedStream::new(raw),
        cfg.table.clone(),
        cfg.padding_min,
        cfg.padding_max,
        false,
    );

    // If the configured key is an edwards25519 scalar, the AEAD seed
    // becomes the hex of its public point; the server is configured with
    // that point directly.
    let seed = keys::normalize_seed(&cfg.key);
    let mut stack = AeadStream::new(puzzle, cfg.aead, &seed)?;

    let payload = build_handshake_payload(&cfg.key);
    stack.write_all(&payload).await?;
    Ok((stack, seed))
}

/// Wrap the finished stack with the control multiplexer when the
/// downlink boost is enabled.
fn finish(cfg: &ProtocolConfig, stack: Stack, seed: &str) -> Tunnel {
    if !cfg.enable_downlink_boost {
        return Tunnel::Plain(stack);
    }
    let handle = stack.get_ref().boost_handle();
    let controller = BoostController::client(handle, kdf::boost_key(seed), cfg.table.is_ascii());
    Tunnel::Control(Box::new(ControlStream::new(
        stack,
        kdf::control_key(seed),
        controller,
    )))
}

/// Establish a tunnel to `server_addr` and ask it to connect to
/// `target_addr`. Returns an application-ready byte stream.
pub async fn dial(cfg: &ProtocolConfig, server_addr: &str, target_addr: &str) -> Result<Tunnel> {
    let (mut stack, seed) = open_stack(cfg, server_addr).await?;
    write_address(&mut stack, target_addr).await?;
    stack.flush().await?;

    debug!(server = server_addr, target = target_addr, "tunnel dialed");
    Ok(finish(cfg, stack, &seed))
}

/// Establish a UDP-over-TCP tunnel: the UoT preface replaces the target
/// address and the server switches to datagram framing.
pub async fn dial_uot(cfg: &ProtocolConfig, server_addr: &str) -> Result<Tunnel> {
    let (mut stack, seed) = open_stack(cfg, server_addr).await?;
    write_uot_preface(&mut stack).await?;
    stack.flush().await?;

    debug!(server = server_addr, "uot tunnel dialed");
    Ok(finish(cfg, stack, &seed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_payload_layout() {
        let payload = build_handshake_payload("handshake-key");
        assert_eq!(payload.len(), 16);

        // A nonzero big-endian timestamp in the first eight bytes.
        let ts = u64::from_be_bytes(payload[..8].try_into().unwrap());
        assert!(ts > 0);

        // The key digest in the last eight.
        assert_eq!(&payload[8..], &kdf::handshake_tag("handshake-key"));
    }

    #[test]
    fn handshake_payload_tracks_key() {
        let a = build_handshake_payload("key-a");
        let b = build_handshake_payload("key-b");
        assert_ne!(a[8..], b[8..]);
    }
}
