//! Server accept state machine.
//!
//! Upgrades an accepted TCP connection through the codec stack under a
//! handshake deadline: detect and consume the HTTP masquerade, open the
//! puzzle codec in recording mode, validate the handshake timestamp,
//! read the target address (or the UoT preface), and return the tunnel.
//!
//! Every failure between the first peeked byte and the target address
//! produces a [`HandshakeError`] carrying the raw socket plus every byte
//! already consumed from it, in order, so the connection can be replayed
//! into a fallback target indistinguishably from a direct connection.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use tracing::debug;

use crate::config::ProtocolConfig;
use crate::crypto::{kdf, AeadStream, RecordCipher};
use crate::error::Error;
use crate::obfs::{httpmask, PuzzleStream};
use crate::tunnel::address::{read_address_tagged, UOT_MAGIC};
use crate::tunnel::boost::BoostController;
use crate::tunnel::buffered::BufferedStream;
use crate::tunnel::control::ControlStream;
use crate::tunnel::{Stack, Tunnel};
use crate::HANDSHAKE_MAX_SKEW_SECS;

/// What the client asked for after the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Connect to this `host:port`.
    Address(String),
    /// Switch to UDP-over-TCP datagram framing.
    UdpOverTcp,
}

/// A failed server handshake, with everything needed to replay the
/// connection into a fallback endpoint: the raw transport, the HTTP
/// header bytes consumed before the codec stack, and the raw bytes the
/// codec layers consumed after it.
pub struct HandshakeError {
    error: Error,
    raw: TcpStream,
    http_header: Vec<u8>,
    read_data: Vec<u8>,
}

impl HandshakeError {
    /// Why the handshake failed.
    pub fn error(&self) -> &Error {
        &self.error
    }

    /// HTTP masquerade bytes consumed before the codec stack, if any.
    pub fn http_header(&self) -> &[u8] {
        &self.http_header
    }

    /// Raw bytes the codec stack consumed from the transport.
    pub fn read_data(&self) -> &[u8] {
        &self.read_data
    }

    /// Deconstruct for fallback replay: `(raw, http_header, read_data,
    /// cause)`. Replay order is header, then read data, then whatever is
    /// still in flight on `raw`.
    pub fn into_parts(self) -> (TcpStream, Vec<u8>, Vec<u8>, Error) {
        (self.raw, self.http_header, self.read_data, self.error)
    }
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tunnel handshake failed: {}", self.error)
    }
}

impl fmt::Debug for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeError")
            .field("error", &self.error)
            .field("http_header_len", &self.http_header.len())
            .field("read_data_len", &self.read_data.len())
            .finish()
    }
}

impl std::error::Error for HandshakeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Deconstruct a partially built stack into a `HandshakeError`.
fn fail(stack: Stack, http_header: Vec<u8>, error: Error) -> Box<HandshakeError> {
    let puzzle = stack.into_inner();
    let (buffered, mut read_data) = puzzle.into_parts();
    let (raw, leftover) = buffered.into_parts();
    read_data.extend_from_slice(&leftover);
    Box::new(HandshakeError {
        error,
        raw,
        http_header,
        read_data,
    })
}

fn timed_out() -> Error {
    Error::Transport(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        "handshake deadline exceeded",
    ))
}

/// Perform the server side of the tunnel handshake on an accepted
/// connection. On success returns the decrypted, application-ready
/// tunnel and the requested target.
pub async fn handshake(
    raw: TcpStream,
    cfg: &ProtocolConfig,
) -> Result<(Tunnel, Target), Box<HandshakeError>> {
    if let Err(e) = cfg.validate() {
        return Err(Box::new(HandshakeError {
            error: e,
            raw,
            http_header: Vec::new(),
            read_data: Vec::new(),
        }));
    }

    let deadline = Instant::now() + cfg.handshake_timeout;
    let mut buffered = BufferedStream::new(raw);
    let mut http_header: Vec<u8> = Vec::new();

    // Masquerade detection: consume the header only when the stream
    // opens with POST. A peek failure is left for the codec reads to
    // surface, where the recording buffers are in place.
    if !cfg.disable_http_mask {
        let looks_masked = match timeout_at(deadline, buffered.peek(4)).await {
            Ok(Ok(peeked)) => peeked == b"POST",
            Ok(Err(_)) | Err(_) => false,
        };
        if looks_masked {
            let consumed = timeout_at(
                deadline,
                httpmask::consume_masquerade(&mut buffered, &mut http_header),
            )
            .await;
            let result = match consumed {
                Ok(r) => r,
                Err(_) => Err(timed_out()),
            };
            if let Err(e) = result {
                let (raw, leftover) = buffered.into_parts();
                return Err(Box::new(HandshakeError {
                    error: e,
                    raw,
                    http_header,
                    read_data: leftover,
                }));
            }
        }
    }

    // Cipher setup is validated before the stack is assembled so the
    // transport survives a bad configuration.
    let cipher = match RecordCipher::new(cfg.aead, &cfg.key) {
        Ok(c) => c,
        Err(e) => {
            let (raw, leftover) = buffered.into_parts();
            return Err(Box::new(HandshakeError {
                error: e,
                raw,
                http_header,
                read_data: leftover,
            }));
        }
    };

    // Recording mode: every raw byte the codec reads is retained until
    // the handshake proves genuine.
    let puzzle = PuzzleStream::new(
        buffered,
        cfg.table.clone(),
        cfg.padding_min,
        cfg.padding_max,
        true,
    );
    let boost_handle = puzzle.boost_handle();
    let mut stack = AeadStream::with_cipher(puzzle, cipher);

    // Handshake payload: timestamp within the skew window. The key-hash
    // half is not compared — record decryption already proves the key.
    let mut hs = [0u8; 16];
    match timeout_at(deadline, stack.read_exact(&mut hs)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => return Err(fail(stack, http_header, Error::Transport(e))),
        Err(_) => return Err(fail(stack, http_header, timed_out())),
    }

    let client_time = u64::from_be_bytes(hs[..8].try_into().expect("fixed slice")) as i64;
    let server_time = unix_now();
    if (server_time - client_time).abs() > HANDSHAKE_MAX_SKEW_SECS {
        return Err(fail(
            stack,
            http_header,
            Error::TimestampSkew {
                server_time,
                client_time,
            },
        ));
    }

    // Genuine peer: release the recording buffer.
    stack.get_ref().stop_recording();

    // Target address, or the UoT preface in its place.
    let tag = match timeout_at(deadline, stack.read_u8()).await {
        Ok(Ok(tag)) => tag,
        Ok(Err(e)) => return Err(fail(stack, http_header, Error::Transport(e))),
        Err(_) => return Err(fail(stack, http_header, timed_out())),
    };

    let target = if tag == UOT_MAGIC[0] {
        let mut rest = [0u8; 3];
        match timeout_at(deadline, stack.read_exact(&mut rest)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(fail(stack, http_header, Error::Transport(e))),
            Err(_) => return Err(fail(stack, http_header, timed_out())),
        }
        if rest[..] != UOT_MAGIC[1..] {
            return Err(fail(
                stack,
                http_header,
                Error::address("malformed uot preface"),
            ));
        }
        Target::UdpOverTcp
    } else {
        match timeout_at(deadline, read_address_tagged(tag, &mut stack)).await {
            Ok(Ok((addr, _, _))) => Target::Address(addr),
            Ok(Err(e)) => return Err(fail(stack, http_header, e)),
            Err(_) => return Err(fail(stack, http_header, timed_out())),
        }
    };

    debug!(?target, "tunnel handshake complete");

    let tunnel = if cfg.enable_downlink_boost {
        let controller = BoostController::server(boost_handle, kdf::boost_key(&cfg.key));
        Tunnel::Control(Box::new(ControlStream::new(
            stack,
            kdf::control_key(&cfg.key),
            controller,
        )))
    } else {
        Tunnel::Plain(stack)
    };
    Ok((tunnel, target))
}
