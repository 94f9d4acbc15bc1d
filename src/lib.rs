//! # hbtun
//!
//! An HTTP-masked obfuscating TCP tunnel. A connection looks like a large
//! `POST` upload to a passive observer while carrying an authenticated,
//! encrypted byte stream between two peers.
//!
//! ## Layering
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     Application                          │
//! ├─────────────────────────────────────────────────────────┤
//! │  Control multiplexer (in-band frames, downlink boost)    │
//! ├─────────────────────────────────────────────────────────┤
//! │  AEAD record framer (ChaCha20-Poly1305 / AES-128-GCM)    │
//! ├─────────────────────────────────────────────────────────┤
//! │  Puzzle codec (keyed substitution + random padding,      │
//! │  upgradable to a 6-bit AES-CTR carrier)                  │
//! ├─────────────────────────────────────────────────────────┤
//! │  HTTP masquerade + TCP                                   │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Each layer is a [`tokio::io::AsyncRead`] + [`tokio::io::AsyncWrite`]
//! adapter that owns the layer below it; closing an outer layer cascades
//! down to the transport.
//!
//! ## Entry points
//!
//! - [`tunnel::dial`] / [`tunnel::dial_uot`]: client side, returns an
//!   application-ready stream connected through the tunnel.
//! - [`tunnel::handshake`]: server side, upgrades an accepted TCP
//!   connection and returns the decrypted stream plus the requested
//!   target. On failure it returns a [`tunnel::HandshakeError`] carrying
//!   every byte already consumed so the caller can replay the connection
//!   into an innocent fallback target ([`tunnel::run_fallback`]).

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod config;
pub mod crypto;
pub mod error;
pub mod obfs;
pub mod tunnel;

pub use config::{AeadMethod, Config, ProtocolConfig, TableMode};
pub use error::{Error, Result};

/// Protocol version carried in control frames.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Transfer buffer size used by the codec layers (matches a typical
/// socket buffer so one inner read fills one codec pass).
pub const IO_BUFFER_SIZE: usize = 32 * 1024;

/// Permitted clock skew between peers during the handshake, in seconds.
pub const HANDSHAKE_MAX_SKEW_SECS: i64 = 60;
