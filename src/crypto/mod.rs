//! Cryptographic layer.
//!
//! This module provides:
//! - Seed-derived symmetric key material (AEAD, control HMAC, boost AES)
//! - The per-record AEAD cipher and the record-framing stream adapter
//! - edwards25519 master-key generation, scalar splitting, and public-point
//!   recovery for operators who prefer asymmetric key distribution

mod aead;
mod frame;
pub mod kdf;
pub mod keys;

pub use aead::{Nonce, RecordCipher};
pub use frame::AeadStream;

/// Size of an AEAD nonce in bytes (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Size of an AEAD authentication tag in bytes (128 bits).
pub const TAG_SIZE: usize = 16;

/// Maximum plaintext carried by one sealed record.
pub const MAX_RECORD_SIZE: usize = 16 * 1024;

/// Truncated HMAC length on control frames.
pub const CONTROL_MAC_SIZE: usize = 16;
