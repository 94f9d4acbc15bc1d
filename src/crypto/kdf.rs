//! Key derivation from the shared seed.
//!
//! Every symmetric key in the protocol is a fixed SHA-256 construction
//! over the out-of-band seed, so both peers derive identical material
//! with no negotiation:
//!
//! - AEAD key: `SHA-256(seed)` truncated to the cipher's key length
//! - Control-channel HMAC key: `SHA-256(seed || "|hb-control")`
//! - Boost AES key: `SHA-256(seed || "|hb-aes")` truncated to 16 bytes

use sha2::{Digest, Sha256};

/// Domain separator for the control-channel HMAC key.
const CONTROL_SUFFIX: &str = "|hb-control";

/// Domain separator for the boost codec AES key.
const BOOST_SUFFIX: &str = "|hb-aes";

/// Derive AEAD key material of `len` bytes (at most 32) from the seed.
pub fn aead_key(seed: &str, len: usize) -> Vec<u8> {
    debug_assert!(len <= 32);
    let digest = Sha256::digest(seed.as_bytes());
    digest[..len].to_vec()
}

/// Derive the 32-byte HMAC key authenticating control frames.
pub fn control_key(seed: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update(CONTROL_SUFFIX.as_bytes());
    hasher.finalize().into()
}

/// Derive the 16-byte AES key for the high-bandwidth carrier.
pub fn boost_key(seed: &str) -> [u8; 16] {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update(BOOST_SUFFIX.as_bytes());
    let digest = hasher.finalize();
    let mut key = [0u8; 16];
    key.copy_from_slice(&digest[..16]);
    key
}

/// Derive the handshake key-hash segment: `SHA-256(key)[..8]`.
pub fn handshake_tag(key: &str) -> [u8; 8] {
    let digest = Sha256::digest(key.as_bytes());
    let mut tag = [0u8; 8];
    tag.copy_from_slice(&digest[..8]);
    tag
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivations_are_deterministic_and_distinct() {
        let a1 = aead_key("seed", 32);
        let a2 = aead_key("seed", 32);
        assert_eq!(a1, a2);

        let c = control_key("seed");
        let b = boost_key("seed");
        assert_ne!(&a1[..16], &b[..]);
        assert_ne!(&a1[..], &c[..]);
    }

    #[test]
    fn aead_key_truncates() {
        let long = aead_key("seed", 32);
        let short = aead_key("seed", 16);
        assert_eq!(&long[..16], &short[..]);
    }

    #[test]
    fn different_seeds_diverge() {
        assert_ne!(control_key("a"), control_key("b"));
        assert_ne!(boost_key("a"), boost_key("b"));
    }

    #[test]
    fn handshake_tag_matches_plain_digest() {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(b"handshake-key");
        assert_eq!(handshake_tag("handshake-key"), digest[..8]);
    }
}
