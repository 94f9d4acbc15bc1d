//! Per-record AEAD sealing.
//!
//! Records are sealed with ChaCha20-Poly1305 or AES-128-GCM under a key
//! derived from the shared seed, using a monotonically increasing
//! per-direction counter nonce. A decrypt failure is fatal to the
//! connection; there is no in-band recovery from a bad record.

use aes_gcm::Aes128Gcm;
use chacha20poly1305::aead::{Aead as AeadOp, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;

use crate::config::AeadMethod;
use crate::crypto::{kdf, NONCE_SIZE};
use crate::error::{Error, Result};

/// A counter nonce. The counter occupies the low (trailing) 8 bytes in
/// big-endian; the leading 4 bytes stay zero. Each direction keeps its
/// own instance starting at zero and increments once per record.
#[derive(Clone, Copy, Debug)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Nonce for the given counter value.
    pub fn new(counter: u64) -> Self {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[4..].copy_from_slice(&counter.to_be_bytes());
        Self(nonce)
    }

    /// Raw nonce bytes.
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }

    /// Current counter value.
    pub fn counter(&self) -> u64 {
        u64::from_be_bytes(self.0[4..].try_into().expect("fixed slice"))
    }

    /// Advance to the next record. A wrap would repeat key material, but
    /// 2^64 records is unreachable within a connection's lifetime.
    pub fn increment(&mut self) {
        let next = self.counter().wrapping_add(1);
        self.0[4..].copy_from_slice(&next.to_be_bytes());
    }
}

impl Default for Nonce {
    fn default() -> Self {
        Self::new(0)
    }
}

/// The record cipher for one connection. Stateless with respect to
/// nonces; the framer owns the per-direction counters.
pub enum RecordCipher {
    /// ChaCha20-Poly1305 with a 32-byte key.
    ChaCha20Poly1305(Box<ChaCha20Poly1305>),
    /// AES-128-GCM with a 16-byte key.
    Aes128Gcm(Box<Aes128Gcm>),
}

impl RecordCipher {
    /// Build the cipher for `method`, deriving key material from `seed`.
    /// Returns `None` for [`AeadMethod::None`] (passthrough framing).
    pub fn new(method: AeadMethod, seed: &str) -> Result<Option<Self>> {
        match method {
            AeadMethod::ChaCha20Poly1305 => {
                let key = kdf::aead_key(seed, 32);
                let cipher = ChaCha20Poly1305::new_from_slice(&key)
                    .map_err(|_| Error::cipher_setup("chacha20-poly1305 key length"))?;
                Ok(Some(RecordCipher::ChaCha20Poly1305(Box::new(cipher))))
            }
            AeadMethod::Aes128Gcm => {
                let key = kdf::aead_key(seed, 16);
                let cipher = Aes128Gcm::new_from_slice(&key)
                    .map_err(|_| Error::cipher_setup("aes-128-gcm key length"))?;
                Ok(Some(RecordCipher::Aes128Gcm(Box::new(cipher))))
            }
            AeadMethod::None => Ok(None),
        }
    }

    /// Seal one record: returns ciphertext with the 16-byte tag appended.
    pub fn seal(&self, nonce: &Nonce, plaintext: &[u8]) -> Result<Vec<u8>> {
        let out = match self {
            RecordCipher::ChaCha20Poly1305(c) => c.encrypt(nonce.as_bytes().into(), plaintext),
            RecordCipher::Aes128Gcm(c) => c.encrypt(nonce.as_bytes().into(), plaintext),
        };
        out.map_err(|_| Error::Decrypt)
    }

    /// Open one record, verifying the tag.
    pub fn open(&self, nonce: &Nonce, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let out = match self {
            RecordCipher::ChaCha20Poly1305(c) => c.decrypt(nonce.as_bytes().into(), ciphertext),
            RecordCipher::Aes128Gcm(c) => c.decrypt(nonce.as_bytes().into(), ciphertext),
        };
        out.map_err(|_| Error::Decrypt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::TAG_SIZE;

    #[test]
    fn nonce_counter_is_big_endian_in_low_bytes() {
        let nonce = Nonce::new(1);
        assert_eq!(&nonce.as_bytes()[..4], &[0, 0, 0, 0]);
        assert_eq!(&nonce.as_bytes()[4..], &[0, 0, 0, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn nonce_strictly_increases() {
        let mut nonce = Nonce::default();
        for expected in 0..16u64 {
            assert_eq!(nonce.counter(), expected);
            nonce.increment();
        }
    }

    #[test]
    fn seal_open_round_trip_chacha() {
        let cipher = RecordCipher::new(AeadMethod::ChaCha20Poly1305, "seed")
            .unwrap()
            .unwrap();
        let nonce = Nonce::new(7);
        let ct = cipher.seal(&nonce, b"record payload").unwrap();
        assert_eq!(ct.len(), b"record payload".len() + TAG_SIZE);
        assert_eq!(cipher.open(&nonce, &ct).unwrap(), b"record payload");
    }

    #[test]
    fn seal_open_round_trip_aes() {
        let cipher = RecordCipher::new(AeadMethod::Aes128Gcm, "seed")
            .unwrap()
            .unwrap();
        let nonce = Nonce::new(0);
        let ct = cipher.seal(&nonce, b"aes record").unwrap();
        assert_eq!(cipher.open(&nonce, &ct).unwrap(), b"aes record");
    }

    #[test]
    fn wrong_nonce_fails_open() {
        let cipher = RecordCipher::new(AeadMethod::ChaCha20Poly1305, "seed")
            .unwrap()
            .unwrap();
        let ct = cipher.seal(&Nonce::new(1), b"data").unwrap();
        assert!(cipher.open(&Nonce::new(2), &ct).is_err());
    }

    #[test]
    fn tampered_record_fails_open() {
        let cipher = RecordCipher::new(AeadMethod::Aes128Gcm, "seed")
            .unwrap()
            .unwrap();
        let nonce = Nonce::new(3);
        let mut ct = cipher.seal(&nonce, b"data").unwrap();
        ct[0] ^= 0x01;
        assert!(cipher.open(&nonce, &ct).is_err());
    }

    #[test]
    fn none_method_yields_no_cipher() {
        assert!(RecordCipher::new(AeadMethod::None, "seed").unwrap().is_none());
    }

    #[test]
    fn different_seeds_cannot_open() {
        let a = RecordCipher::new(AeadMethod::ChaCha20Poly1305, "seed-a")
            .unwrap()
            .unwrap();
        let b = RecordCipher::new(AeadMethod::ChaCha20Poly1305, "seed-b")
            .unwrap()
            .unwrap();
        let nonce = Nonce::new(0);
        let ct = a.seal(&nonce, b"data").unwrap();
        assert!(b.open(&nonce, &ct).is_err());
    }
}
