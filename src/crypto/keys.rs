//! edwards25519 key material.
//!
//! Operators may distribute the tunnel seed asymmetrically: the server is
//! configured with the hex-encoded public point, while each client holds
//! either the master scalar or a split of it. At dial time the client
//! recovers the public point from whatever form it holds and uses its hex
//! encoding as the effective seed, so both sides derive identical
//! symmetric material without ever shipping the scalar to the server.
//!
//! A split is a pair of scalars `(r, k)` with `r + k ≡ s (mod ℓ)`; the
//! group law gives `(r + k)·G = r·G + k·G = s·G`, so any split recovers
//! the same public point.

use curve25519_dalek::edwards::CompressedEdwardsY;
use curve25519_dalek::{EdwardsPoint, Scalar};
use rand::RngCore;
use rand_core::OsRng;

use crate::error::{Error, Result};

/// A master keypair: the private scalar and its public point.
pub struct MasterKey {
    private: Scalar,
    public: EdwardsPoint,
}

impl MasterKey {
    /// Generate a fresh master keypair from OS entropy.
    pub fn generate() -> Self {
        let mut wide = [0u8; 64];
        OsRng.fill_bytes(&mut wide);
        let private = Scalar::from_bytes_mod_order_wide(&wide);
        let public = EdwardsPoint::mul_base(&private);
        Self { private, public }
    }

    /// The private scalar.
    pub fn private(&self) -> &Scalar {
        &self.private
    }

    /// The public point.
    pub fn public(&self) -> &EdwardsPoint {
        &self.public
    }
}

/// Hex-encode a point in compressed form.
pub fn encode_point(point: &EdwardsPoint) -> String {
    hex::encode(point.compress().to_bytes())
}

/// Hex-encode a scalar.
pub fn encode_scalar(scalar: &Scalar) -> String {
    hex::encode(scalar.to_bytes())
}

/// Split a private scalar into `(r, k)` with `r + k = scalar`, returned
/// as the hex encoding of `r || k` (64 bytes). Either share alone reveals
/// nothing about the scalar.
pub fn split_private_key(scalar: &Scalar) -> String {
    let mut wide = [0u8; 64];
    OsRng.fill_bytes(&mut wide);
    let r = Scalar::from_bytes_mod_order_wide(&wide);
    let k = scalar - r;

    let mut joined = [0u8; 64];
    joined[..32].copy_from_slice(&r.to_bytes());
    joined[32..].copy_from_slice(&k.to_bytes());
    hex::encode(joined)
}

fn canonical_scalar(bytes: &[u8]) -> Result<Scalar> {
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::key("scalar must be 32 bytes"))?;
    Option::<Scalar>::from(Scalar::from_canonical_bytes(arr))
        .ok_or_else(|| Error::key("non-canonical scalar"))
}

/// Recover the public point from a hex-encoded scalar (32 bytes) or a
/// hex-encoded split `r || k` (64 bytes).
pub fn recover_public_key(key_hex: &str) -> Result<EdwardsPoint> {
    let bytes = hex::decode(key_hex).map_err(|_| Error::key("key is not hex"))?;
    match bytes.len() {
        32 => {
            let s = canonical_scalar(&bytes)?;
            Ok(EdwardsPoint::mul_base(&s))
        }
        64 => {
            let r = canonical_scalar(&bytes[..32])?;
            let k = canonical_scalar(&bytes[32..])?;
            Ok(EdwardsPoint::mul_base(&(r + k)))
        }
        n => Err(Error::key(format!("unexpected key length {n}"))),
    }
}

/// Decode a hex-encoded compressed point.
pub fn decode_point(point_hex: &str) -> Result<EdwardsPoint> {
    let bytes = hex::decode(point_hex).map_err(|_| Error::key("point is not hex"))?;
    let compressed = CompressedEdwardsY::from_slice(&bytes)
        .map_err(|_| Error::key("point must be 32 bytes"))?;
    compressed
        .decompress()
        .ok_or_else(|| Error::key("invalid point encoding"))
}

/// Normalize a configured key into the effective tunnel seed.
///
/// If the key decodes as a scalar (or a split), the hex encoding of the
/// recovered public point becomes the seed; any other string is used
/// verbatim as a raw shared secret.
pub fn normalize_seed(key: &str) -> String {
    match recover_public_key(key) {
        Ok(point) => encode_point(&point),
        Err(_) => key.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_recovers_master_public() {
        let pair = MasterKey::generate();
        let master_hex = encode_point(pair.public());

        let split_hex = split_private_key(pair.private());
        let recovered = recover_public_key(&split_hex).unwrap();
        assert_eq!(encode_point(&recovered), master_hex);
    }

    #[test]
    fn master_scalar_recovers_public() {
        let pair = MasterKey::generate();
        let scalar_hex = encode_scalar(pair.private());
        let recovered = recover_public_key(&scalar_hex).unwrap();
        assert_eq!(encode_point(&recovered), encode_point(pair.public()));
    }

    #[test]
    fn homomorphic_identity_holds() {
        // (r + k)·G must equal s·G for the split (r, k) of s.
        let pair = MasterKey::generate();
        let split_hex = split_private_key(pair.private());
        let bytes = hex::decode(&split_hex).unwrap();

        let r = canonical_scalar(&bytes[..32]).unwrap();
        let k = canonical_scalar(&bytes[32..]).unwrap();
        let sum_point = EdwardsPoint::mul_base(&(r + k));

        assert_eq!(encode_point(&sum_point), encode_point(pair.public()));

        // And it decomposes: (r + k)·G = r·G + k·G.
        let composed = EdwardsPoint::mul_base(&r) + EdwardsPoint::mul_base(&k);
        assert_eq!(encode_point(&composed), encode_point(pair.public()));
    }

    #[test]
    fn normalize_passes_raw_seeds_verbatim() {
        assert_eq!(normalize_seed("not-a-scalar"), "not-a-scalar");
        assert_eq!(normalize_seed(""), "");
    }

    #[test]
    fn normalize_replaces_scalars_with_point() {
        let pair = MasterKey::generate();
        let scalar_hex = encode_scalar(pair.private());
        assert_eq!(normalize_seed(&scalar_hex), encode_point(pair.public()));
    }

    #[test]
    fn point_codec_round_trips() {
        let pair = MasterKey::generate();
        let hex = encode_point(pair.public());
        let back = decode_point(&hex).unwrap();
        assert_eq!(encode_point(&back), hex);
    }

    #[test]
    fn rejects_malformed_keys() {
        assert!(recover_public_key("zz").is_err());
        assert!(recover_public_key(&hex::encode([0u8; 16])).is_err());
        assert!(recover_public_key(&hex::encode([0u8; 48])).is_err());
        // 32 bytes of 0xff exceed the group order: non-canonical.
        assert!(recover_public_key(&hex::encode([0xffu8; 32])).is_err());
    }
}
