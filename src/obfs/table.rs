//! The puzzle table: a deterministic, seed-keyed substitution mapping.
//!
//! Every plaintext byte owns a set of 4-byte codewords over a 64-symbol
//! hint alphabet; the encoder picks one uniformly at random and emits its
//! bytes in a random order. A codeword decodes from the *unordered*
//! 4-tuple: each hint byte carries a 2-bit slot index alongside its 2-bit
//! value crumb, so the decode map is keyed by the four bytes sorted.
//!
//! The two modes differ only in which byte classes they draw from:
//!
//! - ASCII mode: hint bytes have bit 6 set (`0x40..=0x7f`), padding bytes
//!   have bit 6 clear (`0x20..=0x3f`) — everything printable.
//! - Entropy mode: hint bytes satisfy `b & 0x90 == 0`, padding bytes have
//!   bit 4 or bit 7 set.
//!
//! The classifier test is a single mask per mode, so the receiver can
//! discard padding statelessly.

use std::collections::HashMap;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use sha2::{Digest, Sha256};

use crate::config::TableMode;

/// Hint alphabet size: 16 payloads × 4 symbol choices each.
const ALPHABET_SIZE: usize = 64;

/// Stored codewords per plaintext byte (out of the 256 derivable ones).
const CODEWORDS_PER_BYTE: usize = 64;

/// Padding pool size in entropy mode (ASCII mode uses its whole class).
const ENTROPY_PADDING_POOL: usize = 64;

/// Domain separator mixed into the table RNG seed.
const TABLE_SUFFIX: &str = "|hb-table";

/// The shared, immutable puzzle table.
pub struct Table {
    mode: TableMode,
    /// `encode[b]` lists the codewords for plaintext byte `b`.
    encode: Vec<Vec<[u8; 4]>>,
    /// Sorted-and-packed 4-tuple → plaintext byte.
    decode: HashMap<u32, u8>,
    /// Padding bytes the encoder may interleave.
    padding: Vec<u8>,
}

impl Table {
    /// Derive the table for `(seed, mode)`. Both peers must use the same
    /// pair; the construction is deterministic.
    pub fn new(seed: &str, mode: TableMode) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(seed.as_bytes());
        hasher.update(TABLE_SUFFIX.as_bytes());
        hasher.update(match mode {
            TableMode::PreferAscii => b"prefer_ascii".as_slice(),
            TableMode::PreferEntropy => b"prefer_entropy".as_slice(),
        });
        let mut rng = ChaCha20Rng::from_seed(hasher.finalize().into());

        let mut alphabet: Vec<u8> = match mode {
            TableMode::PreferAscii => (0x40..=0x7f).collect(),
            TableMode::PreferEntropy => (0u8..=0xff).filter(|b| b & 0x90 == 0).collect(),
        };
        debug_assert_eq!(alphabet.len(), ALPHABET_SIZE);
        alphabet.shuffle(&mut rng);

        let mut padding: Vec<u8> = match mode {
            TableMode::PreferAscii => (0x20..=0x3f).collect(),
            TableMode::PreferEntropy => (0u8..=0xff).filter(|b| b & 0x90 != 0).collect(),
        };
        padding.shuffle(&mut rng);
        if mode == TableMode::PreferEntropy {
            padding.truncate(ENTROPY_PADDING_POOL);
        }

        // A hint byte encodes a 4-bit payload `(slot << 2) | crumb`; each
        // payload owns four alphabet symbols the encoder may choose from.
        let symbol = |payload: u8, choice: u8| alphabet[(payload as usize) * 4 + choice as usize];

        let mut encode = Vec::with_capacity(256);
        let mut decode = HashMap::new();
        for b in 0u16..=255 {
            let b = b as u8;
            let payloads: [u8; 4] =
                std::array::from_fn(|slot| ((slot as u8) << 2) | ((b >> (2 * slot)) & 0x03));

            // All 4^4 choice combinations, shuffled, then truncated.
            let mut words = Vec::with_capacity(256);
            for combo in 0u16..256 {
                let word: [u8; 4] = std::array::from_fn(|slot| {
                    symbol(payloads[slot], ((combo >> (2 * slot)) & 0x03) as u8)
                });
                words.push(word);
            }
            words.shuffle(&mut rng);
            words.truncate(CODEWORDS_PER_BYTE);

            for word in &words {
                decode.insert(pack_key(*word), b);
            }
            encode.push(words);
        }

        Self {
            mode,
            encode,
            decode,
            padding,
        }
    }

    /// Whether the table is in ASCII mode.
    pub fn is_ascii(&self) -> bool {
        self.mode == TableMode::PreferAscii
    }

    /// The table's mode.
    pub fn mode(&self) -> TableMode {
        self.mode
    }

    /// Codewords for a plaintext byte. Never empty.
    pub fn codewords(&self, b: u8) -> &[[u8; 4]] {
        &self.encode[b as usize]
    }

    /// Decode an unordered 4-tuple. `None` means the stream is corrupt.
    pub fn decode(&self, tuple: [u8; 4]) -> Option<u8> {
        self.decode.get(&pack_key(tuple)).copied()
    }

    /// The padding pool. Never empty; disjoint from codeword bytes under
    /// the mode's classifier.
    pub fn padding_pool(&self) -> &[u8] {
        &self.padding
    }

    /// Stateless classifier: is this wire byte padding (as opposed to a
    /// codeword or carrier byte)?
    pub fn is_padding_byte(&self, b: u8) -> bool {
        classify_padding(b, self.is_ascii())
    }
}

/// Mode classifier shared by the 4-byte codec and the boost carrier.
pub fn classify_padding(b: u8, ascii: bool) -> bool {
    if ascii {
        b & 0x40 == 0
    } else {
        b & 0x90 != 0
    }
}

/// Canonical decode key: the four bytes sorted, packed big-endian.
fn pack_key(mut tuple: [u8; 4]) -> u32 {
    tuple.sort_unstable();
    u32::from_be_bytes(tuple)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_codeword_decodes_to_its_byte() {
        for mode in [TableMode::PreferAscii, TableMode::PreferEntropy] {
            let table = Table::new("test-seed", mode);
            for b in 0u16..=255 {
                let b = b as u8;
                let words = table.codewords(b);
                assert!(!words.is_empty());
                for word in words {
                    assert_eq!(table.decode(*word), Some(b), "mode {mode:?} byte {b:#x}");
                }
            }
        }
    }

    #[test]
    fn decode_ignores_emission_order() {
        let table = Table::new("seed", TableMode::PreferAscii);
        let word = table.codewords(0xA7)[0];
        let shuffled = [word[3], word[1], word[0], word[2]];
        assert_eq!(table.decode(shuffled), Some(0xA7));
    }

    #[test]
    fn classifier_separates_codewords_from_padding() {
        for mode in [TableMode::PreferAscii, TableMode::PreferEntropy] {
            let table = Table::new("classify", mode);
            for b in 0u16..=255 {
                for word in table.codewords(b as u8) {
                    for &hint in word {
                        assert!(!table.is_padding_byte(hint));
                    }
                }
            }
            for &pad in table.padding_pool() {
                assert!(table.is_padding_byte(pad));
            }
        }
    }

    #[test]
    fn ascii_mode_stays_printable() {
        let table = Table::new("printable", TableMode::PreferAscii);
        for b in 0u16..=255 {
            for word in table.codewords(b as u8) {
                for &hint in word {
                    assert!((0x40..=0x7f).contains(&hint));
                }
            }
        }
        for &pad in table.padding_pool() {
            assert!((0x20..=0x3f).contains(&pad));
        }
    }

    #[test]
    fn same_seed_same_table() {
        let a = Table::new("determinism", TableMode::PreferEntropy);
        let b = Table::new("determinism", TableMode::PreferEntropy);
        for byte in 0u16..=255 {
            assert_eq!(a.codewords(byte as u8), b.codewords(byte as u8));
        }
        assert_eq!(a.padding_pool(), b.padding_pool());
    }

    #[test]
    fn different_seeds_differ() {
        let a = Table::new("seed-a", TableMode::PreferAscii);
        let b = Table::new("seed-b", TableMode::PreferAscii);
        let differs = (0u16..=255).any(|byte| a.codewords(byte as u8) != b.codewords(byte as u8));
        assert!(differs);
    }

    #[test]
    fn codeword_tuples_never_collide_across_bytes() {
        let table = Table::new("collision", TableMode::PreferEntropy);
        let mut seen = std::collections::HashMap::new();
        for b in 0u16..=255 {
            for word in table.codewords(b as u8) {
                let key = super::pack_key(*word);
                if let Some(prev) = seen.insert(key, b as u8) {
                    assert_eq!(prev, b as u8);
                }
            }
        }
    }
}
