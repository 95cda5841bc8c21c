//! Bit-array bloom filter
//!
//! Backs the `bf_add`/`bf_exists` commands of the in-process engine.
//! Positions are derived from two xxh64 digests (double hashing), so a
//! filter sized for `expected_items` at `fp_rate` never reports a false
//! negative and reports false positives at roughly `fp_rate`.

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64::xxh64;

/// Default capacity of a filter created implicitly by `bf_add`
pub const DEFAULT_EXPECTED_ITEMS: usize = 100_000;

/// Default false positive rate of a filter created implicitly by `bf_add`
pub const DEFAULT_FP_RATE: f64 = 0.01;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: u64,
    num_hashes: u32,
}

impl BloomFilter {
    /// Create a filter sized for `expected_items` at the given false positive rate
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn new(expected_items: usize, fp_rate: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let ln2 = std::f64::consts::LN_2;
        let m = (-(n * fp_rate.ln()) / (ln2 * ln2)).ceil().max(64.0);
        let k = ((m / n) * ln2).round().clamp(1.0, 16.0);
        let num_bits = m as u64;
        Self {
            bits: vec![0; num_bits.div_ceil(64) as usize],
            num_bits,
            num_hashes: k as u32,
        }
    }

    /// Add an item. Returns `true` when the item was not already present.
    pub fn insert(&mut self, item: &[u8]) -> bool {
        let positions: Vec<u64> = self.positions(item).collect();
        let mut added = false;
        for pos in positions {
            let (word, mask) = Self::locate(pos);
            if self.bits[word] & mask == 0 {
                self.bits[word] |= mask;
                added = true;
            }
        }
        added
    }

    /// Check membership (may return false positives, never false negatives)
    #[must_use]
    pub fn contains(&self, item: &[u8]) -> bool {
        self.positions(item).all(|pos| {
            let (word, mask) = Self::locate(pos);
            self.bits[word] & mask != 0
        })
    }

    fn positions(&self, item: &[u8]) -> impl Iterator<Item = u64> + '_ {
        let h1 = xxh64(item, 0);
        let h2 = xxh64(item, h1) | 1;
        (0..u64::from(self.num_hashes))
            .map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits)
    }

    #[allow(clippy::cast_possible_truncation)]
    const fn locate(pos: u64) -> (usize, u64) {
        ((pos / 64) as usize, 1u64 << (pos % 64))
    }
}

impl Default for BloomFilter {
    fn default() -> Self {
        Self::new(DEFAULT_EXPECTED_ITEMS, DEFAULT_FP_RATE)
    }
}
