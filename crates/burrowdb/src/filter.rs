//! Bloom filter over key fingerprints.
//!
//! Uses xxhash64 with k=3 hash functions under different seeds:
//! `h_i(x) = xxhash64(x, seed=i) % size_bits`. The filter short-circuits
//! negative lookups and must be consulted before every delete walk.

/// Number of hash functions.
const FILTER_HASH_COUNT: u8 = 3;

/// Approximate membership filter for committed key fingerprints.
#[derive(Debug, Clone)]
pub(crate) struct Filter {
    bits: Vec<u64>,
    hash_count: u8,
}

impl Filter {
    /// Creates a filter sized for the given number of expected fingerprints.
    ///
    /// 10 bits per item gives roughly a 1% false positive rate with k=3.
    pub(crate) fn new(expected_items: usize) -> Self {
        let num_bits = (expected_items * 10).max(64);
        let num_words = num_bits.div_ceil(64);
        Self {
            bits: vec![0u64; num_words],
            hash_count: FILTER_HASH_COUNT,
        }
    }

    /// Appends a fingerprint to the filter.
    pub(crate) fn append(&mut self, fingerprint: u32) {
        let num_bits = (self.bits.len() * 64) as u64;
        let key = u64::from(fingerprint).to_le_bytes();

        for seed in 0..self.hash_count {
            let hash = xxhash_rust::xxh64::xxh64(&key, u64::from(seed));
            let bit_idx = hash % num_bits;
            self.bits[(bit_idx / 64) as usize] |= 1u64 << (bit_idx % 64);
        }
    }

    /// Returns `false` only when the fingerprint was definitely never
    /// appended; `true` may be a false positive.
    pub(crate) fn test(&self, fingerprint: u32) -> bool {
        let num_bits = (self.bits.len() * 64) as u64;
        let key = u64::from(fingerprint).to_le_bytes();

        for seed in 0..self.hash_count {
            let hash = xxhash_rust::xxh64::xxh64(&key, u64::from(seed));
            let bit_idx = hash % num_bits;
            if self.bits[(bit_idx / 64) as usize] & (1u64 << (bit_idx % 64)) == 0 {
                return false;
            }
        }
        true
    }
}
