use sha2::{Digest, Sha256};

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::remote::watch_change::BloomFilterPayload;

/// Probabilistic set of document names sent with an existence filter.
///
/// Bit `i` of the filter lives in `bitmap[i / 8]` at position `i % 8`; the
/// last `padding` bits of the bitmap are unused. A value maps to
/// `hash_count` bits through double hashing of its digest: the first and
/// second 8 bytes are read as little-endian `h1` and `h2` and bit `k` is
/// `(h1 + k * h2) mod bit_count` in wrapping 64-bit arithmetic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilter {
    bitmap: Vec<u8>,
    padding: u8,
    hash_count: u32,
    bit_count: u64,
}

impl BloomFilter {
    pub fn new(bitmap: Vec<u8>, padding: i32, hash_count: i32) -> FirestoreResult<Self> {
        if !(0..8).contains(&padding) {
            return Err(invalid_argument(format!("Invalid bloom filter padding: {padding}")));
        }
        if hash_count < 0 {
            return Err(invalid_argument(format!(
                "Invalid bloom filter hash count: {hash_count}"
            )));
        }
        if !bitmap.is_empty() && hash_count == 0 {
            return Err(invalid_argument(
                "A non-empty bloom filter must have a non-zero hash count",
            ));
        }
        if bitmap.is_empty() && padding != 0 {
            return Err(invalid_argument(
                "An empty bloom filter must have zero padding",
            ));
        }
        let bit_count = (bitmap.len() as u64 * 8).saturating_sub(padding as u64);
        Ok(Self {
            bitmap,
            padding: padding as u8,
            hash_count: hash_count as u32,
            bit_count,
        })
    }

    /// An all-zero filter of `byte_len` bytes, to be filled with [`insert`](Self::insert).
    pub fn with_size(byte_len: usize, hash_count: i32) -> FirestoreResult<Self> {
        Self::new(vec![0; byte_len], 0, hash_count)
    }

    pub fn from_payload(payload: &BloomFilterPayload) -> FirestoreResult<Self> {
        Self::new(payload.bitmap.clone(), payload.padding, payload.hash_count)
    }

    pub fn to_payload(&self) -> BloomFilterPayload {
        BloomFilterPayload {
            bitmap: self.bitmap.clone(),
            padding: i32::from(self.padding),
            hash_count: self.hash_count as i32,
        }
    }

    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    pub fn might_contain(&self, value: &str) -> bool {
        if self.bit_count == 0 {
            return false;
        }
        let (h1, h2) = digest_pair(value);
        (0..self.hash_count).all(|k| self.is_bit_set(self.bit_index(h1, h2, k)))
    }

    pub fn insert(&mut self, value: &str) {
        if self.bit_count == 0 {
            return;
        }
        let (h1, h2) = digest_pair(value);
        for k in 0..self.hash_count {
            let index = self.bit_index(h1, h2, k);
            self.bitmap[(index / 8) as usize] |= 1 << (index % 8);
        }
    }

    fn bit_index(&self, h1: u64, h2: u64, k: u32) -> u64 {
        h1.wrapping_add(h2.wrapping_mul(u64::from(k))) % self.bit_count
    }

    fn is_bit_set(&self, index: u64) -> bool {
        self.bitmap
            .get((index / 8) as usize)
            .map(|byte| byte & (1 << (index % 8)) != 0)
            .unwrap_or(false)
    }
}

fn digest_pair(value: &str) -> (u64, u64) {
    let digest = Sha256::digest(value.as_bytes());
    let mut first = [0u8; 8];
    let mut second = [0u8; 8];
    first.copy_from_slice(&digest[0..8]);
    second.copy_from_slice(&digest[8..16]);
    (u64::from_le_bytes(first), u64::from_le_bytes(second))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_shape() {
        assert!(BloomFilter::new(vec![], 0, 0).is_ok());
        assert!(BloomFilter::new(vec![], 1, 0).is_err());
        assert!(BloomFilter::new(vec![0], 8, 1).is_err());
        assert!(BloomFilter::new(vec![0], -1, 1).is_err());
        assert!(BloomFilter::new(vec![0], 0, 0).is_err());
        assert!(BloomFilter::new(vec![0], 0, -1).is_err());
        assert_eq!(BloomFilter::new(vec![0, 0], 3, 1).unwrap().bit_count(), 13);
    }

    #[test]
    fn empty_filter_contains_nothing() {
        let filter = BloomFilter::new(vec![], 0, 0).unwrap();
        assert!(!filter.might_contain("projects/p/databases/d/documents/a/b"));
    }

    #[test]
    fn inserted_values_are_always_found() {
        let mut filter = BloomFilter::with_size(64, 7).unwrap();
        let names: Vec<String> = (0..50)
            .map(|i| format!("projects/p/databases/(default)/documents/posts/{i}"))
            .collect();
        for name in &names {
            filter.insert(name);
        }
        for name in &names {
            assert!(filter.might_contain(name), "false negative for {name}");
        }
        let misses = (50..550)
            .map(|i| format!("projects/p/databases/(default)/documents/posts/{i}"))
            .filter(|name| filter.might_contain(name))
            .count();
        assert!(misses < 100, "false positive rate too high: {misses}/500");
    }

    #[test]
    fn payload_round_trips_bits() {
        let mut filter = BloomFilter::new(vec![0; 4], 2, 3).unwrap();
        filter.insert("a");
        let restored = BloomFilter::from_payload(&filter.to_payload()).unwrap();
        assert_eq!(restored, filter);
        assert!(restored.might_contain("a"));
    }
}
