//! Bloom filter over message identifiers.
//!
//! Used as a compact digest of recently seen messages, attached to outgoing
//! frames as a retransmission hint. Filters travel between peers, so the byte
//! format is self-describing: the bit-array size and hash count ride in a
//! header and a filter built by one peer can be evaluated by another with no
//! shared configuration.
//!
//! Hash positions are derived by double hashing: the member string is hashed
//! once with SHA-256, the digest's first and second 8 bytes (big-endian u64)
//! become the base pair `(h1, h2)`, and position `i` is `(h1 + i*h2) mod m`.
//! Peers must reproduce this formula bit-identically to interoperate.

use bytes::{BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};

use crate::error::{ProbabilityError, WireError};
use crate::probabilities::{bits_per_element, MAX_HASH_COUNT};

/// Sizing parameters for a [`BloomFilter`].
#[derive(Debug, Clone, PartialEq)]
pub struct BloomFilterOptions {
    /// Expected number of inserted elements.
    pub capacity: u32,
    /// Target false-positive rate.
    pub error_rate: f64,
    /// Override the derived hash count (1..=12).
    pub k_hashes: Option<u32>,
    /// Override the bits-per-element ratio from the probability table.
    pub force_bits_per_element: Option<u32>,
}

impl Default for BloomFilterOptions {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            error_rate: 0.001,
            k_hashes: None,
            force_bits_per_element: None,
        }
    }
}

/// Fixed-size probabilistic set of message identifiers.
///
/// No false negatives for inserted members; false positives at the
/// configured rate.
#[derive(Debug, Clone, PartialEq)]
pub struct BloomFilter {
    bits: Vec<u8>,
    /// Total number of bits.
    m: u32,
    /// Number of hash positions per member.
    k: u32,
}

impl BloomFilter {
    /// Build an empty filter sized from `options`.
    pub fn new(options: &BloomFilterOptions) -> Result<Self, ProbabilityError> {
        let k = match options.k_hashes {
            Some(k) => {
                if k == 0 || k > MAX_HASH_COUNT {
                    return Err(ProbabilityError::KTooLarge(k));
                }
                k
            }
            None => default_hash_count(options.error_rate),
        };

        let ratio = match options.force_bits_per_element {
            Some(bits) => bits,
            None => bits_per_element(k, options.error_rate)?,
        };

        let m = options.capacity.saturating_mul(ratio).max(1);
        Ok(Self {
            bits: vec![0u8; (m as usize + 7) / 8],
            m,
            k,
        })
    }

    /// Number of bits in the filter.
    pub fn total_bits(&self) -> u32 {
        self.m
    }

    /// Number of hash positions per member.
    pub fn hash_count(&self) -> u32 {
        self.k
    }

    /// Add `id` to the set. Idempotent.
    pub fn insert(&mut self, id: &str) {
        let (h1, h2) = base_hashes(id);
        for i in 0..u64::from(self.k) {
            let bit = position(h1, h2, i, self.m);
            self.bits[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }

    /// Test membership. Never false-negative for inserted members.
    pub fn lookup(&self, id: &str) -> bool {
        let (h1, h2) = base_hashes(id);
        (0..u64::from(self.k)).all(|i| {
            let bit = position(h1, h2, i, self.m);
            self.bits[(bit / 8) as usize] & (1 << (bit % 8)) != 0
        })
    }

    /// Serialize to the wire form: `m` (u32 BE), `k` (u32 BE), bit array.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + self.bits.len());
        buf.put_u32(self.m);
        buf.put_u32(self.k);
        buf.put_slice(&self.bits);
        buf.freeze()
    }

    /// Reconstruct a filter from its wire form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < 8 {
            return Err(WireError::MalformedFilter("header too short"));
        }
        let m = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let k = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if m == 0 {
            return Err(WireError::MalformedFilter("zero-size bit array"));
        }
        if k == 0 || k > MAX_HASH_COUNT {
            return Err(WireError::MalformedFilter("hash count out of range"));
        }
        let expected = (m as usize + 7) / 8;
        if bytes.len() - 8 != expected {
            return Err(WireError::MalformedFilter("bit array length mismatch"));
        }
        Ok(Self {
            bits: bytes[8..].to_vec(),
            m,
            k,
        })
    }
}

/// Derived hash count for a target error rate: `round(-log2(p))`, clamped
/// to the supported 1..=12 range.
fn default_hash_count(error_rate: f64) -> u32 {
    let k = (-error_rate.log2()).round();
    (k as i64).clamp(1, i64::from(MAX_HASH_COUNT)) as u32
}

fn base_hashes(id: &str) -> (u64, u64) {
    let digest = Sha256::digest(id.as_bytes());
    let h1 = u64::from_be_bytes(digest[0..8].try_into().unwrap_or_default());
    let h2 = u64::from_be_bytes(digest[8..16].try_into().unwrap_or_default());
    (h1, h2)
}

fn position(h1: u64, h2: u64, i: u64, m: u32) -> u32 {
    (h1.wrapping_add(i.wrapping_mul(h2)) % u64::from(m)) as u32
}
