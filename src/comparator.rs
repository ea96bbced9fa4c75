use crate::pair::Endianness;
use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::hash::Hasher;
use std::sync::Arc;

/// Ordering, equality and hashing over binary-encoded keys.
///
/// `hash` must agree with `compare`: keys that compare `Equal` hash equally.
/// Implementations must be deterministic; the engine does not check this.
pub trait Comparator: Send + Sync {
    fn compare(&self, left: &[u8], right: &[u8]) -> Ordering;

    fn hash(&self, key: &[u8]) -> u64;

    fn equals(&self, left: &[u8], right: &[u8]) -> bool {
        self.compare(left, right) == Ordering::Equal
    }

    /// Byte order of numeric keys, for comparators that decode them.
    fn endianness(&self) -> Option<Endianness> {
        None
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// A comparator bound to a direction; the order used for chunks, merges and sorted output.
#[derive(Clone)]
pub struct KeyOrder {
    comparator: Arc<dyn Comparator>,
    order: SortOrder,
}

impl KeyOrder {
    pub fn new(comparator: Arc<dyn Comparator>, order: SortOrder) -> Self {
        Self { comparator, order }
    }

    pub fn compare(&self, left: &[u8], right: &[u8]) -> Ordering {
        match self.order {
            SortOrder::Ascending => self.comparator.compare(left, right),
            SortOrder::Descending => self.comparator.compare(right, left),
        }
    }

    pub fn equals(&self, left: &[u8], right: &[u8]) -> bool {
        self.comparator.equals(left, right)
    }

    pub fn order(&self) -> SortOrder {
        self.order
    }

    pub fn comparator(&self) -> &Arc<dyn Comparator> {
        &self.comparator
    }
}

fn hash_bytes(key: &[u8]) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write(key);
    hasher.write_usize(key.len());
    // Fx leaves the low bits weak for short keys; finish with a murmur3 mixer.
    let mut h = hasher.finish();
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^ (h >> 33)
}

/// Lexicographic byte order.
#[derive(Clone, Copy, Debug, Default)]
pub struct BytewiseComparator;

impl Comparator for BytewiseComparator {
    fn compare(&self, left: &[u8], right: &[u8]) -> Ordering {
        left.cmp(right)
    }

    fn hash(&self, key: &[u8]) -> u64 {
        hash_bytes(key)
    }
}

/// Keys are 8-byte signed integers in the configured byte order.
///
/// Keys of any other width sort after every integer key, bytewise among themselves.
#[derive(Clone, Copy, Debug)]
pub struct I64Comparator {
    endian: Endianness,
}

impl I64Comparator {
    pub fn new(endian: Endianness) -> Self {
        Self { endian }
    }
}

impl Comparator for I64Comparator {
    fn compare(&self, left: &[u8], right: &[u8]) -> Ordering {
        match (self.endian.decode_i64(left), self.endian.decode_i64(right)) {
            (Some(l), Some(r)) => l.cmp(&r),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => left.cmp(right),
        }
    }

    fn hash(&self, key: &[u8]) -> u64 {
        hash_bytes(key)
    }

    fn endianness(&self) -> Option<Endianness> {
        Some(self.endian)
    }
}
