use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// Byte order for numeric keys and values, and for the length fields of spilled records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Endianness {
    #[default]
    Little,
    Big,
}

impl Endianness {
    pub fn from_big_endian_flag(use_big_endian: bool) -> Self {
        if use_big_endian {
            Endianness::Big
        } else {
            Endianness::Little
        }
    }

    pub fn encode_i64(self, value: i64) -> [u8; 8] {
        match self {
            Endianness::Little => value.to_le_bytes(),
            Endianness::Big => value.to_be_bytes(),
        }
    }

    /// Returns `None` unless `bytes` is exactly eight bytes long.
    pub fn decode_i64(self, bytes: &[u8]) -> Option<i64> {
        let raw: [u8; 8] = bytes.try_into().ok()?;
        Some(match self {
            Endianness::Little => i64::from_le_bytes(raw),
            Endianness::Big => i64::from_be_bytes(raw),
        })
    }
}

/// A binary key/value record; the unit of storage and of disk transfer.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Encode, Decode)]
pub struct Pair {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Pair {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn with_i64_value(key: impl Into<Vec<u8>>, value: i64, endian: Endianness) -> Self {
        Self::new(key, endian.encode_i64(value))
    }

    pub fn with_i64_key(key: i64, value: impl Into<Vec<u8>>, endian: Endianness) -> Self {
        Self::new(endian.encode_i64(key), value)
    }

    pub fn value_as_i64(&self, endian: Endianness) -> Option<i64> {
        endian.decode_i64(&self.value)
    }

    pub fn key_as_i64(&self, endian: Endianness) -> Option<i64> {
        endian.decode_i64(&self.key)
    }

    /// Size of the encoded record on disk: two u64 length prefixes plus payload.
    pub fn encoded_len(&self) -> usize {
        16 + self.key.len() + self.value.len()
    }
}

/// One build-side value matched with one probe-side value sharing `key`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct JoinedPair {
    pub key: Vec<u8>,
    pub build: Vec<u8>,
    pub probe: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_i64_encoding_respects_byte_order() {
        assert_eq!(Endianness::Big.encode_i64(1), [0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(Endianness::Little.encode_i64(1), [1, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(Endianness::Big.decode_i64(&Endianness::Big.encode_i64(-42)), Some(-42));
    }

    #[test]
    fn test_decode_rejects_wrong_width() {
        assert_eq!(Endianness::Little.decode_i64(&[1, 2, 3]), None);
    }

    #[test]
    fn test_pair_value_helpers() {
        let pair = Pair::with_i64_value("a", 7, Endianness::Big);
        assert_eq!(pair.key, b"a".to_vec());
        assert_eq!(pair.value_as_i64(Endianness::Big), Some(7));
        assert_eq!(pair.encoded_len(), 16 + 1 + 8);
    }

    #[test]
    fn test_flag_mapping() {
        assert_eq!(Endianness::from_big_endian_flag(true), Endianness::Big);
        assert_eq!(Endianness::from_big_endian_flag(false), Endianness::Little);
    }
}
