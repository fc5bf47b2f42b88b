//! Key decomposition.
//!
//! The trie branches on one *key unit* per level. Integer keys are split into
//! 4-bit nibbles, most significant first, so a `u64` key spans 16 units and
//! never needs more than a Node16. Byte-string keys use whole bytes.
//!
//! Both decompositions preserve order: comparing unit sequences
//! lexicographically gives the same result as comparing the keys.

use std::fmt::Debug;

/// Largest number of units a key may span. Node depths are single bytes.
pub const MAX_KEY_UNITS: usize = u8::MAX as usize;

/// How a stored key (always a byte string in its leaf) is split into units.
pub trait KeyUnits: Send + Sync + 'static {
    /// Width of one unit in bits, recorded in the pool header.
    const BITS: u8;

    fn unit_count(key: &[u8]) -> usize;

    /// Unit `i` of `key`. `i` must be below `unit_count(key)`.
    fn unit(key: &[u8], i: usize) -> u8;
}

/// 4-bit units, high nibble of each byte first.
#[derive(Debug, Clone, Copy)]
pub struct Nibbles;

impl KeyUnits for Nibbles {
    const BITS: u8 = 4;

    #[inline]
    fn unit_count(key: &[u8]) -> usize {
        key.len() * 2
    }

    #[inline]
    fn unit(key: &[u8], i: usize) -> u8 {
        let b = key[i / 2];
        if i % 2 == 0 {
            b >> 4
        } else {
            b & 0x0F
        }
    }
}

/// 8-bit units.
#[derive(Debug, Clone, Copy)]
pub struct Bytes;

impl KeyUnits for Bytes {
    const BITS: u8 = 8;

    #[inline]
    fn unit_count(key: &[u8]) -> usize {
        key.len()
    }

    #[inline]
    fn unit(key: &[u8], i: usize) -> u8 {
        key[i]
    }
}

/// A key type the index accepts.
pub trait IndexKey {
    /// Decomposition used for this key type.
    type Units: KeyUnits;

    /// Stored byte form. Must order the same way as the key.
    type Encoded<'a>: AsRef<[u8]>
    where
        Self: 'a;

    /// Owned key handed back by scans.
    type Owned: Debug + Clone + Ord;

    fn encode(&self) -> Self::Encoded<'_>;

    fn decode(bytes: &[u8]) -> Self::Owned;
}

impl IndexKey for u64 {
    type Units = Nibbles;
    type Encoded<'a> = [u8; 8];
    type Owned = u64;

    #[inline]
    fn encode(&self) -> [u8; 8] {
        self.to_be_bytes()
    }

    #[inline]
    fn decode(bytes: &[u8]) -> u64 {
        let mut buf = [0u8; 8];
        let n = bytes.len().min(8);
        buf[..n].copy_from_slice(&bytes[..n]);
        u64::from_be_bytes(buf)
    }
}

impl IndexKey for [u8] {
    type Units = Bytes;
    type Encoded<'a> = &'a [u8];
    type Owned = Vec<u8>;

    #[inline]
    fn encode(&self) -> &[u8] {
        self
    }

    #[inline]
    fn decode(bytes: &[u8]) -> Vec<u8> {
        bytes.to_vec()
    }
}
