//! Key/value layout contract.
//!
//! The tree itself never interprets key or value bytes. Ordering, sizing and
//! (de)serialization all come from a [`Layout`] implementation supplied at
//! open time, the same way the storage layer stays behind a trait so tests
//! can swap implementations.
//!
//! Keys and values are fixed-size per layout. The layout also carries an
//! identity (identifier plus major/minor version) which is stamped into the
//! meta page on creation and verified on every subsequent open; opening a
//! store with a layout it was not created with is a metadata mismatch, not a
//! silent reinterpretation of bytes.

use std::fmt::Debug;

pub trait Layout: Send + Sync + 'static {
    type Key: Ord + Clone + Debug + Send + Sync;
    type Value: Clone + PartialEq + Debug + Send + Sync;

    /// Identity of this layout, persisted in the meta page.
    fn identifier(&self) -> u64;
    fn major_version(&self) -> u32;
    fn minor_version(&self) -> u32;

    /// Encoded size of every key, in bytes.
    fn key_size(&self) -> usize;
    /// Encoded size of every value, in bytes.
    fn value_size(&self) -> usize;

    fn write_key(&self, buf: &mut [u8], key: &Self::Key);
    fn read_key(&self, buf: &[u8]) -> Self::Key;
    fn write_value(&self, buf: &mut [u8], value: &Self::Value);
    fn read_value(&self, buf: &[u8]) -> Self::Value;
}

/// `u64` keys mapped to `u64` values, little-endian. The layout used
/// throughout the test suites; the configurable identifier doubles as the
/// fixture for metadata-mismatch checks.
#[derive(Debug, Clone)]
pub struct U64Layout {
    identifier: u64,
}

impl U64Layout {
    pub fn new(identifier: u64) -> Self {
        Self { identifier }
    }
}

impl Default for U64Layout {
    fn default() -> Self {
        Self::new(0x6b76_7536_34_u64)
    }
}

impl Layout for U64Layout {
    type Key = u64;
    type Value = u64;

    fn identifier(&self) -> u64 {
        self.identifier
    }

    fn major_version(&self) -> u32 {
        1
    }

    fn minor_version(&self) -> u32 {
        0
    }

    fn key_size(&self) -> usize {
        8
    }

    fn value_size(&self) -> usize {
        8
    }

    fn write_key(&self, buf: &mut [u8], key: &u64) {
        buf[..8].copy_from_slice(&key.to_le_bytes());
    }

    fn read_key(&self, buf: &[u8]) -> u64 {
        u64::from_le_bytes(buf[..8].try_into().unwrap())
    }

    fn write_value(&self, buf: &mut [u8], value: &u64) {
        buf[..8].copy_from_slice(&value.to_le_bytes());
    }

    fn read_value(&self, buf: &[u8]) -> u64 {
        u64::from_le_bytes(buf[..8].try_into().unwrap())
    }
}
