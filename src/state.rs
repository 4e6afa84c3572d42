//! Durable tree state on alternating pages.
//!
//! The root pointer, the generation counters and the free-list heads live
//! together in a small checksummed record. Two reserved pages (ids 1 and 2)
//! hold copies of it, written alternately: a checkpoint always overwrites
//! the *older* (or invalid) page, so the newest durable state survives a
//! crash mid-write of the other page. On open the newest valid page wins;
//! both pages failing their checksum means the store cannot be opened.
//!
//! ## Record layout (72 bytes at offset 0 of the state page)
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  ----------------------------
//! 0       8     stable generation
//! 8       8     unstable generation
//! 16      8     root page id
//! 24      8     root generation
//! 32      8     last allocated page id
//! 40      8     free-list write page id
//! 48      8     free-list read page id
//! 56      4     free-list write position
//! 60      4     free-list read position
//! 64      4     CRC-32 over bytes 0..64
//! 68      4     reserved
//! ```

use crc::{Crc, CRC_32_ISCSI};
use eyre::Result;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::TreeError;
use crate::generation::GenerationPair;

/// Reserved page ids for the two state copies.
pub const STATE_PAGE_A: u64 = 1;
pub const STATE_PAGE_B: u64 = 2;

pub const STATE_RECORD_SIZE: usize = 72;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// The in-memory shape of one state record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeState {
    pub generation: GenerationPair,
    pub root_id: u64,
    pub root_generation: u64,
    pub last_id: u64,
    pub freelist_write_page: u64,
    pub freelist_read_page: u64,
    pub freelist_write_pos: u32,
    pub freelist_read_pos: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct StateRecord {
    stable_generation: U64,
    unstable_generation: U64,
    root_id: U64,
    root_generation: U64,
    last_id: U64,
    freelist_write_page: U64,
    freelist_read_page: U64,
    freelist_write_pos: U32,
    freelist_read_pos: U32,
    checksum: U32,
    reserved: [u8; 4],
}

const _: () = assert!(std::mem::size_of::<StateRecord>() == STATE_RECORD_SIZE);

impl TreeState {
    pub fn write_to(&self, page: &mut [u8]) {
        let mut record = StateRecord {
            stable_generation: U64::new(self.generation.stable),
            unstable_generation: U64::new(self.generation.unstable),
            root_id: U64::new(self.root_id),
            root_generation: U64::new(self.root_generation),
            last_id: U64::new(self.last_id),
            freelist_write_page: U64::new(self.freelist_write_page),
            freelist_read_page: U64::new(self.freelist_read_page),
            freelist_write_pos: U32::new(self.freelist_write_pos),
            freelist_read_pos: U32::new(self.freelist_read_pos),
            checksum: U32::new(0),
            reserved: [0u8; 4],
        };
        record.checksum = U32::new(CRC32.checksum(&record.as_bytes()[..64]));
        page[..STATE_RECORD_SIZE].copy_from_slice(record.as_bytes());
    }

    /// Parses and verifies one state page. `None` means the page does not
    /// hold a valid record (empty, torn or corrupted), recoverable as long
    /// as the sibling page is valid.
    pub fn read_from(page: &[u8]) -> Option<TreeState> {
        let record = StateRecord::read_from_bytes(&page[..STATE_RECORD_SIZE]).ok()?;
        if record.checksum.get() != CRC32.checksum(&record.as_bytes()[..64]) {
            return None;
        }
        let generation =
            GenerationPair::new(record.stable_generation.get(), record.unstable_generation.get())
                .ok()?;
        Some(TreeState {
            generation,
            root_id: record.root_id.get(),
            root_generation: record.root_generation.get(),
            last_id: record.last_id.get(),
            freelist_write_page: record.freelist_write_page.get(),
            freelist_read_page: record.freelist_read_page.get(),
            freelist_write_pos: record.freelist_write_pos.get(),
            freelist_read_pos: record.freelist_read_pos.get(),
        })
    }
}

/// Which of the two state pages a selection refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatePage {
    A,
    B,
}

impl StatePage {
    pub fn page_id(self) -> u64 {
        match self {
            StatePage::A => STATE_PAGE_A,
            StatePage::B => STATE_PAGE_B,
        }
    }
}

/// Picks the state to resume from: the valid page with the higher unstable
/// generation. Both pages invalid is fatal; two valid pages at the same
/// generation cannot be produced by the write protocol and signal
/// corruption.
pub fn select_newest_valid(
    a: Option<TreeState>,
    b: Option<TreeState>,
) -> Result<(TreeState, StatePage)> {
    match (a, b) {
        (Some(a), Some(b)) => {
            if a.generation.unstable == b.generation.unstable {
                Err(TreeError::inconsistency(format!(
                    "both tree state pages valid at the same generation {}",
                    a.generation.unstable
                ))
                .into())
            } else if a.generation.unstable > b.generation.unstable {
                Ok((a, StatePage::A))
            } else {
                Ok((b, StatePage::B))
            }
        }
        (Some(a), None) => Ok((a, StatePage::A)),
        (None, Some(b)) => Ok((b, StatePage::B)),
        (None, None) => Err(TreeError::inconsistency(
            "neither tree state page passes its checksum; store cannot be opened",
        )
        .into()),
    }
}

/// Picks the page the next state write should overwrite: an invalid page if
/// there is one, else the older of the two.
pub fn select_oldest_or_invalid(a: Option<TreeState>, b: Option<TreeState>) -> Result<StatePage> {
    match (a, b) {
        (None, _) => Ok(StatePage::A),
        (Some(_), None) => Ok(StatePage::B),
        (Some(a), Some(b)) => {
            if a.generation.unstable == b.generation.unstable {
                Err(TreeError::inconsistency(format!(
                    "both tree state pages valid at the same generation {}",
                    a.generation.unstable
                ))
                .into())
            } else if a.generation.unstable < b.generation.unstable {
                Ok(StatePage::A)
            } else {
                Ok(StatePage::B)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(stable: u64) -> TreeState {
        TreeState {
            generation: GenerationPair::new(stable, stable + 1).unwrap(),
            root_id: 4,
            root_generation: stable + 1,
            last_id: 10,
            freelist_write_page: 3,
            freelist_read_page: 3,
            freelist_write_pos: 2,
            freelist_read_pos: 1,
        }
    }

    #[test]
    fn state_record_size_is_72() {
        assert_eq!(std::mem::size_of::<StateRecord>(), STATE_RECORD_SIZE);
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut page = vec![0u8; 256];
        let original = state(5);
        original.write_to(&mut page);

        assert_eq!(TreeState::read_from(&page), Some(original));
    }

    #[test]
    fn corrupted_record_reads_as_invalid() {
        let mut page = vec![0u8; 256];
        state(5).write_to(&mut page);
        page[17] ^= 0x80;

        assert_eq!(TreeState::read_from(&page), None);
    }

    #[test]
    fn zeroed_page_reads_as_invalid() {
        let page = vec![0u8; 256];
        assert_eq!(TreeState::read_from(&page), None);
    }

    #[test]
    fn newest_valid_prefers_higher_generation() {
        let (picked, page) = select_newest_valid(Some(state(3)), Some(state(7))).unwrap();
        assert_eq!(picked.generation.stable, 7);
        assert_eq!(page, StatePage::B);

        let (picked, page) = select_newest_valid(Some(state(9)), Some(state(7))).unwrap();
        assert_eq!(picked.generation.stable, 9);
        assert_eq!(page, StatePage::A);
    }

    #[test]
    fn newest_valid_falls_back_to_single_valid_page() {
        let (picked, page) = select_newest_valid(None, Some(state(2))).unwrap();
        assert_eq!(picked.generation.stable, 2);
        assert_eq!(page, StatePage::B);
    }

    #[test]
    fn newest_valid_with_no_valid_page_is_fatal() {
        assert!(select_newest_valid(None, None).is_err());
    }

    #[test]
    fn oldest_prefers_invalid_page() {
        assert_eq!(select_oldest_or_invalid(None, Some(state(3))).unwrap(), StatePage::A);
        assert_eq!(select_oldest_or_invalid(Some(state(3)), None).unwrap(), StatePage::B);
        assert_eq!(select_oldest_or_invalid(None, None).unwrap(), StatePage::A);
    }

    #[test]
    fn oldest_picks_lower_generation_of_two_valid() {
        assert_eq!(
            select_oldest_or_invalid(Some(state(3)), Some(state(7))).unwrap(),
            StatePage::A
        );
        assert_eq!(
            select_oldest_or_invalid(Some(state(9)), Some(state(7))).unwrap(),
            StatePage::B
        );
    }

    #[test]
    fn equal_generation_tie_is_fatal() {
        assert!(select_oldest_or_invalid(Some(state(5)), Some(state(5))).is_err());
        assert!(select_newest_valid(Some(state(5)), Some(state(5))).is_err());
    }
}
