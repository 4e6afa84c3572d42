//! Meta page: store identity and configuration.
//!
//! Page 0 carries a fixed header identifying the file format and the layout
//! the store was created with. Every open validates the header against the
//! requested configuration; any disagreement is a metadata mismatch and the
//! open fails outright, before any tree page is touched.
//!
//! ## Header layout (64 bytes at offset 0 of page 0)
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  --------------------------------
//! 0       16    magic
//! 16      4     format major version
//! 20      4     format minor version
//! 24      4     page size
//! 28      8     layout identifier
//! 36      4     layout major version
//! 40      4     layout minor version
//! 44      16    reserved
//! 60      4     CRC-32 over bytes 0..60
//! ```

use crc::{Crc, CRC_32_ISCSI};
use eyre::Result;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::TreeError;
use crate::layout::Layout;

pub const META_MAGIC: &[u8; 16] = b"gentree index\x00\x00\x00";
pub const FORMAT_MAJOR_VERSION: u32 = 1;
pub const FORMAT_MINOR_VERSION: u32 = 0;
pub const META_HEADER_SIZE: usize = 64;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct MetaHeader {
    magic: [u8; 16],
    format_major: U32,
    format_minor: U32,
    page_size: U32,
    layout_identifier: U64,
    layout_major: U32,
    layout_minor: U32,
    reserved: [u8; 16],
    checksum: U32,
}

const _: () = assert!(std::mem::size_of::<MetaHeader>() == META_HEADER_SIZE);

impl MetaHeader {
    pub fn new<L: Layout>(layout: &L, page_size: u32) -> Self {
        let mut header = Self {
            magic: *META_MAGIC,
            format_major: U32::new(FORMAT_MAJOR_VERSION),
            format_minor: U32::new(FORMAT_MINOR_VERSION),
            page_size: U32::new(page_size),
            layout_identifier: U64::new(layout.identifier()),
            layout_major: U32::new(layout.major_version()),
            layout_minor: U32::new(layout.minor_version()),
            reserved: [0u8; 16],
            checksum: U32::new(0),
        };
        header.checksum = U32::new(header.payload_crc());
        header
    }

    fn payload_crc(&self) -> u32 {
        CRC32.checksum(&self.as_bytes()[..META_HEADER_SIZE - 4])
    }

    pub fn write_to(&self, page: &mut [u8]) {
        page[..META_HEADER_SIZE].copy_from_slice(self.as_bytes());
    }

    /// Parses the header and verifies magic and checksum. A page that does
    /// not even carry the magic is reported as a mismatch too: it means the
    /// file is not one of ours.
    pub fn read_from(page: &[u8]) -> Result<Self> {
        let header = Self::read_from_bytes(&page[..META_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse meta header: {:?}", e))?;

        if &header.magic != META_MAGIC {
            return Err(TreeError::metadata_mismatch("bad magic in meta page").into());
        }
        if header.checksum.get() != header.payload_crc() {
            return Err(TreeError::metadata_mismatch("meta page checksum mismatch").into());
        }
        Ok(header)
    }

    /// Compares stored identity against the requested configuration.
    pub fn validate<L: Layout>(&self, layout: &L, page_size: u32) -> Result<()> {
        let mismatch = |msg: String| -> Result<()> { Err(TreeError::MetadataMismatch(msg).into()) };

        if self.format_major.get() != FORMAT_MAJOR_VERSION
            || self.format_minor.get() != FORMAT_MINOR_VERSION
        {
            return mismatch(format!(
                "format version {}.{} on disk, {}.{} supported",
                self.format_major.get(),
                self.format_minor.get(),
                FORMAT_MAJOR_VERSION,
                FORMAT_MINOR_VERSION
            ));
        }
        if self.page_size.get() != page_size {
            return mismatch(format!(
                "page size {} on disk, {} requested",
                self.page_size.get(),
                page_size
            ));
        }
        if self.layout_identifier.get() != layout.identifier() {
            return mismatch(format!(
                "layout identifier {} on disk, {} requested",
                self.layout_identifier.get(),
                layout.identifier()
            ));
        }
        if self.layout_major.get() != layout.major_version()
            || self.layout_minor.get() != layout.minor_version()
        {
            return mismatch(format!(
                "layout version {}.{} on disk, {}.{} requested",
                self.layout_major.get(),
                self.layout_minor.get(),
                layout.major_version(),
                layout.minor_version()
            ));
        }
        Ok(())
    }

    pub fn page_size(&self) -> u32 {
        self.page_size.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::U64Layout;

    #[test]
    fn meta_header_size_is_64() {
        assert_eq!(std::mem::size_of::<MetaHeader>(), 64);
    }

    #[test]
    fn round_trip_and_validate() {
        let layout = U64Layout::new(7);
        let mut page = vec![0u8; 256];

        MetaHeader::new(&layout, 256).write_to(&mut page);
        let header = MetaHeader::read_from(&page).unwrap();

        header.validate(&layout, 256).unwrap();
        assert_eq!(header.page_size(), 256);
    }

    #[test]
    fn rejects_bad_magic() {
        let page = vec![0u8; 256];
        let err = MetaHeader::read_from(&page).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TreeError>(),
            Some(TreeError::MetadataMismatch(_))
        ));
    }

    #[test]
    fn rejects_corrupted_header() {
        let layout = U64Layout::new(7);
        let mut page = vec![0u8; 256];
        MetaHeader::new(&layout, 256).write_to(&mut page);
        page[24] ^= 0x01;

        assert!(MetaHeader::read_from(&page).is_err());
    }

    #[test]
    fn different_layout_identifier_is_a_mismatch() {
        let mut page = vec![0u8; 256];
        MetaHeader::new(&U64Layout::new(7), 256).write_to(&mut page);

        let header = MetaHeader::read_from(&page).unwrap();
        let err = header.validate(&U64Layout::new(9), 256).unwrap_err();
        assert!(err.to_string().contains("layout identifier"));
    }

    #[test]
    fn different_page_size_is_a_mismatch() {
        let layout = U64Layout::new(7);
        let mut page = vec![0u8; 512];
        MetaHeader::new(&layout, 512).write_to(&mut page);

        let header = MetaHeader::read_from(&page).unwrap();
        let err = header.validate(&layout, 256).unwrap_err();
        assert!(err.to_string().contains("page size"));
    }
}
