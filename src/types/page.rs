//! On-disk page layout: header and trailer offsets, tablespace flags and
//! the helpers that interpret them.
//!
//! Every page starts with a 38-byte file header and ends with an 8-byte
//! trailer. Multi-byte fields are big-endian.

use bitflags::bitflags;

use super::{Lsn, PageId};

/// Checksum (or, in full_crc32 format, the encryption key version).
pub const SPACE_OR_CHECKSUM: usize = 0;
/// Page number stored inside the page.
pub const PAGE_NO: usize = 4;
/// Previous page in the same index level.
pub const PREV: usize = 8;
/// Next page in the same index level.
pub const NEXT: usize = 12;
/// LSN of the newest modification written to this page (8 bytes).
pub const LSN: usize = 16;
/// Page type (2 bytes).
pub const PAGE_TYPE: usize = 24;
/// Flush LSN on the first page of the system space, key version elsewhere.
pub const FLUSH_LSN_OR_KEY_VERSION: usize = 26;
/// Post-encryption checksum for non-full_crc32 encrypted pages.
pub const ENCRYPTION_CHECKSUM: usize = FLUSH_LSN_OR_KEY_VERSION + 4;
/// Space id stored inside the page.
pub const SPACE_ID: usize = 34;
/// Start of the page body.
pub const DATA: usize = 38;
/// Length of the trailer: old-style checksum plus low 32 bits of the LSN.
pub const TRAILER_LEN: usize = 8;

/// Key version field in full_crc32 format.
pub const FCRC32_KEY_VERSION: usize = 0;
/// Distance from the end of a full_crc32 page to the low 32 LSN bits.
pub const FCRC32_END_LSN: usize = 8;
/// Distance from the end of a full_crc32 page to the CRC-32.
pub const FCRC32_CHECKSUM: usize = 4;
/// Type-field bit marking a full_crc32 page as compressed; the remaining
/// bits hold the physical length divided by 256.
pub const COMPRESS_FCRC32_MARKER: u16 = 1 << 15;

/// Page type of a freshly allocated page.
pub const TYPE_ALLOCATED: u16 = 0;
/// Page-compressed page in the non-full_crc32 format.
pub const TYPE_PAGE_COMPRESSED: u16 = 34354;
/// Page-compressed and encrypted page in the non-full_crc32 format.
pub const TYPE_PAGE_COMPRESSED_ENCRYPTED: u16 = 37401;

/// Magic stored in both checksum fields when checksums are disabled.
pub const NO_CHECKSUM_MAGIC: u32 = 0xDEAD_BEEF;

/// Smallest compressed page size.
pub const ZIP_SIZE_MIN: usize = 1024;
/// Smallest supported uncompressed page size.
pub const PAGE_SIZE_MIN: usize = 4096;
/// Largest supported uncompressed page size.
pub const PAGE_SIZE_MAX: usize = 65536;

bitflags! {
    /// Per-tablespace format flags.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Default)]
    pub struct SpaceFlags: u32 {
        /// Full CRC-32 checksum format.
        const FULL_CRC32 = 1 << 0;
        /// Pages are stored with page compression.
        const PAGE_COMPRESSED = 1 << 1;
        /// Pages are encrypted.
        const ENCRYPTED = 1 << 2;
    }
}

/// Metadata the cache needs to interpret pages of one tablespace.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SpaceInfo {
    /// Tablespace id.
    pub id: u32,
    /// Uncompressed (logical) page size.
    pub page_size: usize,
    /// Compressed page size for ROW_FORMAT=COMPRESSED spaces, 0 otherwise.
    pub zip_size: usize,
    /// Format flags.
    pub flags: SpaceFlags,
}

impl SpaceInfo {
    /// Plain uncompressed tablespace.
    pub fn new(id: u32, page_size: usize) -> Self {
        Self {
            id,
            page_size,
            zip_size: 0,
            flags: SpaceFlags::empty(),
        }
    }

    /// Same space with the given flags.
    pub fn with_flags(mut self, flags: SpaceFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Same space stored as compressed pages of `zip_size` bytes.
    pub fn with_zip_size(mut self, zip_size: usize) -> Self {
        self.zip_size = zip_size;
        self
    }

    /// Number of bytes one page occupies in the file.
    pub fn physical_size(&self) -> usize {
        if self.zip_size > 0 {
            self.zip_size
        } else {
            self.page_size
        }
    }

    /// True for the full_crc32 format.
    pub fn is_full_crc32(&self) -> bool {
        self.flags.contains(SpaceFlags::FULL_CRC32)
    }

    /// True when pages live compressed on disk and in the buddy allocator.
    pub fn is_zip(&self) -> bool {
        self.zip_size > 0
    }
}

pub(crate) fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

pub(crate) fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

pub(crate) fn read_u64(buf: &[u8], off: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[off..off + 8]);
    u64::from_be_bytes(bytes)
}

pub(crate) fn write_u16(buf: &mut [u8], off: usize, value: u16) {
    buf[off..off + 2].copy_from_slice(&value.to_be_bytes());
}

pub(crate) fn write_u32(buf: &mut [u8], off: usize, value: u32) {
    buf[off..off + 4].copy_from_slice(&value.to_be_bytes());
}

pub(crate) fn write_u64(buf: &mut [u8], off: usize, value: u64) {
    buf[off..off + 8].copy_from_slice(&value.to_be_bytes());
}

/// Page number recorded in the header.
pub fn page_no(buf: &[u8]) -> u32 {
    read_u32(buf, PAGE_NO)
}

/// Space id recorded in the header.
pub fn space_id(buf: &[u8]) -> u32 {
    read_u32(buf, SPACE_ID)
}

/// Page type recorded in the header.
pub fn page_type(buf: &[u8]) -> u16 {
    read_u16(buf, PAGE_TYPE)
}

/// Newest LSN recorded in the header.
pub fn page_lsn(buf: &[u8]) -> Lsn {
    Lsn(read_u64(buf, LSN))
}

/// True if every byte of the page is zero. Such pages were never written
/// and are valid.
pub fn is_zeroes(buf: &[u8]) -> bool {
    buf.iter().all(|&b| b == 0)
}

/// Writes the identity fields of a freshly created page.
pub fn init_header(buf: &mut [u8], id: PageId) {
    write_u32(buf, PAGE_NO, id.page_no);
    write_u32(buf, SPACE_ID, id.space);
    write_u16(buf, PAGE_TYPE, TYPE_ALLOCATED);
}

/// Key version of an encrypted page, 0 when the page is not encrypted.
pub fn key_version(buf: &[u8], flags: SpaceFlags) -> u32 {
    if flags.contains(SpaceFlags::FULL_CRC32) {
        read_u32(buf, FCRC32_KEY_VERSION)
    } else {
        read_u32(buf, FLUSH_LSN_OR_KEY_VERSION)
    }
}

/// Stores the key version at the format-specific offset.
pub fn set_key_version(buf: &mut [u8], flags: SpaceFlags, version: u32) {
    if flags.contains(SpaceFlags::FULL_CRC32) {
        write_u32(buf, FCRC32_KEY_VERSION, version);
    } else {
        write_u32(buf, FLUSH_LSN_OR_KEY_VERSION, version);
    }
}

/// Whether the page body is stored page-compressed.
pub fn is_page_compressed(buf: &[u8], flags: SpaceFlags) -> bool {
    let ty = page_type(buf);
    if flags.contains(SpaceFlags::FULL_CRC32) {
        ty & COMPRESS_FCRC32_MARKER != 0
    } else {
        ty == TYPE_PAGE_COMPRESSED || ty == TYPE_PAGE_COMPRESSED_ENCRYPTED
    }
}

/// Physical size of a full_crc32 page.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FullCrc32Size {
    /// Number of bytes covered by the checksum.
    pub size: usize,
    /// The page carries the compression marker with a valid length.
    pub compressed: bool,
    /// The compression marker carries a length that does not fit the page.
    pub corrupted: bool,
}

/// Decodes the compressed length carried in the type field of a
/// full_crc32 page.
pub fn full_crc32_size(buf: &[u8], page_size: usize) -> FullCrc32Size {
    let ty = page_type(buf);
    if ty & COMPRESS_FCRC32_MARKER == 0 {
        return FullCrc32Size {
            size: page_size,
            compressed: false,
            corrupted: false,
        };
    }
    let len = usize::from(ty & !COMPRESS_FCRC32_MARKER) << 8;
    if len < page_size {
        FullCrc32Size {
            size: len,
            compressed: true,
            corrupted: false,
        }
    } else {
        FullCrc32Size {
            size: page_size,
            compressed: false,
            corrupted: true,
        }
    }
}

/// Encodes a compressed physical length into a full_crc32 type field.
/// `len` must be a multiple of 256.
pub fn full_crc32_compressed_type(len: usize) -> u16 {
    debug_assert_eq!(len % 256, 0);
    COMPRESS_FCRC32_MARKER | (len >> 8) as u16
}
