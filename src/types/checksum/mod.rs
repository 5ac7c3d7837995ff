#![forbid(unsafe_code)]

//! Page checksums.
//!
//! Three stamping variants coexist in the non-full_crc32 format and are
//! told apart by the two checksum fields (header offset 0 and the first
//! half of the trailer). Validation accepts any of them.

use serde::{Deserialize, Serialize};

use super::page::{
    self, read_u32, read_u64, write_u32, write_u64, SpaceFlags, DATA, FCRC32_CHECKSUM,
    FCRC32_END_LSN, FLUSH_LSN_OR_KEY_VERSION, LSN, NO_CHECKSUM_MAGIC, PAGE_NO, PAGE_TYPE,
    SPACE_OR_CHECKSUM, TRAILER_LEN,
};
use super::Lsn;

/// Checksum flavour written into pages.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumAlgorithm {
    /// CRC-32 over header and body, stored in both fields.
    Crc32,
    /// Legacy fold checksum: new value in the header, old in the trailer.
    Innodb,
    /// Both fields hold a fixed magic.
    None,
    /// Single CRC-32 over the whole page, stored in the last four bytes.
    FullCrc32,
}

const HASH_RANDOM_MASK: u32 = 1_463_735_687;
const HASH_RANDOM_MASK2: u32 = 1_653_893_711;

fn fold_pair(n1: u32, n2: u32) -> u32 {
    ((((n1 ^ n2 ^ HASH_RANDOM_MASK2) << 8).wrapping_add(n1)) ^ HASH_RANDOM_MASK).wrapping_add(n2)
}

fn fold_binary(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(0u32, |acc, &b| fold_pair(acc, u32::from(b)))
}

/// CRC-32 variant: CRC of header bytes [4, 26) XOR CRC of the body
/// [38, size - 8).
pub fn crc32_checksum(page: &[u8]) -> u32 {
    let size = page.len();
    crc32fast::hash(&page[PAGE_NO..FLUSH_LSN_OR_KEY_VERSION])
        ^ crc32fast::hash(&page[DATA..size - TRAILER_LEN])
}

/// Legacy checksum stored in the header field.
pub fn innodb_new_checksum(page: &[u8]) -> u32 {
    let size = page.len();
    fold_binary(&page[PAGE_NO..FLUSH_LSN_OR_KEY_VERSION])
        .wrapping_add(fold_binary(&page[DATA..size - TRAILER_LEN]))
}

/// Legacy checksum stored in the trailer field; covers the header
/// including the already-written new checksum.
pub fn innodb_old_checksum(page: &[u8]) -> u32 {
    fold_binary(&page[..FLUSH_LSN_OR_KEY_VERSION])
}

/// full_crc32: CRC-32 over the first `size - 4` bytes.
pub fn full_crc32_checksum(page: &[u8], size: usize) -> u32 {
    crc32fast::hash(&page[..size - FCRC32_CHECKSUM])
}

/// Checksum of a compressed page image: the CRCs of [4, 16), the page
/// type and the data area, XORed.
pub fn zip_checksum(zip: &[u8]) -> u32 {
    crc32fast::hash(&zip[PAGE_NO..LSN])
        ^ crc32fast::hash(&zip[PAGE_TYPE..PAGE_TYPE + 2])
        ^ crc32fast::hash(&zip[DATA..])
}

fn field1(page: &[u8]) -> u32 {
    read_u32(page, SPACE_OR_CHECKSUM)
}

fn field2(page: &[u8]) -> u32 {
    read_u32(page, page.len() - TRAILER_LEN)
}

fn crc32_valid(page: &[u8]) -> bool {
    let (f1, f2) = (field1(page), field2(page));
    f1 == f2 && f1 == crc32_checksum(page)
}

fn innodb_valid(page: &[u8]) -> bool {
    let (f1, f2) = (field1(page), field2(page));
    if f2 != read_u32(page, LSN) && f2 != innodb_old_checksum(page) {
        return false;
    }
    f1 == 0 || f1 == innodb_new_checksum(page)
}

fn none_valid(page: &[u8]) -> bool {
    field1(page) == NO_CHECKSUM_MAGIC && field2(page) == NO_CHECKSUM_MAGIC
}

/// Identifies which non-full_crc32 variant validates the page, if any.
pub fn detect(page: &[u8]) -> Option<ChecksumAlgorithm> {
    if crc32_valid(page) {
        Some(ChecksumAlgorithm::Crc32)
    } else if none_valid(page) {
        Some(ChecksumAlgorithm::None)
    } else if innodb_valid(page) {
        Some(ChecksumAlgorithm::Innodb)
    } else {
        None
    }
}

/// Validates an uncompressed page image as read from disk (before
/// decryption or decompression).
pub fn is_corrupted(page: &[u8], flags: SpaceFlags) -> bool {
    if flags.contains(SpaceFlags::FULL_CRC32) {
        return is_corrupted_full_crc32(page, flags);
    }
    let size = page.len();
    if read_u32(page, LSN + 4) != read_u32(page, size - TRAILER_LEN + 4) {
        return !page::is_zeroes(page);
    }
    if field1(page) == 0 && field2(page) == 0 && read_u64(page, LSN) == 0 {
        return !page::is_zeroes(page);
    }
    detect(page).is_none()
}

fn is_corrupted_full_crc32(page: &[u8], flags: SpaceFlags) -> bool {
    let size = page::full_crc32_size(page, page.len());
    if size.corrupted {
        return true;
    }
    let stored = read_u32(page, size.size - FCRC32_CHECKSUM);
    if stored == 0 && page::is_zeroes(&page[..size.size]) {
        return false;
    }
    if stored != full_crc32_checksum(page, size.size) {
        return true;
    }
    if !size.compressed && page::key_version(page, flags) == 0 {
        return read_u32(page, LSN + 4) != read_u32(page, size.size - FCRC32_END_LSN);
    }
    false
}

/// Validates a compressed page image.
pub fn is_zip_corrupted(zip: &[u8]) -> bool {
    let stored = read_u32(zip, SPACE_OR_CHECKSUM);
    if stored == 0 && page::is_zeroes(zip) {
        return false;
    }
    stored != zip_checksum(zip)
}

/// Stamps LSN fields and checksums on an outgoing uncompressed page.
pub fn stamp_page(page: &mut [u8], algorithm: ChecksumAlgorithm, lsn: Lsn) {
    let size = page.len();
    write_u64(page, LSN, lsn.0);
    match algorithm {
        ChecksumAlgorithm::FullCrc32 => {
            write_u32(page, size - FCRC32_END_LSN, lsn.0 as u32);
            restamp_full_crc32(page, size);
        }
        ChecksumAlgorithm::Crc32 => {
            write_u32(page, size - TRAILER_LEN + 4, lsn.0 as u32);
            let crc = crc32_checksum(page);
            write_u32(page, SPACE_OR_CHECKSUM, crc);
            write_u32(page, size - TRAILER_LEN, crc);
        }
        ChecksumAlgorithm::Innodb => {
            write_u32(page, size - TRAILER_LEN + 4, lsn.0 as u32);
            let new = innodb_new_checksum(page);
            write_u32(page, SPACE_OR_CHECKSUM, new);
            let old = innodb_old_checksum(page);
            write_u32(page, size - TRAILER_LEN, old);
        }
        ChecksumAlgorithm::None => {
            write_u32(page, size - TRAILER_LEN + 4, lsn.0 as u32);
            write_u32(page, SPACE_OR_CHECKSUM, NO_CHECKSUM_MAGIC);
            write_u32(page, size - TRAILER_LEN, NO_CHECKSUM_MAGIC);
        }
    }
}

/// Recomputes the trailing CRC-32 of a full_crc32 image of `size` bytes
/// (used after encryption or compression rewrote the page).
pub fn restamp_full_crc32(page: &mut [u8], size: usize) {
    let crc = full_crc32_checksum(page, size);
    write_u32(page, size - FCRC32_CHECKSUM, crc);
}

/// Stamps LSN and checksum on an outgoing compressed page image.
pub fn stamp_zip(zip: &mut [u8], lsn: Lsn) {
    write_u64(zip, LSN, lsn.0);
    let crc = zip_checksum(zip);
    write_u32(zip, SPACE_OR_CHECKSUM, crc);
}

/// Post-encryption checksum of a non-full_crc32 page.
pub fn encryption_checksum(page: &[u8]) -> u32 {
    crc32_checksum(page)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::page::{ENCRYPTION_CHECKSUM, PAGE_SIZE_MIN};
    use proptest::prelude::*;

    fn sample_page(size: usize) -> Vec<u8> {
        let mut page: Vec<u8> = (0..size).map(|i| (i * 31 % 251) as u8).collect();
        page::init_header(&mut page, crate::types::PageId::new(4, 17));
        page
    }

    #[test]
    fn crc32_xors_header_and_body_crcs() {
        let page = sample_page(16384);
        let expected = crc32fast::hash(&page[4..26]) ^ crc32fast::hash(&page[38..16384 - 8]);
        assert_eq!(crc32_checksum(&page), expected);
        assert_ne!(
            crc32_checksum(&page),
            crc32fast::hash(&[&page[4..26], &page[38..16384 - 8]].concat())
        );
    }

    #[test]
    fn zip_checksum_xors_three_ranges() {
        let zip = sample_page(2048);
        let expected = crc32fast::hash(&zip[4..16])
            ^ crc32fast::hash(&zip[24..26])
            ^ crc32fast::hash(&zip[38..]);
        assert_eq!(zip_checksum(&zip), expected);
    }

    #[test]
    fn crc32_reference_value() {
        assert_eq!(crc32fast::hash(b"123456789"), 0xCBF4_3926);
        let mut page = vec![0u8; 4096];
        page[4..26].copy_from_slice(&[0xAB; 22]);
        let header_only = crc32fast::hash(&[0xAB; 22]) ^ crc32fast::hash(&vec![0u8; 4096 - 46]);
        assert_eq!(crc32_checksum(&page), header_only);
    }

    #[test]
    fn fold_pair_matches_reference_values() {
        assert_eq!(fold_pair(0, 0), ((HASH_RANDOM_MASK2 << 8) ^ HASH_RANDOM_MASK));
        assert_eq!(fold_binary(&[]), 0);
        assert_eq!(fold_binary(&[7]), fold_pair(0, 7));
    }

    #[test]
    fn each_variant_validates_and_is_detected() {
        for algo in [
            ChecksumAlgorithm::Crc32,
            ChecksumAlgorithm::Innodb,
            ChecksumAlgorithm::None,
        ] {
            let mut page = sample_page(PAGE_SIZE_MIN);
            stamp_page(&mut page, algo, Lsn(0x1_0000_0042));
            assert!(!is_corrupted(&page, SpaceFlags::empty()), "{algo:?}");
            assert_eq!(detect(&page), Some(algo));
        }
    }

    #[test]
    fn full_crc32_stamp_validates() {
        let mut page = sample_page(PAGE_SIZE_MIN);
        stamp_page(&mut page, ChecksumAlgorithm::FullCrc32, Lsn(99));
        assert!(!is_corrupted(&page, SpaceFlags::FULL_CRC32));
        page[100] ^= 1;
        assert!(is_corrupted(&page, SpaceFlags::FULL_CRC32));
    }

    #[test]
    fn lsn_trailer_mismatch_is_corruption() {
        let mut page = sample_page(PAGE_SIZE_MIN);
        stamp_page(&mut page, ChecksumAlgorithm::Crc32, Lsn(5));
        write_u32(&mut page, LSN + 4, 6);
        assert!(is_corrupted(&page, SpaceFlags::empty()));
    }

    #[test]
    fn zero_pages_are_valid() {
        let page = vec![0u8; PAGE_SIZE_MIN];
        assert!(!is_corrupted(&page, SpaceFlags::empty()));
        assert!(!is_corrupted(&page, SpaceFlags::FULL_CRC32));
        assert!(!is_zip_corrupted(&page[..1024]));
    }

    #[test]
    fn zip_stamp_validates() {
        let mut zip = sample_page(2048);
        stamp_zip(&mut zip, Lsn(12));
        assert!(!is_zip_corrupted(&zip));
        zip[2000] ^= 0x80;
        assert!(is_zip_corrupted(&zip));
    }

    #[test]
    fn encryption_checksum_ignores_its_own_field() {
        let mut page = sample_page(PAGE_SIZE_MIN);
        let before = encryption_checksum(&page);
        write_u32(&mut page, ENCRYPTION_CHECKSUM, before);
        assert_eq!(encryption_checksum(&page), before);
    }

    proptest! {
        #[test]
        fn single_bit_flips_are_detected(offset in DATA..(PAGE_SIZE_MIN - TRAILER_LEN), bit in 0u8..8) {
            let mut page = sample_page(PAGE_SIZE_MIN);
            stamp_page(&mut page, ChecksumAlgorithm::Crc32, Lsn(77));
            page[offset] ^= 1 << bit;
            prop_assert!(is_corrupted(&page, SpaceFlags::empty()));
        }
    }
}
