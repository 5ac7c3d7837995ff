//! Page codec hooks and the on-disk image pipeline.
//!
//! Outgoing pages are stamped, optionally page-compressed, optionally
//! encrypted and finally checksummed. Incoming images go the other way and
//! the result is reported as an [`IoStatus`]. The algorithms themselves
//! live behind [`PageCodec`].

use crate::types::checksum::{
    encryption_checksum, is_corrupted, is_zip_corrupted, restamp_full_crc32, stamp_page, stamp_zip,
    ChecksumAlgorithm,
};
use crate::types::page::{
    self, read_u16, read_u32, write_u16, write_u32, write_u64, SpaceFlags, SpaceInfo, DATA,
    ENCRYPTION_CHECKSUM, FCRC32_CHECKSUM, FCRC32_END_LSN, FCRC32_KEY_VERSION,
    FLUSH_LSN_OR_KEY_VERSION, LSN, PAGE_TYPE, TRAILER_LEN,
};
use crate::types::{IoStatus, Lsn, PageId};

/// Compression and encryption hooks.
///
/// The first 38 bytes (the page header) of every image are owned by the
/// pool: compressed images carry them verbatim and encryption never
/// covers them.
pub trait PageCodec: Send + Sync + 'static {
    /// Compresses an uncompressed page into `zip`, whose length is the
    /// compressed page size. Returns false if the page does not fit.
    fn compress(&self, page: &[u8], zip: &mut [u8]) -> bool;

    /// Inflates a compressed image into `page`. Returns false on malformed
    /// input.
    fn decompress(&self, zip: &[u8], page: &mut [u8]) -> bool;

    /// Compresses a page body for page-compressed tablespaces into `out`,
    /// returning the payload length, or `None` to store it uncompressed.
    fn compress_payload(&self, body: &[u8], out: &mut [u8]) -> Option<usize>;

    /// Inflates a payload produced by [`PageCodec::compress_payload`] into
    /// `out`, which has the original body length.
    fn decompress_payload(&self, payload: &[u8], out: &mut [u8]) -> bool;

    /// Key version to encrypt new writes of `space` with; 0 disables
    /// encryption.
    fn key_version(&self, _space: u32) -> u32 {
        0
    }

    /// Encrypts `data` in place.
    fn encrypt(&self, _id: PageId, _key_version: u32, _data: &mut [u8]) {}

    /// Decrypts `data` in place. Returns false when the key is unavailable.
    fn decrypt(&self, _id: PageId, _key_version: u32, _data: &mut [u8]) -> bool {
        false
    }
}

/// Stores images as-is: a page "compresses" when everything past the
/// compressed size (or past the last non-zero body byte) is zero.
#[derive(Default, Debug, Clone, Copy)]
pub struct PassthroughCodec;

impl PageCodec for PassthroughCodec {
    fn compress(&self, page: &[u8], zip: &mut [u8]) -> bool {
        let n = zip.len();
        if n > page.len() || page[n..].iter().any(|&b| b != 0) {
            return false;
        }
        zip.copy_from_slice(&page[..n]);
        true
    }

    fn decompress(&self, zip: &[u8], page: &mut [u8]) -> bool {
        let n = zip.len();
        if n > page.len() {
            return false;
        }
        page[..n].copy_from_slice(zip);
        page[n..].fill(0);
        true
    }

    fn compress_payload(&self, body: &[u8], out: &mut [u8]) -> Option<usize> {
        let end = body.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
        if end > out.len() {
            return None;
        }
        out[..end].copy_from_slice(&body[..end]);
        Some(end)
    }

    fn decompress_payload(&self, payload: &[u8], out: &mut [u8]) -> bool {
        if payload.len() > out.len() {
            return false;
        }
        out[..payload.len()].copy_from_slice(payload);
        out[payload.len()..].fill(0);
        true
    }
}

/// Original page type, stored ahead of a page-compressed payload.
const ORIG_TYPE_LEN: usize = 2;

/// Builds the on-disk image of a page of an uncompressed-format space.
/// The image always has the full page size; a page-compressed image is
/// zero past its recorded length.
pub(crate) fn encode_page(
    id: PageId,
    space: &SpaceInfo,
    codec: &dyn PageCodec,
    algorithm: ChecksumAlgorithm,
    frame: &[u8],
    lsn: Lsn,
) -> Vec<u8> {
    let mut out = frame.to_vec();
    let size = out.len();
    let key_version = if space.flags.contains(SpaceFlags::ENCRYPTED) {
        codec.key_version(id.space)
    } else {
        0
    };

    if space.is_full_crc32() {
        write_u64(&mut out, LSN, lsn.0);
        write_u32(&mut out, size - FCRC32_END_LSN, lsn.0 as u32);
        let mut len = size;
        if space.flags.contains(SpaceFlags::PAGE_COMPRESSED) {
            if let Some(compressed) = compress_full_crc32(codec, frame, &mut out) {
                len = compressed;
            }
        }
        write_u32(&mut out, FCRC32_KEY_VERSION, key_version);
        if key_version != 0 {
            codec.encrypt(id, key_version, &mut out[DATA..len - FCRC32_CHECKSUM]);
        }
        restamp_full_crc32(&mut out, len);
        return out;
    }

    write_u32(&mut out, FLUSH_LSN_OR_KEY_VERSION, 0);
    write_u32(&mut out, ENCRYPTION_CHECKSUM, 0);
    stamp_page(&mut out, algorithm, lsn);
    if key_version != 0 {
        page::set_key_version(&mut out, space.flags, key_version);
        codec.encrypt(id, key_version, &mut out[DATA..size - TRAILER_LEN]);
        let crc = encryption_checksum(&out);
        write_u32(&mut out, ENCRYPTION_CHECKSUM, crc);
    }
    out
}

fn compress_full_crc32(codec: &dyn PageCodec, frame: &[u8], out: &mut [u8]) -> Option<usize> {
    let size = frame.len();
    let body = &frame[DATA..size - FCRC32_END_LSN];
    let start = DATA + ORIG_TYPE_LEN;
    let mut payload = vec![0u8; size - start - FCRC32_CHECKSUM];
    let n = codec.compress_payload(body, &mut payload)?;
    let len = (start + n + FCRC32_CHECKSUM).next_multiple_of(256);
    if len >= size {
        return None;
    }
    write_u16(out, DATA, page::page_type(frame));
    out[start..start + n].copy_from_slice(&payload[..n]);
    out[start + n..].fill(0);
    write_u16(out, PAGE_TYPE, page::full_crc32_compressed_type(len));
    Some(len)
}

/// Verifies and decodes an image of an uncompressed-format space into
/// `frame`.
pub(crate) fn decode_page(
    id: PageId,
    space: &SpaceInfo,
    codec: &dyn PageCodec,
    verify: bool,
    image: &[u8],
    frame: &mut [u8],
) -> IoStatus {
    if page::is_zeroes(image) {
        frame.fill(0);
        return IoStatus::Success;
    }
    let status = if space.is_full_crc32() {
        decode_full_crc32(id, space, codec, verify, image, frame)
    } else {
        decode_legacy(id, space, codec, verify, image, frame)
    };
    if status != IoStatus::Success {
        return status;
    }
    check_identity(id, frame)
}

fn decode_full_crc32(
    id: PageId,
    space: &SpaceInfo,
    codec: &dyn PageCodec,
    verify: bool,
    image: &[u8],
    frame: &mut [u8],
) -> IoStatus {
    let size = frame.len();
    let shape = page::full_crc32_size(image, size);
    if shape.corrupted || (verify && is_corrupted(image, space.flags)) {
        return IoStatus::PageCorrupted;
    }
    frame.copy_from_slice(image);
    let key_version = read_u32(frame, FCRC32_KEY_VERSION);
    if key_version != 0 {
        if !space.flags.contains(SpaceFlags::ENCRYPTED)
            || !codec.decrypt(id, key_version, &mut frame[DATA..shape.size - FCRC32_CHECKSUM])
        {
            return IoStatus::DecryptionFailed;
        }
        write_u32(frame, FCRC32_KEY_VERSION, 0);
    }
    if shape.compressed {
        let start = DATA + ORIG_TYPE_LEN;
        let original_type = read_u16(frame, DATA);
        let payload = frame[start..shape.size - FCRC32_CHECKSUM].to_vec();
        if !codec.decompress_payload(&payload, &mut frame[DATA..size - FCRC32_END_LSN]) {
            return IoStatus::PageCorrupted;
        }
        write_u16(frame, PAGE_TYPE, original_type);
        let lsn = page::page_lsn(frame);
        write_u32(frame, size - FCRC32_END_LSN, lsn.0 as u32);
        restamp_full_crc32(frame, size);
    }
    IoStatus::Success
}

fn decode_legacy(
    id: PageId,
    space: &SpaceInfo,
    codec: &dyn PageCodec,
    verify: bool,
    image: &[u8],
    frame: &mut [u8],
) -> IoStatus {
    let size = frame.len();
    let key_version = if space.flags.contains(SpaceFlags::ENCRYPTED) {
        page::key_version(image, space.flags)
    } else {
        0
    };
    if key_version == 0 {
        if verify && is_corrupted(image, space.flags) {
            return IoStatus::PageCorrupted;
        }
        frame.copy_from_slice(image);
        return IoStatus::Success;
    }
    if verify && read_u32(image, ENCRYPTION_CHECKSUM) != encryption_checksum(image) {
        return IoStatus::PageCorrupted;
    }
    frame.copy_from_slice(image);
    if !codec.decrypt(id, key_version, &mut frame[DATA..size - TRAILER_LEN]) {
        return IoStatus::DecryptionFailed;
    }
    write_u32(frame, FLUSH_LSN_OR_KEY_VERSION, 0);
    write_u32(frame, ENCRYPTION_CHECKSUM, 0);
    if verify && is_corrupted(frame, space.flags) {
        return IoStatus::DecryptionFailed;
    }
    IoStatus::Success
}

fn check_identity(id: PageId, frame: &[u8]) -> IoStatus {
    let space_id = page::space_id(frame);
    if page::page_no(frame) != id.page_no || (space_id != id.space && space_id != 0) {
        return IoStatus::PageCorrupted;
    }
    IoStatus::Success
}

/// Compresses `frame` into `zip` and stamps it. Returns false if the page
/// does not fit the compressed size.
pub(crate) fn encode_zip(codec: &dyn PageCodec, frame: &[u8], zip: &mut [u8], lsn: Lsn) -> bool {
    if !codec.compress(frame, zip) {
        return false;
    }
    zip[..DATA].copy_from_slice(&frame[..DATA]);
    stamp_zip(zip, lsn);
    true
}

/// Verifies a compressed image and inflates it into `frame`.
pub(crate) fn decode_zip(id: PageId, codec: &dyn PageCodec, verify: bool, zip: &[u8], frame: &mut [u8]) -> IoStatus {
    if page::is_zeroes(zip) {
        frame.fill(0);
        return IoStatus::Success;
    }
    if verify && is_zip_corrupted(zip) {
        return IoStatus::PageCorrupted;
    }
    if !codec.decompress(zip, frame) {
        return IoStatus::PageCorrupted;
    }
    frame[..DATA].copy_from_slice(&zip[..DATA]);
    check_identity(id, frame)
}
