#![allow(missing_docs)]

mod support;

use std::sync::Arc;

use bufpool::buf::{PageCodec, PassthroughCodec};
use bufpool::primitives::aio::{InlineIo, SpaceFiles};
use bufpool::primitives::io::{FileIo, MemFileIo};
use bufpool::types::page::{self, SpaceFlags, SpaceInfo};
use bufpool::types::PageId;
use bufpool::{BufError, BufferPool, Lsn, Result};

fn stamp(data: &mut [u8], n: u32) {
    data[page::DATA..page::DATA + 4].copy_from_slice(&n.to_be_bytes());
    data[page::DATA + 500] = n as u8;
}

fn stamped(data: &[u8]) -> u32 {
    u32::from_be_bytes([
        data[page::DATA],
        data[page::DATA + 1],
        data[page::DATA + 2],
        data[page::DATA + 3],
    ])
}

#[test]
fn compressed_pages_survive_frame_eviction() -> Result<()> {
    let (pool, _files) = support::mem_pool(support::options(64));
    for n in 0..150u32 {
        let mut page = pool.create(PageId::new(2, n))?;
        stamp(page.data_mut(), n);
        page.mark_dirty(Lsn(u64::from(n) + 1), Lsn(u64::from(n) + 1));
    }
    pool.validate()?;
    let stats = pool.stats();
    assert!(stats.total.buddy_frames > 0);
    assert!(stats.buddy.iter().any(|class| class.used > 0));

    for n in 0..150u32 {
        let page = pool.get(PageId::new(2, n))?;
        assert_eq!(stamped(page.data()), n);
        assert_eq!(page.data()[page::DATA + 500], n as u8);
    }
    let stats = pool.stats().total;
    assert!(stats.pages_read + stats.unzips > 0);
    pool.flush_all();
    pool.validate()?;
    Ok(())
}

#[test]
fn unzip_lru_gives_back_frames_first() -> Result<()> {
    let mut options = support::options(64);
    options.lru_scan_depth = 64;
    let (pool, _files) = support::mem_pool(options);
    for n in 0..40u32 {
        let mut page = pool.create(PageId::new(2, n))?;
        stamp(page.data_mut(), n);
        page.mark_dirty(Lsn(1), Lsn(1));
    }
    pool.flush_all();
    let before = pool.stats().total;
    assert!(before.unzip_lru_len > 0);
    pool.flush_lru(8);
    let after = pool.stats().total;
    assert!(after.zip_pages > before.zip_pages, "frames were dropped, copies kept");

    let page = pool.get(PageId::new(2, 39))?;
    assert_eq!(stamped(page.data()), 39);
    drop(page);
    pool.validate()?;
    Ok(())
}

#[test]
fn page_compressed_space_stores_short_images() -> Result<()> {
    support::init_tracing();
    let files = Arc::new(SpaceFiles::new());
    let flags = SpaceFlags::FULL_CRC32 | SpaceFlags::PAGE_COMPRESSED;
    let file = Arc::new(MemFileIo::new());
    files.attach(SpaceInfo::new(4, support::PAGE_SIZE).with_flags(flags), file.clone());
    let pool = BufferPool::with_files(support::options(64), Arc::clone(&files))?;

    let id = PageId::new(4, 2);
    {
        let mut page = pool.create(id)?;
        stamp(page.data_mut(), 77);
        page.mark_dirty(Lsn(5), Lsn(6));
    }
    pool.invalidate()?;

    let mut image = vec![0u8; support::PAGE_SIZE];
    file.read_at(u64::from(id.page_no) * support::PAGE_SIZE as u64, &mut image)?;
    assert!(page::is_page_compressed(&image, flags));
    assert!(image[1024..].iter().all(|&b| b == 0));

    let page = pool.get(id)?;
    assert_eq!(stamped(page.data()), 77);
    assert_eq!(page.lsn(), Lsn(6));
    Ok(())
}

/// XOR "cipher" with a per-instance key.
struct XorCodec(u8);

impl PageCodec for XorCodec {
    fn compress(&self, page: &[u8], zip: &mut [u8]) -> bool {
        PassthroughCodec.compress(page, zip)
    }

    fn decompress(&self, zip: &[u8], page: &mut [u8]) -> bool {
        PassthroughCodec.decompress(zip, page)
    }

    fn compress_payload(&self, body: &[u8], out: &mut [u8]) -> Option<usize> {
        PassthroughCodec.compress_payload(body, out)
    }

    fn decompress_payload(&self, payload: &[u8], out: &mut [u8]) -> bool {
        PassthroughCodec.decompress_payload(payload, out)
    }

    fn key_version(&self, _space: u32) -> u32 {
        1
    }

    fn encrypt(&self, _id: PageId, _key_version: u32, data: &mut [u8]) {
        data.iter_mut().for_each(|b| *b ^= self.0);
    }

    fn decrypt(&self, _id: PageId, _key_version: u32, data: &mut [u8]) -> bool {
        data.iter_mut().for_each(|b| *b ^= self.0);
        true
    }
}

fn encrypted_pool(files: &Arc<SpaceFiles>, key: u8) -> Result<BufferPool> {
    BufferPool::builder(
        support::options(64),
        Arc::new(InlineIo::new(Arc::clone(files))),
        Arc::<SpaceFiles>::clone(files),
    )
    .codec(Arc::new(XorCodec(key)))
    .build()
}

#[test]
fn encrypted_pages_round_trip() -> Result<()> {
    support::init_tracing();
    for flags in [SpaceFlags::ENCRYPTED, SpaceFlags::ENCRYPTED | SpaceFlags::FULL_CRC32] {
        let (files, file) = encrypted_space(flags);
        let id = PageId::new(5, 9);
        let pool = encrypted_pool(&files, 0x5A)?;
        write_page(&pool, id)?;

        let mut image = vec![0u8; support::PAGE_SIZE];
        file.read_at(u64::from(id.page_no) * support::PAGE_SIZE as u64, &mut image)?;
        assert_ne!(stamped(&image), 9, "{flags:?}: body is stored encrypted");

        let page = pool.get(id)?;
        assert_eq!(stamped(page.data()), 9, "{flags:?}");
    }
    Ok(())
}

#[test]
fn wrong_key_is_a_decryption_failure() -> Result<()> {
    support::init_tracing();
    let (files, _file) = encrypted_space(SpaceFlags::ENCRYPTED);
    let id = PageId::new(5, 9);
    write_page(&encrypted_pool(&files, 0x5A)?, id)?;

    let pool = encrypted_pool(&files, 0x33)?;
    let err = pool.get(id).unwrap_err();
    assert!(matches!(err, BufError::DecryptionFailed(p) if p == id), "{err}");
    assert!(!pool.is_resident(id));
    Ok(())
}

fn encrypted_space(flags: SpaceFlags) -> (Arc<SpaceFiles>, Arc<MemFileIo>) {
    let files = Arc::new(SpaceFiles::new());
    let file = Arc::new(MemFileIo::new());
    files.attach(SpaceInfo::new(5, support::PAGE_SIZE).with_flags(flags), file.clone());
    (files, file)
}

/// Writes a stamped page and empties the pool.
fn write_page(pool: &BufferPool, id: PageId) -> Result<()> {
    {
        let mut page = pool.create(id)?;
        stamp(page.data_mut(), id.page_no);
        page.mark_dirty(Lsn(3), Lsn(3));
    }
    pool.invalidate()
}
