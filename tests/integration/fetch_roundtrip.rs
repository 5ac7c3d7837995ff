#![allow(missing_docs)]

mod support;

use std::sync::Arc;

use bufpool::buf::{FetchMode, LatchMode};
use bufpool::primitives::aio::{SpaceFiles, ThreadedIo};
use bufpool::primitives::io::{FileIo, MemFileIo};
use bufpool::types::page::{self, SpaceFlags, SpaceInfo};
use bufpool::{BufError, BufferPool, Lsn, PageId, Result};
use tempfile::tempdir;

fn fill(page: &mut [u8], seed: u8) {
    let len = page.len();
    for (i, b) in page[page::DATA..len - page::TRAILER_LEN].iter_mut().enumerate() {
        *b = seed.wrapping_add(i as u8);
    }
}

#[test]
fn pages_survive_eviction_on_disk() -> Result<()> {
    support::init_tracing();
    let dir = tempdir()?;
    let files = Arc::new(SpaceFiles::new());
    files.open(SpaceInfo::new(7, support::PAGE_SIZE), dir.path().join("space7.ibd"))?;
    let pool = BufferPool::with_files(support::options(64), Arc::clone(&files))?;

    for n in 0..200u32 {
        let mut page = pool.create(PageId::new(7, n))?;
        fill(page.data_mut(), n as u8);
        page.mark_dirty(Lsn(u64::from(n) + 1), Lsn(u64::from(n) + 1));
    }
    pool.flush_all();
    files.sync_space(7)?;

    for n in (0..200u32).rev() {
        let page = pool.get(PageId::new(7, n))?;
        let mut expected = vec![0u8; support::PAGE_SIZE];
        fill(&mut expected, n as u8);
        let body = page::DATA..support::PAGE_SIZE - page::TRAILER_LEN;
        assert_eq!(page.data()[body.clone()], expected[body], "page {n}");
        assert_eq!(page.lsn(), Lsn(u64::from(n) + 1));
    }
    pool.validate()?;
    Ok(())
}

#[test]
fn full_crc32_space_round_trips_through_threaded_io() -> Result<()> {
    support::init_tracing();
    let files = Arc::new(SpaceFiles::new());
    files.attach(
        SpaceInfo::new(3, support::PAGE_SIZE).with_flags(SpaceFlags::FULL_CRC32),
        Arc::new(MemFileIo::new()),
    );
    let io = Arc::new(ThreadedIo::new(Arc::clone(&files), 2)?);
    let pool = BufferPool::builder(support::options(64), io, files).build()?;

    let id = PageId::new(3, 11);
    {
        let mut page = pool.create(id)?;
        fill(page.data_mut(), 5);
        page.mark_dirty(Lsn(90), Lsn(91));
    }
    pool.checkpoint(Lsn(100))?;
    assert_eq!(pool.oldest_modification(), None);
    pool.invalidate()?;

    let page = pool.get(id)?;
    assert_eq!(page.data()[page::DATA], 5);
    assert_eq!(page.lsn(), Lsn(91));
    Ok(())
}

#[test]
fn missing_space_reports_deleted() {
    let (pool, files) = support::mem_pool(support::options(64));
    files.drop_space(1);
    let err = pool.get(PageId::new(1, 0)).unwrap_err();
    assert!(matches!(err, BufError::TablespaceDeleted(1)));
}

#[test]
fn corrupted_page_is_reported_and_not_cached() -> Result<()> {
    let (pool, files) = support::mem_pool(support::options(64));
    let id = PageId::new(1, 4);
    {
        let mut page = pool.create(id)?;
        fill(page.data_mut(), 1);
        page.mark_dirty(Lsn(3), Lsn(3));
    }
    pool.invalidate()?;

    let file = files.file(1).expect("space 1");
    let offset = u64::from(id.page_no) * support::PAGE_SIZE as u64;
    file.write_at(offset + 1000, &[0xFF; 4])?;

    let err = pool.get(id).unwrap_err();
    assert!(matches!(err, BufError::PageCorrupted(p) if p == id));
    assert!(!pool.is_resident(id));

    let page = pool
        .fetch(id, FetchMode::PossiblyFreed, LatchMode::Shared)?
        .expect("possibly freed returns the page");
    assert_eq!(page.io_status(), bufpool::types::IoStatus::PageCorrupted);
    drop(page);
    assert!(!pool.is_resident(id));
    Ok(())
}

#[test]
fn shared_guards_coexist() -> Result<()> {
    let (pool, _files) = support::mem_pool(support::options(64));
    let id = PageId::new(1, 2);
    let a = pool.get(id)?;
    let b = pool.get(id)?;
    assert_eq!(a.fix_count(), 2);
    drop(a);
    assert_eq!(b.fix_count(), 1);
    let mut c = pool.fetch(id, FetchMode::NoLatch, LatchMode::Exclusive)?.expect("page");
    assert_eq!(c.latch_mode(), LatchMode::None);
    drop(b);
    c.latch(LatchMode::Exclusive);
    c.data_mut()[page::DATA] = 1;
    Ok(())
}
