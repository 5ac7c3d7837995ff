#![allow(missing_docs)]

mod support;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use bufpool::buf::{LatchMode, ResizeStatus};
use bufpool::types::page;
use bufpool::{BufError, Lsn, PageId, Result};

fn options(pages: usize) -> bufpool::PoolOptions {
    let mut options = support::options(pages);
    options.chunk_pages = 16;
    options.resize_retry_ms = 1;
    options
}

#[test]
fn grow_then_shrink() -> Result<()> {
    let (pool, _files) = support::mem_pool(options(64));
    for n in 0..60u32 {
        let mut page = pool.create(PageId::new(1, n))?;
        page.data_mut()[page::DATA] = n as u8;
        page.mark_dirty(Lsn(u64::from(n) + 1), Lsn(u64::from(n) + 1));
    }

    pool.resize(128)?;
    let status = pool.wait_for_resize();
    assert_eq!(status, ResizeStatus::Completed { from_pages: 64, to_pages: 128 });
    assert_eq!(pool.curr_size(), 128);
    assert_eq!(pool.stats().total.free_len, 68);
    pool.validate()?;

    pool.resize(32)?;
    let status = pool.wait_for_resize();
    assert_eq!(status, ResizeStatus::Completed { from_pages: 128, to_pages: 32 });
    assert_eq!(pool.curr_size(), 32);
    pool.validate()?;

    for n in 0..60u32 {
        let page = pool.get(PageId::new(1, n))?;
        assert_eq!(page.data()[page::DATA], n as u8, "page {n}");
    }
    Ok(())
}

#[test]
fn handles_go_stale_across_a_shrink() -> Result<()> {
    let (pool, _files) = support::mem_pool(options(64));
    let handle = pool.get(PageId::new(1, 3))?.handle();
    pool.optimistic_get(&handle, LatchMode::Shared)?;

    pool.resize(48)?;
    pool.wait_for_resize();
    assert!(matches!(
        pool.optimistic_get(&handle, LatchMode::Shared),
        Err(BufError::StaleHandle(_))
    ));
    let page = pool.revalidate(&handle, LatchMode::Shared)?;
    assert_eq!(page.page_id(), PageId::new(1, 3));
    Ok(())
}

#[test]
fn pinned_zone_aborts_the_shrink() -> Result<()> {
    let mut options = options(64);
    options.resize_max_attempts = 5;
    let (pool, _files) = support::mem_pool(options);
    let mut guards = Vec::new();
    for n in 0..64u32 {
        guards.push(pool.get(PageId::new(1, n))?);
    }

    pool.resize(32)?;
    let status = pool.wait_for_resize();
    assert!(matches!(status, ResizeStatus::Aborted { target_pages: 32, .. }), "{status:?}");
    assert_eq!(pool.curr_size(), 64);
    drop(guards);

    let stats = pool.stats().total;
    assert_eq!(stats.withdraw_len, 0);
    assert_eq!(stats.lru_len + stats.free_len, 64);
    pool.validate()?;
    Ok(())
}

#[test]
fn readers_keep_working_during_resize() -> Result<()> {
    let (pool, _files) = support::mem_pool(options(128));
    let pool = Arc::new(pool);
    for n in 0..200u32 {
        let mut page = pool.create(PageId::new(1, n))?;
        page.data_mut()[page::DATA] = n as u8;
        page.mark_dirty(Lsn(1), Lsn(1));
    }
    let stop = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..3)
        .map(|t| {
            let pool = Arc::clone(&pool);
            let stop = Arc::clone(&stop);
            thread::spawn(move || -> Result<()> {
                let mut n = t;
                while !stop.load(Ordering::Relaxed) {
                    n = (n + 7) % 200;
                    match pool.get(PageId::new(1, n)) {
                        Ok(page) => assert_eq!(page.data()[page::DATA], n as u8),
                        Err(BufError::OutOfMemory(_)) => {}
                        Err(err) => return Err(err),
                    }
                }
                Ok(())
            })
        })
        .collect();

    for target in [64usize, 192, 48, 128] {
        pool.resize(target)?;
        let status = pool.wait_for_resize();
        assert!(matches!(status, ResizeStatus::Completed { to_pages, .. } if to_pages == target), "{status:?}");
    }
    stop.store(true, Ordering::Relaxed);
    for reader in readers {
        reader.join().expect("reader panicked")?;
    }
    pool.validate()?;
    Ok(())
}

#[test]
fn second_resize_is_rejected_while_running() -> Result<()> {
    let (pool, _files) = support::mem_pool(options(64));
    let _pinned: Vec<_> = (0..64u32)
        .map(|n| pool.get(PageId::new(1, n)))
        .collect::<Result<_>>()?;
    pool.resize(16)?;
    if pool.resize_status().is_running() {
        assert!(matches!(pool.resize(32), Err(BufError::Invalid(_))));
    }
    pool.wait_for_resize();
    Ok(())
}
