#![allow(missing_docs)]

mod support;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use bufpool::buf::{FetchMode, LatchMode};
use bufpool::types::page;
use bufpool::{BufError, BufferPool, Lsn, PageId, Result};
use rand::Rng;

const PAGES: u32 = 256;

fn seeded_pool() -> Result<Arc<BufferPool>> {
    let (pool, _files) = support::mem_pool(support::options(64));
    for n in 0..PAGES {
        let mut page = pool.create(PageId::new(1, n))?;
        page.data_mut()[page::DATA..page::DATA + 4].copy_from_slice(&n.to_be_bytes());
        page.mark_dirty(Lsn(1), Lsn(1));
    }
    pool.flush_all();
    Ok(Arc::new(pool))
}

fn signature(data: &[u8]) -> u32 {
    u32::from_be_bytes([
        data[page::DATA],
        data[page::DATA + 1],
        data[page::DATA + 2],
        data[page::DATA + 3],
    ])
}

#[test]
fn pinned_pages_are_never_evicted() -> Result<()> {
    let pool = seeded_pool()?;
    let readers = 4;
    let evictors = 2;
    let barrier = Arc::new(Barrier::new(readers + evictors));
    let stop = Arc::new(AtomicBool::new(false));

    let mut handles = Vec::new();
    for _ in 0..readers {
        let pool = Arc::clone(&pool);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || -> Result<u64> {
            let mut rng = rand::thread_rng();
            barrier.wait();
            let mut checks = 0;
            for _ in 0..2_000 {
                let n = rng.gen_range(0..PAGES);
                let guard = match pool.get(PageId::new(1, n)) {
                    Ok(guard) => guard,
                    // Every other block may be pinned by the other readers.
                    Err(BufError::OutOfMemory(_)) => continue,
                    Err(err) => return Err(err),
                };
                let before = guard.page_id();
                thread::yield_now();
                assert_eq!(guard.page_id(), before);
                assert_eq!(signature(guard.data()), n, "pinned page {n} was replaced");
                checks += 1;
            }
            Ok(checks)
        }));
    }
    let evictions = Arc::new(AtomicU64::new(0));
    let mut evictor_handles = Vec::new();
    for e in 0..evictors {
        let pool = Arc::clone(&pool);
        let barrier = Arc::clone(&barrier);
        let stop = Arc::clone(&stop);
        let evictions = Arc::clone(&evictions);
        evictor_handles.push(thread::spawn(move || {
            let mut rng = rand::thread_rng();
            barrier.wait();
            while !stop.load(Ordering::Relaxed) {
                let n = if e == 0 {
                    pool.evict_all_clean()
                } else {
                    let id = PageId::new(1, rng.gen_range(0..PAGES));
                    pool.fetch(id, FetchMode::EvictIfInPool, LatchMode::None)
                        .expect("evict if in pool");
                    pool.flush_lru(8)
                };
                evictions.fetch_add(n as u64, Ordering::Relaxed);
            }
        }));
    }

    let mut checks = 0;
    for handle in handles {
        checks += handle.join().expect("reader panicked")?;
    }
    stop.store(true, Ordering::Relaxed);
    for handle in evictor_handles {
        handle.join().expect("evictor panicked");
    }
    assert!(checks > 0);
    assert!(evictions.load(Ordering::Relaxed) > 0);
    assert_eq!(pool.stats().total.read_errors, 0);
    pool.validate()?;
    Ok(())
}

#[test]
fn scans_survive_concurrent_removal() -> Result<()> {
    let pool = seeded_pool()?;
    let stop = Arc::new(AtomicBool::new(false));
    let lsn = Arc::new(AtomicU64::new(10));

    let writer = {
        let pool = Arc::clone(&pool);
        let stop = Arc::clone(&stop);
        let lsn = Arc::clone(&lsn);
        thread::spawn(move || -> Result<()> {
            let mut rng = rand::thread_rng();
            while !stop.load(Ordering::Relaxed) {
                let n = rng.gen_range(0..PAGES);
                let mut page = match pool.get_mut(PageId::new(1, n)) {
                    Ok(page) => page,
                    Err(BufError::OutOfMemory(_)) => continue,
                    Err(err) => return Err(err),
                };
                let at = Lsn(lsn.fetch_add(1, Ordering::Relaxed));
                page.mark_dirty(at, at);
            }
            Ok(())
        })
    };
    let remover = {
        let pool = Arc::clone(&pool);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut rng = rand::thread_rng();
            while !stop.load(Ordering::Relaxed) {
                let id = PageId::new(1, rng.gen_range(0..PAGES));
                pool.fetch(id, FetchMode::EvictIfInPool, LatchMode::None)
                    .expect("evict if in pool");
            }
        })
    };

    for _ in 0..200 {
        let limit = Lsn(lsn.load(Ordering::Relaxed));
        pool.flush_list(limit, 16);
        pool.flush_lru(16);
    }
    thread::sleep(Duration::from_millis(10));
    stop.store(true, Ordering::Relaxed);
    writer.join().expect("writer panicked")?;
    remover.join().expect("remover panicked");

    pool.flush_all();
    assert_eq!(pool.flush_list_len(), 0);
    pool.validate()?;
    Ok(())
}
