#![allow(missing_docs)]

mod support;

use std::sync::{Arc, Barrier};
use std::thread;

use bufpool::buf::{FetchMode, LatchMode};
use bufpool::{BufError, PageId, Result};

#[test]
fn watch_then_load_then_unset() -> Result<()> {
    let (pool, _files) = support::mem_pool(support::options(64));
    let id = PageId::new(1, 12);
    assert!(pool.fetch(id, FetchMode::IfInPoolOrWatch, LatchMode::Shared)?.is_none());
    assert!(!pool.watch_occurred(id));
    assert!(!pool.is_resident(id));

    let page = pool.get(id)?;
    assert!(pool.watch_occurred(id));
    // The reader's fix plus the one inherited from the watch.
    assert_eq!(page.fix_count(), 2);
    drop(page);

    pool.watch_unset(id);
    let page = pool.fetch(id, FetchMode::IfInPool, LatchMode::Shared)?.expect("resident");
    assert_eq!(page.fix_count(), 1);
    Ok(())
}

#[test]
fn watch_on_resident_page_returns_it() -> Result<()> {
    let (pool, _files) = support::mem_pool(support::options(64));
    let id = PageId::new(1, 2);
    drop(pool.get(id)?);
    let page = pool
        .fetch(id, FetchMode::IfInPoolOrWatch, LatchMode::Shared)?
        .expect("resident page");
    assert_eq!(page.page_id(), id);
    Ok(())
}

#[test]
fn unset_without_load_clears_the_sentinel() -> Result<()> {
    let (pool, _files) = support::mem_pool(support::options(64));
    let id = PageId::new(1, 20);
    for _ in 0..3 {
        assert!(pool.fetch(id, FetchMode::IfInPoolOrWatch, LatchMode::None)?.is_none());
    }
    for _ in 0..3 {
        pool.watch_unset(id);
    }
    assert!(!pool.watch_occurred(id));
    // A fresh load no longer inherits any fix.
    let page = pool.get(id)?;
    assert_eq!(page.fix_count(), 1);
    drop(page);
    pool.validate()?;
    Ok(())
}

#[test]
fn sentinels_run_out() -> Result<()> {
    let mut options = support::options(64);
    options.watch_slots = 2;
    let (pool, _files) = support::mem_pool(options);
    for n in 0..2 {
        pool.fetch(PageId::new(1, n), FetchMode::IfInPoolOrWatch, LatchMode::None)?;
    }
    let err = pool
        .fetch(PageId::new(1, 9), FetchMode::IfInPoolOrWatch, LatchMode::None)
        .unwrap_err();
    assert!(matches!(err, BufError::OutOfMemory(_)));
    pool.watch_unset(PageId::new(1, 0));
    pool.fetch(PageId::new(1, 9), FetchMode::IfInPoolOrWatch, LatchMode::None)?;
    Ok(())
}

#[test]
fn concurrent_loads_share_one_copy() -> Result<()> {
    let (pool, _files) = support::mem_pool(support::options(64));
    let pool = Arc::new(pool);
    let id = PageId::new(1, 33);
    let barrier = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let pool = Arc::clone(&pool);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || -> Result<()> {
                barrier.wait();
                let page = pool.get(id)?;
                assert_eq!(page.page_id(), id);
                Ok(())
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("loader panicked")?;
    }
    let stats = pool.stats().total;
    assert_eq!(stats.pages_read, 1);
    assert_eq!(stats.lru_len, 1);
    pool.validate()?;
    Ok(())
}
