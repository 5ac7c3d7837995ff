#![allow(missing_docs)]

mod support;

use std::sync::Arc;

use bufpool::buf::lru::{ratio_from_pct, NON_OLD_MIN_LEN, OLD_RATIO_DIV, OLD_TOLERANCE};
use bufpool::buf::{FetchMode, LatchMode};
use bufpool::primitives::aio::InlineIo;
use bufpool::primitives::clock::ManualClock;
use bufpool::{BufferPool, PageId, Result};

struct Aging {
    pool: BufferPool,
    clock: Arc<ManualClock>,
}

/// Pool with a manual clock, a warm LRU and one eviction behind it, so
/// freshly read pages land in the old sublist and aging applies.
fn aging_pool(threshold_ms: u64) -> Result<Aging> {
    support::init_tracing();
    let files = support::mem_spaces();
    let clock = Arc::new(ManualClock::new(1));
    let mut options = support::options(128);
    options.lru_old_threshold_ms = threshold_ms;
    let pool = BufferPool::builder(options, Arc::new(InlineIo::new(Arc::clone(&files))), files)
        .clock(clock.clone())
        .build()?;
    for n in 0..60 {
        pool.get(PageId::new(1, n))?;
    }
    pool.fetch(PageId::new(1, 0), FetchMode::EvictIfInPool, LatchMode::None)?;
    assert!(pool.stats().total.freed_page_clock > 0);
    Ok(Aging { pool, clock })
}

fn touch(pool: &BufferPool, n: u32) -> Result<bool> {
    let page = pool.get(PageId::new(1, n))?;
    Ok(page.is_old())
}

#[test]
fn promotion_waits_for_the_interval() -> Result<()> {
    for threshold in [200u64, 1000, 5000] {
        let Aging { pool, clock } = aging_pool(threshold)?;
        assert!(touch(&pool, 100)?, "fresh page enters the old sublist");
        assert!(touch(&pool, 101)?);

        clock.advance(threshold / 2);
        assert!(touch(&pool, 100)?, "threshold {threshold}: early touch keeps the page old");

        clock.advance(threshold);
        assert!(!touch(&pool, 101)?, "threshold {threshold}: late touch promotes");
        let stats = pool.stats().total;
        assert_eq!(stats.pages_made_young, 1);
        assert!(stats.pages_not_made_young >= 1);
        pool.validate()?;
    }
    Ok(())
}

#[test]
fn peek_never_promotes() -> Result<()> {
    let Aging { pool, clock } = aging_pool(1000)?;
    assert!(touch(&pool, 100)?);
    clock.advance(5000);
    let page = pool
        .fetch(PageId::new(1, 100), FetchMode::PeekIfInPool, LatchMode::Shared)?
        .expect("resident");
    assert!(page.is_old());
    drop(page);
    assert_eq!(pool.stats().total.pages_made_young, 0);
    Ok(())
}

#[test]
fn explicit_make_young() -> Result<()> {
    let Aging { pool, .. } = aging_pool(1000)?;
    let page = pool.get(PageId::new(1, 100))?;
    assert!(page.is_old());
    pool.make_young(&page);
    assert!(!page.is_old());
    Ok(())
}

#[test]
fn old_sublist_tracks_the_ratio() -> Result<()> {
    let Aging { pool, .. } = aging_pool(1000)?;
    for pct in [5u32, 37, 60, 95] {
        let ratio = pool.set_old_ratio_pct(pct);
        assert_eq!(ratio, ratio_from_pct(pct));
        for n in 200..260 {
            pool.get(PageId::new(1, n))?;
        }
        let stats = pool.stats().total;
        let len = stats.lru_len as usize;
        let target = (len * ratio / OLD_RATIO_DIV).min(len - (OLD_TOLERANCE + NON_OLD_MIN_LEN));
        let old = stats.old_len as usize;
        assert!(
            old.abs_diff(target) <= OLD_TOLERANCE,
            "pct {pct}: old {old}, target {target}, lru {}",
            stats.lru_len
        );
        pool.validate()?;
    }
    Ok(())
}

#[test]
fn zero_threshold_ages_by_evictions() -> Result<()> {
    let Aging { pool, .. } = aging_pool(1000)?;
    pool.set_old_threshold_ms(0);
    assert!(touch(&pool, 100)?);
    assert!(touch(&pool, 100)?, "too few evictions since the page was linked");
    for n in 1..=30 {
        pool.fetch(PageId::new(1, n), FetchMode::EvictIfInPool, LatchMode::None)?;
    }
    assert!(!touch(&pool, 100)?);
    Ok(())
}
