#![allow(missing_docs)]

mod support;

use bufpool::buf::FlushType;
use bufpool::{Lsn, PageId, Result};

fn dirty(pool: &bufpool::BufferPool, n: u32, start: u64, end: u64) -> Result<()> {
    let mut page = pool.get_mut(PageId::new(1, n))?;
    page.mark_dirty(Lsn(start), Lsn(end));
    Ok(())
}

#[test]
fn checkpoint_writes_only_what_it_must() -> Result<()> {
    let (pool, _files) = support::mem_pool(support::options(128));
    for n in 0..20 {
        dirty(&pool, n, 100 + u64::from(n) * 10, 105 + u64::from(n) * 10)?;
    }
    assert_eq!(pool.flush_list_len(), 20);
    assert_eq!(pool.oldest_modification(), Some(Lsn(100)));
    assert!(pool.modified_ratio_pct() > 0);

    pool.checkpoint(Lsn(150))?;
    assert_eq!(pool.oldest_modification(), Some(Lsn(150)));
    assert_eq!(pool.flush_list_len(), 15);
    for n in 0..5 {
        assert!(!pool.is_dirty(PageId::new(1, n)));
    }
    assert!(pool.is_dirty(PageId::new(1, 5)));
    assert_eq!(pool.stats().total.pages_written, 5);

    pool.checkpoint(Lsn(u64::MAX))?;
    assert_eq!(pool.oldest_modification(), None);
    assert_eq!(pool.modified_ratio_pct(), 0);
    pool.validate()?;
    Ok(())
}

#[test]
fn redirtying_keeps_the_first_lsn() -> Result<()> {
    let (pool, _files) = support::mem_pool(support::options(64));
    dirty(&pool, 1, 10, 11)?;
    dirty(&pool, 1, 40, 41)?;
    assert_eq!(pool.oldest_modification(), Some(Lsn(10)));
    assert_eq!(pool.flush_list(Lsn(11), 10), 1);
    pool.wait_batch_end(FlushType::List);
    assert_eq!(pool.oldest_modification(), None);

    // Written pages become dirty again at their next change.
    dirty(&pool, 1, 50, 52)?;
    assert_eq!(pool.oldest_modification(), Some(Lsn(50)));
    let page = pool.get(PageId::new(1, 1))?;
    assert_eq!(page.lsn(), Lsn(52));
    Ok(())
}

#[test]
fn batch_respects_the_page_limit() -> Result<()> {
    let (pool, _files) = support::mem_pool(support::options(64));
    for n in 0..10 {
        dirty(&pool, n, 1 + u64::from(n), 1 + u64::from(n))?;
    }
    assert_eq!(pool.flush_list(Lsn(u64::MAX), 4), 4);
    assert_eq!(pool.flush_list_len(), 6);
    assert_eq!(pool.oldest_modification(), Some(Lsn(5)));
    Ok(())
}

#[test]
fn recovery_mode_orders_out_of_order_changes() -> Result<()> {
    let (pool, _files) = support::mem_pool(support::options(64));
    pool.set_recovery_mode(true);
    // Redo apply dirties pages in page order, not LSN order.
    let lsns = [70u64, 20, 90, 10, 50, 30];
    for (n, lsn) in lsns.iter().enumerate() {
        dirty(&pool, n as u32, *lsn, *lsn + 1)?;
    }
    pool.validate()?;
    assert_eq!(pool.oldest_modification(), Some(Lsn(10)));

    assert_eq!(pool.flush_list(Lsn(40), usize::MAX), 3);
    assert_eq!(pool.oldest_modification(), Some(Lsn(50)));
    pool.set_recovery_mode(false);

    dirty(&pool, 10, 200, 201)?;
    pool.checkpoint(Lsn(100))?;
    assert_eq!(pool.oldest_modification(), Some(Lsn(200)));
    pool.validate()?;
    Ok(())
}

#[test]
fn lru_flush_cleans_the_tail() -> Result<()> {
    let mut options = support::options(64);
    options.lru_scan_depth = 64;
    let (pool, _files) = support::mem_pool(options);
    for n in 0..64 {
        dirty(&pool, n, 1 + u64::from(n), 1 + u64::from(n))?;
    }
    let written = pool.flush_lru(64);
    assert!(written > 0);
    let stats = pool.stats().total;
    assert!(stats.free_len > 0);
    assert_eq!(stats.flush_list_len as usize, 64 - written);
    pool.validate()?;
    Ok(())
}
