//! Sharded page hash and watch sentinels.
//!
//! Each bucket is its own `RwLock`, taken before the instance lock. A
//! watch entry marks an identity somebody is waiting on; it never carries
//! page content and is replaced by the real page when one is loaded.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use rustc_hash::FxHashMap;

use super::list::Slot;
use crate::types::PageId;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum HashEntry {
    Page(Slot),
    Watch(usize),
}

pub(crate) type Bucket = FxHashMap<PageId, HashEntry>;

pub(crate) struct PageHash {
    buckets: Box<[RwLock<Bucket>]>,
}

impl PageHash {
    pub(crate) fn new(n_locks: usize) -> Self {
        let buckets = (0..n_locks.max(1))
            .map(|_| RwLock::new(Bucket::default()))
            .collect();
        Self { buckets }
    }

    pub(crate) fn bucket_index(&self, id: PageId) -> usize {
        id.fold() as usize % self.buckets.len()
    }

    pub(crate) fn bucket(&self, id: PageId) -> &RwLock<Bucket> {
        &self.buckets[self.bucket_index(id)]
    }

    pub(crate) fn lookup(&self, id: PageId) -> Option<HashEntry> {
        self.bucket(id).read().get(&id).copied()
    }

    /// Every bucket, read-locked in index order.
    pub(crate) fn read_all(&self) -> Vec<RwLockReadGuard<'_, Bucket>> {
        self.buckets.iter().map(|b| b.read()).collect()
    }

    /// Every bucket, write-locked in index order.
    pub(crate) fn write_all(&self) -> Vec<RwLockWriteGuard<'_, Bucket>> {
        self.buckets.iter().map(|b| b.write()).collect()
    }
}

#[derive(Default)]
struct WatchSlot {
    in_use: AtomicBool,
    page_id: AtomicU64,
    fix_count: AtomicU32,
}

/// Fixed pool of watch sentinels. Callers hold the bucket write lock of
/// the watched identity while touching a slot.
pub(crate) struct Watches {
    slots: Box<[WatchSlot]>,
}

impl Watches {
    pub(crate) fn new(n: usize) -> Self {
        Self {
            slots: (0..n).map(|_| WatchSlot::default()).collect(),
        }
    }

    /// Claims a slot for `id` with one watcher.
    pub(crate) fn acquire(&self, id: PageId) -> Option<usize> {
        let idx = self.slots.iter().position(|s| {
            s.in_use
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        })?;
        let slot = &self.slots[idx];
        slot.page_id.store(id.to_raw(), Ordering::Release);
        slot.fix_count.store(1, Ordering::Release);
        Some(idx)
    }

    pub(crate) fn add_watcher(&self, idx: usize) {
        self.slots[idx].fix_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one watcher; true when it was the last one and the slot is
    /// free again.
    pub(crate) fn remove_watcher(&self, idx: usize) -> bool {
        let slot = &self.slots[idx];
        let prior = slot.fix_count.fetch_sub(1, Ordering::AcqRel);
        assert!(prior > 0, "watch slot {idx} has no watchers");
        if prior == 1 {
            slot.in_use.store(false, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Releases the slot and returns its watcher count so the loaded page
    /// can inherit it.
    pub(crate) fn take(&self, idx: usize) -> u32 {
        let slot = &self.slots[idx];
        let count = slot.fix_count.swap(0, Ordering::AcqRel);
        slot.in_use.store(false, Ordering::Release);
        count
    }

    pub(crate) fn page_id(&self, idx: usize) -> PageId {
        PageId::from_raw(self.slots[idx].page_id.load(Ordering::Acquire))
    }

    #[cfg(test)]
    pub(crate) fn in_use(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.in_use.load(Ordering::Acquire))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_partition_by_fold() {
        let hash = PageHash::new(8);
        let id = PageId::new(3, 77);
        assert_eq!(hash.bucket_index(id), id.fold() as usize % 8);
        hash.bucket(id).write().insert(id, HashEntry::Page(Slot::Block(4)));
        assert_eq!(hash.lookup(id), Some(HashEntry::Page(Slot::Block(4))));
        assert_eq!(hash.lookup(PageId::new(3, 78)), None);
    }

    #[test]
    fn watch_slots_count_watchers() {
        let watches = Watches::new(2);
        let id = PageId::new(1, 1);
        let a = watches.acquire(id).unwrap();
        let b = watches.acquire(PageId::new(1, 2)).unwrap();
        assert!(watches.acquire(PageId::new(1, 3)).is_none());
        assert_eq!(watches.page_id(a), id);
        watches.add_watcher(a);
        assert!(!watches.remove_watcher(a));
        assert!(watches.remove_watcher(a));
        assert_eq!(watches.in_use(), 1);
        watches.add_watcher(b);
        assert_eq!(watches.take(b), 2);
        assert_eq!(watches.in_use(), 0);
    }
}
