//! Pool statistics.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use super::buddy::BuddyStat;
use super::descriptor::FlushType;

/// Event counters of one instance, bumped without the instance lock.
#[derive(Default)]
pub(crate) struct Counters {
    pub(crate) page_gets: AtomicU64,
    pub(crate) pages_read: AtomicU64,
    pub(crate) pages_created: AtomicU64,
    pub(crate) pages_written: AtomicU64,
    pub(crate) pages_evicted: AtomicU64,
    pub(crate) made_young: AtomicU64,
    pub(crate) not_made_young: AtomicU64,
    pub(crate) pending_reads: AtomicU64,
    pub(crate) write_errors: AtomicU64,
    pub(crate) read_errors: AtomicU64,
    pub(crate) unzips: AtomicU64,
}

impl Counters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Snapshot of one pool instance.
#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct InstanceStats {
    /// Blocks owned by the instance.
    pub pool_size: u64,
    /// Pages on the LRU list (compressed-only pages included).
    pub lru_len: u64,
    /// Length of the old sublist.
    pub old_len: u64,
    /// Blocks on the free list.
    pub free_len: u64,
    /// Dirty pages.
    pub flush_list_len: u64,
    /// Blocks holding both a compressed and an uncompressed copy.
    pub unzip_lru_len: u64,
    /// Compressed-only pages.
    pub zip_pages: u64,
    /// Blocks set aside by a shrinking resize.
    pub withdraw_len: u64,
    /// Frames donated to the buddy allocator.
    pub buddy_frames: u64,
    /// Reads in flight.
    pub pending_reads: u64,
    /// LRU flush writes in flight.
    pub pending_writes_lru: u64,
    /// Flush-list writes in flight.
    pub pending_writes_list: u64,
    /// Single-page flush writes in flight.
    pub pending_writes_single: u64,
    /// Old pages promoted to the young end.
    pub pages_made_young: u64,
    /// Old pages left in place because they were touched too soon.
    pub pages_not_made_young: u64,
    /// Pages read from disk.
    pub pages_read: u64,
    /// Pages created without a read.
    pub pages_created: u64,
    /// Pages written back.
    pub pages_written: u64,
    /// Pages evicted.
    pub pages_evicted: u64,
    /// Page lookups.
    pub page_gets: u64,
    /// Completed reads that failed verification or I/O.
    pub read_errors: u64,
    /// Failed writes.
    pub write_errors: u64,
    /// Compressed pages inflated on access.
    pub unzips: u64,
    /// Evictions so far, as seen by the LRU aging heuristic.
    pub freed_page_clock: u64,
}

impl InstanceStats {
    /// Writes in flight for one flush type.
    pub fn pending_writes(&self, ty: FlushType) -> u64 {
        match ty {
            FlushType::Lru => self.pending_writes_lru,
            FlushType::List => self.pending_writes_list,
            FlushType::SinglePage => self.pending_writes_single,
        }
    }

    fn accumulate(&mut self, other: &InstanceStats) {
        self.pool_size += other.pool_size;
        self.lru_len += other.lru_len;
        self.old_len += other.old_len;
        self.free_len += other.free_len;
        self.flush_list_len += other.flush_list_len;
        self.unzip_lru_len += other.unzip_lru_len;
        self.zip_pages += other.zip_pages;
        self.withdraw_len += other.withdraw_len;
        self.buddy_frames += other.buddy_frames;
        self.pending_reads += other.pending_reads;
        self.pending_writes_lru += other.pending_writes_lru;
        self.pending_writes_list += other.pending_writes_list;
        self.pending_writes_single += other.pending_writes_single;
        self.pages_made_young += other.pages_made_young;
        self.pages_not_made_young += other.pages_not_made_young;
        self.pages_read += other.pages_read;
        self.pages_created += other.pages_created;
        self.pages_written += other.pages_written;
        self.pages_evicted += other.pages_evicted;
        self.page_gets += other.page_gets;
        self.read_errors += other.read_errors;
        self.write_errors += other.write_errors;
        self.unzips += other.unzips;
        self.freed_page_clock += other.freed_page_clock;
    }
}

/// Whole-pool snapshot.
#[derive(Clone, Debug, Default, Serialize)]
pub struct PoolStats {
    /// Per-instance figures.
    pub instances: Vec<InstanceStats>,
    /// Sum over instances.
    pub total: InstanceStats,
    /// Buddy allocator figures per size class, summed over instances.
    pub buddy: Vec<BuddyStat>,
}

impl PoolStats {
    pub(crate) fn collect(per_instance: Vec<(InstanceStats, Vec<BuddyStat>)>) -> Self {
        let mut stats = PoolStats::default();
        for (inst, buddy) in per_instance {
            stats.total.accumulate(&inst);
            if stats.buddy.is_empty() {
                stats.buddy = buddy;
            } else {
                for (sum, class) in stats.buddy.iter_mut().zip(buddy) {
                    sum.used += class.used;
                    sum.relocated += class.relocated;
                    sum.relocated_usec += class.relocated_usec;
                }
            }
            stats.instances.push(inst);
        }
        stats
    }

    /// Dirty pages as a share of LRU plus free pages.
    pub fn modified_ratio_pct(&self) -> u64 {
        let t = &self.total;
        t.flush_list_len * 100 / (t.lru_len + t.free_len + 1)
    }
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = &self.total;
        write!(
            f,
            "size={} lru={} old={} free={} dirty={} reads={} writes={} evicted={} young={} not_young={}",
            t.pool_size,
            t.lru_len,
            t.old_len,
            t.free_len,
            t.flush_list_len,
            t.pages_read,
            t.pages_written,
            t.pages_evicted,
            t.pages_made_young,
            t.pages_not_made_young
        )
    }
}
