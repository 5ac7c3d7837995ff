//! Free blocks and eviction.
//!
//! A free block comes from the free list if possible, then from evicting a
//! clean page near the LRU tail, and as a last resort from writing out one
//! dirty page. Eviction only ever try-locks the page-hash bucket because it
//! runs under the instance mutex.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use super::arena::{BlockRef, ChunkSet, Nodes};
use super::buddy::{BuddyAddr, BuddyAllocator};
use super::codec;
use super::descriptor::{Descriptor, IoFix, PageState, ZipRef};
use super::hash::{Bucket, HashEntry};
use super::instance::{Instance, InstanceInner};
use super::list::Slot;
use super::lru::Cursor;
use super::stats::Counters;
use crate::types::{BufError, Lsn, PageId, Result};

impl Instance {
    /// Returns a block in `ReadyForUse`, evicting or flushing as needed.
    /// Must be called without any pool lock held.
    pub(crate) fn get_free_block(self: &Arc<Self>) -> Result<BlockRef> {
        let options = &self.ctx.options;
        let warn_every = options.free_block_warn_iterations.max(1);
        let mut n_iterations = 0usize;
        loop {
            {
                let mut inner = self.inner.lock();
                let chunks = self.chunks.read();
                if let Some(block) = self.take_free(&mut inner, &chunks) {
                    return Ok(block);
                }
                if self.scan_and_free(&mut inner, &chunks, n_iterations > 0) {
                    if let Some(block) = self.take_free(&mut inner, &chunks) {
                        return Ok(block);
                    }
                }
            }

            if n_iterations >= options.free_block_max_iterations {
                warn!(instance = self.idx, iterations = n_iterations, "buf.lru.free_block_exhausted");
                return Err(BufError::OutOfMemory("no free block after LRU scan and flush"));
            }
            if n_iterations > 0 && n_iterations % warn_every == 0 {
                let (stats, _) = self.stats();
                warn!(
                    instance = self.idx,
                    iterations = n_iterations,
                    lru = stats.lru_len,
                    dirty = stats.flush_list_len,
                    pending_reads = stats.pending_reads,
                    "buf.lru.free_block_stall"
                );
            }
            if !self.flush_single_page() && n_iterations > 1 {
                thread::sleep(Duration::from_millis(1));
            } else {
                thread::yield_now();
            }
            n_iterations += 1;
        }
    }

    /// Pops a usable block off the free list. Blocks in the withdraw zone
    /// are diverted to the withdraw list on the way.
    pub(crate) fn take_free(&self, inner: &mut InstanceInner, chunks: &ChunkSet) -> Option<BlockRef> {
        while let Some(slot) = inner.free.pop_front() {
            let Slot::Block(i) = slot else {
                continue;
            };
            if inner.in_withdraw_zone(i) {
                chunks.get(i).desc.bump_generation();
                inner.withdraw.push_back(slot);
                continue;
            }
            let block = chunks.get_ref(i);
            block.desc.transition(PageState::ReadyForUse);
            return Some(block);
        }
        None
    }

    /// Returns a `NotUsed` block to the free list, or to the withdraw list
    /// while its slot is being withdrawn.
    pub(crate) fn free_block_locked(&self, inner: &mut InstanceInner, chunks: &ChunkSet, i: u32) {
        let desc = &chunks.get(i).desc;
        debug_assert_eq!(desc.state(), PageState::NotUsed);
        debug_assert!(desc.zip().is_none(), "freed block {i} still owns a compressed copy");
        desc.bump_generation();
        let slot = Slot::Block(i);
        if inner.in_withdraw_zone(i) {
            inner.withdraw.push_back(slot);
        } else {
            inner.free.push_front(slot);
        }
    }

    fn scan_and_free(&self, inner: &mut InstanceInner, chunks: &ChunkSet, scan_all: bool) -> bool {
        (self.evict_from_unzip(inner) && self.free_from_unzip_lru(inner, chunks, scan_all))
            || self.free_from_common_lru(inner, chunks, scan_all)
    }

    /// Whether frames of pages with both copies should be released first.
    pub(crate) fn evict_from_unzip(&self, inner: &InstanceInner) -> bool {
        let unzip = inner.lru.unzip().len();
        unzip > 0 && unzip * 10 > inner.lru.len()
    }

    fn scan_depth(&self, scan_all: bool) -> usize {
        if scan_all {
            usize::MAX
        } else {
            self.ctx.options.lru_search_threshold
        }
    }

    /// Drops the uncompressed frame of one page from the unzip LRU tail.
    fn free_from_unzip_lru(&self, inner: &mut InstanceInner, chunks: &ChunkSet, scan_all: bool) -> bool {
        let victims: SmallVec<[Slot; 16]> = inner
            .lru
            .unzip()
            .iter_rev()
            .take(self.scan_depth(scan_all))
            .collect();
        victims
            .into_iter()
            .any(|slot| self.try_evict(inner, chunks, slot, true))
    }

    /// Evicts one clean page, scanning from the LRU tail.
    fn free_from_common_lru(&self, inner: &mut InstanceInner, chunks: &ChunkSet, scan_all: bool) -> bool {
        let depth = self.scan_depth(scan_all);
        let mut cursor = {
            let InstanceInner { lru, zips, .. } = &mut *inner;
            lru.cursor_start(Cursor::Scan, &Nodes { chunks, zips: &*zips })
        };
        let mut scanned = 0usize;
        while let Some(slot) = cursor {
            if scanned >= depth {
                break;
            }
            let prev = inner.lru.prev(slot);
            inner.lru.set_cursor(Cursor::Scan, prev);
            if self.try_evict(inner, chunks, slot, false) {
                trace!(instance = self.idx, scanned, "buf.lru.scan_freed");
                return true;
            }
            cursor = inner.lru.cursor(Cursor::Scan);
            scanned += 1;
        }
        false
    }

    /// Evicts the page at `slot` if it is clean, unfixed and not under
    /// I/O. With `keep_zip`, a page that has a compressed copy only loses
    /// its uncompressed frame.
    pub(crate) fn try_evict(&self, inner: &mut InstanceInner, chunks: &ChunkSet, slot: Slot, keep_zip: bool) -> bool {
        let zip_desc;
        let desc: &Descriptor = match slot {
            Slot::Block(i) => match chunks.block(i) {
                Some(block) => &block.desc,
                None => return false,
            },
            Slot::Zip(z) => match inner.zips.try_get(z) {
                Some(d) => {
                    zip_desc = Arc::clone(d);
                    &zip_desc
                }
                None => return false,
            },
        };
        if !desc.state().in_file() || !desc.can_relocate() {
            return false;
        }
        let id = desc.page_id();
        let Some(mut bucket) = self.hash.bucket(id).try_write() else {
            return false;
        };
        // Fixes happen under the bucket lock, so this check is final.
        if bucket.get(&id) != Some(&HashEntry::Page(slot)) || !desc.can_relocate() {
            return false;
        }
        match slot {
            Slot::Block(i) if keep_zip && desc.zip().is_some() => self.evict_frame_keep_zip(inner, chunks, &mut bucket, i),
            _ => {
                if desc.is_dirty() {
                    return false;
                }
                self.remove_hashed(inner, chunks, &mut bucket, slot, desc);
                Counters::bump(&self.counters.pages_evicted);
                true
            }
        }
    }

    /// Replaces a block that has a compressed copy by a compressed-only
    /// descriptor. A dirty frame is recompressed first so the copy is
    /// current.
    fn evict_frame_keep_zip(&self, inner: &mut InstanceInner, chunks: &ChunkSet, bucket: &mut Bucket, i: u32) -> bool {
        let block = chunks.get(i);
        let desc = &block.desc;
        let Some(zip) = desc.zip() else {
            return false;
        };
        let dirty = desc.is_dirty();
        if dirty {
            let Some(frame) = block.frame.try_read() else {
                return false;
            };
            let mut image = vec![0u8; zip.size];
            if !codec::encode_zip(self.codec(), &frame, &mut image, desc.newest_modification()) {
                return false;
            }
            drop(frame);
            self.store_zip_bytes(chunks, zip, &image);
        }

        let id = desc.page_id();
        let old_slot = Slot::Block(i);
        let zdesc = Arc::new(Descriptor::new());
        zdesc.copy_page_fields(desc);
        zdesc.set_zip(desc.take_zip());
        zdesc.transition(if dirty { PageState::ZipDirty } else { PageState::ZipPage });
        let new_slot = Slot::Zip(inner.zips.insert(zdesc));

        inner.lru.unzip_remove(old_slot);
        inner.lru.replace(old_slot, new_slot);
        inner.buddy.set_owner(zip.addr, new_slot);
        if dirty {
            let mut flush = self.flush.lock();
            flush.relocate(old_slot, new_slot);
            desc.set_oldest_modification(Lsn::ZERO);
        }
        bucket.insert(id, HashEntry::Page(new_slot));
        desc.transition(PageState::NotUsed);
        self.free_block_locked(inner, chunks, i);
        self.freed_page_clock
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Counters::bump(&self.counters.pages_evicted);
        trace!(page = %id, dirty, "buf.lru.evict_frame");
        true
    }

    /// Evicts `id` if it is resident and evictable.
    pub(crate) fn evict_page(&self, id: PageId) -> bool {
        let Some(HashEntry::Page(slot)) = self.hash.lookup(id) else {
            return false;
        };
        let mut inner = self.inner.lock();
        let chunks = self.chunks.read();
        self.try_evict(&mut inner, &chunks, slot, false)
    }

    /// Evicts every clean, unpinned page. Returns how many went.
    pub(crate) fn evict_all_clean(&self) -> usize {
        let mut inner = self.inner.lock();
        let chunks = self.chunks.read();
        let slots: Vec<Slot> = inner.lru.list().iter_rev().collect();
        let evicted = slots
            .into_iter()
            .filter(|slot| self.try_evict(&mut inner, &chunks, *slot, false))
            .count();
        debug!(instance = self.idx, evicted, "buf.lru.evict_all_clean");
        evicted
    }

    /// Pages currently fixed by some holder.
    pub(crate) fn pinned_pages(&self) -> usize {
        let inner = self.inner.lock();
        let chunks = self.chunks.read();
        let nodes = Nodes {
            chunks: &chunks,
            zips: &inner.zips,
        };
        inner
            .lru
            .list()
            .iter()
            .filter(|slot| nodes.desc(*slot).fix_count() > 0)
            .count()
    }

    /// Allocates buddy space for a compressed copy of `size` bytes,
    /// donating a fresh frame when no donated frame has room. The
    /// allocation has no owner until the caller sets one.
    pub(crate) fn alloc_zip(self: &Arc<Self>, size: usize) -> Result<ZipRef> {
        {
            let mut inner = self.inner.lock();
            let class = inner.buddy.class_for(size);
            let allowed = inner.buddy_frame_allowed();
            if let Some(addr) = inner.buddy.alloc(class, &allowed) {
                return Ok(ZipRef { addr, class, size });
            }
        }
        let block = self.get_free_block()?;
        let mut inner = self.inner.lock();
        let class = inner.buddy.class_for(size);
        block.desc.transition(PageState::Memory);
        let addr = inner.buddy.add_frame(block.slot, class);
        trace!(instance = self.idx, frame = block.slot, class, "buf.buddy.frame_added");
        Ok(ZipRef { addr, class, size })
    }

    /// Releases a compressed copy. Buddies blocking a merge may be moved;
    /// a frame that becomes entirely free goes back to the free list.
    pub(crate) fn free_zip_locked(&self, inner: &mut InstanceInner, chunks: &ChunkSet, zip: ZipRef) {
        let freed_frame = {
            let allowed = inner.buddy_frame_allowed();
            let InstanceInner { buddy, zips, .. } = &mut *inner;
            let nodes = Nodes { chunks, zips: &*zips };
            let mut relocate = |owner: Slot, src: BuddyAddr, dst: BuddyAddr, class: usize| {
                self.relocate_zip_bytes(chunks, &nodes, owner, src, dst, class)
            };
            buddy.free(zip.addr, zip.class, &allowed, &mut relocate)
        };
        if let Some(frame) = freed_frame {
            chunks.get(frame).desc.transition(PageState::NotUsed);
            self.free_block_locked(inner, chunks, frame);
            trace!(instance = self.idx, frame, "buf.buddy.frame_freed");
        }
    }

    /// Moves the compressed copy of `owner` from `src` to `dst`. Fails if
    /// the page is under I/O or its bucket is busy.
    pub(crate) fn relocate_zip_bytes(
        &self,
        chunks: &ChunkSet,
        nodes: &Nodes<'_>,
        owner: Slot,
        src: BuddyAddr,
        dst: BuddyAddr,
        class: usize,
    ) -> bool {
        let Some(desc) = nodes.try_desc(owner) else {
            return false;
        };
        let Some(zip) = desc.zip() else {
            return false;
        };
        if zip.addr != src || desc.io_fix() != IoFix::None {
            return false;
        }
        let id = desc.page_id();
        let Some(_bucket) = self.hash.bucket(id).try_write() else {
            return false;
        };
        if desc.io_fix() != IoFix::None {
            return false;
        }
        let len = BuddyAllocator::size_of(class);
        let bytes = {
            let host = chunks.get(src.frame).frame.read();
            let start = src.offset as usize;
            host[start..start + len].to_vec()
        };
        {
            let mut host = chunks.get(dst.frame).frame.write();
            let start = dst.offset as usize;
            host[start..start + len].copy_from_slice(&bytes);
        }
        desc.set_zip(Some(ZipRef { addr: dst, ..zip }));
        true
    }
}
