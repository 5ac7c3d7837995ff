//! One pool instance: page hash, lists, arena and the fetch paths.
//!
//! Lock order, outermost first: page-hash bucket, instance mutex, chunk
//! table, flush-list mutex, descriptor metadata. Frame latches are only
//! try-locked while any of these is held. No pool lock is held while an
//! I/O is submitted.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::arena::{BlockRef, Chunk, ChunkSet, ChunkTable, Nodes, ZipSlab};
use super::buddy::{BuddyAllocator, BuddyStat};
use super::codec::{self, PageCodec};
use super::descriptor::{Descriptor, FlushType, FrameWrite, IoFix, PageState, ZipRef};
use super::flush::{FlushGates, FlushList};
use super::guard::{FetchMode, PageHandle};
use super::hash::{Bucket, HashEntry, PageHash, Watches};
use super::list::{IndexList, ListKind, Slot};
use super::lru::{self, Lru, OLD_RATIO_DIV};
use super::options::PoolOptions;
use super::stats::{Counters, InstanceStats};
use crate::primitives::aio::{IoRequest, PageIo, SpaceRegistry};
use crate::primitives::clock::Clock;
use crate::types::page::{self, SpaceInfo};
use crate::types::{BufError, IoStatus, Lsn, PageId, Result};

/// Collaborators shared by every instance of a pool.
pub(crate) struct PoolContext {
    pub(crate) options: PoolOptions,
    pub(crate) io: Arc<dyn PageIo>,
    pub(crate) spaces: Arc<dyn SpaceRegistry>,
    pub(crate) codec: Arc<dyn PageCodec>,
    pub(crate) clock: Arc<dyn Clock>,
    /// Promotion interval of old pages; 0 disables the time check.
    pub(crate) old_threshold_ms: AtomicU64,
}

/// State under the instance mutex.
pub(crate) struct InstanceInner {
    pub(crate) free: IndexList,
    pub(crate) withdraw: IndexList,
    pub(crate) lru: Lru,
    pub(crate) buddy: BuddyAllocator,
    pub(crate) zips: ZipSlab,
    /// Blocks at or past this slot are being withdrawn by a shrink.
    pub(crate) withdraw_target: Option<u32>,
}

impl InstanceInner {
    pub(crate) fn in_withdraw_zone(&self, slot: u32) -> bool {
        self.withdraw_target.map_or(false, |target| slot >= target)
    }

    /// Frames a new buddy allocation may live in.
    pub(crate) fn buddy_frame_allowed(&self) -> impl Fn(u32) -> bool {
        let target = self.withdraw_target;
        move |frame| target.map_or(true, |t| frame < t)
    }
}

pub(crate) enum Lookup {
    Block(BlockRef),
    Zip,
    Miss,
}

pub(crate) struct Instance {
    pub(crate) idx: usize,
    pub(crate) page_size: usize,
    pub(crate) ctx: Arc<PoolContext>,
    pub(crate) hash: PageHash,
    pub(crate) watches: Watches,
    pub(crate) inner: Mutex<InstanceInner>,
    pub(crate) chunks: ChunkTable,
    pub(crate) flush: Mutex<FlushList>,
    pub(crate) gates: FlushGates,
    pub(crate) counters: Counters,
    /// Evictions so far; drives the "young enough" test.
    pub(crate) freed_page_clock: AtomicU32,
    /// Copy of the LRU ratio for lock-free peeks.
    pub(crate) old_ratio: AtomicUsize,
    pub(crate) curr_size: AtomicUsize,
    pub(crate) withdraw_clock: AtomicU64,
    pub(crate) withdrawing: AtomicBool,
}

impl Instance {
    pub(crate) fn new(idx: usize, ctx: Arc<PoolContext>, n_chunks: usize) -> Result<Self> {
        let options = &ctx.options;
        let chunk_pages = options.chunk_pages;
        let mut table = ChunkTable::new(chunk_pages);
        let mut free = IndexList::new(ListKind::Free);
        {
            let chunks = table.get_mut();
            for c in 0..n_chunks {
                let base = (c * chunk_pages) as u32;
                chunks.push(Chunk::allocate(base, chunk_pages, options.page_size)?);
            }
            for block in chunks.iter() {
                free.push_back(Slot::Block(block.slot));
            }
        }
        let ratio = lru::ratio_from_pct(options.lru_old_pct);
        let curr_size = n_chunks * chunk_pages;
        debug!(instance = idx, pages = curr_size, "buf.instance.create");
        Ok(Self {
            idx,
            page_size: options.page_size,
            hash: PageHash::new(options.page_hash_locks),
            watches: Watches::new(options.watch_slots),
            inner: Mutex::new(InstanceInner {
                free,
                withdraw: IndexList::new(ListKind::Withdraw),
                lru: Lru::new(ratio, options.lru_old_min_len),
                buddy: BuddyAllocator::new(options.page_size),
                zips: ZipSlab::default(),
                withdraw_target: None,
            }),
            chunks: table,
            flush: Mutex::new(FlushList::new()),
            gates: FlushGates::new(),
            counters: Counters::default(),
            freed_page_clock: AtomicU32::new(0),
            old_ratio: AtomicUsize::new(ratio),
            curr_size: AtomicUsize::new(curr_size),
            withdraw_clock: AtomicU64::new(0),
            withdrawing: AtomicBool::new(false),
            ctx,
        })
    }

    pub(crate) fn codec(&self) -> &dyn PageCodec {
        &*self.ctx.codec
    }

    pub(crate) fn space(&self, id: PageId) -> Result<SpaceInfo> {
        let space = self
            .ctx
            .spaces
            .space(id.space)
            .ok_or(BufError::TablespaceDeleted(id.space))?;
        if space.page_size != self.page_size {
            return Err(BufError::Invalid("tablespace page size differs from the pool page size"));
        }
        Ok(space)
    }

    pub(crate) fn lru_add(&self, inner: &mut InstanceInner, chunks: &ChunkSet, slot: Slot, old: bool) {
        let InstanceInner { lru, zips, .. } = inner;
        let nodes = Nodes { chunks, zips: &*zips };
        if lru.add_block(slot, old, &nodes) {
            let clock = self.freed_page_clock.load(Ordering::Relaxed) & (u32::MAX >> 1);
            nodes.desc(slot).set_freed_page_clock(clock);
        }
    }

    pub(crate) fn lru_remove(&self, inner: &mut InstanceInner, chunks: &ChunkSet, slot: Slot) {
        let InstanceInner { lru, zips, .. } = inner;
        lru.remove(slot, &Nodes { chunks, zips: &*zips });
    }

    fn lru_make_young(&self, inner: &mut InstanceInner, chunks: &ChunkSet, slot: Slot) -> bool {
        let was_old = {
            let InstanceInner { lru, zips, .. } = &mut *inner;
            lru.make_young(slot, &Nodes { chunks, zips: &*zips })
        };
        let clock = self.freed_page_clock.load(Ordering::Relaxed) & (u32::MAX >> 1);
        Nodes {
            chunks,
            zips: &inner.zips,
        }
        .desc(slot)
        .set_freed_page_clock(clock);
        was_old
    }

    /// Looks `id` up and fixes a resident block.
    fn lookup_fix(&self, id: PageId) -> Lookup {
        let bucket = self.hash.bucket(id).read();
        match bucket.get(&id) {
            Some(HashEntry::Page(Slot::Block(i))) => {
                let chunks = self.chunks.read();
                let block = chunks
                    .block_ref(*i)
                    .unwrap_or_else(|| panic!("hashed block {i} outside the arena"));
                block.desc.fix();
                Lookup::Block(block)
            }
            Some(HashEntry::Page(Slot::Zip(_))) => Lookup::Zip,
            _ => Lookup::Miss,
        }
    }

    /// Fixes and returns the block holding `id`, reading it if needed.
    /// `None` when the mode does not load missing pages.
    pub(crate) fn fetch(self: &Arc<Self>, id: PageId, mode: FetchMode) -> Result<Option<BlockRef>> {
        let space = self.space(id)?;
        Counters::bump(&self.counters.page_gets);
        let block = loop {
            let found = match self.lookup_fix(id) {
                Lookup::Miss if mode == FetchMode::IfInPoolOrWatch => self.watch_set(id)?,
                other => other,
            };
            match found {
                Lookup::Block(block) => break block,
                Lookup::Zip if mode == FetchMode::EvictIfInPool => {
                    self.evict_page(id);
                    return Ok(None);
                }
                Lookup::Zip => {
                    if let Some(block) = self.unzip(id)? {
                        break block;
                    }
                }
                Lookup::Miss => match mode {
                    FetchMode::IfInPool
                    | FetchMode::PeekIfInPool
                    | FetchMode::EvictIfInPool
                    | FetchMode::IfInPoolOrWatch => return Ok(None),
                    FetchMode::Get | FetchMode::NoLatch | FetchMode::PossiblyFreed => {
                        if let Some(block) = self.read_page(id, &space)? {
                            break block;
                        }
                    }
                },
            }
        };

        if mode == FetchMode::EvictIfInPool {
            block.desc.unfix();
            self.evict_page(id);
            return Ok(None);
        }

        if block.desc.io_fix() == IoFix::Read {
            // The pending read owns the exclusive latch until it completes.
            drop(block.frame.read());
        }
        let status = block.desc.io_status();
        if status != IoStatus::Success
            && !(mode == FetchMode::PossiblyFreed && status == IoStatus::PageCorrupted)
        {
            self.release(&block);
            status.into_result(id)?;
        }

        if mode != FetchMode::PeekIfInPool {
            self.note_access(&block);
        }
        Ok(Some(block))
    }

    fn note_access(&self, block: &BlockRef) {
        let now = self.ctx.clock.now_ms();
        block.desc.set_accessed(now);
        if self.peek_if_too_old(&block.desc, now) {
            self.make_young(block.slot());
        }
    }

    /// Moves a resident page to the young end.
    pub(crate) fn make_young(&self, slot: Slot) {
        let mut inner = self.inner.lock();
        let chunks = self.chunks.read();
        if inner.lru.contains(slot) && self.lru_make_young(&mut inner, &chunks, slot) {
            Counters::bump(&self.counters.made_young);
        }
    }

    /// Whether an accessed page should move to the young end.
    pub(crate) fn peek_if_too_old(&self, desc: &Descriptor, now_ms: u64) -> bool {
        if self.freed_page_clock.load(Ordering::Relaxed) == 0 {
            // Nothing evicted yet; aging has no meaning.
            return false;
        }
        let threshold = self.ctx.old_threshold_ms.load(Ordering::Relaxed);
        if threshold != 0 && desc.is_old() {
            let access = desc.access_time();
            if access != 0 && now_ms.saturating_sub(access) >= threshold {
                return true;
            }
            Counters::bump(&self.counters.not_made_young);
            return false;
        }
        !self.peek_if_young(desc)
    }

    /// Whether `desc` is still within the young quarter of the list,
    /// measured in evictions since it was last put at the head.
    fn peek_if_young(&self, desc: &Descriptor) -> bool {
        let clock = (self.freed_page_clock.load(Ordering::Relaxed) & (u32::MAX >> 1)) as usize;
        let ratio = self.old_ratio.load(Ordering::Relaxed);
        let size = self.curr_size.load(Ordering::Relaxed);
        clock < desc.freed_page_clock() as usize + size * (OLD_RATIO_DIV - ratio) / (OLD_RATIO_DIV * 4)
    }

    /// Loads `id` into a fresh block and submits the read. The returned
    /// block is fixed and its latch is owned by the pending read. `None`
    /// when another thread loaded the page first.
    fn read_page(self: &Arc<Self>, id: PageId, space: &SpaceInfo) -> Result<Option<BlockRef>> {
        let block = self.get_free_block()?;
        let zip = if space.is_zip() {
            match self.alloc_zip(space.zip_size) {
                Ok(zip) => Some(zip),
                Err(err) => {
                    self.discard_unused(&block, None);
                    return Err(err);
                }
            }
        } else {
            None
        };

        let bucket_lock = self.hash.bucket(id);
        let mut bucket = bucket_lock.write();
        let mut inner = self.inner.lock();
        let chunks = self.chunks.read();
        let inherit = match bucket.get(&id).copied() {
            Some(HashEntry::Page(_)) => {
                self.release_unused_locked(&mut inner, &chunks, &block, zip);
                return Ok(None);
            }
            Some(HashEntry::Watch(w)) => self.watches.take(w),
            None => 0,
        };

        let desc = &block.desc;
        desc.init_for_page(id);
        desc.transition(PageState::FilePage);
        desc.fix_by(1 + inherit);
        let claimed = desc.begin_io(IoFix::Read);
        debug_assert!(claimed);
        let latch = block
            .frame
            .try_write_arc()
            .unwrap_or_else(|| panic!("free block {} is latched", block.slot));
        let slot = block.slot();
        if let Some(zip) = zip {
            desc.set_zip(Some(zip));
            inner.buddy.set_owner(zip.addr, slot);
        }
        self.lru_add(&mut inner, &chunks, slot, true);
        if zip.is_some() {
            inner.lru.unzip_add(slot, true);
        }
        bucket.insert(id, HashEntry::Page(slot));
        self.counters.pending_reads.fetch_add(1, Ordering::Relaxed);
        drop(chunks);
        drop(inner);
        drop(bucket);

        debug!(page = %id, slot = block.slot, watchers = inherit, "buf.read.submit");
        self.submit_read(id, *space, block.clone(), latch);
        Ok(Some(block))
    }

    fn submit_read(self: &Arc<Self>, id: PageId, space: SpaceInfo, block: BlockRef, mut latch: FrameWrite) {
        let len = space.physical_size();
        let req = IoRequest {
            page_id: id,
            offset: u64::from(id.page_no) * len as u64,
            buf: vec![0u8; len],
        };
        let instance = Arc::clone(self);
        self.ctx.io.submit_read(
            req,
            Box::new(move |req, result| {
                let status = match result {
                    Ok(()) => instance.decode_read(id, &space, &block, &req.buf, &mut latch),
                    Err(BufError::TablespaceDeleted(_)) => IoStatus::TablespaceDeleted,
                    Err(err) => {
                        warn!(page = %id, error = %err, "buf.read.io_failed");
                        IoStatus::IoError
                    }
                };
                instance.complete_read(&block, status, latch);
            }),
        );
    }

    fn decode_read(&self, id: PageId, space: &SpaceInfo, block: &BlockRef, image: &[u8], frame: &mut [u8]) -> IoStatus {
        let verify = self.ctx.options.verify_checksums;
        if !space.is_zip() {
            return codec::decode_page(id, space, self.codec(), verify, image, frame);
        }
        let Some(zip) = block.desc.zip() else {
            return IoStatus::PageCorrupted;
        };
        let status = codec::decode_zip(id, self.codec(), verify, image, frame);
        self.store_zip_bytes(&self.chunks.read(), zip, image);
        status
    }

    fn complete_read(&self, block: &BlockRef, status: IoStatus, latch: FrameWrite) {
        let id = block.desc.page_id();
        block.desc.set_io_status(status);
        if status == IoStatus::Success {
            Counters::bump(&self.counters.pages_read);
        } else {
            Counters::bump(&self.counters.read_errors);
            warn!(page = %id, status = ?status, "buf.read.failed");
        }
        self.counters.pending_reads.fetch_sub(1, Ordering::Relaxed);
        block.desc.end_io();
        drop(latch);
        trace!(page = %id, "buf.read.complete");
    }

    /// Turns a compressed-only page back into a block. `None` when the
    /// page changed under us and the lookup must be retried.
    fn unzip(self: &Arc<Self>, id: PageId) -> Result<Option<BlockRef>> {
        let block = self.get_free_block()?;
        let mut bucket = self.hash.bucket(id).write();
        let mut inner = self.inner.lock();
        let chunks = self.chunks.read();

        let Some(HashEntry::Page(Slot::Zip(z))) = bucket.get(&id).copied() else {
            self.release_unused_locked(&mut inner, &chunks, &block, None);
            return Ok(None);
        };
        let zdesc = Arc::clone(inner.zips.get(z));
        if zdesc.io_fix() != IoFix::None {
            // A write of the compressed copy is in flight.
            self.release_unused_locked(&mut inner, &chunks, &block, None);
            drop(chunks);
            drop(inner);
            drop(bucket);
            std::thread::yield_now();
            return Ok(None);
        }
        let Some(zip) = zdesc.take_zip() else {
            panic!("compressed-only page {id} has no compressed copy");
        };
        let Some(mut latch) = block.frame.try_write_arc() else {
            panic!("free block {} is latched", block.slot);
        };
        let old_slot = Slot::Zip(z);
        let slot = block.slot();
        let desc = &block.desc;
        let dirty = zdesc.is_dirty();

        desc.copy_page_fields(&zdesc);
        desc.set_zip(Some(zip));
        desc.transition(PageState::FilePage);
        desc.fix();
        inner.lru.replace(old_slot, slot);
        inner.lru.unzip_add(slot, false);
        inner.buddy.set_owner(zip.addr, slot);
        if dirty {
            let mut flush = self.flush.lock();
            flush.relocate(old_slot, slot);
            zdesc.set_oldest_modification(Lsn::ZERO);
        }
        bucket.insert(id, HashEntry::Page(slot));
        zdesc.transition(PageState::NotUsed);
        inner.zips.remove(z);

        let image = self.zip_bytes(&chunks, zip);
        let status = codec::decode_zip(id, self.codec(), self.ctx.options.verify_checksums, &image, &mut latch);
        desc.set_io_status(status);
        Counters::bump(&self.counters.unzips);
        drop(latch);
        debug!(page = %id, slot = block.slot, ?status, "buf.unzip");
        Ok(Some(block))
    }

    /// Copies the compressed image out of its buddy frame.
    pub(crate) fn zip_bytes(&self, chunks: &ChunkSet, zip: ZipRef) -> Vec<u8> {
        let host = chunks.get(zip.addr.frame);
        let frame = host.frame.read();
        let start = zip.addr.offset as usize;
        frame[start..start + zip.size].to_vec()
    }

    pub(crate) fn store_zip_bytes(&self, chunks: &ChunkSet, zip: ZipRef, bytes: &[u8]) {
        let host = chunks.get(zip.addr.frame);
        let mut frame = host.frame.write();
        let start = zip.addr.offset as usize;
        frame[start..start + zip.size].copy_from_slice(&bytes[..zip.size]);
    }

    /// Creates `id` without reading it. Returns the block fixed and
    /// exclusively latched, with the frame zeroed and its header set.
    pub(crate) fn create(self: &Arc<Self>, id: PageId) -> Result<(BlockRef, FrameWrite)> {
        let space = self.space(id)?;
        loop {
            let block = self.get_free_block()?;
            let zip = if space.is_zip() {
                match self.alloc_zip(space.zip_size) {
                    Ok(zip) => Some(zip),
                    Err(err) => {
                        self.discard_unused(&block, None);
                        return Err(err);
                    }
                }
            } else {
                None
            };

            let mut bucket = self.hash.bucket(id).write();
            let mut inner = self.inner.lock();
            let chunks = self.chunks.read();
            let inherit = match bucket.get(&id).copied() {
                Some(HashEntry::Page(Slot::Block(i))) => {
                    let existing = chunks.get_ref(i);
                    existing.desc.fix();
                    self.release_unused_locked(&mut inner, &chunks, &block, zip);
                    drop(chunks);
                    drop(inner);
                    drop(bucket);
                    let mut latch = existing.frame.write_arc();
                    existing.desc.set_io_status(IoStatus::Success);
                    latch.fill(0);
                    page::init_header(&mut latch, id);
                    debug!(page = %id, "buf.page.recreate");
                    return Ok((existing, latch));
                }
                Some(HashEntry::Page(Slot::Zip(z))) => {
                    let zdesc = Arc::clone(inner.zips.get(z));
                    if zdesc.io_fix() != IoFix::None {
                        self.release_unused_locked(&mut inner, &chunks, &block, zip);
                        drop(chunks);
                        drop(inner);
                        drop(bucket);
                        std::thread::yield_now();
                        continue;
                    }
                    // The new page replaces the compressed copy entirely.
                    if zdesc.is_dirty() {
                        let mut flush = self.flush.lock();
                        flush.remove(Slot::Zip(z));
                        zdesc.set_oldest_modification(Lsn::ZERO);
                    }
                    self.remove_hashed(&mut inner, &chunks, &mut bucket, Slot::Zip(z), &zdesc);
                    0
                }
                Some(HashEntry::Watch(w)) => self.watches.take(w),
                None => 0,
            };

            let slot = block.slot();
            let desc = &block.desc;
            desc.init_for_page(id);
            desc.transition(PageState::FilePage);
            desc.fix_by(1 + inherit);
            let latch = block
                .frame
                .try_write_arc()
                .unwrap_or_else(|| panic!("free block {} is latched", block.slot));
            if let Some(zip) = zip {
                desc.set_zip(Some(zip));
                inner.buddy.set_owner(zip.addr, slot);
            }
            self.lru_add(&mut inner, &chunks, slot, false);
            if zip.is_some() {
                inner.lru.unzip_add(slot, false);
            }
            bucket.insert(id, HashEntry::Page(slot));
            desc.set_accessed(self.ctx.clock.now_ms());
            Counters::bump(&self.counters.pages_created);
            drop(chunks);
            drop(inner);
            drop(bucket);

            let mut latch = latch;
            latch.fill(0);
            page::init_header(&mut latch, id);
            debug!(page = %id, slot = block.slot, "buf.page.create");
            return Ok((block, latch));
        }
    }

    /// Registers interest in `id`: returns the block if it is resident,
    /// otherwise leaves a sentinel in the hash.
    fn watch_set(&self, id: PageId) -> Result<Lookup> {
        let mut bucket = self.hash.bucket(id).write();
        match bucket.get(&id).copied() {
            Some(HashEntry::Page(Slot::Block(i))) => {
                let block = self.chunks.read().get_ref(i);
                block.desc.fix();
                Ok(Lookup::Block(block))
            }
            Some(HashEntry::Page(Slot::Zip(_))) => Ok(Lookup::Zip),
            Some(HashEntry::Watch(w)) => {
                self.watches.add_watcher(w);
                Ok(Lookup::Miss)
            }
            None => {
                let w = self
                    .watches
                    .acquire(id)
                    .ok_or(BufError::OutOfMemory("watch sentinels exhausted"))?;
                bucket.insert(id, HashEntry::Watch(w));
                trace!(page = %id, slot = w, "buf.watch.set");
                Ok(Lookup::Miss)
            }
        }
    }

    /// Drops one watcher of `id`. If the page was loaded meanwhile, the
    /// fix it inherited from the watch is released instead.
    pub(crate) fn watch_unset(&self, id: PageId) {
        let mut bucket = self.hash.bucket(id).write();
        match bucket.get(&id).copied() {
            Some(HashEntry::Watch(w)) => {
                if self.watches.remove_watcher(w) {
                    bucket.remove(&id);
                    trace!(page = %id, "buf.watch.cleared");
                }
            }
            Some(HashEntry::Page(Slot::Block(i))) => {
                let block = self.chunks.read().get_ref(i);
                drop(bucket);
                self.release(&block);
            }
            other => debug_assert!(false, "watch_unset of {id} found {other:?}"),
        }
    }

    /// True once a real page replaced the sentinel of `id`.
    pub(crate) fn watch_occurred(&self, id: PageId) -> bool {
        matches!(self.hash.lookup(id), Some(HashEntry::Page(_)))
    }

    /// Unfixes a block handed out by a fetch. A page whose read failed is
    /// dropped from the pool by its last holder.
    pub(crate) fn release(&self, block: &BlockRef) {
        if block.desc.unfix() == 0 && block.desc.io_status() != IoStatus::Success {
            self.discard_failed(block);
        }
    }

    fn discard_failed(&self, block: &BlockRef) {
        let desc = &block.desc;
        let id = desc.page_id();
        let slot = block.slot();
        let mut bucket = self.hash.bucket(id).write();
        let mut inner = self.inner.lock();
        if bucket.get(&id) != Some(&HashEntry::Page(slot))
            || desc.state() != PageState::FilePage
            || desc.io_status() == IoStatus::Success
            || desc.is_dirty()
            || !desc.can_relocate()
        {
            return;
        }
        let chunks = self.chunks.read();
        debug!(page = %id, status = ?desc.io_status(), "buf.read.discard");
        self.remove_hashed(&mut inner, &chunks, &mut bucket, slot, desc);
    }

    /// Unlinks a clean, unfixed page from the hash and the LRU and frees
    /// its storage.
    pub(crate) fn remove_hashed(
        &self,
        inner: &mut InstanceInner,
        chunks: &ChunkSet,
        bucket: &mut Bucket,
        slot: Slot,
        desc: &Descriptor,
    ) {
        let id = desc.page_id();
        desc.transition(PageState::RemoveHash);
        bucket.remove(&id);
        self.lru_remove(inner, chunks, slot);
        self.freed_page_clock.fetch_add(1, Ordering::Relaxed);
        if let Some(zip) = desc.take_zip() {
            self.free_zip_locked(inner, chunks, zip);
        }
        desc.transition(PageState::NotUsed);
        match slot {
            Slot::Block(i) => self.free_block_locked(inner, chunks, i),
            Slot::Zip(z) => {
                inner.zips.remove(z);
            }
        }
        trace!(page = %id, ?slot, "buf.lru.removed");
    }

    /// Takes a block out of the free list path that turned out unneeded.
    fn discard_unused(&self, block: &BlockRef, zip: Option<ZipRef>) {
        let mut inner = self.inner.lock();
        let chunks = self.chunks.read();
        self.release_unused_locked(&mut inner, &chunks, block, zip);
    }

    fn release_unused_locked(&self, inner: &mut InstanceInner, chunks: &ChunkSet, block: &BlockRef, zip: Option<ZipRef>) {
        if let Some(zip) = zip {
            self.free_zip_locked(inner, chunks, zip);
        }
        block.desc.transition(PageState::NotUsed);
        self.free_block_locked(inner, chunks, block.slot);
    }

    /// Takes a free block for private use (not hashed, not on any list).
    pub(crate) fn alloc_scratch(self: &Arc<Self>) -> Result<(BlockRef, FrameWrite)> {
        let block = self.get_free_block()?;
        block.desc.transition(PageState::Memory);
        let latch = block
            .frame
            .try_write_arc()
            .unwrap_or_else(|| panic!("free block {} is latched", block.slot));
        Ok((block, latch))
    }

    pub(crate) fn free_scratch(&self, block: &BlockRef) {
        let mut inner = self.inner.lock();
        let chunks = self.chunks.read();
        block.desc.transition(PageState::NotUsed);
        self.free_block_locked(&mut inner, &chunks, block.slot);
    }

    /// Records a change made under the exclusive latch: the page LSN moves
    /// to `end`, and a clean page joins the flush list at `start`.
    pub(crate) fn note_modification(&self, block: &BlockRef, start: Lsn, end: Lsn) {
        let desc = &block.desc;
        debug_assert!(start <= end, "modification range {start}..{end} reversed");
        desc.set_newest_modification(end);
        if desc.oldest_modification().is_zero() {
            let mut flush = self.flush.lock();
            flush.insert(block.slot(), start);
            desc.set_oldest_modification(start);
        }
    }

    /// Handle for revalidating `block` later without a hash lookup.
    pub(crate) fn handle_for(&self, block: &BlockRef) -> PageHandle {
        PageHandle {
            page_id: block.desc.page_id(),
            instance: self.idx,
            slot: block.slot,
            generation: block.desc.generation(),
            withdraw_clock: self.withdraw_clock.load(Ordering::Acquire),
        }
    }

    /// Fixes the block behind `handle` if it still holds the same page.
    pub(crate) fn optimistic_get(&self, handle: &PageHandle) -> Result<BlockRef> {
        let stale = || BufError::StaleHandle(handle.page_id);
        if self.withdraw_clock.load(Ordering::Acquire) != handle.withdraw_clock {
            return Err(stale());
        }
        let bucket = self.hash.bucket(handle.page_id).read();
        if bucket.get(&handle.page_id) != Some(&HashEntry::Page(Slot::Block(handle.slot))) {
            return Err(stale());
        }
        let block = self.chunks.read().block_ref(handle.slot).ok_or_else(stale)?;
        if block.desc.generation() != handle.generation {
            return Err(stale());
        }
        block.desc.fix();
        drop(bucket);
        if block.desc.io_status() != IoStatus::Success {
            self.release(&block);
            return Err(stale());
        }
        self.note_access(&block);
        Ok(block)
    }

    pub(crate) fn set_old_ratio(&self, ratio: usize) -> bool {
        let mut inner = self.inner.lock();
        let chunks = self.chunks.read();
        let InstanceInner { lru, zips, .. } = &mut *inner;
        let changed = lru.set_ratio(ratio, &Nodes { chunks: &chunks, zips: &*zips });
        self.old_ratio.store(lru.ratio(), Ordering::Relaxed);
        changed
    }

    pub(crate) fn oldest_modification(&self) -> Option<Lsn> {
        self.flush.lock().oldest()
    }

    pub(crate) fn set_recovery_mode(&self, on: bool) {
        let mut flush = self.flush.lock();
        match (on, flush.has_rbt()) {
            (true, false) => flush.create_rbt(),
            (false, true) => flush.free_rbt(),
            _ => {}
        }
    }

    pub(crate) fn stats(&self) -> (InstanceStats, Vec<BuddyStat>) {
        let inner = self.inner.lock();
        let pool_size = self.chunks.read().n_blocks() as u64;
        let flush_list_len = self.flush.lock().len() as u64;
        let get = |c: &AtomicU64| Counters::get(c);
        let c = &self.counters;
        let stats = InstanceStats {
            pool_size,
            lru_len: inner.lru.len() as u64,
            old_len: inner.lru.old_len() as u64,
            free_len: inner.free.len() as u64,
            flush_list_len,
            unzip_lru_len: inner.lru.unzip().len() as u64,
            zip_pages: inner.zips.len() as u64,
            withdraw_len: inner.withdraw.len() as u64,
            buddy_frames: inner.buddy.n_frames() as u64,
            pending_reads: get(&c.pending_reads),
            pending_writes_lru: self.gates.in_flight(FlushType::Lru) as u64,
            pending_writes_list: self.gates.in_flight(FlushType::List) as u64,
            pending_writes_single: self.gates.in_flight(FlushType::SinglePage) as u64,
            pages_made_young: get(&c.made_young),
            pages_not_made_young: get(&c.not_made_young),
            pages_read: get(&c.pages_read),
            pages_created: get(&c.pages_created),
            pages_written: get(&c.pages_written),
            pages_evicted: get(&c.pages_evicted),
            page_gets: get(&c.page_gets),
            read_errors: get(&c.read_errors),
            write_errors: get(&c.write_errors),
            unzips: get(&c.unzips),
            freed_page_clock: u64::from(self.freed_page_clock.load(Ordering::Relaxed)),
        };
        (stats, inner.buddy.stats())
    }

    /// Cross-checks the hash, the lists and every descriptor.
    pub(crate) fn validate(&self) -> Result<()> {
        let buckets = self.hash.read_all();
        let inner = self.inner.lock();
        let chunks = self.chunks.read();
        let flush = self.flush.lock();
        let nodes = Nodes {
            chunks: &chunks,
            zips: &inner.zips,
        };
        let fail = |msg: String| BufError::Invariant(format!("instance {}: {msg}", self.idx));

        let mut hashed = 0usize;
        for bucket in &buckets {
            for (id, entry) in bucket.iter() {
                match *entry {
                    HashEntry::Page(slot) => {
                        hashed += 1;
                        let desc = nodes
                            .try_desc(slot)
                            .ok_or_else(|| fail(format!("{id} hashed to missing {slot:?}")))?;
                        if !desc.state().in_file() || desc.page_id() != *id {
                            return Err(fail(format!(
                                "{id} hashed to {slot:?} holding {} in {:?}",
                                desc.page_id(),
                                desc.state()
                            )));
                        }
                        if !inner.lru.contains(slot) {
                            return Err(fail(format!("{id} at {slot:?} is not on the LRU")));
                        }
                    }
                    HashEntry::Watch(w) => {
                        if self.watches.page_id(w) != *id {
                            return Err(fail(format!("watch {w} filed under {id}")));
                        }
                    }
                }
            }
        }

        let in_hash = |id: PageId, slot: Slot| {
            buckets[self.hash.bucket_index(id)].get(&id) == Some(&HashEntry::Page(slot))
        };
        let mut resident = 0usize;
        for block in chunks.iter() {
            let slot = Slot::Block(block.slot);
            let desc = &block.desc;
            match desc.state() {
                PageState::NotUsed => {
                    if !inner.free.contains(slot) && !inner.withdraw.contains(slot) {
                        return Err(fail(format!("unused {slot:?} is on no list")));
                    }
                }
                PageState::FilePage => {
                    resident += 1;
                    if !in_hash(desc.page_id(), slot) {
                        return Err(fail(format!("{slot:?} holds {} but is not hashed", desc.page_id())));
                    }
                    if desc.zip().is_some() != inner.lru.unzip().contains(slot) {
                        return Err(fail(format!("{slot:?} unzip LRU membership is wrong")));
                    }
                }
                PageState::Memory => {
                    if inner.buddy.owns_frame(block.slot) && inner.free.contains(slot) {
                        return Err(fail(format!("buddy frame {slot:?} is on the free list")));
                    }
                }
                state => {
                    if inner.free.contains(slot) {
                        return Err(fail(format!("{slot:?} in {state:?} is on the free list")));
                    }
                }
            }
            if desc.is_dirty() != flush.contains(slot) {
                return Err(fail(format!("{slot:?} dirty flag disagrees with the flush list")));
            }
        }
        for (z, desc) in inner.zips.iter() {
            let slot = Slot::Zip(z);
            resident += 1;
            if !matches!(desc.state(), PageState::ZipPage | PageState::ZipDirty) {
                return Err(fail(format!("{slot:?} in {:?}", desc.state())));
            }
            if (desc.state() == PageState::ZipDirty) != flush.contains(slot) {
                return Err(fail(format!("{slot:?} dirty state disagrees with the flush list")));
            }
            if !in_hash(desc.page_id(), slot) {
                return Err(fail(format!("{slot:?} holds {} but is not hashed", desc.page_id())));
            }
        }
        if resident != hashed {
            return Err(fail(format!("{resident} resident pages but {hashed} hashed")));
        }
        if inner.lru.len() != resident {
            return Err(fail(format!("LRU has {} pages, {resident} resident", inner.lru.len())));
        }
        inner.lru.check(&nodes).map_err(fail)?;
        flush.check().map_err(fail)?;
        Ok(())
    }
}
