//! The public buffer pool: a set of instances behind one API.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::codec::{PageCodec, PassthroughCodec};
use super::descriptor::FlushType;
use super::guard::{FetchMode, LatchMode, PageGuard, PageHandle, ScratchBlock};
use super::hash::HashEntry;
use super::instance::{Instance, PoolContext};
use super::lru;
use super::options::PoolOptions;
use super::resize::{ResizeController, ResizeStatus};
use super::stats::PoolStats;
use crate::primitives::aio::{InlineIo, PageIo, SpaceFiles, SpaceRegistry};
use crate::primitives::clock::{Clock, SystemClock};
use crate::types::{BufError, Lsn, PageId, Result};

/// Checkpoint rounds without progress before giving up.
const CHECKPOINT_STALL_ROUNDS: usize = 3;

/// Assembles a [`BufferPool`] from options and collaborators.
pub struct BufferPoolBuilder {
    options: PoolOptions,
    io: Arc<dyn PageIo>,
    spaces: Arc<dyn SpaceRegistry>,
    codec: Arc<dyn PageCodec>,
    clock: Arc<dyn Clock>,
}

impl BufferPoolBuilder {
    /// Pool over `io` and `spaces` with the pass-through codec and the
    /// system clock.
    pub fn new(options: PoolOptions, io: Arc<dyn PageIo>, spaces: Arc<dyn SpaceRegistry>) -> Self {
        Self {
            options,
            io,
            spaces,
            codec: Arc::new(PassthroughCodec),
            clock: Arc::new(SystemClock::new()),
        }
    }

    /// Compression and encryption hooks.
    pub fn codec(mut self, codec: Arc<dyn PageCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Time source for LRU aging.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validates the options and allocates every instance.
    pub fn build(self) -> Result<BufferPool> {
        self.options.validate()?;
        let n_chunks = self.options.chunks_per_instance();
        let ctx = Arc::new(PoolContext {
            old_threshold_ms: AtomicU64::new(self.options.lru_old_threshold_ms),
            options: self.options,
            io: self.io,
            spaces: self.spaces,
            codec: self.codec,
            clock: self.clock,
        });
        let instances = (0..ctx.options.instances)
            .map(|idx| Instance::new(idx, Arc::clone(&ctx), n_chunks).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        info!(
            instances = instances.len(),
            pages = n_chunks * ctx.options.chunk_pages * instances.len(),
            page_size = ctx.options.page_size,
            "buf.pool.open"
        );
        Ok(BufferPool {
            ctx,
            instances,
            resize: Arc::new(ResizeController::new()),
            next_scratch: AtomicUsize::new(0),
        })
    }
}

/// Page cache shared by every thread of the storage engine.
///
/// Pages are spread over instances by extent, so neighbouring pages share
/// an instance and its locks. Every accessor hands out a [`PageGuard`]
/// that unpins on drop.
pub struct BufferPool {
    ctx: Arc<PoolContext>,
    instances: Vec<Arc<Instance>>,
    resize: Arc<ResizeController>,
    next_scratch: AtomicUsize,
}

impl BufferPool {
    /// Starts a builder.
    pub fn builder(
        options: PoolOptions,
        io: Arc<dyn PageIo>,
        spaces: Arc<dyn SpaceRegistry>,
    ) -> BufferPoolBuilder {
        BufferPoolBuilder::new(options, io, spaces)
    }

    /// Pool over `files` with transfers done on the calling thread.
    pub fn with_files(options: PoolOptions, files: Arc<SpaceFiles>) -> Result<Self> {
        let io = Arc::new(InlineIo::new(Arc::clone(&files)));
        Self::builder(options, io, files).build()
    }

    /// Options the pool was built with.
    pub fn options(&self) -> &PoolOptions {
        &self.ctx.options
    }

    fn instance_for(&self, id: PageId) -> &Arc<Instance> {
        &self.instances[id.extent_fold() as usize % self.instances.len()]
    }

    /// Fixes `id` according to `mode` and latches it with `latch`.
    /// `NoLatch` always yields an unlatched guard. `None` when the mode does
    /// not load missing pages, or for `EvictIfInPool`.
    pub fn fetch(&self, id: PageId, mode: FetchMode, latch: LatchMode) -> Result<Option<PageGuard>> {
        let inst = self.instance_for(id);
        let latch = if mode == FetchMode::NoLatch {
            LatchMode::None
        } else {
            latch
        };
        Ok(inst
            .fetch(id, mode)?
            .map(|block| PageGuard::new(Arc::clone(inst), block, latch)))
    }

    fn fetch_loaded(&self, id: PageId, latch: LatchMode) -> Result<PageGuard> {
        self.fetch(id, FetchMode::Get, latch)?
            .ok_or_else(|| BufError::Invariant(format!("plain fetch of {id} returned no page")))
    }

    /// Shared-latched page, read from disk if needed.
    pub fn get(&self, id: PageId) -> Result<PageGuard> {
        self.fetch_loaded(id, LatchMode::Shared)
    }

    /// Exclusively latched page, read from disk if needed.
    pub fn get_mut(&self, id: PageId) -> Result<PageGuard> {
        self.fetch_loaded(id, LatchMode::Exclusive)
    }

    /// Zero-filled, exclusively latched page that is not read from disk.
    /// A resident copy is reused and cleared.
    pub fn create(&self, id: PageId) -> Result<PageGuard> {
        let inst = self.instance_for(id);
        let (block, latch) = inst.create(id)?;
        Ok(PageGuard::exclusive(Arc::clone(inst), block, latch))
    }

    /// Borrows a free block for private use.
    pub fn alloc_block(&self) -> Result<ScratchBlock> {
        let n = self.next_scratch.fetch_add(1, Ordering::Relaxed) % self.instances.len();
        let inst = &self.instances[n];
        let (block, latch) = inst.alloc_scratch()?;
        Ok(ScratchBlock::new(Arc::clone(inst), block, latch))
    }

    /// Re-fixes the page behind `handle` without a hash search, failing
    /// with [`BufError::StaleHandle`] if it moved.
    pub fn optimistic_get(&self, handle: &PageHandle, latch: LatchMode) -> Result<PageGuard> {
        let inst = self
            .instances
            .get(handle.instance)
            .ok_or(BufError::StaleHandle(handle.page_id))?;
        let block = inst.optimistic_get(handle)?;
        Ok(PageGuard::new(Arc::clone(inst), block, latch))
    }

    /// Like [`optimistic_get`](Self::optimistic_get), falling back to a
    /// regular fetch when the handle went stale.
    pub fn revalidate(&self, handle: &PageHandle, latch: LatchMode) -> Result<PageGuard> {
        match self.optimistic_get(handle, latch) {
            Err(BufError::StaleHandle(id)) => {
                debug!(page = %id, "buf.handle.revalidate");
                self.fetch_loaded(id, latch)
            }
            other => other,
        }
    }

    /// Drops the interest registered by an `IfInPoolOrWatch` miss.
    pub fn watch_unset(&self, id: PageId) {
        self.instance_for(id).watch_unset(id);
    }

    /// Whether the watched page was loaded since the watch was set.
    pub fn watch_occurred(&self, id: PageId) -> bool {
        self.instance_for(id).watch_occurred(id)
    }

    /// Whether `id` is resident, in either form.
    pub fn is_resident(&self, id: PageId) -> bool {
        matches!(self.instance_for(id).hash.lookup(id), Some(HashEntry::Page(_)))
    }

    /// Whether `id` is resident with unwritten changes.
    pub fn is_dirty(&self, id: PageId) -> bool {
        self.instance_for(id).is_dirty(id)
    }

    /// Moves the guarded page to the young end of the LRU.
    pub fn make_young(&self, guard: &PageGuard) {
        guard.instance().make_young(guard.block().slot());
    }

    /// Writes dirty pages older than `lsn_limit`, up to `max_pages` per
    /// instance. Instances with a list batch already running are skipped.
    pub fn flush_list(&self, lsn_limit: Lsn, max_pages: usize) -> usize {
        self.instances
            .iter()
            .filter_map(|inst| inst.flush_list_batch(lsn_limit, max_pages))
            .sum()
    }

    /// Frees blocks at the LRU tails, writing dirty pages as needed.
    /// Returns the number of pages written.
    pub fn flush_lru(&self, max_pages: usize) -> usize {
        let mut flushed = 0;
        let mut evicted = 0;
        for batch in self.instances.iter().filter_map(|inst| inst.flush_lru_batch(max_pages)) {
            flushed += batch.flushed;
            evicted += batch.evicted;
        }
        debug!(flushed, evicted, "buf.flush.lru");
        flushed
    }

    /// Writes every dirty page and waits for the writes.
    pub fn flush_all(&self) {
        for inst in &self.instances {
            inst.flush_all();
        }
    }

    /// Flushes until no page has `oldest_modification < lsn`.
    pub fn checkpoint(&self, lsn: Lsn) -> Result<()> {
        let mut stalled = 0;
        loop {
            match self.oldest_modification() {
                Some(oldest) if oldest < lsn => {}
                _ => return Ok(()),
            }
            let written = self.flush_list(lsn, usize::MAX);
            self.wait_batch_end(FlushType::List);
            if written > 0 {
                stalled = 0;
                continue;
            }
            stalled += 1;
            if stalled >= CHECKPOINT_STALL_ROUNDS {
                warn!(%lsn, oldest = ?self.oldest_modification(), "buf.flush.checkpoint_stalled");
                return Err(BufError::Io(std::io::Error::other(format!(
                    "checkpoint to {lsn} made no progress"
                ))));
            }
            self.wait_batch_end(FlushType::Lru);
            self.wait_batch_end(FlushType::SinglePage);
        }
    }

    /// Waits until no batch of `ty` runs on any instance.
    pub fn wait_batch_end(&self, ty: FlushType) {
        for inst in &self.instances {
            inst.gates.wait_end(ty);
        }
    }

    /// Smallest `oldest_modification` in the pool; `None` when clean.
    pub fn oldest_modification(&self) -> Option<Lsn> {
        self.instances.iter().filter_map(|inst| inst.oldest_modification()).min()
    }

    /// Dirty pages as a percentage of cached pages.
    pub fn modified_ratio_pct(&self) -> u64 {
        self.stats().modified_ratio_pct()
    }

    /// Number of dirty pages.
    pub fn flush_list_len(&self) -> usize {
        self.instances.iter().map(|inst| inst.flush.lock().len()).sum()
    }

    /// Switches flush lists to ordered insertion for redo apply.
    pub fn set_recovery_mode(&self, on: bool) {
        for inst in &self.instances {
            inst.set_recovery_mode(on);
        }
        info!(on, "buf.flush.recovery_mode");
    }

    /// Sets the old sublist share of the LRU, clamped to 5..=95 percent.
    /// Returns the ratio out of [`OLD_RATIO_DIV`](lru::OLD_RATIO_DIV).
    pub fn set_old_ratio_pct(&self, pct: u32) -> usize {
        let ratio = lru::ratio_from_pct(pct.clamp(5, 95));
        for inst in &self.instances {
            inst.set_old_ratio(ratio);
        }
        ratio
    }

    /// Sets how long a page must stay old before an access promotes it.
    /// Zero promotes on the first access after eviction started.
    pub fn set_old_threshold_ms(&self, ms: u64) {
        self.ctx.old_threshold_ms.store(ms, Ordering::Relaxed);
    }

    /// Counters of every instance.
    pub fn stats(&self) -> PoolStats {
        PoolStats::collect(self.instances.iter().map(|inst| inst.stats()).collect())
    }

    /// Checks the hash, lists and descriptors of every instance.
    pub fn validate(&self) -> Result<()> {
        self.instances.iter().try_for_each(|inst| inst.validate())
    }

    /// Writes all dirty pages and empties the pool. Fails if any page is
    /// pinned.
    pub fn invalidate(&self) -> Result<()> {
        if self.instances.iter().any(|inst| inst.pinned_pages() > 0) {
            return Err(BufError::Invalid("cannot invalidate a pool with pinned pages"));
        }
        self.flush_all();
        let evicted = self.evict_all_clean();
        info!(evicted, "buf.pool.invalidate");
        Ok(())
    }

    /// Evicts every clean, unpinned page. Returns how many left.
    pub fn evict_all_clean(&self) -> usize {
        self.instances.iter().map(|inst| inst.evict_all_clean()).sum()
    }

    /// Starts resizing to `target_pages` in the background.
    pub fn resize(&self, target_pages: usize) -> Result<()> {
        if target_pages == 0 {
            return Err(BufError::Invalid("pool size must be positive"));
        }
        self.resize
            .start(self.instances.clone(), self.ctx.options.clone(), target_pages)
    }

    /// Progress of the current or last resize.
    pub fn resize_status(&self) -> ResizeStatus {
        self.resize.status()
    }

    /// Blocks until the running resize, if any, finishes.
    pub fn wait_for_resize(&self) -> ResizeStatus {
        self.resize.wait()
    }

    /// Current size in pages.
    pub fn curr_size(&self) -> usize {
        self.instances
            .iter()
            .map(|inst| inst.curr_size.load(Ordering::Relaxed))
            .sum()
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("instances", &self.instances.len())
            .field("pages", &self.curr_size())
            .field("resize", &self.resize.status())
            .finish()
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        self.resize.shutdown();
    }
}
