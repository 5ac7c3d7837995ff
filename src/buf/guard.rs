//! Access handles returned by the pool.
//!
//! A [`PageGuard`] pins a page for as long as it lives and optionally holds
//! its content latch. Dropping the guard releases the latch first, then the
//! pin.

use std::fmt;
use std::mem;
use std::sync::Arc;

use super::arena::BlockRef;
use super::descriptor::{FrameRead, FrameWrite};
use super::instance::Instance;
use crate::types::page;
use crate::types::{IoStatus, Lsn, PageId};

/// How a fetch treats a page that is not resident, and whether it latches.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FetchMode {
    /// Read the page if needed.
    Get,
    /// Only return a resident page.
    IfInPool,
    /// Like `IfInPool`, without counting as an access for LRU aging.
    PeekIfInPool,
    /// Read if needed but do not latch.
    NoLatch,
    /// Return a resident page, or register a watch sentinel.
    IfInPoolOrWatch,
    /// Read if needed and hand out pages that fail their checksum; the
    /// caller knows the page may have been freed.
    PossiblyFreed,
    /// Evict the page if it is resident; never returns a page.
    EvictIfInPool,
}

/// Content latch a guard holds.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LatchMode {
    /// Pinned only.
    None,
    /// Shared latch; many readers.
    Shared,
    /// Exclusive latch; required to modify the frame.
    Exclusive,
}

/// Lightweight reference for re-finding a page without a hash lookup.
///
/// A handle stays valid while the page keeps its block. Eviction, a
/// relocation or any withdraw phase of a resize makes it stale.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PageHandle {
    pub(crate) page_id: PageId,
    pub(crate) instance: usize,
    pub(crate) slot: u32,
    pub(crate) generation: u32,
    pub(crate) withdraw_clock: u64,
}

impl PageHandle {
    /// Page the handle was taken for.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }
}

enum Latch {
    None,
    Shared(FrameRead),
    Exclusive(FrameWrite),
}

/// Pinned page, optionally latched.
pub struct PageGuard {
    instance: Arc<Instance>,
    block: BlockRef,
    latch: Latch,
}

impl PageGuard {
    pub(crate) fn new(instance: Arc<Instance>, block: BlockRef, mode: LatchMode) -> Self {
        let latch = Self::acquire(&block, mode);
        Self {
            instance,
            block,
            latch,
        }
    }

    pub(crate) fn exclusive(instance: Arc<Instance>, block: BlockRef, latch: FrameWrite) -> Self {
        Self {
            instance,
            block,
            latch: Latch::Exclusive(latch),
        }
    }

    fn acquire(block: &BlockRef, mode: LatchMode) -> Latch {
        match mode {
            LatchMode::None => Latch::None,
            LatchMode::Shared => Latch::Shared(block.frame.read_arc()),
            LatchMode::Exclusive => Latch::Exclusive(block.frame.write_arc()),
        }
    }

    /// Page held by the guard.
    pub fn page_id(&self) -> PageId {
        self.block.desc.page_id()
    }

    /// Latch currently held.
    pub fn latch_mode(&self) -> LatchMode {
        match self.latch {
            Latch::None => LatchMode::None,
            Latch::Shared(_) => LatchMode::Shared,
            Latch::Exclusive(_) => LatchMode::Exclusive,
        }
    }

    /// Takes a latch on a guard that holds none.
    ///
    /// # Panics
    ///
    /// If the guard already holds a latch.
    pub fn latch(&mut self, mode: LatchMode) {
        assert!(
            matches!(self.latch, Latch::None),
            "page {} is already latched",
            self.page_id()
        );
        self.latch = Self::acquire(&self.block, mode);
    }

    /// Releases the latch but keeps the pin.
    pub fn unlatch(&mut self) {
        self.latch = Latch::None;
    }

    /// Page bytes.
    ///
    /// # Panics
    ///
    /// If the guard holds no latch.
    pub fn data(&self) -> &[u8] {
        match &self.latch {
            Latch::Shared(frame) => frame,
            Latch::Exclusive(frame) => frame,
            Latch::None => panic!("page {} read without a latch", self.page_id()),
        }
    }

    /// Mutable page bytes.
    ///
    /// # Panics
    ///
    /// Unless the guard holds the exclusive latch.
    pub fn data_mut(&mut self) -> &mut [u8] {
        let id = self.page_id();
        match &mut self.latch {
            Latch::Exclusive(frame) => frame,
            _ => panic!("page {id} modified without the exclusive latch"),
        }
    }

    /// Records a modification covering `start..=end` in the redo log. The
    /// page LSN becomes `end`; a clean page is put on the flush list at
    /// `start`.
    ///
    /// # Panics
    ///
    /// Unless the guard holds the exclusive latch.
    pub fn mark_dirty(&mut self, start: Lsn, end: Lsn) {
        let frame = self.data_mut();
        page::write_u64(frame, page::LSN, end.0);
        self.instance.note_modification(&self.block, start, end);
    }

    /// LSN stored in the page header.
    pub fn lsn(&self) -> Lsn {
        page::page_lsn(self.data())
    }

    /// Whether the page has unwritten changes.
    pub fn is_dirty(&self) -> bool {
        self.block.desc.is_dirty()
    }

    /// LSN of the first unwritten change, zero when clean.
    pub fn oldest_modification(&self) -> Lsn {
        self.block.desc.oldest_modification()
    }

    /// Outcome of the read that loaded the page.
    pub fn io_status(&self) -> IoStatus {
        self.block.desc.io_status()
    }

    /// Whether the page sits in the old LRU sublist.
    pub fn is_old(&self) -> bool {
        self.block.desc.is_old()
    }

    /// Current pin count, this guard included.
    pub fn fix_count(&self) -> u32 {
        self.block.desc.fix_count()
    }

    /// Handle for [`BufferPool::optimistic_get`](super::BufferPool::optimistic_get).
    pub fn handle(&self) -> PageHandle {
        self.instance.handle_for(&self.block)
    }

    pub(crate) fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    pub(crate) fn block(&self) -> &BlockRef {
        &self.block
    }
}

impl fmt::Debug for PageGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageGuard")
            .field("page", &self.page_id())
            .field("latch", &self.latch_mode())
            .field("fix_count", &self.fix_count())
            .finish()
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        drop(mem::replace(&mut self.latch, Latch::None));
        self.instance.release(&self.block);
    }
}

/// Block borrowed from the pool for private use, exclusively latched.
/// It is not in the page hash and goes back to the free list on drop.
pub struct ScratchBlock {
    instance: Arc<Instance>,
    block: BlockRef,
    latch: Option<FrameWrite>,
}

impl ScratchBlock {
    pub(crate) fn new(instance: Arc<Instance>, block: BlockRef, latch: FrameWrite) -> Self {
        Self {
            instance,
            block,
            latch: Some(latch),
        }
    }

    /// Block bytes.
    pub fn data(&self) -> &[u8] {
        match &self.latch {
            Some(frame) => frame,
            None => &[],
        }
    }

    /// Mutable block bytes.
    pub fn data_mut(&mut self) -> &mut [u8] {
        match &mut self.latch {
            Some(frame) => frame,
            None => &mut [],
        }
    }
}

impl Drop for ScratchBlock {
    fn drop(&mut self) {
        self.latch = None;
        self.instance.free_scratch(&self.block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::instance::tests::{fixture, options};

    #[test]
    fn guard_unpins_on_drop() {
        let fx = fixture(options(64));
        let inst = &fx.instance;
        let id = PageId::new(1, 4);
        let block = inst.fetch(id, FetchMode::Get).unwrap().unwrap();
        let mut guard = PageGuard::new(Arc::clone(inst), block.clone(), LatchMode::Shared);
        assert_eq!(guard.fix_count(), 1);
        assert_eq!(guard.latch_mode(), LatchMode::Shared);
        assert!(block.frame.try_write().is_none());
        guard.unlatch();
        assert!(block.frame.try_write().is_some());
        drop(guard);
        assert_eq!(block.desc.fix_count(), 0);
    }

    #[test]
    fn mark_dirty_stamps_lsn() {
        let fx = fixture(options(64));
        let inst = &fx.instance;
        let (block, latch) = inst.create(PageId::new(1, 8)).unwrap();
        let mut guard = PageGuard::exclusive(Arc::clone(inst), block, latch);
        guard.mark_dirty(Lsn(40), Lsn(44));
        assert_eq!(guard.lsn(), Lsn(44));
        assert_eq!(guard.oldest_modification(), Lsn(40));
        guard.mark_dirty(Lsn(50), Lsn(51));
        assert_eq!(guard.oldest_modification(), Lsn(40));
        assert!(guard.is_dirty());
    }

    #[test]
    #[should_panic(expected = "without the exclusive latch")]
    fn shared_guard_cannot_write() {
        let fx = fixture(options(64));
        let inst = &fx.instance;
        let block = inst.fetch(PageId::new(1, 1), FetchMode::Get).unwrap().unwrap();
        let mut guard = PageGuard::new(Arc::clone(inst), block, LatchMode::Shared);
        guard.data_mut()[0] = 1;
    }

    #[test]
    fn scratch_block_returns_to_free_list() {
        let fx = fixture(options(64));
        let inst = &fx.instance;
        let free_before = inst.stats().0.free_len;
        let (block, latch) = inst.alloc_scratch().unwrap();
        let mut scratch = ScratchBlock::new(Arc::clone(inst), block, latch);
        scratch.data_mut()[0] = 9;
        assert_eq!(scratch.data()[0], 9);
        assert_eq!(inst.stats().0.free_len, free_before - 1);
        drop(scratch);
        assert_eq!(inst.stats().0.free_len, free_before);
        inst.validate().unwrap();
    }
}
