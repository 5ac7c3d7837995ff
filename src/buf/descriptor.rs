//! Page descriptors and blocks.
//!
//! Every logically independent field is its own atomic; multi-field data
//! (the compressed-copy reference) sits behind the descriptor mutex. State
//! changes go through [`Descriptor::transition`], which rejects illegal
//! edges with a panic.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};

use super::buddy::BuddyAddr;
use crate::types::{IoStatus, Lsn, PageId};

/// Lifecycle state of a descriptor.
#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PageState {
    /// On the free list.
    NotUsed = 0,
    /// Taken off the free list, not yet assigned.
    ReadyForUse = 1,
    /// Scratch block (also buddy allocator frames).
    Memory = 2,
    /// Resident page backed by a file.
    FilePage = 3,
    /// Clean compressed-only page.
    ZipPage = 4,
    /// Dirty compressed-only page.
    ZipDirty = 5,
    /// Being unlinked from the page hash.
    RemoveHash = 6,
}

impl PageState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => PageState::NotUsed,
            1 => PageState::ReadyForUse,
            2 => PageState::Memory,
            3 => PageState::FilePage,
            4 => PageState::ZipPage,
            5 => PageState::ZipDirty,
            6 => PageState::RemoveHash,
            other => panic!("corrupt page state byte {other}"),
        }
    }

    /// Whether `self -> to` is a legal edge.
    pub fn can_transition(self, to: PageState) -> bool {
        use PageState::*;
        matches!(
            (self, to),
            (NotUsed, ReadyForUse)
                | (NotUsed, ZipPage)
                | (NotUsed, ZipDirty)
                | (ReadyForUse, Memory)
                | (ReadyForUse, FilePage)
                | (ReadyForUse, NotUsed)
                | (Memory, NotUsed)
                | (FilePage, NotUsed)
                | (FilePage, RemoveHash)
                | (ZipPage, ZipDirty)
                | (ZipDirty, ZipPage)
                | (ZipPage, RemoveHash)
                | (ZipDirty, RemoveHash)
                | (ZipPage, NotUsed)
                | (ZipDirty, NotUsed)
                | (RemoveHash, NotUsed)
        )
    }

    /// Resident file page, compressed or not.
    pub fn in_file(self) -> bool {
        matches!(
            self,
            PageState::FilePage | PageState::ZipPage | PageState::ZipDirty
        )
    }

    fn leaves_residency(self, to: PageState) -> bool {
        self.in_file() && matches!(to, PageState::NotUsed | PageState::RemoveHash)
    }
}

/// Pending I/O on a descriptor.
#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum IoFix {
    /// No I/O in flight.
    None = 0,
    /// Read in flight; the frame latch is held exclusively.
    Read = 1,
    /// Write in flight; the frame latch is held shared.
    Write = 2,
}

impl IoFix {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => IoFix::None,
            1 => IoFix::Read,
            _ => IoFix::Write,
        }
    }
}

/// Kind of write-back that issued a write.
#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum FlushType {
    /// Near the LRU tail, to replenish the free list.
    Lru = 0,
    /// Checkpoint order from the flush list.
    List = 1,
    /// One page, synchronously, for a stalled free-block request.
    SinglePage = 2,
}

impl FlushType {
    pub(crate) const ALL: [FlushType; 3] = [FlushType::Lru, FlushType::List, FlushType::SinglePage];

    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(FlushType::Lru),
            1 => Some(FlushType::List),
            2 => Some(FlushType::SinglePage),
            _ => None,
        }
    }
}

const NO_FLUSH_TYPE: u8 = u8::MAX;

/// Location of a compressed copy inside the buddy allocator.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) struct ZipRef {
    pub(crate) addr: BuddyAddr,
    pub(crate) class: usize,
    pub(crate) size: usize,
}

#[derive(Default)]
pub(crate) struct DescMeta {
    pub(crate) zip: Option<ZipRef>,
}

/// Metadata record for one cached page.
pub struct Descriptor {
    page_id: AtomicU64,
    state: AtomicU8,
    io_fix: AtomicU8,
    flush_type: AtomicU8,
    io_status: AtomicU8,
    old: AtomicBool,
    fix_count: AtomicU32,
    freed_page_clock: AtomicU32,
    access_time: AtomicU64,
    oldest_modification: AtomicU64,
    newest_modification: AtomicU64,
    generation: AtomicU32,
    meta: Mutex<DescMeta>,
}

impl Default for Descriptor {
    fn default() -> Self {
        Self::new()
    }
}

impl Descriptor {
    pub(crate) fn new() -> Self {
        Self {
            page_id: AtomicU64::new(0),
            state: AtomicU8::new(PageState::NotUsed as u8),
            io_fix: AtomicU8::new(IoFix::None as u8),
            flush_type: AtomicU8::new(NO_FLUSH_TYPE),
            io_status: AtomicU8::new(IoStatus::Success as u8),
            old: AtomicBool::new(false),
            fix_count: AtomicU32::new(0),
            freed_page_clock: AtomicU32::new(0),
            access_time: AtomicU64::new(0),
            oldest_modification: AtomicU64::new(0),
            newest_modification: AtomicU64::new(0),
            generation: AtomicU32::new(0),
            meta: Mutex::new(DescMeta::default()),
        }
    }

    /// Page identity (meaningful only for resident states).
    pub fn page_id(&self) -> PageId {
        PageId::from_raw(self.page_id.load(Ordering::Acquire))
    }

    pub(crate) fn set_page_id(&self, id: PageId) {
        self.page_id.store(id.to_raw(), Ordering::Release);
    }

    /// Current state.
    pub fn state(&self) -> PageState {
        PageState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Moves to `to`, panicking on an illegal edge or when a resident page
    /// would leave the hash while fixed, dirty or under I/O.
    pub(crate) fn transition(&self, to: PageState) {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let from = PageState::from_u8(current);
            assert!(
                from.can_transition(to),
                "illegal page state transition {from:?} -> {to:?} for {}",
                self.page_id()
            );
            if from.leaves_residency(to) {
                let fix = self.fix_count();
                let oldest = self.oldest_modification();
                let io = self.io_fix();
                assert!(
                    fix == 0 && oldest.is_zero() && io == IoFix::None,
                    "page {} cannot leave residency: fix={fix} oldest={oldest} io={io:?}",
                    self.page_id()
                );
            }
            match self.state.compare_exchange(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Pending I/O.
    pub fn io_fix(&self) -> IoFix {
        IoFix::from_u8(self.io_fix.load(Ordering::Acquire))
    }

    /// Claims the descriptor for I/O; false if another I/O is pending.
    pub(crate) fn begin_io(&self, kind: IoFix) -> bool {
        debug_assert_ne!(kind, IoFix::None);
        self.io_fix
            .compare_exchange(
                IoFix::None as u8,
                kind as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn end_io(&self) {
        let prior = self.io_fix.swap(IoFix::None as u8, Ordering::AcqRel);
        debug_assert_ne!(prior, IoFix::None as u8, "end_io without pending io");
    }

    /// Write-back kind of the last issued write.
    pub fn flush_type(&self) -> Option<FlushType> {
        FlushType::from_u8(self.flush_type.load(Ordering::Acquire))
    }

    pub(crate) fn set_flush_type(&self, ty: FlushType) {
        self.flush_type.store(ty as u8, Ordering::Release);
    }

    /// Result of the last read.
    pub fn io_status(&self) -> IoStatus {
        IoStatus::from_u8(self.io_status.load(Ordering::Acquire))
    }

    pub(crate) fn set_io_status(&self, status: IoStatus) {
        self.io_status.store(status as u8, Ordering::Release);
    }

    /// In the old LRU sublist.
    pub fn is_old(&self) -> bool {
        self.old.load(Ordering::Relaxed)
    }

    pub(crate) fn set_old(&self, old: bool) {
        self.old.store(old, Ordering::Relaxed);
    }

    /// Pin count.
    pub fn fix_count(&self) -> u32 {
        self.fix_count.load(Ordering::Acquire)
    }

    pub(crate) fn fix(&self) -> u32 {
        self.fix_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn fix_by(&self, n: u32) {
        self.fix_count.fetch_add(n, Ordering::AcqRel);
    }

    pub(crate) fn unfix(&self) -> u32 {
        let prior = self.fix_count.fetch_sub(1, Ordering::AcqRel);
        assert!(prior > 0, "unfix of unfixed page {}", self.page_id());
        prior - 1
    }

    pub(crate) fn freed_page_clock(&self) -> u32 {
        self.freed_page_clock.load(Ordering::Relaxed)
    }

    pub(crate) fn set_freed_page_clock(&self, clock: u32) {
        self.freed_page_clock.store(clock, Ordering::Relaxed);
    }

    /// First-access timestamp in clock milliseconds, 0 if never accessed.
    pub fn access_time(&self) -> u64 {
        self.access_time.load(Ordering::Relaxed)
    }

    /// Records the first access; later calls keep the original stamp.
    pub(crate) fn set_accessed(&self, now_ms: u64) {
        let _ = self.access_time.compare_exchange(
            0,
            now_ms.max(1),
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }

    pub(crate) fn set_access_time(&self, ms: u64) {
        self.access_time.store(ms, Ordering::Relaxed);
    }

    /// LSN at which the page first became dirty; zero when clean.
    pub fn oldest_modification(&self) -> Lsn {
        Lsn(self.oldest_modification.load(Ordering::Acquire))
    }

    /// Must be called with the flush-list lock held.
    pub(crate) fn set_oldest_modification(&self, lsn: Lsn) {
        self.oldest_modification.store(lsn.0, Ordering::Release);
    }

    /// LSN of the newest change.
    pub fn newest_modification(&self) -> Lsn {
        Lsn(self.newest_modification.load(Ordering::Acquire))
    }

    pub(crate) fn set_newest_modification(&self, lsn: Lsn) {
        self.newest_modification.store(lsn.0, Ordering::Release);
    }

    /// Recycle counter; bumped whenever the slot returns to the free list
    /// or is withdrawn.
    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn bump_generation(&self) -> u32 {
        self.generation.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    pub(crate) fn zip(&self) -> Option<ZipRef> {
        self.meta.lock().zip
    }

    pub(crate) fn set_zip(&self, zip: Option<ZipRef>) {
        self.meta.lock().zip = zip;
    }

    pub(crate) fn take_zip(&self) -> Option<ZipRef> {
        self.meta.lock().zip.take()
    }

    /// Dirty (on the flush list).
    pub fn is_dirty(&self) -> bool {
        !self.oldest_modification().is_zero()
    }

    /// Neither pinned nor under I/O.
    pub(crate) fn can_relocate(&self) -> bool {
        self.fix_count() == 0 && self.io_fix() == IoFix::None
    }

    pub(crate) fn ready_for_flush(&self) -> bool {
        self.is_dirty()
            && self.io_fix() == IoFix::None
            && matches!(self.state(), PageState::FilePage | PageState::ZipDirty)
    }

    /// Clears per-page fields when a descriptor is (re)assigned.
    pub(crate) fn init_for_page(&self, id: PageId) {
        self.set_page_id(id);
        self.set_old(false);
        self.set_access_time(0);
        self.set_freed_page_clock(0);
        self.oldest_modification.store(0, Ordering::Release);
        self.newest_modification.store(0, Ordering::Release);
        self.flush_type.store(NO_FLUSH_TYPE, Ordering::Release);
        self.set_io_status(IoStatus::Success);
    }

    /// Copies aging and modification fields from `other` (relocation).
    pub(crate) fn copy_page_fields(&self, other: &Descriptor) {
        self.set_page_id(other.page_id());
        self.set_old(other.is_old());
        self.set_access_time(other.access_time());
        self.set_freed_page_clock(other.freed_page_clock());
        self.oldest_modification
            .store(other.oldest_modification().0, Ordering::Release);
        self.set_newest_modification(other.newest_modification());
        self.set_io_status(other.io_status());
    }
}

pub(crate) type Frame = Arc<RwLock<Box<[u8]>>>;
pub(crate) type FrameRead = ArcRwLockReadGuard<RawRwLock, Box<[u8]>>;
pub(crate) type FrameWrite = ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>;

/// Descriptor plus an uncompressed frame guarded by the content latch.
pub(crate) struct Block {
    pub(crate) slot: u32,
    pub(crate) desc: Descriptor,
    pub(crate) frame: Frame,
}

impl Block {
    pub(crate) fn new(slot: u32, frame: Box<[u8]>) -> Self {
        Self {
            slot,
            desc: Descriptor::new(),
            frame: Arc::new(RwLock::new(frame)),
        }
    }
}
