//! Online resizing.
//!
//! Growing allocates whole chunks and threads their blocks onto the free
//! list. Shrinking first withdraws every block of the chunks to be dropped:
//! free blocks move to the withdraw list, resident pages are relocated to
//! blocks below the cut, and buddy allocations are moved out of the zone.
//! Once an instance has withdrawn its whole zone the chunks are dropped
//! under every lock. Starting a withdraw and dropping chunks both bump the
//! withdraw clock, so handles taken earlier must be revalidated.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::arena::{Chunk, ChunkSet, Nodes};
use super::buddy::{BuddyAddr, BuddyAllocator};
use super::descriptor::{IoFix, PageState, ZipRef};
use super::hash::HashEntry;
use super::instance::{Instance, InstanceInner};
use super::list::{IndexList, ListKind, Slot};
use super::options::PoolOptions;
use crate::types::{BufError, Lsn, Result};

/// Progress of an online resize.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum ResizeStatus {
    /// No resize has run.
    Idle,
    /// Shrinking: blocks of the dropped chunks are being emptied.
    Withdrawing {
        /// Requested pool size in pages.
        target_pages: usize,
        /// Blocks withdrawn so far.
        withdrawn: usize,
        /// Blocks that must be withdrawn.
        to_withdraw: usize,
        /// Withdraw rounds so far.
        attempt: usize,
    },
    /// Growing: chunks are being allocated.
    Growing {
        /// Requested pool size in pages.
        target_pages: usize,
    },
    /// Last resize finished.
    Completed {
        /// Pool size before.
        from_pages: usize,
        /// Pool size after.
        to_pages: usize,
    },
    /// Last resize gave up; the pool kept its size.
    Aborted {
        /// Requested pool size in pages.
        target_pages: usize,
        /// Why it stopped.
        reason: String,
    },
}

impl ResizeStatus {
    /// Whether a resize is in progress.
    pub fn is_running(&self) -> bool {
        matches!(self, ResizeStatus::Withdrawing { .. } | ResizeStatus::Growing { .. })
    }
}

/// Withdraw progress of one instance.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct WithdrawProgress {
    pub(crate) withdrawn: usize,
    pub(crate) to_withdraw: usize,
}

impl WithdrawProgress {
    pub(crate) fn done(&self) -> bool {
        self.withdrawn >= self.to_withdraw
    }
}

impl Instance {
    pub(crate) fn n_chunks(&self) -> usize {
        self.chunks.read().n_chunks()
    }

    /// Starts withdrawing every block from chunk `target_chunks` on.
    pub(crate) fn begin_withdraw(&self, target_chunks: usize) {
        let mut inner = self.inner.lock();
        let target = (target_chunks * self.chunks.chunk_pages()) as u32;
        inner.withdraw_target = Some(target);
        self.withdrawing.store(true, Ordering::Release);
        self.withdraw_clock.fetch_add(1, Ordering::AcqRel);
        info!(instance = self.idx, target_slots = target, "buf.resize.withdraw_begin");
    }

    /// One withdraw round. Safe to repeat until the result is done.
    pub(crate) fn withdraw_step(self: &Arc<Self>) -> WithdrawProgress {
        self.withdraw_free_blocks();
        // Turn dirty pages near the tail into free blocks for relocation.
        let _ = self.flush_lru_batch(self.ctx.options.lru_scan_depth);
        self.relocate_zone_pages();
        self.relocate_zone_buddies();

        let inner = self.inner.lock();
        let chunks = self.chunks.read();
        let target = inner.withdraw_target.unwrap_or(chunks.n_blocks() as u32) as usize;
        let progress = WithdrawProgress {
            withdrawn: inner.withdraw.len(),
            to_withdraw: chunks.n_blocks().saturating_sub(target),
        };
        debug!(
            instance = self.idx,
            withdrawn = progress.withdrawn,
            to_withdraw = progress.to_withdraw,
            "buf.resize.withdraw_step"
        );
        progress
    }

    fn withdraw_free_blocks(&self) {
        let mut inner = self.inner.lock();
        let chunks = self.chunks.read();
        let zone: Vec<Slot> = inner
            .free
            .iter()
            .filter(|slot| matches!(slot, Slot::Block(i) if inner.in_withdraw_zone(*i)))
            .collect();
        for slot in zone {
            inner.free.remove(slot);
            if let Slot::Block(i) = slot {
                chunks.get(i).desc.bump_generation();
            }
            inner.withdraw.push_back(slot);
        }
    }

    fn relocate_zone_pages(&self) {
        let victims: Vec<u32> = {
            let inner = self.inner.lock();
            inner
                .lru
                .list()
                .iter()
                .filter_map(|slot| match slot {
                    Slot::Block(i) if inner.in_withdraw_zone(i) => Some(i),
                    _ => None,
                })
                .collect()
        };
        let moved = victims.into_iter().filter(|i| self.relocate_block(*i)).count();
        if moved > 0 {
            debug!(instance = self.idx, moved, "buf.resize.relocated_pages");
        }
    }

    /// Moves the page in block `i` to a free block outside the zone.
    fn relocate_block(&self, i: u32) -> bool {
        let id = {
            let chunks = self.chunks.read();
            match chunks.block(i) {
                Some(block) if block.desc.state() == PageState::FilePage => block.desc.page_id(),
                _ => return false,
            }
        };
        let old_slot = Slot::Block(i);
        let mut bucket = self.hash.bucket(id).write();
        if bucket.get(&id) != Some(&HashEntry::Page(old_slot)) {
            return false;
        }
        let mut inner = self.inner.lock();
        let chunks = self.chunks.read();
        let src = chunks.get(i);
        if !src.desc.can_relocate() {
            return false;
        }
        let Some(dst) = self.take_free(&mut inner, &chunks) else {
            return false;
        };
        let copied = match (src.frame.try_read(), dst.frame.try_write()) {
            (Some(from), Some(mut to)) => {
                to.copy_from_slice(&from);
                true
            }
            _ => false,
        };
        if !copied {
            dst.desc.transition(PageState::NotUsed);
            self.free_block_locked(&mut inner, &chunks, dst.slot);
            return false;
        }

        let new_slot = dst.slot();
        dst.desc.copy_page_fields(&src.desc);
        let zip = src.desc.take_zip();
        dst.desc.set_zip(zip);
        dst.desc.transition(PageState::FilePage);
        inner.lru.replace(old_slot, new_slot);
        if let Some(zip) = zip {
            inner.buddy.set_owner(zip.addr, new_slot);
        }
        if src.desc.is_dirty() {
            let mut flush = self.flush.lock();
            flush.relocate(old_slot, new_slot);
            src.desc.set_oldest_modification(Lsn::ZERO);
        }
        bucket.insert(id, HashEntry::Page(new_slot));
        src.desc.transition(PageState::NotUsed);
        self.free_block_locked(&mut inner, &chunks, i);
        true
    }

    /// Moves compressed copies out of buddy frames in the zone so those
    /// frames can be released.
    fn relocate_zone_buddies(&self) {
        let mut inner = self.inner.lock();
        let chunks = self.chunks.read();
        let frames: Vec<u32> = inner
            .buddy
            .frames()
            .filter(|frame| inner.in_withdraw_zone(*frame))
            .collect();
        for frame in frames {
            for (addr, class, owner) in inner.buddy.allocations_in(frame) {
                if let Some(owner) = owner {
                    self.relocate_buddy(&mut inner, &chunks, owner, addr, class);
                }
            }
        }
    }

    fn relocate_buddy(
        &self,
        inner: &mut InstanceInner,
        chunks: &ChunkSet,
        owner: Slot,
        src: BuddyAddr,
        class: usize,
    ) -> bool {
        let started = Instant::now();
        let (id, zip) = {
            let nodes = Nodes {
                chunks,
                zips: &inner.zips,
            };
            let Some(desc) = nodes.try_desc(owner) else {
                return false;
            };
            match desc.zip() {
                Some(zip) if zip.addr == src && desc.io_fix() == IoFix::None => (desc.page_id(), zip),
                _ => return false,
            }
        };
        let Some(_bucket) = self.hash.bucket(id).try_write() else {
            return false;
        };
        let allowed = inner.buddy_frame_allowed();
        let dst = match inner.buddy.alloc(class, &allowed) {
            Some(dst) => dst,
            None => {
                let Some(block) = self.take_free(inner, chunks) else {
                    return false;
                };
                block.desc.transition(PageState::Memory);
                inner.buddy.add_frame(block.slot, class)
            }
        };
        let len = BuddyAllocator::size_of(class);
        let bytes = {
            let host = chunks.get(src.frame).frame.read();
            host[src.offset as usize..src.offset as usize + len].to_vec()
        };
        {
            let mut host = chunks.get(dst.frame).frame.write();
            host[dst.offset as usize..dst.offset as usize + len].copy_from_slice(&bytes);
        }
        inner.buddy.set_owner(dst, owner);
        Nodes {
            chunks,
            zips: &inner.zips,
        }
        .desc(owner)
        .set_zip(Some(ZipRef { addr: dst, ..zip }));
        let mut no_relocation = |_: Slot, _: BuddyAddr, _: BuddyAddr, _: usize| false;
        if let Some(frame) = inner.buddy.free(src, class, &allowed, &mut no_relocation) {
            chunks.get(frame).desc.transition(PageState::NotUsed);
            self.free_block_locked(inner, chunks, frame);
        }
        inner
            .buddy
            .record_relocation(class, started.elapsed().as_micros() as u64);
        true
    }

    /// Drops the withdrawn chunks. Every zone block must be on the
    /// withdraw list.
    pub(crate) fn finish_shrink(&self, target_chunks: usize) {
        let buckets = self.hash.write_all();
        let mut inner = self.inner.lock();
        let mut chunks = self.chunks.write();
        inner.withdraw = IndexList::new(ListKind::Withdraw);
        inner.withdraw_target = None;
        let dropped = chunks.truncate(target_chunks);
        self.curr_size.store(chunks.n_blocks(), Ordering::Relaxed);
        self.withdraw_clock.fetch_add(1, Ordering::AcqRel);
        self.withdrawing.store(false, Ordering::Release);
        drop(chunks);
        drop(inner);
        drop(buckets);
        info!(
            instance = self.idx,
            chunks = target_chunks,
            dropped = dropped.len(),
            "buf.resize.shrunk"
        );
    }

    /// Gives up a withdraw: the withdrawn blocks become free again.
    pub(crate) fn abort_withdraw(&self) {
        let mut inner = self.inner.lock();
        inner.withdraw_target = None;
        while let Some(slot) = inner.withdraw.pop_front() {
            inner.free.push_back(slot);
        }
        self.withdrawing.store(false, Ordering::Release);
        warn!(instance = self.idx, "buf.resize.withdraw_aborted");
    }

    /// Adds chunks until the instance has `target_chunks`.
    pub(crate) fn grow(&self, target_chunks: usize) -> Result<()> {
        let chunk_pages = self.chunks.chunk_pages();
        let (base, have) = {
            let chunks = self.chunks.read();
            (chunks.n_blocks(), chunks.n_chunks())
        };
        let mut fresh = Vec::new();
        for k in 0..target_chunks.saturating_sub(have) {
            let start = (base + k * chunk_pages) as u32;
            fresh.push(Chunk::allocate(start, chunk_pages, self.page_size)?);
        }
        let mut inner = self.inner.lock();
        let mut chunks = self.chunks.write();
        for chunk in fresh {
            let start = chunk.base();
            let len = chunk.len() as u32;
            chunks.push(chunk);
            for slot in start..start + len {
                inner.free.push_back(Slot::Block(slot));
            }
        }
        self.curr_size.store(chunks.n_blocks(), Ordering::Relaxed);
        info!(instance = self.idx, chunks = chunks.n_chunks(), "buf.resize.grown");
        Ok(())
    }
}

/// Runs at most one resize at a time on a background thread and publishes
/// its status.
pub(crate) struct ResizeController {
    status: Mutex<ResizeStatus>,
    changed: Condvar,
    worker: Mutex<Option<JoinHandle<()>>>,
    cancel: AtomicBool,
}

impl Default for ResizeController {
    fn default() -> Self {
        Self::new()
    }
}

impl ResizeController {
    pub(crate) fn new() -> Self {
        Self {
            status: Mutex::new(ResizeStatus::Idle),
            changed: Condvar::new(),
            worker: Mutex::new(None),
            cancel: AtomicBool::new(false),
        }
    }

    pub(crate) fn status(&self) -> ResizeStatus {
        self.status.lock().clone()
    }

    fn set(&self, status: ResizeStatus) {
        *self.status.lock() = status;
        self.changed.notify_all();
    }

    /// Blocks until no resize is running and returns the final status.
    pub(crate) fn wait(&self) -> ResizeStatus {
        let mut status = self.status.lock();
        while status.is_running() {
            self.changed.wait(&mut status);
        }
        status.clone()
    }

    /// Starts resizing `instances` to `target_pages` in the background.
    pub(crate) fn start(
        self: &Arc<Self>,
        instances: Vec<Arc<Instance>>,
        options: PoolOptions,
        target_pages: usize,
    ) -> Result<()> {
        {
            let mut status = self.status.lock();
            if status.is_running() {
                return Err(BufError::Invalid("a resize is already running"));
            }
            *status = ResizeStatus::Growing { target_pages };
        }
        if let Some(previous) = self.worker.lock().take() {
            let _ = previous.join();
        }
        self.cancel.store(false, Ordering::Release);
        let ctl = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("bufpool-resize".into())
            .spawn(move || ctl.run(&instances, &options, target_pages));
        match spawned {
            Ok(handle) => {
                *self.worker.lock() = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.set(ResizeStatus::Aborted {
                    target_pages,
                    reason: err.to_string(),
                });
                Err(BufError::Io(err))
            }
        }
    }

    fn run(&self, instances: &[Arc<Instance>], options: &PoolOptions, target_pages: usize) {
        let total = |instances: &[Arc<Instance>]| -> usize {
            instances
                .iter()
                .map(|inst| inst.curr_size.load(Ordering::Relaxed))
                .sum()
        };
        let from_pages = total(instances);
        let target_chunks = options.chunks_for(target_pages);
        let have_chunks = instances.first().map_or(0, |inst| inst.n_chunks());
        info!(from_pages, target_pages, target_chunks, have_chunks, "buf.resize.start");

        if target_chunks < have_chunks {
            if let Err(reason) = self.shrink(instances, options, target_pages, target_chunks) {
                for inst in instances {
                    inst.abort_withdraw();
                }
                warn!(target_pages, %reason, "buf.resize.aborted");
                self.set(ResizeStatus::Aborted { target_pages, reason });
                return;
            }
        } else if target_chunks > have_chunks {
            self.set(ResizeStatus::Growing { target_pages });
            for inst in instances {
                if let Err(err) = inst.grow(target_chunks) {
                    warn!(target_pages, error = %err, "buf.resize.aborted");
                    self.set(ResizeStatus::Aborted {
                        target_pages,
                        reason: err.to_string(),
                    });
                    return;
                }
            }
        }

        let to_pages = total(instances);
        info!(from_pages, to_pages, "buf.resize.complete");
        self.set(ResizeStatus::Completed { from_pages, to_pages });
    }

    fn shrink(
        &self,
        instances: &[Arc<Instance>],
        options: &PoolOptions,
        target_pages: usize,
        target_chunks: usize,
    ) -> std::result::Result<(), String> {
        for inst in instances {
            inst.begin_withdraw(target_chunks);
        }
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let mut withdrawn = 0;
            let mut to_withdraw = 0;
            let mut done = true;
            for inst in instances {
                let progress = inst.withdraw_step();
                withdrawn += progress.withdrawn;
                to_withdraw += progress.to_withdraw;
                done &= progress.done();
            }
            self.set(ResizeStatus::Withdrawing {
                target_pages,
                withdrawn,
                to_withdraw,
                attempt,
            });
            if done {
                break;
            }
            if self.cancel.load(Ordering::Acquire) {
                return Err("pool shutting down".into());
            }
            if attempt >= options.resize_max_attempts {
                return Err(format!(
                    "withdrew {withdrawn} of {to_withdraw} blocks in {attempt} attempts"
                ));
            }
            thread::sleep(Duration::from_millis(options.resize_retry_ms));
        }
        for inst in instances {
            inst.finish_shrink(target_chunks);
        }
        Ok(())
    }

    /// Stops a running resize at its next round and joins the thread.
    pub(crate) fn shutdown(&self) {
        self.cancel.store(true, Ordering::Release);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}
