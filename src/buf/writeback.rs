//! Page write-back.
//!
//! Three kinds of writes exist: flush-list batches for checkpoints, LRU
//! batches that replenish the free list, and single-page flushes for a
//! thread stalled on a free block. Batches walk their list with a hazard
//! pointer and drop the list lock around every page they write.

use std::sync::mpsc;
use std::sync::Arc;

use tracing::{debug, error, trace};

use super::arena::{BlockRef, ChunkSet, Nodes};
use super::codec;
use super::descriptor::{Descriptor, FlushType, FrameRead, IoFix, PageState};
use super::hash::HashEntry;
use super::instance::{Instance, InstanceInner};
use super::list::Slot;
use super::lru::Cursor;
use super::stats::Counters;
use crate::primitives::aio::IoRequest;
use crate::types::checksum::stamp_zip;
use crate::types::page::SpaceInfo;
use crate::types::{BufError, Lsn, PageId, Result};

/// What a write holds on to until it completes.
enum WriteTarget {
    /// Block with its content latch held shared.
    Block(BlockRef, FrameRead),
    /// Compressed-only page.
    Zip(Arc<Descriptor>),
}

impl WriteTarget {
    fn desc(&self) -> &Descriptor {
        match self {
            WriteTarget::Block(block, _) => &block.desc,
            WriteTarget::Zip(desc) => desc,
        }
    }
}

/// Outcome of an LRU flush batch.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct LruBatch {
    pub(crate) evicted: usize,
    pub(crate) flushed: usize,
}

impl Instance {
    /// Claims a dirty page for writing. Runs under the instance lock so
    /// eviction and relocation see the I/O fix.
    fn claim_for_write(&self, inner: &InstanceInner, chunks: &ChunkSet, slot: Slot, ty: FlushType) -> Option<WriteTarget> {
        let target = match slot {
            Slot::Block(i) => {
                let block = chunks.block_ref(i)?;
                let desc = &block.desc;
                if !desc.ready_for_flush() || (ty != FlushType::List && desc.fix_count() > 0) {
                    return None;
                }
                let latch = block.frame.try_read_arc()?;
                WriteTarget::Block(block, latch)
            }
            Slot::Zip(z) => {
                let desc = Arc::clone(inner.zips.try_get(z)?);
                if !desc.ready_for_flush() {
                    return None;
                }
                WriteTarget::Zip(desc)
            }
        };
        if !target.desc().begin_io(IoFix::Write) {
            return None;
        }
        target.desc().set_flush_type(ty);
        self.gates.io_started(ty);
        Some(target)
    }

    /// Issues the write of the page at `slot`. Returns whether a write was
    /// submitted; `done` is signalled once it completes.
    pub(crate) fn flush_slot(self: &Arc<Self>, slot: Slot, ty: FlushType, done: Option<mpsc::Sender<()>>) -> bool {
        let target = {
            let inner = self.inner.lock();
            let chunks = self.chunks.read();
            match self.claim_for_write(&inner, &chunks, slot, ty) {
                Some(target) => target,
                None => return false,
            }
        };
        let desc = target.desc();
        let id = desc.page_id();
        let lsn = desc.newest_modification();

        let Some(space) = self.ctx.spaces.space(id.space) else {
            // Nothing to write into; the page just stops being dirty.
            debug!(page = %id, "buf.flush.space_dropped");
            self.complete_write(slot, target, ty, Ok(()), done);
            return true;
        };
        let image = match self.write_image(&target, &space, lsn) {
            Some(image) => image,
            None => {
                let err = BufError::Invalid("page does not fit its compressed size");
                self.complete_write(slot, target, ty, Err(err), done);
                return true;
            }
        };
        let req = IoRequest {
            page_id: id,
            offset: u64::from(id.page_no) * space.physical_size() as u64,
            buf: image,
        };
        trace!(page = %id, ?ty, %lsn, "buf.flush.submit");
        let instance = Arc::clone(self);
        self.ctx.io.submit_write(
            req,
            Box::new(move |_req, result| instance.complete_write(slot, target, ty, result, done)),
        );
        true
    }

    fn write_image(&self, target: &WriteTarget, space: &SpaceInfo, lsn: Lsn) -> Option<Vec<u8>> {
        let id = target.desc().page_id();
        match target {
            WriteTarget::Block(block, frame) => match block.desc.zip() {
                Some(zip) if space.is_zip() => {
                    let mut image = vec![0u8; zip.size];
                    if !codec::encode_zip(self.codec(), frame, &mut image, lsn) {
                        error!(page = %id, zip_size = zip.size, "buf.flush.compress_failed");
                        return None;
                    }
                    self.store_zip_bytes(&self.chunks.read(), zip, &image);
                    Some(image)
                }
                _ => Some(codec::encode_page(
                    id,
                    space,
                    self.codec(),
                    self.ctx.options.checksum_algorithm,
                    frame,
                    lsn,
                )),
            },
            WriteTarget::Zip(desc) => {
                let zip = desc.zip()?;
                let mut image = self.zip_bytes(&self.chunks.read(), zip);
                stamp_zip(&mut image, lsn);
                Some(image)
            }
        }
    }

    fn complete_write(
        self: &Arc<Self>,
        slot: Slot,
        target: WriteTarget,
        ty: FlushType,
        result: Result<()>,
        done: Option<mpsc::Sender<()>>,
    ) {
        let desc = target.desc();
        let id = desc.page_id();
        let written = match result {
            Ok(()) => {
                {
                    let mut flush = self.flush.lock();
                    flush.remove(slot);
                    desc.set_oldest_modification(Lsn::ZERO);
                }
                if desc.state() == PageState::ZipDirty {
                    desc.transition(PageState::ZipPage);
                }
                Counters::bump(&self.counters.pages_written);
                true
            }
            Err(err) => {
                Counters::bump(&self.counters.write_errors);
                error!(page = %id, ?ty, error = %err, "buf.flush.write_failed");
                false
            }
        };
        desc.end_io();
        drop(target);
        self.gates.io_done(ty);
        if written && ty != FlushType::List {
            let mut inner = self.inner.lock();
            let chunks = self.chunks.read();
            self.try_evict(&mut inner, &chunks, slot, false);
        }
        trace!(page = %id, ?ty, written, "buf.flush.complete");
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    /// Writes dirty pages with `oldest_modification < lsn_limit`, oldest
    /// first, up to `max` pages. `None` if a flush-list batch is already
    /// running.
    pub(crate) fn flush_list_batch(self: &Arc<Self>, lsn_limit: Lsn, max: usize) -> Option<usize> {
        if !self.gates.try_start(FlushType::List) {
            return None;
        }
        let mut count = 0usize;
        let mut scanned = 0usize;
        let mut flush = self.flush.lock();
        let mut cursor = flush.list().tail();
        while let Some(slot) = cursor {
            if count >= max {
                break;
            }
            match flush.lsn_of(slot) {
                Some(lsn) if lsn < lsn_limit => {}
                _ => break,
            }
            let prev = flush.list().prev(slot);
            flush.hp.set(prev);
            drop(flush);
            if self.flush_slot(slot, FlushType::List, None) {
                count += 1;
            }
            flush = self.flush.lock();
            cursor = flush.hp.get();
            scanned += 1;
        }
        flush.hp.set(None);
        drop(flush);
        self.gates.end(FlushType::List);
        debug!(instance = self.idx, count, scanned, %lsn_limit, "buf.flush.list_batch");
        Some(count)
    }

    /// Frees blocks near the LRU tail: evicts clean pages and writes dirty
    /// ones, stopping once `lru_scan_depth` blocks are free. `None` if an
    /// LRU batch is already running.
    pub(crate) fn flush_lru_batch(self: &Arc<Self>, max: usize) -> Option<LruBatch> {
        if !self.gates.try_start(FlushType::Lru) {
            return None;
        }
        let depth = self.ctx.options.lru_scan_depth;
        let mut batch = LruBatch::default();
        let mut inner = self.inner.lock();

        if self.evict_from_unzip(&inner) {
            let chunks = self.chunks.read();
            let victims: Vec<Slot> = inner.lru.unzip().iter_rev().take(depth).collect();
            for slot in victims {
                if inner.free.len() >= depth || batch.evicted >= max {
                    break;
                }
                if self.try_evict(&mut inner, &chunks, slot, true) {
                    batch.evicted += 1;
                }
            }
        }

        let mut cursor = inner.lru.tail();
        let mut scanned = 0usize;
        while let Some(slot) = cursor {
            if scanned >= depth || inner.free.len() >= depth || batch.evicted + batch.flushed >= max {
                break;
            }
            let prev = inner.lru.prev(slot);
            inner.lru.set_cursor(Cursor::Flush, prev);
            let chunks = self.chunks.read();
            let (clean, flushable) = {
                let desc = Nodes {
                    chunks: &chunks,
                    zips: &inner.zips,
                }
                .desc(slot);
                (
                    !desc.is_dirty() && desc.can_relocate(),
                    desc.ready_for_flush() && desc.fix_count() == 0,
                )
            };
            if clean {
                if self.try_evict(&mut inner, &chunks, slot, false) {
                    batch.evicted += 1;
                }
            } else if flushable {
                drop(chunks);
                drop(inner);
                if self.flush_slot(slot, FlushType::Lru, None) {
                    batch.flushed += 1;
                }
                inner = self.inner.lock();
            }
            cursor = inner.lru.cursor(Cursor::Flush);
            scanned += 1;
        }
        inner.lru.set_cursor(Cursor::Flush, None);
        drop(inner);
        self.gates.end(FlushType::Lru);
        debug!(
            instance = self.idx,
            evicted = batch.evicted,
            flushed = batch.flushed,
            scanned,
            "buf.flush.lru_batch"
        );
        Some(batch)
    }

    /// Makes one block free by evicting a clean page or synchronously
    /// writing and evicting a dirty one. Must be called without pool locks.
    pub(crate) fn flush_single_page(self: &Arc<Self>) -> bool {
        let mut inner = self.inner.lock();
        let mut chunks = self.chunks.read();
        let mut cursor = {
            let InstanceInner { lru, zips, .. } = &mut *inner;
            lru.cursor_start(Cursor::Single, &Nodes { chunks: &chunks, zips: &*zips })
        };
        let mut scanned = 0usize;
        while let Some(slot) = cursor {
            let prev = inner.lru.prev(slot);
            inner.lru.set_cursor(Cursor::Single, prev);
            let (clean, flushable) = {
                let desc = Nodes {
                    chunks: &chunks,
                    zips: &inner.zips,
                }
                .desc(slot);
                (
                    !desc.is_dirty() && desc.can_relocate(),
                    desc.ready_for_flush() && desc.fix_count() == 0,
                )
            };
            if clean && self.try_evict(&mut inner, &chunks, slot, false) {
                trace!(instance = self.idx, scanned, "buf.flush.single_evicted");
                return true;
            }
            if flushable {
                drop(chunks);
                drop(inner);
                let (tx, rx) = mpsc::channel();
                if self.flush_slot(slot, FlushType::SinglePage, Some(tx)) {
                    let _ = rx.recv();
                    trace!(instance = self.idx, scanned, "buf.flush.single_written");
                    return true;
                }
                inner = self.inner.lock();
                chunks = self.chunks.read();
            }
            cursor = inner.lru.cursor(Cursor::Single);
            scanned += 1;
        }
        false
    }

    /// Writes every dirty page and waits for the writes.
    pub(crate) fn flush_all(self: &Arc<Self>) {
        loop {
            if self.flush.lock().len() == 0 {
                return;
            }
            if self.flush_list_batch(Lsn(u64::MAX), usize::MAX).is_none() {
                self.gates.wait_end(FlushType::List);
                continue;
            }
            self.gates.wait_end(FlushType::List);
            if self.flush.lock().len() > 0 {
                std::thread::yield_now();
            }
        }
    }

    /// Whether `id` is resident and on the flush list.
    pub(crate) fn is_dirty(&self, id: PageId) -> bool {
        let Some(HashEntry::Page(slot)) = self.hash.lookup(id) else {
            return false;
        };
        self.flush.lock().contains(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::guard::FetchMode;
    use crate::buf::instance::tests::{fixture, options};
    use crate::primitives::io::FileIo;
    use crate::types::page;

    fn id(n: u32) -> PageId {
        PageId::new(1, n)
    }

    fn dirty(inst: &Arc<Instance>, n: u32, lsn: u64) {
        let (block, mut latch) = inst.create(id(n)).unwrap();
        latch[64] = n as u8;
        inst.note_modification(&block, Lsn(lsn), Lsn(lsn));
        drop(latch);
        inst.release(&block);
    }

    #[test]
    fn list_batch_stops_at_lsn_limit() {
        let fx = fixture(options(64));
        let inst = &fx.instance;
        for n in 1..=5 {
            dirty(inst, n, u64::from(n) * 10);
        }
        assert_eq!(inst.flush_list_batch(Lsn(30), usize::MAX), Some(2));
        inst.gates.wait_end(FlushType::List);
        assert_eq!(inst.oldest_modification(), Some(Lsn(30)));
        assert!(!inst.is_dirty(id(1)));
        assert!(inst.is_dirty(id(3)));

        let file = fx.files.file(1).unwrap();
        let mut image = vec![0u8; 4096];
        file.read_at(4096, &mut image).unwrap();
        assert_eq!(page::page_no(&image), 1);
        assert_eq!(page::page_lsn(&image), Lsn(10));
        assert_eq!(image[64], 1);
        inst.validate().unwrap();
    }

    #[test]
    fn single_page_flush_frees_a_dirty_block() {
        let fx = fixture(options(32));
        let inst = &fx.instance;
        for n in 0..32 {
            dirty(inst, n, u64::from(n) + 1);
        }
        assert_eq!(inst.stats().0.free_len, 0);
        let block = inst.fetch(id(50), FetchMode::Get).unwrap().unwrap();
        inst.release(&block);
        let (stats, _) = inst.stats();
        assert_eq!(stats.pages_written, 1);
        assert_eq!(stats.flush_list_len, 31);
        inst.validate().unwrap();
    }

    #[test]
    fn lru_batch_writes_then_evicts() {
        let fx = fixture(options(64));
        let inst = &fx.instance;
        for n in 0..8 {
            dirty(inst, n, u64::from(n) + 1);
        }
        let batch = inst.flush_lru_batch(usize::MAX).unwrap();
        assert_eq!(batch.flushed, 8);
        inst.gates.wait_end(FlushType::Lru);
        let (stats, _) = inst.stats();
        assert_eq!(stats.flush_list_len, 0);
        assert_eq!(stats.lru_len, 0);
        inst.validate().unwrap();
    }

    #[test]
    fn flush_all_empties_the_list() {
        let fx = fixture(options(64));
        let inst = &fx.instance;
        for n in 0..10 {
            dirty(inst, n, 100 - u64::from(n));
        }
        inst.flush_all();
        assert_eq!(inst.oldest_modification(), None);
        assert_eq!(inst.stats().0.pages_written, 10);
        inst.validate().unwrap();
    }
}
