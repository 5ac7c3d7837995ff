//! Chunk arena: the stable storage behind block slots.
//!
//! Blocks are allocated a chunk at a time and addressed by slot index
//! (`chunk * chunk_pages + offset`). A [`BlockRef`] keeps its chunk alive,
//! so a reference that outlives a shrink still points at valid memory; the
//! descriptor generation tells callers whether it still means anything.

use std::ops::Deref;
use std::sync::Arc;

use parking_lot::RwLock;

use super::descriptor::{Block, Descriptor};
use super::list::Slot;
use super::lru::OldFlags;
use crate::types::{BufError, Result};

pub(crate) struct Chunk {
    base: u32,
    blocks: Box<[Block]>,
}

impl Chunk {
    /// Allocates `pages` zeroed frames starting at slot `base`.
    pub(crate) fn allocate(base: u32, pages: usize, page_size: usize) -> Result<Self> {
        let mut blocks = Vec::new();
        blocks
            .try_reserve_exact(pages)
            .map_err(|_| BufError::OutOfMemory("chunk descriptor array"))?;
        for offset in 0..pages {
            let mut frame = Vec::new();
            frame
                .try_reserve_exact(page_size)
                .map_err(|_| BufError::OutOfMemory("chunk frame"))?;
            frame.resize(page_size, 0u8);
            blocks.push(Block::new(base + offset as u32, frame.into_boxed_slice()));
        }
        Ok(Self {
            base,
            blocks: blocks.into_boxed_slice(),
        })
    }

    pub(crate) fn base(&self) -> u32 {
        self.base
    }

    pub(crate) fn len(&self) -> usize {
        self.blocks.len()
    }

    pub(crate) fn blocks(&self) -> &[Block] {
        &self.blocks
    }
}

/// Counted reference to one block.
#[derive(Clone)]
pub(crate) struct BlockRef {
    chunk: Arc<Chunk>,
    offset: usize,
}

impl BlockRef {
    pub(crate) fn slot(&self) -> Slot {
        Slot::Block(self.slot)
    }
}

impl Deref for BlockRef {
    type Target = Block;

    fn deref(&self) -> &Block {
        &self.chunk.blocks[self.offset]
    }
}

/// Chunks of one instance.
pub(crate) struct ChunkSet {
    chunk_pages: usize,
    chunks: Vec<Arc<Chunk>>,
}

impl ChunkSet {
    pub(crate) fn n_blocks(&self) -> usize {
        self.chunks.iter().map(|c| c.len()).sum()
    }

    pub(crate) fn n_chunks(&self) -> usize {
        self.chunks.len()
    }

    pub(crate) fn block(&self, slot: u32) -> Option<&Block> {
        let slot = slot as usize;
        self.chunks
            .get(slot / self.chunk_pages)
            .and_then(|c| c.blocks.get(slot % self.chunk_pages))
    }

    pub(crate) fn block_ref(&self, slot: u32) -> Option<BlockRef> {
        let slot = slot as usize;
        let chunk = self.chunks.get(slot / self.chunk_pages)?;
        let offset = slot % self.chunk_pages;
        (offset < chunk.len()).then(|| BlockRef {
            chunk: Arc::clone(chunk),
            offset,
        })
    }

    /// Block at `slot`; the slot must be live.
    pub(crate) fn get(&self, slot: u32) -> &Block {
        self.block(slot)
            .unwrap_or_else(|| panic!("block slot {slot} outside the arena"))
    }

    /// Counted reference to a live slot.
    pub(crate) fn get_ref(&self, slot: u32) -> BlockRef {
        self.block_ref(slot)
            .unwrap_or_else(|| panic!("block slot {slot} outside the arena"))
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Block> + '_ {
        self.chunks.iter().flat_map(|c| c.blocks.iter())
    }

    pub(crate) fn push(&mut self, chunk: Chunk) {
        debug_assert_eq!(chunk.base() as usize, self.n_blocks());
        self.chunks.push(Arc::new(chunk));
    }

    /// Drops chunks beyond `keep`, returning them.
    pub(crate) fn truncate(&mut self, keep: usize) -> Vec<Arc<Chunk>> {
        if keep >= self.chunks.len() {
            return Vec::new();
        }
        self.chunks.split_off(keep)
    }
}

/// Lock around the chunk set. Always read with `read_recursive`: lookups
/// may nest inside a thread that already holds it.
pub(crate) struct ChunkTable {
    inner: RwLock<ChunkSet>,
    chunk_pages: usize,
}

impl ChunkTable {
    pub(crate) fn new(chunk_pages: usize) -> Self {
        Self {
            inner: RwLock::new(ChunkSet {
                chunk_pages,
                chunks: Vec::new(),
            }),
            chunk_pages,
        }
    }

    pub(crate) fn chunk_pages(&self) -> usize {
        self.chunk_pages
    }

    pub(crate) fn read(&self) -> parking_lot::RwLockReadGuard<'_, ChunkSet> {
        self.inner.read_recursive()
    }

    pub(crate) fn write(&self) -> parking_lot::RwLockWriteGuard<'_, ChunkSet> {
        self.inner.write()
    }

    pub(crate) fn get_mut(&mut self) -> &mut ChunkSet {
        self.inner.get_mut()
    }
}

/// Compressed-only descriptors, addressed by `Slot::Zip` index.
#[derive(Default)]
pub(crate) struct ZipSlab {
    entries: Vec<Option<Arc<Descriptor>>>,
    vacant: Vec<u32>,
}

impl ZipSlab {
    pub(crate) fn insert(&mut self, desc: Arc<Descriptor>) -> u32 {
        match self.vacant.pop() {
            Some(idx) => {
                self.entries[idx as usize] = Some(desc);
                idx
            }
            None => {
                self.entries.push(Some(desc));
                (self.entries.len() - 1) as u32
            }
        }
    }

    pub(crate) fn remove(&mut self, idx: u32) -> Option<Arc<Descriptor>> {
        let taken = self.entries.get_mut(idx as usize)?.take();
        if taken.is_some() {
            self.vacant.push(idx);
        }
        taken
    }

    pub(crate) fn try_get(&self, idx: u32) -> Option<&Arc<Descriptor>> {
        self.entries.get(idx as usize).and_then(Option::as_ref)
    }

    pub(crate) fn get(&self, idx: u32) -> &Arc<Descriptor> {
        self.try_get(idx)
            .unwrap_or_else(|| panic!("zip slot {idx} is vacant"))
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len() - self.vacant.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (u32, &Arc<Descriptor>)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, d)| d.as_ref().map(|d| (i as u32, d)))
    }
}

/// Resolves any slot to its descriptor. Needs the chunk read guard and the
/// zip slab (which lives under the instance lock).
pub(crate) struct Nodes<'a> {
    pub(crate) chunks: &'a ChunkSet,
    pub(crate) zips: &'a ZipSlab,
}

impl<'a> Nodes<'a> {
    pub(crate) fn desc(&self, slot: Slot) -> &'a Descriptor {
        match slot {
            Slot::Block(i) => &self.chunks.get(i).desc,
            Slot::Zip(z) => self.zips.get(z),
        }
    }

    pub(crate) fn try_desc(&self, slot: Slot) -> Option<&'a Descriptor> {
        match slot {
            Slot::Block(i) => self.chunks.block(i).map(|b| &b.desc),
            Slot::Zip(z) => self.zips.try_get(z).map(|d| &**d),
        }
    }
}

impl OldFlags for Nodes<'_> {
    fn set_old(&self, slot: Slot, old: bool) {
        self.desc(slot).set_old(old);
    }

    fn is_old(&self, slot: Slot) -> bool {
        self.desc(slot).is_old()
    }
}
