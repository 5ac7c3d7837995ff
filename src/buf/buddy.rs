//! Binary buddy allocator for compressed page images.
//!
//! Size classes run from 1 KiB (class 0) up to the uncompressed page size
//! (class `n_sizes`, a whole frame). Frames are donated by the instance and
//! handed back once every piece inside them has coalesced. The allocator
//! only tracks addresses; moving bytes during relocation is the caller's
//! job.

use std::collections::BTreeSet;
use std::time::Instant;

use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use smallvec::SmallVec;

use super::list::Slot;
use crate::types::page::ZIP_SIZE_MIN;

/// Position of a buddy block: frame (arena slot) and byte offset.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct BuddyAddr {
    /// Arena slot of the frame hosting the block.
    pub frame: u32,
    /// Byte offset inside the frame.
    pub offset: u32,
}

/// Per-size-class counters.
#[derive(Clone, Copy, Default, Debug, Serialize, PartialEq, Eq)]
pub struct BuddyStat {
    /// Block size of the class in bytes.
    pub size: usize,
    /// Blocks currently allocated.
    pub used: u64,
    /// Relocations performed.
    pub relocated: u64,
    /// Time spent relocating, in microseconds.
    pub relocated_usec: u64,
}

#[derive(Copy, Clone, Debug)]
struct Allocation {
    class: usize,
    owner: Option<Slot>,
}

pub(crate) struct BuddyAllocator {
    n_sizes: usize,
    free: Vec<BTreeSet<BuddyAddr>>,
    used: FxHashMap<BuddyAddr, Allocation>,
    frames: FxHashSet<u32>,
    stats: Vec<BuddyStat>,
}

impl BuddyAllocator {
    pub(crate) fn new(page_size: usize) -> Self {
        let n_sizes = (page_size / ZIP_SIZE_MIN).trailing_zeros() as usize;
        let stats = (0..=n_sizes)
            .map(|class| BuddyStat {
                size: ZIP_SIZE_MIN << class,
                ..BuddyStat::default()
            })
            .collect();
        Self {
            n_sizes,
            free: vec![BTreeSet::new(); n_sizes],
            used: FxHashMap::default(),
            frames: FxHashSet::default(),
            stats,
        }
    }

    /// Class holding `size` bytes.
    pub(crate) fn class_for(&self, size: usize) -> usize {
        let size = size.max(ZIP_SIZE_MIN).next_power_of_two();
        let class = (size / ZIP_SIZE_MIN).trailing_zeros() as usize;
        assert!(class <= self.n_sizes, "compressed size {size} exceeds the page size");
        class
    }

    pub(crate) fn full_class(&self) -> usize {
        self.n_sizes
    }

    pub(crate) fn size_of(class: usize) -> usize {
        ZIP_SIZE_MIN << class
    }

    /// Allocates from already-donated frames whose slot satisfies `allowed`.
    pub(crate) fn alloc(&mut self, class: usize, allowed: &dyn Fn(u32) -> bool) -> Option<BuddyAddr> {
        let addr = self.alloc_zip(class, allowed)?;
        self.mark_used(addr, class);
        Some(addr)
    }

    fn alloc_zip(&mut self, class: usize, allowed: &dyn Fn(u32) -> bool) -> Option<BuddyAddr> {
        if class >= self.n_sizes {
            return None;
        }
        if let Some(addr) = self.free[class].iter().find(|a| allowed(a.frame)).copied() {
            self.free[class].remove(&addr);
            return Some(addr);
        }
        let big = self.alloc_zip(class + 1, allowed)?;
        self.free[class].insert(BuddyAddr {
            frame: big.frame,
            offset: big.offset + Self::size_of(class) as u32,
        });
        Some(big)
    }

    /// Takes ownership of a whole frame and carves a block of `class` from it.
    pub(crate) fn add_frame(&mut self, frame: u32, class: usize) -> BuddyAddr {
        assert!(self.frames.insert(frame), "frame {frame} donated twice");
        let mut j = self.n_sizes;
        while j > class {
            j -= 1;
            self.free[j].insert(BuddyAddr {
                frame,
                offset: Self::size_of(j) as u32,
            });
        }
        let addr = BuddyAddr { frame, offset: 0 };
        self.mark_used(addr, class);
        addr
    }

    fn mark_used(&mut self, addr: BuddyAddr, class: usize) {
        self.used.insert(addr, Allocation { class, owner: None });
        self.stats[class].used += 1;
    }

    pub(crate) fn set_owner(&mut self, addr: BuddyAddr, owner: Slot) {
        if let Some(alloc) = self.used.get_mut(&addr) {
            alloc.owner = Some(owner);
        }
    }

    #[cfg(test)]
    pub(crate) fn owner(&self, addr: BuddyAddr) -> Option<Slot> {
        self.used.get(&addr).and_then(|a| a.owner)
    }

    /// Frees a block, coalescing with free buddies. When a buddy is in use
    /// and another free block of the same class exists, `relocate(owner,
    /// src, dst, class)` may move the buddy so coalescing can continue.
    /// Returns the frame slot if the whole frame became free.
    pub(crate) fn free(
        &mut self,
        addr: BuddyAddr,
        class: usize,
        allowed: &dyn Fn(u32) -> bool,
        relocate: &mut dyn FnMut(Slot, BuddyAddr, BuddyAddr, usize) -> bool,
    ) -> Option<u32> {
        let alloc = self
            .used
            .remove(&addr)
            .unwrap_or_else(|| panic!("double free of buddy block {addr:?}"));
        assert_eq!(alloc.class, class, "buddy block {addr:?} freed with wrong class");
        self.stats[class].used -= 1;
        self.recombine(addr, class, allowed, relocate)
    }

    fn recombine(
        &mut self,
        mut addr: BuddyAddr,
        mut class: usize,
        allowed: &dyn Fn(u32) -> bool,
        relocate: &mut dyn FnMut(Slot, BuddyAddr, BuddyAddr, usize) -> bool,
    ) -> Option<u32> {
        loop {
            if class == self.n_sizes {
                self.frames.remove(&addr.frame);
                return Some(addr.frame);
            }
            let size = Self::size_of(class) as u32;
            let buddy = BuddyAddr {
                frame: addr.frame,
                offset: addr.offset ^ size,
            };
            if self.free[class].remove(&buddy) {
                addr.offset &= !size;
                class += 1;
                continue;
            }
            if self.try_relocate(buddy, class, allowed, relocate) {
                addr.offset &= !size;
                class += 1;
                continue;
            }
            self.free[class].insert(addr);
            return None;
        }
    }

    fn try_relocate(
        &mut self,
        buddy: BuddyAddr,
        class: usize,
        allowed: &dyn Fn(u32) -> bool,
        relocate: &mut dyn FnMut(Slot, BuddyAddr, BuddyAddr, usize) -> bool,
    ) -> bool {
        let owner = match self.used.get(&buddy) {
            Some(Allocation {
                class: c,
                owner: Some(owner),
            }) if *c == class => *owner,
            _ => return false,
        };
        let Some(dst) = self.free[class]
            .iter()
            .find(|a| a.frame != buddy.frame && allowed(a.frame))
            .copied()
        else {
            return false;
        };
        self.free[class].remove(&dst);
        let started = Instant::now();
        if !relocate(owner, buddy, dst, class) {
            self.free[class].insert(dst);
            return false;
        }
        self.move_allocation(buddy, dst);
        let stat = &mut self.stats[class];
        stat.relocated += 1;
        stat.relocated_usec += started.elapsed().as_micros() as u64;
        true
    }

    /// Re-keys an allocation after its bytes were copied to `dst`.
    pub(crate) fn move_allocation(&mut self, src: BuddyAddr, dst: BuddyAddr) {
        if let Some(alloc) = self.used.remove(&src) {
            self.used.insert(dst, alloc);
        }
    }

    pub(crate) fn record_relocation(&mut self, class: usize, usec: u64) {
        let stat = &mut self.stats[class];
        stat.relocated += 1;
        stat.relocated_usec += usec;
    }

    /// Allocations living inside `frame`: (address, class, owner).
    pub(crate) fn allocations_in(&self, frame: u32) -> SmallVec<[(BuddyAddr, usize, Option<Slot>); 8]> {
        let mut out: SmallVec<[_; 8]> = self
            .used
            .iter()
            .filter(|(addr, _)| addr.frame == frame)
            .map(|(addr, a)| (*addr, a.class, a.owner))
            .collect();
        out.sort_unstable_by_key(|(addr, _, _)| *addr);
        out
    }

    pub(crate) fn owns_frame(&self, frame: u32) -> bool {
        self.frames.contains(&frame)
    }

    pub(crate) fn frames(&self) -> impl Iterator<Item = u32> + '_ {
        self.frames.iter().copied()
    }

    pub(crate) fn n_frames(&self) -> usize {
        self.frames.len()
    }

    pub(crate) fn stats(&self) -> Vec<BuddyStat> {
        self.stats.clone()
    }

    #[cfg(test)]
    pub(crate) fn shape(&self) -> Vec<Vec<BuddyAddr>> {
        self.free.iter().map(|set| set.iter().copied().collect()).collect()
    }
}
