//! LRU list with midpoint insertion.
//!
//! The tail part of the list is the "old" sublist. Pages read from disk
//! enter at its head (the midpoint) and only reach the young end once they
//! survive the promotion interval, so one large scan cannot flush the
//! working set. `old` points at the youngest block of the old sublist and
//! its length is kept within [`OLD_TOLERANCE`] of the configured ratio
//! whenever the list holds at least `min_len` blocks.

use super::hazard::HazardPointer;
use super::list::{IndexList, ListKind, Slot};

/// Denominator of the old-sublist ratio.
pub const OLD_RATIO_DIV: usize = 1024;
/// Smallest accepted ratio (about 5%).
pub const OLD_RATIO_MIN: usize = 51;
/// Largest accepted ratio.
pub const OLD_RATIO_MAX: usize = OLD_RATIO_DIV;
/// Allowed drift of the old sublist length before it is moved.
pub const OLD_TOLERANCE: usize = 20;
/// Blocks always kept in the young sublist.
pub const NON_OLD_MIN_LEN: usize = 5;

/// Old-sublist ratio for a percentage, clamped to the accepted range.
pub fn ratio_from_pct(pct: u32) -> usize {
    (pct as usize * OLD_RATIO_DIV / 100).clamp(OLD_RATIO_MIN, OLD_RATIO_MAX)
}

/// Access to the `old` flag of the descriptors behind list slots.
pub(crate) trait OldFlags {
    fn set_old(&self, slot: Slot, old: bool);
    fn is_old(&self, slot: Slot) -> bool;
}

/// The three scan cursors kept on the LRU.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Cursor {
    /// LRU flush batches.
    Flush,
    /// Free-block eviction scan.
    Scan,
    /// Single-page flushes.
    Single,
}

pub(crate) struct Lru {
    list: IndexList,
    old: Option<Slot>,
    old_len: usize,
    ratio: usize,
    min_len: usize,
    unzip: IndexList,
    flush_hp: HazardPointer,
    scan_itr: HazardPointer,
    single_itr: HazardPointer,
}

impl Lru {
    pub(crate) fn new(ratio: usize, min_len: usize) -> Self {
        assert!(
            min_len > OLD_TOLERANCE + NON_OLD_MIN_LEN,
            "LRU old minimum length {min_len} too small"
        );
        Self {
            list: IndexList::new(ListKind::Lru),
            old: None,
            old_len: 0,
            ratio: ratio.clamp(OLD_RATIO_MIN, OLD_RATIO_MAX),
            min_len,
            unzip: IndexList::new(ListKind::UnzipLru),
            flush_hp: HazardPointer::new(ListKind::Lru),
            scan_itr: HazardPointer::new(ListKind::Lru),
            single_itr: HazardPointer::new(ListKind::Lru),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.list.len()
    }

    pub(crate) fn old_len(&self) -> usize {
        self.old_len
    }

    pub(crate) fn ratio(&self) -> usize {
        self.ratio
    }

    pub(crate) fn list(&self) -> &IndexList {
        &self.list
    }

    pub(crate) fn unzip(&self) -> &IndexList {
        &self.unzip
    }

    pub(crate) fn contains(&self, slot: Slot) -> bool {
        self.list.contains(slot)
    }

    pub(crate) fn tail(&self) -> Option<Slot> {
        self.list.tail()
    }

    pub(crate) fn prev(&self, slot: Slot) -> Option<Slot> {
        self.list.prev(slot)
    }

    /// Changes the ratio and re-establishes the old sublist length.
    pub(crate) fn set_ratio(&mut self, ratio: usize, flags: &impl OldFlags) -> bool {
        let ratio = ratio.clamp(OLD_RATIO_MIN, OLD_RATIO_MAX);
        if ratio == self.ratio {
            return false;
        }
        self.ratio = ratio;
        if self.old.is_some() {
            self.adjust_old_len(flags);
        }
        true
    }

    /// Target length of the old sublist for the current list length.
    pub(crate) fn target_old_len(&self) -> usize {
        let len = self.list.len();
        (len * self.ratio / OLD_RATIO_DIV).min(len.saturating_sub(OLD_TOLERANCE + NON_OLD_MIN_LEN))
    }

    fn adjust_old_len(&mut self, flags: &impl OldFlags) {
        let new_len = self.target_old_len();
        loop {
            let Some(old) = self.old else {
                return;
            };
            if self.old_len + OLD_TOLERANCE < new_len {
                let Some(prev) = self.list.prev(old) else {
                    return;
                };
                self.old = Some(prev);
                self.old_len += 1;
                flags.set_old(prev, true);
            } else if self.old_len > new_len + OLD_TOLERANCE {
                let Some(next) = self.list.next(old) else {
                    return;
                };
                self.old = Some(next);
                self.old_len -= 1;
                flags.set_old(old, false);
            } else {
                return;
            }
        }
    }

    fn old_init(&mut self, flags: &impl OldFlags) {
        for slot in self.list.iter_rev() {
            flags.set_old(slot, true);
        }
        self.old = self.list.head();
        self.old_len = self.list.len();
        self.adjust_old_len(flags);
    }

    /// Links `slot` at the midpoint (`old`) or the head. Returns true when
    /// the block went to the head; the caller then stamps its
    /// freed-page clock.
    pub(crate) fn add_block(&mut self, slot: Slot, old: bool, flags: &impl OldFlags) -> bool {
        let at_head = match self.old {
            Some(anchor) if old && self.list.len() >= self.min_len => {
                self.list.insert_after(anchor, slot);
                self.old_len += 1;
                false
            }
            _ => {
                self.list.push_front(slot);
                true
            }
        };
        let len = self.list.len();
        if len > self.min_len {
            flags.set_old(slot, old);
            self.adjust_old_len(flags);
        } else if len == self.min_len {
            self.old_init(flags);
        } else {
            flags.set_old(slot, self.old.is_some());
        }
        at_head
    }

    /// Unlinks `slot` from the LRU (and the unzip LRU).
    pub(crate) fn remove(&mut self, slot: Slot, flags: &impl OldFlags) {
        self.flush_hp.adjust(slot, &self.list);
        self.scan_itr.adjust(slot, &self.list);
        self.single_itr.adjust(slot, &self.list);

        if self.old == Some(slot) {
            match self.list.prev(slot) {
                Some(prev) => {
                    self.old = Some(prev);
                    flags.set_old(prev, true);
                    self.old_len += 1;
                }
                None => self.old = None,
            }
        }
        let was_old = flags.is_old(slot);
        if !self.list.remove(slot) {
            panic!("{slot:?} is not in the LRU list");
        }
        self.unzip.remove(slot);

        if self.list.len() < self.min_len {
            for s in self.list.iter() {
                flags.set_old(s, false);
            }
            self.old = None;
            self.old_len = 0;
            return;
        }
        if was_old {
            self.old_len -= 1;
        }
        self.adjust_old_len(flags);
    }

    /// Moves `slot` to the head. Returns whether it was in the old sublist.
    pub(crate) fn make_young(&mut self, slot: Slot, flags: &impl OldFlags) -> bool {
        let was_old = flags.is_old(slot);
        self.remove(slot, flags);
        self.add_block(slot, false, flags);
        was_old
    }

    /// Puts `new` in place of `old` without touching aging state.
    pub(crate) fn replace(&mut self, old: Slot, new: Slot) {
        self.list.replace(old, new);
        if self.old == Some(old) {
            self.old = Some(new);
        }
        if self.unzip.contains(old) {
            self.unzip.replace(old, new);
        }
        self.flush_hp.relocate(old, new);
        self.scan_itr.relocate(old, new);
        self.single_itr.relocate(old, new);
    }

    /// Links a block that has both frames into the unzip LRU.
    pub(crate) fn unzip_add(&mut self, slot: Slot, old: bool) {
        if old {
            self.unzip.push_back(slot);
        } else {
            self.unzip.push_front(slot);
        }
    }

    pub(crate) fn unzip_remove(&mut self, slot: Slot) -> bool {
        self.unzip.remove(slot)
    }

    fn hp(&self, which: Cursor) -> &HazardPointer {
        match which {
            Cursor::Flush => &self.flush_hp,
            Cursor::Scan => &self.scan_itr,
            Cursor::Single => &self.single_itr,
        }
    }

    fn hp_mut(&mut self, which: Cursor) -> &mut HazardPointer {
        match which {
            Cursor::Flush => &mut self.flush_hp,
            Cursor::Scan => &mut self.scan_itr,
            Cursor::Single => &mut self.single_itr,
        }
    }

    pub(crate) fn cursor(&self, which: Cursor) -> Option<Slot> {
        self.hp(which).get()
    }

    pub(crate) fn set_cursor(&mut self, which: Cursor, slot: Option<Slot>) {
        self.hp_mut(which).set(slot);
    }

    /// Positions a scan cursor: resumes from its hazard pointer unless that
    /// block left the old sublist, otherwise starts at the tail.
    pub(crate) fn cursor_start(&mut self, which: Cursor, flags: &impl OldFlags) -> Option<Slot> {
        match self.cursor(which) {
            Some(slot) if flags.is_old(slot) => Some(slot),
            _ => {
                let tail = self.list.tail();
                self.set_cursor(which, tail);
                tail
            }
        }
    }

    /// Structural checks used by `validate`.
    pub(crate) fn check(&self, flags: &impl OldFlags) -> Result<(), String> {
        let len = self.list.len();
        let n_old = self.list.iter().filter(|s| flags.is_old(*s)).count();
        if len < self.min_len {
            if self.old.is_some() || self.old_len != 0 || n_old != 0 {
                return Err(format!(
                    "short LRU ({len}) has old state: ptr={:?} len={} flagged={n_old}",
                    self.old, self.old_len
                ));
            }
            return Ok(());
        }
        let Some(old) = self.old else {
            return Err(format!("LRU of {len} blocks has no old pointer"));
        };
        if n_old != self.old_len {
            return Err(format!("old_len {} but {n_old} blocks flagged old", self.old_len));
        }
        let mut in_old = false;
        for slot in self.list.iter() {
            in_old |= slot == old;
            if flags.is_old(slot) != in_old {
                return Err(format!("{slot:?} old flag disagrees with its position"));
            }
        }
        let target = self.target_old_len();
        if self.old_len.abs_diff(target) > OLD_TOLERANCE {
            return Err(format!(
                "old sublist {} outside tolerance of target {target}",
                self.old_len
            ));
        }
        Ok(())
    }
}
