//! Doubly linked lists over descriptor slots.
//!
//! Links live in a side table keyed by [`Slot`], so a descriptor can sit in
//! several lists (LRU plus flush list) without intrusive pointers. Scans run
//! from the tail toward the head; `prev` is the scan successor.

use rustc_hash::FxHashMap;

/// Address of a descriptor inside one pool instance.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub(crate) enum Slot {
    /// Block with an uncompressed frame, by arena index.
    Block(u32),
    /// Compressed-only descriptor, by zip slab index.
    Zip(u32),
}

/// Which list a structure tracks.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum ListKind {
    Free,
    Withdraw,
    Lru,
    UnzipLru,
    Flush,
}

#[derive(Copy, Clone, Default, Debug)]
struct Link {
    prev: Option<Slot>,
    next: Option<Slot>,
}

pub(crate) struct IndexList {
    kind: ListKind,
    head: Option<Slot>,
    tail: Option<Slot>,
    links: FxHashMap<Slot, Link>,
}

impl IndexList {
    pub(crate) fn new(kind: ListKind) -> Self {
        Self {
            kind,
            head: None,
            tail: None,
            links: FxHashMap::default(),
        }
    }

    pub(crate) fn kind(&self) -> ListKind {
        self.kind
    }

    pub(crate) fn len(&self) -> usize {
        self.links.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub(crate) fn head(&self) -> Option<Slot> {
        self.head
    }

    pub(crate) fn tail(&self) -> Option<Slot> {
        self.tail
    }

    pub(crate) fn contains(&self, slot: Slot) -> bool {
        self.links.contains_key(&slot)
    }

    /// Neighbour toward the head.
    pub(crate) fn prev(&self, slot: Slot) -> Option<Slot> {
        self.links.get(&slot).and_then(|l| l.prev)
    }

    /// Neighbour toward the tail.
    pub(crate) fn next(&self, slot: Slot) -> Option<Slot> {
        self.links.get(&slot).and_then(|l| l.next)
    }

    fn claim(&mut self, slot: Slot, link: Link) {
        let prior = self.links.insert(slot, link);
        assert!(
            prior.is_none(),
            "{slot:?} is already linked into the {:?} list",
            self.kind
        );
    }

    pub(crate) fn push_front(&mut self, slot: Slot) {
        let link = Link {
            prev: None,
            next: self.head,
        };
        self.claim(slot, link);
        match self.head {
            Some(old) => self.link_mut(old).prev = Some(slot),
            None => self.tail = Some(slot),
        }
        self.head = Some(slot);
    }

    pub(crate) fn push_back(&mut self, slot: Slot) {
        let link = Link {
            prev: self.tail,
            next: None,
        };
        self.claim(slot, link);
        match self.tail {
            Some(old) => self.link_mut(old).next = Some(slot),
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
    }

    /// Links `slot` directly behind `anchor` (toward the tail).
    pub(crate) fn insert_after(&mut self, anchor: Slot, slot: Slot) {
        let next = self.link(anchor).next;
        self.claim(
            slot,
            Link {
                prev: Some(anchor),
                next,
            },
        );
        self.link_mut(anchor).next = Some(slot);
        match next {
            Some(n) => self.link_mut(n).prev = Some(slot),
            None => self.tail = Some(slot),
        }
    }

    /// Unlinks `slot`; returns false if it was not linked.
    pub(crate) fn remove(&mut self, slot: Slot) -> bool {
        let Some(link) = self.links.remove(&slot) else {
            return false;
        };
        match link.prev {
            Some(p) => self.link_mut(p).next = link.next,
            None => self.head = link.next,
        }
        match link.next {
            Some(n) => self.link_mut(n).prev = link.prev,
            None => self.tail = link.prev,
        }
        true
    }

    pub(crate) fn pop_front(&mut self) -> Option<Slot> {
        let head = self.head?;
        self.remove(head);
        Some(head)
    }

    /// Puts `new` at the position of `old`.
    pub(crate) fn replace(&mut self, old: Slot, new: Slot) {
        let link = self
            .links
            .remove(&old)
            .unwrap_or_else(|| panic!("{old:?} is not in the {:?} list", self.kind));
        self.claim(new, link);
        match link.prev {
            Some(p) => self.link_mut(p).next = Some(new),
            None => self.head = Some(new),
        }
        match link.next {
            Some(n) => self.link_mut(n).prev = Some(new),
            None => self.tail = Some(new),
        }
    }

    /// Head to tail.
    pub(crate) fn iter(&self) -> impl Iterator<Item = Slot> + '_ {
        std::iter::successors(self.head, move |s| self.next(*s))
    }

    /// Tail to head (scan order).
    pub(crate) fn iter_rev(&self) -> impl Iterator<Item = Slot> + '_ {
        std::iter::successors(self.tail, move |s| self.prev(*s))
    }

    fn link(&self, slot: Slot) -> Link {
        self.links
            .get(&slot)
            .copied()
            .unwrap_or_else(|| panic!("{slot:?} is not in the {:?} list", self.kind))
    }

    fn link_mut(&mut self, slot: Slot) -> &mut Link {
        let kind = self.kind;
        self.links
            .get_mut(&slot)
            .unwrap_or_else(|| panic!("{slot:?} is not in the {kind:?} list"))
    }
}
