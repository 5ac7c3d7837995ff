//! Hazard pointers for scans that drop the list lock between steps.
//!
//! A scan publishes the next slot it will visit. Whoever unlinks that slot
//! first moves the pointer to the slot's scan successor, so the scanner
//! never resumes from an unlinked (and possibly reused) descriptor.

use super::list::{IndexList, ListKind, Slot};

pub(crate) struct HazardPointer {
    kind: ListKind,
    hp: Option<Slot>,
}

impl HazardPointer {
    pub(crate) fn new(kind: ListKind) -> Self {
        Self { kind, hp: None }
    }

    pub(crate) fn get(&self) -> Option<Slot> {
        self.hp
    }

    pub(crate) fn set(&mut self, slot: Option<Slot>) {
        self.hp = slot;
    }

    /// Must run before `removed` is unlinked from `list`.
    pub(crate) fn adjust(&mut self, removed: Slot, list: &IndexList) {
        debug_assert_eq!(list.kind(), self.kind);
        if self.hp == Some(removed) {
            self.hp = list.prev(removed);
        }
    }

    /// Keeps the cursor on a descriptor that moved to a new slot.
    pub(crate) fn relocate(&mut self, old: Slot, new: Slot) {
        if self.hp == Some(old) {
            self.hp = Some(new);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use rand::{Rng, SeedableRng};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;

    struct Scanned {
        list: IndexList,
        hp: HazardPointer,
        removed: Vec<Slot>,
    }

    impl Scanned {
        fn remove(&mut self, slot: Slot) -> bool {
            self.hp.adjust(slot, &self.list);
            let removed = self.list.remove(slot);
            if removed {
                self.removed.push(slot);
            }
            removed
        }
    }

    #[test]
    fn adjust_moves_to_scan_successor() {
        let mut list = IndexList::new(ListKind::Flush);
        for i in 0..3 {
            list.push_front(Slot::Block(i));
        }
        // head: 2, 1, 0 :tail
        let mut hp = HazardPointer::new(ListKind::Flush);
        hp.set(Some(Slot::Block(1)));
        hp.adjust(Slot::Block(0), &list);
        assert_eq!(hp.get(), Some(Slot::Block(1)));
        hp.adjust(Slot::Block(1), &list);
        assert_eq!(hp.get(), Some(Slot::Block(2)));
        list.remove(Slot::Block(1));
        hp.adjust(Slot::Block(2), &list);
        assert_eq!(hp.get(), None);
    }

    #[test]
    fn concurrent_scan_and_remove_never_sees_unlinked_slot() {
        const N: u32 = 4096;
        let mut list = IndexList::new(ListKind::Lru);
        for i in 0..N {
            list.push_front(Slot::Block(i));
        }
        let shared = Arc::new(Mutex::new(Scanned {
            list,
            hp: HazardPointer::new(ListKind::Lru),
            removed: Vec::new(),
        }));
        let done = Arc::new(AtomicBool::new(false));
        let barrier = Arc::new(Barrier::new(3));

        let scanner = {
            let shared = Arc::clone(&shared);
            let barrier = Arc::clone(&barrier);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                barrier.wait();
                let mut visited = 0usize;
                {
                    let mut guard = shared.lock();
                    let tail = guard.list.tail();
                    guard.hp.set(tail);
                }
                loop {
                    let mut guard = shared.lock();
                    let Some(slot) = guard.hp.get() else {
                        break;
                    };
                    assert!(guard.list.contains(slot), "scanner resumed on unlinked {slot:?}");
                    let prev = guard.list.prev(slot);
                    guard.hp.set(prev);
                    drop(guard);
                    visited += 1;
                    thread::yield_now();
                }
                done.store(true, Ordering::SeqCst);
                visited
            })
        };

        let removers: Vec<_> = (0..2u64)
            .map(|seed| {
                let shared = Arc::clone(&shared);
                let barrier = Arc::clone(&barrier);
                let done = Arc::clone(&done);
                thread::spawn(move || {
                    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
                    barrier.wait();
                    while !done.load(Ordering::SeqCst) {
                        let mut guard = shared.lock();
                        // Prefer the hazard pointer itself to exercise adjust().
                        let victim = match guard.hp.get() {
                            Some(slot) if rng.gen_bool(0.5) => slot,
                            _ => Slot::Block(rng.gen_range(0..N)),
                        };
                        guard.remove(victim);
                    }
                })
            })
            .collect();

        let _visited = scanner.join().unwrap();
        for r in removers {
            r.join().unwrap();
        }
        let guard = shared.lock();
        assert_eq!(guard.list.len() + guard.removed.len(), N as usize);
    }
}
