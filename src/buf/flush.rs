//! Dirty-page list and flush batch gates.
//!
//! The list runs from the newest `oldest_modification` at the head to the
//! oldest at the tail, so checkpoint batches walk from the tail. LSNs are
//! kept beside the links so the flush lock never needs to look at a
//! descriptor. During recovery, pages are dirtied out of order and an
//! ordered index finds the insert position.

use std::collections::BTreeSet;
use std::ops::Bound::{Excluded, Unbounded};

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;

use super::descriptor::FlushType;
use super::hazard::HazardPointer;
use super::list::{IndexList, ListKind, Slot};
use crate::types::Lsn;

pub(crate) struct FlushList {
    list: IndexList,
    lsn: FxHashMap<Slot, Lsn>,
    rbt: Option<BTreeSet<(u64, Slot)>>,
    /// Cursor of flush-list batches.
    pub(crate) hp: HazardPointer,
}

impl Default for FlushList {
    fn default() -> Self {
        Self::new()
    }
}

impl FlushList {
    pub(crate) fn new() -> Self {
        Self {
            list: IndexList::new(ListKind::Flush),
            lsn: FxHashMap::default(),
            rbt: None,
            hp: HazardPointer::new(ListKind::Flush),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.list.len()
    }

    pub(crate) fn contains(&self, slot: Slot) -> bool {
        self.list.contains(slot)
    }

    pub(crate) fn list(&self) -> &IndexList {
        &self.list
    }

    pub(crate) fn lsn_of(&self, slot: Slot) -> Option<Lsn> {
        self.lsn.get(&slot).copied()
    }

    /// Smallest `oldest_modification` on the list.
    pub(crate) fn oldest(&self) -> Option<Lsn> {
        self.list.tail().and_then(|s| self.lsn_of(s))
    }

    pub(crate) fn has_rbt(&self) -> bool {
        self.rbt.is_some()
    }

    /// Builds the ordered index from the current list contents.
    pub(crate) fn create_rbt(&mut self) {
        let rbt = self.lsn.iter().map(|(slot, lsn)| (lsn.0, *slot)).collect();
        self.rbt = Some(rbt);
    }

    pub(crate) fn free_rbt(&mut self) {
        self.rbt = None;
    }

    /// Adds a newly dirtied page.
    pub(crate) fn insert(&mut self, slot: Slot, lsn: Lsn) {
        assert!(!lsn.is_zero(), "dirtying {slot:?} with a zero LSN");
        match &mut self.rbt {
            Some(rbt) => {
                let successor = rbt.range((Excluded((lsn.0, slot)), Unbounded)).next().copied();
                rbt.insert((lsn.0, slot));
                match successor {
                    Some((_, anchor)) => self.list.insert_after(anchor, slot),
                    None => self.list.push_front(slot),
                }
            }
            None => {
                // Pages normally arrive in LSN order; walk past any newer ones.
                let mut anchor = None;
                let mut cursor = self.list.head();
                while let Some(s) = cursor {
                    if self.lsn[&s] <= lsn {
                        break;
                    }
                    anchor = Some(s);
                    cursor = self.list.next(s);
                }
                match anchor {
                    Some(a) => self.list.insert_after(a, slot),
                    None => self.list.push_front(slot),
                }
            }
        }
        self.lsn.insert(slot, lsn);
    }

    /// Removes a page that became clean; false if it was not listed.
    pub(crate) fn remove(&mut self, slot: Slot) -> bool {
        let Some(lsn) = self.lsn.remove(&slot) else {
            return false;
        };
        self.hp.adjust(slot, &self.list);
        self.list.remove(slot);
        if let Some(rbt) = &mut self.rbt {
            rbt.remove(&(lsn.0, slot));
        }
        true
    }

    /// Keeps the position of a page that moved to another slot.
    pub(crate) fn relocate(&mut self, old: Slot, new: Slot) {
        let Some(lsn) = self.lsn.remove(&old) else {
            return;
        };
        self.list.replace(old, new);
        self.lsn.insert(new, lsn);
        if let Some(rbt) = &mut self.rbt {
            rbt.remove(&(lsn.0, old));
            rbt.insert((lsn.0, new));
        }
        self.hp.relocate(old, new);
    }

    /// Ordering and index checks used by `validate`.
    pub(crate) fn check(&self) -> Result<(), String> {
        let mut prev: Option<Lsn> = None;
        for slot in self.list.iter() {
            let lsn = self
                .lsn_of(slot)
                .ok_or_else(|| format!("{slot:?} listed without an LSN"))?;
            if let Some(p) = prev {
                if lsn > p {
                    return Err(format!("flush list out of order at {slot:?}: {lsn} after {p}"));
                }
            }
            prev = Some(lsn);
        }
        if self.lsn.len() != self.list.len() {
            return Err("flush list LSN map out of sync".into());
        }
        if let Some(rbt) = &self.rbt {
            if rbt.len() != self.list.len()
                || rbt.iter().any(|(lsn, slot)| self.lsn_of(*slot) != Some(Lsn(*lsn)))
            {
                return Err("recovery index disagrees with the flush list".into());
            }
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Default, Debug)]
struct GateState {
    init: bool,
    n_flush: usize,
}

/// One batch per flush type, plus the count of its writes in flight.
pub(crate) struct FlushGates {
    state: Mutex<[GateState; 3]>,
    done: Condvar,
}

impl Default for FlushGates {
    fn default() -> Self {
        Self::new()
    }
}

impl FlushGates {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new([GateState::default(); 3]),
            done: Condvar::new(),
        }
    }

    /// Claims the batch slot of `ty`; false if a batch of that type is
    /// running or still has writes in flight.
    pub(crate) fn try_start(&self, ty: FlushType) -> bool {
        let mut state = self.state.lock();
        let gate = &mut state[ty as usize];
        if gate.init || gate.n_flush > 0 {
            return false;
        }
        gate.init = true;
        true
    }

    pub(crate) fn end(&self, ty: FlushType) {
        let mut state = self.state.lock();
        let gate = &mut state[ty as usize];
        gate.init = false;
        if gate.n_flush == 0 {
            self.done.notify_all();
        }
    }

    pub(crate) fn io_started(&self, ty: FlushType) {
        self.state.lock()[ty as usize].n_flush += 1;
    }

    pub(crate) fn io_done(&self, ty: FlushType) {
        let mut state = self.state.lock();
        let gate = &mut state[ty as usize];
        gate.n_flush -= 1;
        if gate.n_flush == 0 && !gate.init {
            self.done.notify_all();
        }
    }

    pub(crate) fn in_flight(&self, ty: FlushType) -> usize {
        self.state.lock()[ty as usize].n_flush
    }

    /// Blocks until no batch of `ty` runs and its writes have completed.
    pub(crate) fn wait_end(&self, ty: FlushType) {
        let mut state = self.state.lock();
        while state[ty as usize].init || state[ty as usize].n_flush > 0 {
            self.done.wait(&mut state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn b(i: u32) -> Slot {
        Slot::Block(i)
    }

    fn order(list: &FlushList) -> Vec<Slot> {
        list.list().iter().collect()
    }

    #[test]
    fn in_order_inserts_go_to_head() {
        let mut fl = FlushList::new();
        fl.insert(b(1), Lsn(10));
        fl.insert(b(2), Lsn(20));
        fl.insert(b(3), Lsn(30));
        assert_eq!(order(&fl), vec![b(3), b(2), b(1)]);
        assert_eq!(fl.oldest(), Some(Lsn(10)));
        fl.check().unwrap();
    }

    #[test]
    fn out_of_order_insert_keeps_sorted() {
        let mut fl = FlushList::new();
        fl.insert(b(1), Lsn(10));
        fl.insert(b(3), Lsn(30));
        fl.insert(b(2), Lsn(20));
        assert_eq!(order(&fl), vec![b(3), b(2), b(1)]);
        fl.insert(b(0), Lsn(5));
        assert_eq!(fl.oldest(), Some(Lsn(5)));
        fl.check().unwrap();
    }

    #[test]
    fn recovery_index_places_by_lsn() {
        let mut fl = FlushList::new();
        fl.insert(b(1), Lsn(50));
        fl.create_rbt();
        fl.insert(b(2), Lsn(10));
        fl.insert(b(3), Lsn(70));
        fl.insert(b(4), Lsn(40));
        fl.insert(b(5), Lsn(40));
        assert_eq!(
            order(&fl).iter().map(|s| fl.lsn_of(*s).unwrap().0).collect::<Vec<_>>(),
            vec![70, 50, 40, 40, 10]
        );
        fl.check().unwrap();
        assert!(fl.remove(b(4)));
        fl.check().unwrap();
        fl.free_rbt();
        assert!(!fl.has_rbt());
    }

    #[test]
    fn relocate_keeps_position_and_cursor() {
        let mut fl = FlushList::new();
        for i in 1..=3 {
            fl.insert(b(i), Lsn(u64::from(i)));
        }
        fl.hp.set(Some(b(2)));
        fl.relocate(b(2), Slot::Zip(0));
        assert_eq!(order(&fl), vec![b(3), Slot::Zip(0), b(1)]);
        assert_eq!(fl.hp.get(), Some(Slot::Zip(0)));
        assert!(fl.remove(Slot::Zip(0)));
        assert_eq!(fl.hp.get(), Some(b(3)));
    }

    #[test]
    fn gates_allow_one_batch_per_type() {
        let gates = Arc::new(FlushGates::new());
        assert!(gates.try_start(FlushType::List));
        assert!(!gates.try_start(FlushType::List));
        assert!(gates.try_start(FlushType::Lru));
        gates.io_started(FlushType::List);
        gates.end(FlushType::List);
        assert!(!gates.try_start(FlushType::List), "writes still in flight");

        let waiter = {
            let gates = Arc::clone(&gates);
            thread::spawn(move || gates.wait_end(FlushType::List))
        };
        thread::sleep(Duration::from_millis(20));
        gates.io_done(FlushType::List);
        waiter.join().unwrap();
        assert!(gates.try_start(FlushType::List));
        gates.end(FlushType::List);
        gates.end(FlushType::Lru);
    }
}
