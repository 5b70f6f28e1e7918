//! The monitor table.
//!
//! Object monitors live in a table keyed by object reference, created on
//! first contention-free entry and reclaimed by the sweep-purge pass once
//! their object dies. The condition variable of a monitor is created lazily
//! by the first `wait`; purge asserts it has no waiters before dropping it.

use crate::heap::{Heap, HeapRef, header};
use crate::keys::ThreadId;
use parking_lot::Condvar;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct Monitor {
    pub owner: Option<ThreadId>,
    pub count: u32,
    pub cond: Option<Arc<Condvar>>,
    pub waiters: u32,
}

#[derive(Default)]
pub struct MonitorTable {
    entries: HashMap<HeapRef, Monitor>,
}

impl MonitorTable {
    pub fn entry_mut(&mut self, obj: HeapRef) -> &mut Monitor {
        self.entries.entry(obj).or_default()
    }

    pub fn get_mut(&mut self, obj: HeapRef) -> Option<&mut Monitor> {
        self.entries.get_mut(&obj)
    }

    pub fn get(&self, obj: HeapRef) -> Option<&Monitor> {
        self.entries.get(&obj)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops the monitors of dead objects. Runs with the world stopped,
    /// right after the mark phase; a dead object cannot have waiters.
    pub fn purge(&mut self, heap: &Heap) {
        self.entries.retain(|&obj, monitor| {
            if header::is_marked(heap.header_of(obj)) {
                true
            } else {
                assert_eq!(monitor.waiters, 0, "dead object with monitor waiters");
                false
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monitors_keep_owner_and_count_consistent() {
        let mut table = MonitorTable::default();
        let me = ThreadId::from_usize(1);

        let entry = table.entry_mut(64);
        assert!(entry.owner.is_none());
        entry.owner = Some(me);
        entry.count = 1;
        entry.count += 1;

        let entry = table.get_mut(64).unwrap();
        assert_eq!(entry.owner, Some(me));
        entry.count -= 1;
        entry.count -= 1;
        if entry.count == 0 {
            entry.owner = None;
        }
        assert!(table.get(64).unwrap().owner.is_none());
    }
}
