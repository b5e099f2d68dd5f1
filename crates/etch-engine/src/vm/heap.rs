//! Reference-counted heap with dirty-set tracking for the cycle collector.
//!
//! Ownership protocol: every owner of a container handle (a register, a
//! global slot, a heap cell's payload, a channel buffer, the finalizer queue)
//! holds exactly one strong count on the cell. `alloc` returns a cell whose
//! count already reflects the handle about to be installed. Weak handles
//! count separately and never keep a cell alive; a dead cell's slot survives
//! as a tombstone until its weak count drains.

use super::value::Value;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;

/// Tri-color marking state used by the cycle collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    White,
    Grey,
    Black,
}

/// Payload of a heap cell.
#[derive(Debug, Clone)]
pub enum HeapData {
    /// `ref[T]` cell
    Cell(Value),
    Array(Vec<Value>),
    Tuple(Vec<Value>),
    Object {
        type_name: String,
        fields: FxHashMap<String, Value>,
    },
    Closure {
        func: u32,
        captures: Vec<Value>,
    },
    Channel(ChannelState),
}

/// Bounded FIFO channel state. Waiting tasks are parked by id.
#[derive(Debug, Clone, Default)]
pub struct ChannelState {
    /// 0 = unbounded
    pub capacity: usize,
    pub buf: VecDeque<Value>,
    pub send_wait: VecDeque<(u32, Value)>,
    pub recv_wait: VecDeque<u32>,
}

impl HeapData {
    /// Heap ids directly referenced by this payload.
    pub fn children(&self, strong: &mut Vec<u32>, weak: &mut Vec<u32>) {
        match self {
            HeapData::Cell(v) => v.collect_ids(strong, weak),
            HeapData::Array(items) | HeapData::Tuple(items) => {
                for v in items {
                    v.collect_ids(strong, weak);
                }
            }
            HeapData::Object { fields, .. } => {
                for v in fields.values() {
                    v.collect_ids(strong, weak);
                }
            }
            HeapData::Closure { captures, .. } => {
                for v in captures {
                    v.collect_ids(strong, weak);
                }
            }
            HeapData::Channel(chan) => {
                for v in &chan.buf {
                    v.collect_ids(strong, weak);
                }
                for (_, v) in &chan.send_wait {
                    v.collect_ids(strong, weak);
                }
            }
        }
    }
}

/// One heap slot.
#[derive(Debug)]
pub struct HeapCell {
    pub alive: bool,
    pub data: HeapData,
    pub strong: u32,
    pub weak: u32,
    pub color: Color,
    /// Destructor already queued/ran; the next zero actually frees
    pub finalized: bool,
}

/// Aggregate collector statistics, surfaced through the embedding ABI.
#[derive(Debug, Clone, Copy, Default)]
pub struct GcStats {
    pub collections: u64,
    pub cells_freed: u64,
    /// Cycle-collection time spent in the current frame
    pub gc_time_us: u64,
    pub total_gc_time_us: u64,
    pub heap_cells: u64,
    pub dirty_cells: u64,
}

/// The heap arena.
pub struct Heap {
    cells: Vec<Option<HeapCell>>,
    free: Vec<u32>,
    /// Cycle-collection candidates: cells whose outgoing reference set
    /// changed since the last pass
    pub dirty: FxHashSet<u32>,
    pub stats: GcStats,
    /// Destructor calls waiting for the interpreter to drain
    pub finalize_queue: VecDeque<(String, Value)>,
    /// Object type name → destructor function key
    destructors: FxHashMap<String, String>,
    /// Total strong-count increments/decrements, for leak accounting
    pub total_retains: u64,
    pub total_releases: u64,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            cells: Vec::new(),
            free: Vec::new(),
            dirty: FxHashSet::default(),
            stats: GcStats::default(),
            finalize_queue: VecDeque::new(),
            destructors: FxHashMap::default(),
            total_retains: 0,
            total_releases: 0,
        }
    }

    pub fn set_destructors(&mut self, table: &[(String, String)]) {
        self.destructors = table.iter().cloned().collect();
    }

    /// Number of live cells.
    pub fn live_cells(&self) -> usize {
        self.cells
            .iter()
            .filter(|c| c.as_ref().map(|c| c.alive).unwrap_or(false))
            .count()
    }

    /// Allocate a cell. The payload's child handles are retained (the cell
    /// now owns them); the returned id carries one strong count for the
    /// handle the caller is about to install.
    pub fn alloc(&mut self, data: HeapData) -> u32 {
        let mut strong_ids = Vec::new();
        let mut weak_ids = Vec::new();
        data.children(&mut strong_ids, &mut weak_ids);
        for id in strong_ids {
            self.inc_strong(id);
        }
        for id in weak_ids {
            self.inc_weak(id);
        }

        let cell = HeapCell {
            alive: true,
            data,
            strong: 1,
            weak: 0,
            color: Color::Black,
            finalized: false,
        };
        self.total_retains += 1;
        match self.free.pop() {
            Some(id) => {
                self.cells[id as usize] = Some(cell);
                id
            }
            None => {
                self.cells.push(Some(cell));
                (self.cells.len() - 1) as u32
            }
        }
    }

    pub fn get(&self, id: u32) -> Option<&HeapCell> {
        self.cells.get(id as usize).and_then(|c| c.as_ref())
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut HeapCell> {
        self.cells.get_mut(id as usize).and_then(|c| c.as_mut())
    }

    pub fn is_alive(&self, id: u32) -> bool {
        self.get(id).map(|c| c.alive).unwrap_or(false)
    }

    /// Mark a cell as a cycle candidate. O(1); called by every write through
    /// a handle.
    pub fn mark_dirty(&mut self, id: u32) {
        self.dirty.insert(id);
    }

    /// Retain every handle held by `v`.
    pub fn retain(&mut self, v: &Value) {
        let mut strong = Vec::new();
        let mut weak = Vec::new();
        v.collect_ids(&mut strong, &mut weak);
        for id in strong {
            self.inc_strong(id);
        }
        for id in weak {
            self.inc_weak(id);
        }
    }

    /// Release every handle held by `v`, finalizing cells whose strong count
    /// reaches zero.
    pub fn release(&mut self, v: &Value) {
        let mut strong = Vec::new();
        let mut weak = Vec::new();
        v.collect_ids(&mut strong, &mut weak);
        for id in strong {
            self.dec_strong(id);
        }
        for id in weak {
            self.dec_weak(id);
        }
    }

    fn inc_strong(&mut self, id: u32) {
        if let Some(cell) = self.get_mut(id) {
            cell.strong += 1;
        }
        self.total_retains += 1;
    }

    fn inc_weak(&mut self, id: u32) {
        if let Some(cell) = self.get_mut(id) {
            cell.weak += 1;
        }
    }

    pub(crate) fn dec_strong(&mut self, id: u32) {
        self.total_releases += 1;
        let Some(cell) = self.get_mut(id) else {
            return;
        };
        debug_assert!(cell.strong > 0, "strong underflow on cell {id}");
        cell.strong = cell.strong.saturating_sub(1);
        if cell.strong == 0 {
            self.finalize(id);
        } else {
            // A decrement that does not reach zero may have severed part of a
            // cycle; remember the cell for trial deletion.
            self.dirty.insert(id);
        }
    }

    pub(crate) fn dec_weak(&mut self, id: u32) {
        let Some(cell) = self.get_mut(id) else {
            return;
        };
        cell.weak = cell.weak.saturating_sub(1);
        if cell.weak == 0 && !cell.alive {
            self.free_slot(id);
        }
    }

    /// Strong count hit zero: run down the cell. Objects with a registered
    /// destructor are revived once, queued for the interpreter, and freed on
    /// the second zero.
    fn finalize(&mut self, id: u32) {
        let needs_destructor = {
            let Some(cell) = self.get(id) else { return };
            if !cell.alive {
                return;
            }
            match (&cell.data, cell.finalized) {
                (HeapData::Object { type_name, .. }, false) => {
                    self.destructors.get(type_name).cloned()
                }
                _ => None,
            }
        };

        if let Some(dtor_key) = needs_destructor {
            // Revive: the queue entry owns one strong count.
            let cell = self.get_mut(id).expect("cell checked above");
            cell.strong = 1;
            cell.finalized = true;
            self.total_retains += 1;
            self.finalize_queue.push_back((dtor_key, Value::Object(id)));
            return;
        }

        let data = {
            let cell = self.get_mut(id).expect("cell checked above");
            cell.alive = false;
            std::mem::replace(&mut cell.data, HeapData::Tuple(Vec::new()))
        };
        self.stats.cells_freed += 1;
        self.dirty.remove(&id);

        let mut strong = Vec::new();
        let mut weak = Vec::new();
        data.children(&mut strong, &mut weak);
        for child in strong {
            self.dec_strong(child);
        }
        for child in weak {
            self.dec_weak(child);
        }

        let keep_tombstone = self.get(id).map(|c| c.weak > 0).unwrap_or(false);
        if !keep_tombstone {
            self.free_slot(id);
        }
    }

    fn free_slot(&mut self, id: u32) {
        if let Some(slot) = self.cells.get_mut(id as usize) {
            *slot = None;
            self.free.push(id);
        }
        self.dirty.remove(&id);
    }

    /// Free a cell whose membership in a garbage cycle was established by the
    /// collector. Counts of member cells are already settled by the caller.
    pub(crate) fn free_cycle_member(&mut self, id: u32) -> HeapData {
        let data = {
            let cell = self.get_mut(id).expect("cycle member must exist");
            cell.alive = false;
            cell.strong = 0;
            std::mem::replace(&mut cell.data, HeapData::Tuple(Vec::new()))
        };
        self.stats.cells_freed += 1;
        let keep_tombstone = self.get(id).map(|c| c.weak > 0).unwrap_or(false);
        if !keep_tombstone {
            self.free_slot(id);
        } else {
            self.dirty.remove(&id);
        }
        data
    }

    /// Refresh the externally visible cell statistics.
    pub fn refresh_stats(&mut self) {
        self.stats.heap_cells = self.live_cells() as u64;
        self.stats.dirty_cells = self.dirty.len() as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_release_frees() {
        let mut heap = Heap::new();
        let id = heap.alloc(HeapData::Cell(Value::Int(5)));
        assert!(heap.is_alive(id));
        heap.release(&Value::Ref(id));
        assert!(!heap.is_alive(id));
        assert_eq!(heap.live_cells(), 0);
    }

    #[test]
    fn test_nested_release() {
        let mut heap = Heap::new();
        let inner = heap.alloc(HeapData::Cell(Value::Int(1)));
        let outer = heap.alloc(HeapData::Array(vec![Value::Ref(inner)]));
        // alloc retained the inner handle; drop our own.
        heap.release(&Value::Ref(inner));
        assert!(heap.is_alive(inner));

        heap.release(&Value::Array(outer));
        assert!(!heap.is_alive(outer));
        assert!(!heap.is_alive(inner));
    }

    #[test]
    fn test_weak_tombstone() {
        let mut heap = Heap::new();
        let id = heap.alloc(HeapData::Cell(Value::Int(9)));
        heap.retain(&Value::Weak(id));
        heap.release(&Value::Ref(id));
        // Dead, but the slot survives for the weak handle.
        assert!(!heap.is_alive(id));
        assert!(heap.get(id).is_some());

        heap.release(&Value::Weak(id));
        assert!(heap.get(id).is_none());
    }

    #[test]
    fn test_slot_reuse() {
        let mut heap = Heap::new();
        let a = heap.alloc(HeapData::Cell(Value::Int(1)));
        heap.release(&Value::Ref(a));
        let b = heap.alloc(HeapData::Cell(Value::Int(2)));
        assert_eq!(a, b);
    }

    #[test]
    fn test_destructor_queues_once() {
        let mut heap = Heap::new();
        heap.set_destructors(&[("File".to_string(), "closeFile::OFile:v".to_string())]);
        let id = heap.alloc(HeapData::Object {
            type_name: "File".to_string(),
            fields: FxHashMap::default(),
        });
        heap.release(&Value::Object(id));
        // Revived, waiting on the queue.
        assert!(heap.is_alive(id));
        assert_eq!(heap.finalize_queue.len(), 1);

        let (_, v) = heap.finalize_queue.pop_front().unwrap();
        heap.release(&v);
        assert!(!heap.is_alive(id));
        assert!(heap.finalize_queue.is_empty());
    }

    #[test]
    fn test_retain_release_balance() {
        let mut heap = Heap::new();
        let id = heap.alloc(HeapData::Cell(Value::Int(5)));
        heap.retain(&Value::Ref(id));
        heap.release(&Value::Ref(id));
        heap.release(&Value::Ref(id));
        assert_eq!(heap.live_cells(), 0);
        assert_eq!(heap.total_retains, heap.total_releases);
    }
}
