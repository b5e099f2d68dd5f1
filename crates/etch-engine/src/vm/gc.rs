//! Incremental trial-deletion cycle collection.
//!
//! Strong/weak counting reclaims acyclic garbage as counts drain; this
//! collector handles cycles. Candidates are the heap's dirty cells. Each
//! slice takes a bounded chunk of candidates and runs the classic three-color
//! trial deletion over the subgraph they reach: a grey pass trial-deletes
//! internal edges, a scan pass re-blackens anything still externally
//! referenced (register and global handles are counted owners that the grey
//! pass never decrements, so external references keep trial counts positive),
//! and the remaining white cells are garbage cycles.
//!
//! Slices observe the host frame budget: work stops once the deadline passes
//! and leftover candidates stay dirty for the next frame.

use super::heap::{Color, Heap, HeapData};
use rustc_hash::{FxHashMap, FxHashSet};
use std::time::Instant;

/// Candidates processed per slice before the deadline is rechecked.
const CHUNK: usize = 64;

/// Dirty-set size beyond which the collector asks the host for a full frame.
pub const HIGH_WATER: usize = 256;

/// Run cycle collection until the dirty set drains or `deadline` passes.
/// Returns the number of cells freed.
pub fn collect_cycles(heap: &mut Heap, deadline: Option<Instant>) -> u64 {
    let mut freed = 0;
    loop {
        if heap.dirty.is_empty() {
            break;
        }
        if let Some(limit) = deadline {
            if Instant::now() >= limit {
                break;
            }
        }
        let chunk: Vec<u32> = heap.dirty.iter().take(CHUNK).copied().collect();
        for id in &chunk {
            heap.dirty.remove(id);
        }
        freed += collect_chunk(heap, &chunk);
    }
    heap.stats.collections += 1;
    heap.refresh_stats();
    freed
}

/// True when the dirty set has grown past the high-water mark and the host
/// should grant a dedicated collection frame.
pub fn needs_gc_frame(heap: &Heap) -> bool {
    heap.dirty.len() > HIGH_WATER
}

fn collect_chunk(heap: &mut Heap, candidates: &[u32]) -> u64 {
    let mut trial: FxHashMap<u32, i64> = FxHashMap::default();
    let mut touched: Vec<u32> = Vec::new();

    for &id in candidates {
        if heap.is_alive(id) {
            mark_grey(heap, id, &mut trial, &mut touched);
        }
    }
    for &id in candidates {
        if heap.is_alive(id) {
            scan(heap, id, &mut trial);
        }
    }

    // Everything still white is cyclic garbage.
    let whites: FxHashSet<u32> = touched
        .iter()
        .copied()
        .filter(|&id| {
            heap.get(id)
                .map(|c| c.alive && c.color == Color::White)
                .unwrap_or(false)
        })
        .collect();

    // Settle counts for edges leaving the doomed set, then free its members
    // without re-walking their counts. Edges between doomed cells die with
    // them; only the bookkeeping total needs the matching release.
    let mut freed = 0;
    for &id in &whites {
        let data = heap.free_cycle_member(id);
        let mut strong = Vec::new();
        let mut weak = Vec::new();
        data.children(&mut strong, &mut weak);
        for child in strong {
            if whites.contains(&child) {
                heap.total_releases += 1;
            } else {
                heap.dec_strong(child);
            }
        }
        for child in weak {
            heap.dec_weak(child);
        }
        freed += 1;
    }

    // Reset surviving cells to black.
    for id in touched {
        if let Some(cell) = heap.get_mut(id) {
            cell.color = Color::Black;
        }
    }
    freed
}

/// Trial-delete: paint the subgraph grey, decrementing trial counts along
/// every internal strong edge.
fn mark_grey(heap: &mut Heap, root: u32, trial: &mut FxHashMap<u32, i64>, touched: &mut Vec<u32>) {
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        let Some(cell) = heap.get(id) else { continue };
        if !cell.alive || cell.color == Color::Grey {
            continue;
        }
        trial.entry(id).or_insert(cell.strong as i64);
        let mut strong = Vec::new();
        let mut weak = Vec::new();
        cell.data.children(&mut strong, &mut weak);
        if let Some(cell) = heap.get_mut(id) {
            cell.color = Color::Grey;
        }
        touched.push(id);
        for child in strong {
            if let Some(child_cell) = heap.get(child) {
                if child_cell.alive {
                    let entry = trial.entry(child).or_insert(child_cell.strong as i64);
                    *entry -= 1;
                    stack.push(child);
                }
            }
        }
    }
}

/// Scan: grey cells with a positive trial count are externally referenced —
/// re-blacken them and restore the counts they consume; the rest turn white.
fn scan(heap: &mut Heap, root: u32, trial: &mut FxHashMap<u32, i64>) {
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        let Some(cell) = heap.get(id) else { continue };
        if !cell.alive || cell.color != Color::Grey {
            continue;
        }
        let externally_held = trial.get(&id).copied().unwrap_or(1) > 0;
        if externally_held {
            scan_black(heap, id, trial);
        } else {
            let mut strong = Vec::new();
            let mut weak = Vec::new();
            cell.data.children(&mut strong, &mut weak);
            if let Some(cell) = heap.get_mut(id) {
                cell.color = Color::White;
            }
            for child in strong {
                stack.push(child);
            }
        }
    }
}

fn scan_black(heap: &mut Heap, root: u32, trial: &mut FxHashMap<u32, i64>) {
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        let Some(cell) = heap.get(id) else { continue };
        if !cell.alive || cell.color == Color::Black {
            continue;
        }
        let mut strong = Vec::new();
        let mut weak = Vec::new();
        cell.data.children(&mut strong, &mut weak);
        if let Some(cell) = heap.get_mut(id) {
            cell.color = Color::Black;
        }
        for child in strong {
            if let Some(entry) = trial.get_mut(&child) {
                *entry += 1;
            }
            if let Some(child_cell) = heap.get(child) {
                if child_cell.alive && child_cell.color != Color::Black {
                    stack.push(child);
                }
            }
        }
    }
}

/// Convenience wrapper used by tests and the adaptive (budget = 0) path.
pub fn collect_all(heap: &mut Heap) -> u64 {
    collect_cycles(heap, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::value::Value;

    fn ref_cell(heap: &mut Heap, v: Value) -> u32 {
        heap.alloc(HeapData::Cell(v))
    }

    #[test]
    fn test_simple_cycle_collected() {
        let mut heap = Heap::new();
        // a -> b -> a
        let a = ref_cell(&mut heap, Value::Nil);
        let b = ref_cell(&mut heap, Value::Ref(a));
        if let Some(cell) = heap.get_mut(a) {
            cell.data = HeapData::Cell(Value::Ref(b));
        }
        heap.retain(&Value::Ref(b));
        heap.mark_dirty(a);
        // Drop the external handles; counts stay positive through the cycle.
        heap.release(&Value::Ref(a));
        heap.release(&Value::Ref(b));
        assert!(heap.is_alive(a));
        assert!(heap.is_alive(b));

        let freed = collect_all(&mut heap);
        assert_eq!(freed, 2);
        assert!(!heap.is_alive(a));
        assert!(!heap.is_alive(b));
        assert_eq!(heap.live_cells(), 0);
    }

    #[test]
    fn test_externally_referenced_cycle_survives() {
        let mut heap = Heap::new();
        let a = ref_cell(&mut heap, Value::Nil);
        let b = ref_cell(&mut heap, Value::Ref(a));
        if let Some(cell) = heap.get_mut(a) {
            cell.data = HeapData::Cell(Value::Ref(b));
        }
        heap.retain(&Value::Ref(b));
        heap.mark_dirty(a);
        // Keep the register handle on `a`; drop only `b`'s.
        heap.release(&Value::Ref(b));

        collect_all(&mut heap);
        assert!(heap.is_alive(a));
        assert!(heap.is_alive(b));

        // Now drop the last handle and collect again.
        heap.mark_dirty(a);
        heap.release(&Value::Ref(a));
        collect_all(&mut heap);
        assert_eq!(heap.live_cells(), 0);
    }

    #[test]
    fn test_self_cycle_through_array() {
        let mut heap = Heap::new();
        let arr = heap.alloc(HeapData::Array(vec![Value::Nil]));
        if let Some(cell) = heap.get_mut(arr) {
            cell.data = HeapData::Array(vec![Value::Array(arr)]);
        }
        heap.retain(&Value::Array(arr));
        heap.mark_dirty(arr);
        heap.release(&Value::Array(arr));
        assert!(heap.is_alive(arr));

        let freed = collect_all(&mut heap);
        assert_eq!(freed, 1);
        assert_eq!(heap.live_cells(), 0);
    }

    #[test]
    fn test_acyclic_dirty_cells_survive() {
        let mut heap = Heap::new();
        let a = ref_cell(&mut heap, Value::Int(1));
        heap.mark_dirty(a);
        let freed = collect_all(&mut heap);
        assert_eq!(freed, 0);
        assert!(heap.is_alive(a));
    }

    #[test]
    fn test_needs_gc_frame_high_water() {
        let mut heap = Heap::new();
        assert!(!needs_gc_frame(&heap));
        for _ in 0..(HIGH_WATER + 1) {
            let id = ref_cell(&mut heap, Value::Int(0));
            heap.mark_dirty(id);
        }
        assert!(needs_gc_frame(&heap));
    }
}
