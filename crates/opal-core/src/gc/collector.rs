//! Generational mark-and-sweep collector
//!
//! Every collection entry point marks from the roots it is handed before
//! any sweep runs; there is no sweep path that can observe unmarked live
//! objects. Minor collections sweep the young generation and advance
//! survivors one tenure step; major collections sweep the old generation.

use super::heap::{Generation, Handle, Heap};
use crate::object::HeapObject;
use crate::value::Value;
use crate::vm::defaults;
use crate::weak::WeakRegistry;
use std::time::{Duration, Instant};

/// Garbage collector statistics
#[derive(Debug, Clone, Default)]
pub struct GcStats {
    /// Full collections run
    pub collections: usize,

    /// Minor collections run (standalone or as part of a full collection)
    pub minor_collections: usize,

    /// Total objects freed
    pub objects_freed: usize,

    /// Total objects promoted to the old generation
    pub objects_promoted: usize,

    /// Objects marked by the last collection
    pub last_marked: usize,

    /// Live objects after the last collection
    pub live_objects: usize,

    /// Total pause time across all collections
    pub total_pause_time: Duration,

    /// Last collection duration
    pub last_pause_time: Duration,
}

impl GcStats {
    fn record(&mut self, pause: Duration, marked: usize, live: usize) {
        self.total_pause_time += pause;
        self.last_pause_time = pause;
        self.last_marked = marked;
        self.live_objects = live;
    }
}

/// Generational mark-and-sweep garbage collector
#[derive(Debug)]
pub struct GarbageCollector {
    heap: Heap,
    young_threshold: usize,
    stats: GcStats,
}

impl GarbageCollector {
    /// Create a collector with the given young-generation threshold
    pub fn new(young_threshold: usize) -> Self {
        Self {
            heap: Heap::new(),
            young_threshold,
            stats: GcStats::default(),
        }
    }

    /// Borrow the heap
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Mutably borrow the heap
    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// Get collector statistics
    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    /// Allocate an object into the young generation
    ///
    /// Allocation never sweeps on its own; the engine checks
    /// [`should_collect`](Self::should_collect) and runs a collection with
    /// its roots before calling this.
    pub fn allocate(&mut self, object: HeapObject) -> Handle {
        self.heap.alloc(object)
    }

    /// Whether the young generation has outgrown its threshold
    pub fn should_collect(&self) -> bool {
        self.heap.young_count() > self.young_threshold
    }

    /// Minor collection: mark from roots, sweep the young generation
    pub fn collect_minor(&mut self, roots: &[Value], weak: &mut WeakRegistry) {
        let start = Instant::now();

        let marked = self.mark(roots);
        let (freed, promoted) = self.sweep_young(weak);
        self.clear_old_marks();

        self.stats.minor_collections += 1;
        self.stats.objects_freed += freed;
        self.stats.objects_promoted += promoted;
        self.stats
            .record(start.elapsed(), marked, self.heap.live_objects());
    }

    /// Full collection: mark from roots, minor sweep, then major sweep
    pub fn collect_full(&mut self, roots: &[Value], weak: &mut WeakRegistry) {
        let start = Instant::now();

        let marked = self.mark(roots);
        let (freed_young, promoted) = self.sweep_young(weak);
        let freed_old = self.sweep_old(weak);

        self.stats.collections += 1;
        self.stats.minor_collections += 1;
        self.stats.objects_freed += freed_young + freed_old;
        self.stats.objects_promoted += promoted;
        self.stats
            .record(start.elapsed(), marked, self.heap.live_objects());
    }

    /// Mark phase: traverse the heap from the given roots
    ///
    /// Returns the number of objects marked.
    fn mark(&mut self, roots: &[Value]) -> usize {
        let mut marked = 0;
        for root in roots {
            if let Some(handle) = root.handle() {
                marked += self.mark_handle(handle);
            }
        }
        marked
    }

    /// Mark one object and everything reachable from it
    fn mark_handle(&mut self, handle: Handle) -> usize {
        match self.heap.header_mut(handle) {
            Some(header) if !header.marked => header.marked = true,
            _ => return 0,
        }

        // Collect child handles first; marking mutates headers while the
        // object contents are borrowed otherwise.
        let mut children = Vec::new();
        if let Some(object) = self.heap.get(handle) {
            match object {
                HeapObject::Array(a) => {
                    children.extend(a.elements.iter().filter_map(Value::handle));
                }
                HeapObject::Map(m) => {
                    children.extend(m.entries.values().filter_map(Value::handle));
                }
                HeapObject::Record(r) => {
                    children.extend(r.fields.values().filter_map(Value::handle));
                }
                HeapObject::Function(_) => {}
                HeapObject::Closure(c) => {
                    children.push(c.function);
                    children.extend(c.captures.iter().filter_map(Value::handle));
                }
            }
        }

        let mut marked = 1;
        for child in children {
            marked += self.mark_handle(child);
        }
        marked
    }

    /// Sweep the young generation
    ///
    /// Unmarked objects are finalized; survivors advance one tenure step and
    /// are promoted once they exceed the tenure threshold. Returns
    /// `(freed, promoted)`.
    fn sweep_young(&mut self, weak: &mut WeakRegistry) -> (usize, usize) {
        let handles = std::mem::take(&mut self.heap.young);
        let mut kept = Vec::with_capacity(handles.len());
        let mut freed = 0;
        let mut promoted = 0;

        for handle in handles {
            let marked = self
                .heap
                .header(handle)
                .map(|h| h.marked)
                .unwrap_or(false);
            if !marked {
                self.finalize(handle, weak);
                freed += 1;
                continue;
            }

            if let Some(header) = self.heap.header_mut(handle) {
                header.marked = false;
                header.tenure += 1;
                if header.tenure > defaults::TENURE_THRESHOLD {
                    header.generation = Generation::Old;
                    self.heap.old.push(handle);
                    promoted += 1;
                } else {
                    kept.push(handle);
                }
            }
        }

        self.heap.young = kept;
        (freed, promoted)
    }

    /// Sweep the old generation; returns the number of objects freed
    fn sweep_old(&mut self, weak: &mut WeakRegistry) -> usize {
        let handles = std::mem::take(&mut self.heap.old);
        let mut kept = Vec::with_capacity(handles.len());
        let mut freed = 0;

        for handle in handles {
            let marked = self
                .heap
                .header(handle)
                .map(|h| h.marked)
                .unwrap_or(false);
            if !marked {
                self.finalize(handle, weak);
                freed += 1;
                continue;
            }
            if let Some(header) = self.heap.header_mut(handle) {
                header.marked = false;
            }
            kept.push(handle);
        }

        self.heap.old = kept;
        freed
    }

    /// Clear leftover marks on the old generation after a minor collection
    fn clear_old_marks(&mut self) {
        let handles: Vec<Handle> = self.heap.old.clone();
        for handle in handles {
            if let Some(header) = self.heap.header_mut(handle) {
                header.marked = false;
            }
        }
    }

    /// Finalize one object: null its observers, release its storage
    fn finalize(&mut self, handle: Handle, weak: &mut WeakRegistry) {
        if let Some(slot) = self.heap.release(handle) {
            for id in slot.header.observers {
                weak.invalidate(id);
            }
        }
    }
}

impl Default for GarbageCollector {
    fn default() -> Self {
        Self::new(defaults::YOUNG_GC_THRESHOLD)
    }
}
