use serde::Serialize;

use super::ObjectHeap;
use crate::config::VmConfig;
use crate::value::Value;

/// Counters for the collector, reported by `--stats`.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct GcStats {
    pub collections: u64,
    pub objects_freed: u64,
    pub bytes_freed: u64,
    pub last_live_bytes: usize,
    pub threshold: usize,
}

/// Outcome of one collection cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionReport {
    pub marked: usize,
    pub objects_freed: usize,
    pub bytes_freed: usize,
    pub live_bytes: usize,
}

/// Stop-the-world mark-sweep collector over an `ObjectHeap`.
///
/// The collector never decides on its own when to run: callers check
/// `should_collect` at points where every live value is reachable from the
/// roots they pass to `collect`.
#[derive(Debug)]
pub struct GarbageCollector {
    threshold: usize,
    min_threshold: usize,
    growth_factor: f64,
    pause_depth: u32,
    worklist: Vec<Value>,
    stats: GcStats,
}

impl GarbageCollector {
    pub fn new(config: &VmConfig) -> Self {
        GarbageCollector {
            threshold: config.gc_threshold,
            min_threshold: config.gc_min_threshold,
            growth_factor: config.gc_growth_factor,
            pause_depth: 0,
            worklist: Vec::new(),
            stats: GcStats { threshold: config.gc_threshold, ..GcStats::default() },
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn stats(&self) -> GcStats {
        self.stats
    }

    /// Pauses collection. Pauses nest; each needs a matching `resume`.
    pub fn pause(&mut self) {
        self.pause_depth += 1;
    }

    pub fn resume(&mut self) {
        self.pause_depth = self.pause_depth.saturating_sub(1);
    }

    pub fn is_paused(&self) -> bool {
        self.pause_depth > 0
    }

    pub fn should_collect(&self, heap: &ObjectHeap) -> bool {
        !self.is_paused() && heap.bytes_allocated() > self.threshold
    }

    /// Runs a full cycle unless paused. Everything not reachable from `roots`
    /// is moved to its type's free list.
    pub fn collect(&mut self, heap: &mut ObjectHeap, roots: impl IntoIterator<Item = Value>) -> Option<CollectionReport> {
        if self.is_paused() {
            return None;
        }
        let before = heap.bytes_allocated();
        let marked = self.mark(heap, roots);
        let swept = heap.sweep();
        let live_bytes = heap.bytes_allocated();

        let grown = (live_bytes as f64 * self.growth_factor) as usize;
        self.threshold = grown.max(self.min_threshold);

        self.stats.collections += 1;
        self.stats.objects_freed += swept.objects as u64;
        self.stats.bytes_freed += swept.bytes as u64;
        self.stats.last_live_bytes = live_bytes;
        self.stats.threshold = self.threshold;

        tracing::debug!(
            before,
            live_bytes,
            freed = swept.bytes,
            objects_freed = swept.objects,
            threshold = self.threshold,
            "gc cycle"
        );

        Some(CollectionReport {
            marked,
            objects_freed: swept.objects,
            bytes_freed: swept.bytes,
            live_bytes,
        })
    }

    /// Marks from the roots with an explicit worklist; nesting depth of the
    /// object graph never reaches the native stack.
    fn mark(&mut self, heap: &mut ObjectHeap, roots: impl IntoIterator<Item = Value>) -> usize {
        let mut marked = 0;
        self.worklist.clear();
        self.worklist.extend(roots);
        while let Some(value) = self.worklist.pop() {
            let Some(obj) = value.obj_ref() else { continue };
            if heap.mark(obj) {
                marked += 1;
                heap.trace(obj, &mut self.worklist);
            }
        }
        marked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{ObjArrayIterator, ObjError, ObjKind, ObjRangeIterator, OBJ_HEADER_SIZE};
    use crate::value::ErrorKind;

    const NO_ROOTS: [Value; 0] = [];

    fn collector() -> GarbageCollector {
        GarbageCollector::new(&VmConfig::default())
    }

    #[test]
    fn reachable_objects_survive() {
        let mut heap = ObjectHeap::new();
        let mut gc = collector();
        let s = heap.alloc_string("kept");
        let arr = heap.alloc_array(vec![Value::String(s), Value::I32(7)]);
        let garbage = heap.alloc_array(vec![]);

        let report = gc.collect(&mut heap, [Value::Array(arr)]).unwrap();
        assert_eq!(report.marked, 2);
        assert_eq!(report.objects_freed, 1);
        assert!(heap.get(arr).is_ok());
        assert!(heap.get(s).is_ok());
        assert!(heap.get(garbage).is_err());
        assert_eq!(heap.free_slots(ObjKind::Array), 1);
    }

    #[test]
    fn unreachable_slot_is_reused_by_next_allocation() {
        let mut heap = ObjectHeap::new();
        let mut gc = collector();
        let root = heap.alloc_array(vec![]);
        let dead = heap.alloc_array(vec![]);
        gc.collect(&mut heap, [Value::Array(root)]);
        let fresh = heap.alloc_array(vec![Value::Bool(true)]);
        assert_eq!(fresh.index(), dead.index());
        assert_ne!(fresh.index(), root.index());
    }

    #[test]
    fn marks_survive_across_cycles() {
        let mut heap = ObjectHeap::new();
        let mut gc = collector();
        let s = heap.alloc_string("twice");
        gc.collect(&mut heap, [Value::String(s)]);
        gc.collect(&mut heap, [Value::String(s)]);
        assert!(heap.get(s).is_ok());
        assert!(!heap.is_marked(Value::String(s).obj_ref().unwrap()));
    }

    #[test]
    fn error_keeps_message_alive() {
        let mut heap = ObjectHeap::new();
        let mut gc = collector();
        let err = heap.alloc_error(ErrorKind::Value, "boom", 3, 4);
        let msg = heap.get(err).unwrap().message;
        gc.collect(&mut heap, [Value::Error(err)]);
        assert_eq!(heap.string_text(msg).unwrap(), "boom");
    }

    #[test]
    fn array_iterator_keeps_array_alive() {
        let mut heap = ObjectHeap::new();
        let mut gc = collector();
        let arr = heap.alloc_array(vec![Value::I32(1)]);
        let it = heap.alloc(ObjArrayIterator { array: arr, index: 0 });
        let range = heap.alloc(ObjRangeIterator { current: 0, end: 1, step: 1 });
        gc.collect(&mut heap, [Value::ArrayIterator(it)]);
        assert!(heap.get(arr).is_ok());
        assert!(heap.get(range).is_err());
    }

    #[test]
    fn deeply_nested_arrays_mark_iteratively() {
        let mut heap = ObjectHeap::new();
        let mut gc = collector();
        let mut inner = heap.alloc_array(vec![]);
        for _ in 0..100_000 {
            inner = heap.alloc_array(vec![Value::Array(inner)]);
        }
        let report = gc.collect(&mut heap, [Value::Array(inner)]).unwrap();
        assert_eq!(report.marked, 100_001);
        assert_eq!(report.objects_freed, 0);
    }

    #[test]
    fn cycles_terminate() {
        let mut heap = ObjectHeap::new();
        let mut gc = collector();
        let a = heap.alloc_array(vec![]);
        let b = heap.alloc_array(vec![Value::Array(a)]);
        heap.array_push(a, Value::Array(b)).unwrap();
        let report = gc.collect(&mut heap, [Value::Array(a)]).unwrap();
        assert_eq!(report.marked, 2);
    }

    #[test]
    fn threshold_grows_from_live_bytes() {
        let config = VmConfig { gc_threshold: 64, gc_min_threshold: 0, ..VmConfig::default() };
        let mut gc = GarbageCollector::new(&config);
        let mut heap = ObjectHeap::new();
        let keep = heap.alloc_string("0123456789");
        assert!(!gc.should_collect(&heap));
        for _ in 0..4 {
            heap.alloc_string("garbage garbage");
        }
        assert!(gc.should_collect(&heap));
        let report = gc.collect(&mut heap, [Value::String(keep)]).unwrap();
        assert_eq!(report.live_bytes, OBJ_HEADER_SIZE + 11);
        assert_eq!(gc.threshold(), (OBJ_HEADER_SIZE + 11) * 2);
        assert_eq!(gc.stats().collections, 1);
    }

    #[test]
    fn threshold_never_drops_below_minimum() {
        let mut gc = collector();
        let mut heap = ObjectHeap::new();
        gc.collect(&mut heap, NO_ROOTS);
        assert_eq!(gc.threshold(), VmConfig::default().gc_min_threshold);
    }

    #[test]
    fn paused_collector_neither_sweeps_nor_grows() {
        let config = VmConfig { gc_threshold: 1, gc_min_threshold: 0, ..VmConfig::default() };
        let mut gc = GarbageCollector::new(&config);
        let mut heap = ObjectHeap::new();
        let message = heap.intern("pending");
        let transient = heap.alloc(ObjError { kind: ErrorKind::Runtime, message, line: 0, column: 0 });
        gc.pause();
        gc.pause();
        assert!(!gc.should_collect(&heap));
        assert!(gc.collect(&mut heap, NO_ROOTS).is_none());
        assert!(heap.get(transient).is_ok());
        assert_eq!(gc.threshold(), 1);
        gc.resume();
        assert!(gc.is_paused());
        gc.resume();
        assert!(gc.should_collect(&heap));
        gc.collect(&mut heap, NO_ROOTS);
        assert!(heap.get(transient).is_err());
    }
}
