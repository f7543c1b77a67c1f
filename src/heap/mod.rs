pub mod gc;

use std::borrow::Cow;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::rc::Rc;

pub use gc::{GarbageCollector, GcStats};

use crate::strings::{self, RopeLeaf, StringRope, StringTable};
use crate::value::{ErrorKind, Value};

/// Accounted size of every object's slot bookkeeping.
pub const OBJ_HEADER_SIZE: usize = 16;
pub const ARRAY_INITIAL_CAPACITY: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum HeapError {
    #[error("stale {kind:?} handle #{index}")]
    StaleHandle { kind: ObjKind, index: u32 },
}

pub type HeapResult<T> = Result<T, HeapError>;

// ── Handles ──────────────────────────────────────────────────────────

/// Typed index into one of the heap's slabs.
pub struct Handle<T> {
    index: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    pub(crate) fn new(index: u32) -> Self {
        Handle { index, _marker: PhantomData }
    }

    pub fn index(self) -> u32 {
        self.index
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjKind {
    String,
    Array,
    Error,
    Enum,
    RangeIterator,
    ArrayIterator,
    Closure,
}

/// Untyped handle, used by the collector's worklist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef {
    pub kind: ObjKind,
    pub index: u32,
}

// ── Objects ──────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ObjString {
    rope: Rc<StringRope>,
    hash: u32,
    interned: bool,
}

impl ObjString {
    fn from_leaf(leaf: RopeLeaf, hash: u32) -> Self {
        let interned = leaf.is_interned();
        ObjString { rope: Rc::new(StringRope::Leaf(Rc::new(leaf))), hash, interned }
    }

    pub fn from_rope(rope: Rc<StringRope>, hash: u32) -> Self {
        ObjString { rope, hash, interned: false }
    }

    pub fn len(&self) -> usize {
        self.rope.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rope.is_empty()
    }

    pub fn hash(&self) -> u32 {
        self.hash
    }

    pub fn is_interned(&self) -> bool {
        self.interned
    }

    pub fn rope(&self) -> &Rc<StringRope> {
        &self.rope
    }

    pub fn is_flat(&self) -> bool {
        self.rope.leaf_bytes().is_some()
    }

    /// Text of the string; flattens a rope into a temporary when needed.
    pub fn text(&self) -> Cow<'_, str> {
        match self.rope.leaf_bytes() {
            Some(bytes) => String::from_utf8_lossy(bytes),
            None => Cow::Owned(self.rope.to_string_lossy()),
        }
    }
}

#[derive(Debug)]
pub struct ObjArray {
    items: Vec<Value>,
    capacity: usize,
}

impl ObjArray {
    pub fn new() -> Self {
        ObjArray::with_items(Vec::new())
    }

    pub fn with_items(mut items: Vec<Value>) -> Self {
        let mut capacity = ARRAY_INITIAL_CAPACITY;
        while capacity < items.len() {
            capacity *= 2;
        }
        items.reserve_exact(capacity - items.len());
        ObjArray { items, capacity }
    }

    pub fn items(&self) -> &[Value] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.items.get(index).copied()
    }

    pub fn set(&mut self, index: usize, value: Value) -> bool {
        match self.items.get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Appends, doubling the capacity when full.
    pub fn push(&mut self, value: Value) {
        if self.items.len() == self.capacity {
            self.capacity *= 2;
            self.items.reserve_exact(self.capacity - self.items.len());
        }
        self.items.push(value);
    }

    pub fn pop(&mut self) -> Option<Value> {
        self.items.pop()
    }
}

impl Default for ObjArray {
    fn default() -> Self {
        ObjArray::new()
    }
}

#[derive(Debug)]
pub struct ObjError {
    pub kind: ErrorKind,
    pub message: Handle<ObjString>,
    pub line: u32,
    pub column: u32,
}

#[derive(Debug)]
pub struct ObjEnum {
    pub type_name: Handle<ObjString>,
    pub variant_name: Handle<ObjString>,
    pub variant_index: u8,
    pub payload: Vec<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjRangeIterator {
    pub current: i64,
    pub end: i64,
    pub step: i64,
}

impl ObjRangeIterator {
    /// Yields the current position and advances, or `None` when exhausted.
    pub fn next_value(&mut self) -> Option<i64> {
        let more = if self.step > 0 { self.current < self.end } else { self.current > self.end };
        if !more {
            return None;
        }
        let value = self.current;
        self.current = match self.current.checked_add(self.step) {
            Some(next) => next,
            None => self.end,
        };
        Some(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjArrayIterator {
    pub array: Handle<ObjArray>,
    pub index: usize,
}

#[derive(Debug)]
pub struct ObjClosure {
    pub function: u16,
    pub upvalues: Vec<Value>,
}

/// Implemented by every type that lives in a slab.
pub trait HeapObject: Sized {
    const KIND: ObjKind;

    fn slab(heap: &ObjectHeap) -> &Slab<Self>;
    fn slab_mut(heap: &mut ObjectHeap) -> &mut Slab<Self>;
    fn payload_size(&self) -> usize;
    /// Pushes every value this object keeps alive.
    fn trace(&self, out: &mut Vec<Value>);
}

macro_rules! heap_object {
    ($ty:ty, $kind:ident, $field:ident, |$this:ident| $size:expr, |$obj:ident, $out:ident| $trace:block) => {
        impl HeapObject for $ty {
            const KIND: ObjKind = ObjKind::$kind;

            fn slab(heap: &ObjectHeap) -> &Slab<Self> {
                &heap.$field
            }

            fn slab_mut(heap: &mut ObjectHeap) -> &mut Slab<Self> {
                &mut heap.$field
            }

            #[allow(unused_variables)]
            fn payload_size(&self) -> usize {
                let $this = self;
                $size
            }

            #[allow(unused_variables)]
            fn trace(&self, $out: &mut Vec<Value>) {
                let $obj = self;
                $trace
            }
        }
    };
}

heap_object!(ObjString, String, strings, |s| s.len() + 1, |s, out| {});
heap_object!(ObjArray, Array, arrays, |a| a.capacity() * size_of::<Value>(), |a, out| {
    out.extend_from_slice(a.items());
});
heap_object!(ObjError, Error, errors, |e| size_of::<ObjError>(), |e, out| {
    out.push(Value::String(e.message));
});
heap_object!(ObjEnum, Enum, enums, |e| size_of::<ObjEnum>() + e.payload.len() * size_of::<Value>(), |e, out| {
    out.push(Value::String(e.type_name));
    out.push(Value::String(e.variant_name));
    out.extend_from_slice(&e.payload);
});
heap_object!(ObjRangeIterator, RangeIterator, ranges, |r| size_of::<ObjRangeIterator>(), |r, out| {});
heap_object!(ObjArrayIterator, ArrayIterator, array_iters, |i| size_of::<ObjArrayIterator>(), |i, out| {
    out.push(Value::Array(i.array));
});
heap_object!(ObjClosure, Closure, closures, |c| size_of::<ObjClosure>() + c.upvalues.len() * size_of::<Value>(), |c, out| {
    out.extend_from_slice(&c.upvalues);
});

// ── Slabs ────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Slot<T> {
    object: Option<T>,
    marked: bool,
    bytes: usize,
}

/// Storage for one object type. Freed slots are recycled through an index
/// free list, most recently freed first.
#[derive(Debug)]
pub struct Slab<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

impl<T> Default for Slab<T> {
    fn default() -> Self {
        Slab { slots: Vec::new(), free: Vec::new(), live: 0 }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepCount {
    pub objects: usize,
    pub bytes: usize,
}

impl<T> Slab<T> {
    fn insert(&mut self, object: T, bytes: usize) -> u32 {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.object = Some(object);
            slot.marked = false;
            slot.bytes = bytes;
            return index;
        }
        self.slots.push(Slot { object: Some(object), marked: false, bytes });
        (self.slots.len() - 1) as u32
    }

    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        self.slots.get(handle.index as usize)?.object.as_ref()
    }

    fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        self.slots.get_mut(handle.index as usize)?.object.as_mut()
    }

    pub fn contains(&self, index: u32) -> bool {
        self.slots.get(index as usize).is_some_and(|s| s.object.is_some())
    }

    pub fn live(&self) -> usize {
        self.live
    }

    pub fn free_slots(&self) -> usize {
        self.free.len()
    }

    /// Sets the mark bit; returns true only the first time in a cycle.
    fn mark(&mut self, index: u32) -> bool {
        match self.slots.get_mut(index as usize) {
            Some(slot) if slot.object.is_some() && !slot.marked => {
                slot.marked = true;
                true
            }
            _ => false,
        }
    }

    fn is_marked(&self, index: u32) -> bool {
        self.slots.get(index as usize).is_some_and(|s| s.marked)
    }

    /// Finalizes unmarked objects onto the free list and clears marks.
    fn sweep(&mut self) -> SweepCount {
        let mut count = SweepCount::default();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.object.is_none() {
                continue;
            }
            if slot.marked {
                slot.marked = false;
                continue;
            }
            slot.object = None;
            count.objects += 1;
            count.bytes += slot.bytes;
            slot.bytes = 0;
            self.free.push(index as u32);
        }
        self.live -= count.objects;
        count
    }

    fn release(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.live = 0;
    }

    fn resize(&mut self, index: u32, bytes: usize) -> Option<usize> {
        let slot = self.slots.get_mut(index as usize)?;
        let old = slot.bytes;
        slot.bytes = bytes;
        Some(old)
    }
}

// ── Heap ─────────────────────────────────────────────────────────────

/// Type-segmented object storage plus the string intern table.
#[derive(Debug, Default)]
pub struct ObjectHeap {
    strings: Slab<ObjString>,
    arrays: Slab<ObjArray>,
    errors: Slab<ObjError>,
    enums: Slab<ObjEnum>,
    ranges: Slab<ObjRangeIterator>,
    array_iters: Slab<ObjArrayIterator>,
    closures: Slab<ObjClosure>,
    interned: StringTable,
    bytes_allocated: usize,
    total_allocations: u64,
}

impl ObjectHeap {
    pub fn new() -> Self {
        ObjectHeap::default()
    }

    /// Stores `object`, reusing a freed slot of the same type when one exists.
    /// Never collects; callers decide when it is safe to.
    pub fn alloc<T: HeapObject>(&mut self, object: T) -> Handle<T> {
        let bytes = OBJ_HEADER_SIZE + object.payload_size();
        let index = T::slab_mut(self).insert(object, bytes);
        self.bytes_allocated += bytes;
        self.total_allocations += 1;
        Handle::new(index)
    }

    pub fn get<T: HeapObject>(&self, handle: Handle<T>) -> HeapResult<&T> {
        T::slab(self)
            .get(handle)
            .ok_or(HeapError::StaleHandle { kind: T::KIND, index: handle.index })
    }

    pub fn get_mut<T: HeapObject>(&mut self, handle: Handle<T>) -> HeapResult<&mut T> {
        T::slab_mut(self)
            .get_mut(handle)
            .ok_or(HeapError::StaleHandle { kind: T::KIND, index: handle.index })
    }

    /// Re-accounts an object whose payload changed size in place.
    fn reaccount<T: HeapObject>(&mut self, handle: Handle<T>) -> HeapResult<()> {
        let bytes = OBJ_HEADER_SIZE + self.get(handle)?.payload_size();
        if let Some(old) = T::slab_mut(self).resize(handle.index, bytes) {
            self.bytes_allocated = self.bytes_allocated - old + bytes;
        }
        Ok(())
    }

    pub fn contains(&self, obj: ObjRef) -> bool {
        match obj.kind {
            ObjKind::String => self.strings.contains(obj.index),
            ObjKind::Array => self.arrays.contains(obj.index),
            ObjKind::Error => self.errors.contains(obj.index),
            ObjKind::Enum => self.enums.contains(obj.index),
            ObjKind::RangeIterator => self.ranges.contains(obj.index),
            ObjKind::ArrayIterator => self.array_iters.contains(obj.index),
            ObjKind::Closure => self.closures.contains(obj.index),
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn total_allocations(&self) -> u64 {
        self.total_allocations
    }

    pub fn live_objects(&self) -> usize {
        self.strings.live()
            + self.arrays.live()
            + self.errors.live()
            + self.enums.live()
            + self.ranges.live()
            + self.array_iters.live()
            + self.closures.live()
    }

    pub fn free_slots(&self, kind: ObjKind) -> usize {
        match kind {
            ObjKind::String => self.strings.free_slots(),
            ObjKind::Array => self.arrays.free_slots(),
            ObjKind::Error => self.errors.free_slots(),
            ObjKind::Enum => self.enums.free_slots(),
            ObjKind::RangeIterator => self.ranges.free_slots(),
            ObjKind::ArrayIterator => self.array_iters.free_slots(),
            ObjKind::Closure => self.closures.free_slots(),
        }
    }

    // ── collector hooks ──

    pub(crate) fn mark(&mut self, obj: ObjRef) -> bool {
        match obj.kind {
            ObjKind::String => self.strings.mark(obj.index),
            ObjKind::Array => self.arrays.mark(obj.index),
            ObjKind::Error => self.errors.mark(obj.index),
            ObjKind::Enum => self.enums.mark(obj.index),
            ObjKind::RangeIterator => self.ranges.mark(obj.index),
            ObjKind::ArrayIterator => self.array_iters.mark(obj.index),
            ObjKind::Closure => self.closures.mark(obj.index),
        }
    }

    pub fn is_marked(&self, obj: ObjRef) -> bool {
        match obj.kind {
            ObjKind::String => self.strings.is_marked(obj.index),
            ObjKind::Array => self.arrays.is_marked(obj.index),
            ObjKind::Error => self.errors.is_marked(obj.index),
            ObjKind::Enum => self.enums.is_marked(obj.index),
            ObjKind::RangeIterator => self.ranges.is_marked(obj.index),
            ObjKind::ArrayIterator => self.array_iters.is_marked(obj.index),
            ObjKind::Closure => self.closures.is_marked(obj.index),
        }
    }

    pub(crate) fn trace(&self, obj: ObjRef, out: &mut Vec<Value>) {
        fn trace_in<T: HeapObject>(slab: &Slab<T>, index: u32, out: &mut Vec<Value>) {
            if let Some(object) = slab.get(Handle::new(index)) {
                object.trace(out);
            }
        }
        match obj.kind {
            ObjKind::String => trace_in(&self.strings, obj.index, out),
            ObjKind::Array => trace_in(&self.arrays, obj.index, out),
            ObjKind::Error => trace_in(&self.errors, obj.index, out),
            ObjKind::Enum => trace_in(&self.enums, obj.index, out),
            ObjKind::RangeIterator => trace_in(&self.ranges, obj.index, out),
            ObjKind::ArrayIterator => trace_in(&self.array_iters, obj.index, out),
            ObjKind::Closure => trace_in(&self.closures, obj.index, out),
        }
    }

    /// Moves every unmarked object to its type's free list.
    pub(crate) fn sweep(&mut self) -> SweepCount {
        let mut total = SweepCount::default();
        for count in [
            self.strings.sweep(),
            self.arrays.sweep(),
            self.errors.sweep(),
            self.enums.sweep(),
            self.ranges.sweep(),
            self.array_iters.sweep(),
            self.closures.sweep(),
        ] {
            total.objects += count.objects;
            total.bytes += count.bytes;
        }
        let strings = &self.strings;
        self.interned.retain(|h| strings.contains(h.index));
        self.bytes_allocated -= total.bytes;
        total
    }

    /// Releases every object outright. Used at VM teardown.
    pub fn release_all(&mut self) {
        self.strings.release();
        self.arrays.release();
        self.errors.release();
        self.enums.release();
        self.ranges.release();
        self.array_iters.release();
        self.closures.release();
        self.interned.clear();
        self.bytes_allocated = 0;
    }

    // ── strings ──

    pub fn string_slab(&self) -> &Slab<ObjString> {
        &self.strings
    }

    /// Returns the canonical string for `text`, allocating it on first use.
    pub fn intern(&mut self, text: &str) -> Handle<ObjString> {
        let bytes = text.as_bytes();
        let hash = strings::djb2(bytes);
        if let Some(existing) = self.interned.find(hash, bytes, &self.strings) {
            return existing;
        }
        let handle = self.alloc(ObjString::from_leaf(RopeLeaf::new(bytes).interned(), hash));
        self.interned.insert(hash, handle);
        handle
    }

    pub fn interned_count(&self) -> usize {
        self.interned.len()
    }

    pub fn string_table(&self) -> &StringTable {
        &self.interned
    }

    /// A fresh, non-interned flat string.
    pub fn alloc_string(&mut self, text: impl Into<String>) -> Handle<ObjString> {
        let text = text.into();
        let hash = strings::djb2(text.as_bytes());
        self.alloc(ObjString::from_leaf(RopeLeaf::new(text.into_bytes()), hash))
    }

    pub fn alloc_rope(&mut self, rope: StringRope) -> Handle<ObjString> {
        let hash = match rope.leaf_bytes() {
            Some(bytes) => strings::djb2(bytes),
            None => strings::djb2(&rope.flatten()),
        };
        self.alloc(ObjString::from_rope(Rc::new(rope), hash))
    }

    /// Concatenation without copying either side.
    pub fn concat_strings(&mut self, left: Handle<ObjString>, right: Handle<ObjString>) -> HeapResult<Handle<ObjString>> {
        let (l, r) = (self.get(left)?, self.get(right)?);
        let hash = strings::djb2_concat(l.hash(), r.hash(), r.len());
        let rope = StringRope::concat(Rc::clone(l.rope()), Rc::clone(r.rope()));
        Ok(self.alloc(ObjString::from_rope(Rc::new(rope), hash)))
    }

    pub fn string_text(&self, handle: Handle<ObjString>) -> HeapResult<Cow<'_, str>> {
        Ok(self.get(handle)?.text())
    }

    /// Replaces a rope representation with a single flat leaf.
    pub fn flatten_string(&mut self, handle: Handle<ObjString>) -> HeapResult<()> {
        let obj = self.get_mut(handle)?;
        if !obj.is_flat() {
            let bytes = obj.rope.flatten();
            obj.rope = Rc::new(StringRope::Leaf(Rc::new(RopeLeaf::new(bytes))));
        }
        Ok(())
    }

    pub fn strings_equal(&self, a: Handle<ObjString>, b: Handle<ObjString>) -> HeapResult<bool> {
        if a == b {
            return Ok(true);
        }
        let (sa, sb) = (self.get(a)?, self.get(b)?);
        if sa.is_interned() && sb.is_interned() {
            return Ok(false);
        }
        Ok(sa.len() == sb.len() && sa.hash() == sb.hash() && sa.text() == sb.text())
    }

    // ── arrays ──

    pub fn alloc_array(&mut self, items: Vec<Value>) -> Handle<ObjArray> {
        self.alloc(ObjArray::with_items(items))
    }

    pub fn array_push(&mut self, handle: Handle<ObjArray>, value: Value) -> HeapResult<()> {
        let array = self.get_mut(handle)?;
        let before = array.capacity();
        array.push(value);
        if array.capacity() != before {
            self.reaccount(handle)?;
        }
        Ok(())
    }

    pub fn array_pop(&mut self, handle: Handle<ObjArray>) -> HeapResult<Option<Value>> {
        Ok(self.get_mut(handle)?.pop())
    }

    pub fn array_get(&self, handle: Handle<ObjArray>, index: usize) -> HeapResult<Option<Value>> {
        Ok(self.get(handle)?.get(index))
    }

    pub fn array_set(&mut self, handle: Handle<ObjArray>, index: usize, value: Value) -> HeapResult<bool> {
        Ok(self.get_mut(handle)?.set(index, value))
    }

    // ── errors ──

    pub fn alloc_error(&mut self, kind: ErrorKind, message: &str, line: u32, column: u32) -> Handle<ObjError> {
        let message = self.intern(message);
        self.alloc(ObjError { kind, message, line, column })
    }
}
