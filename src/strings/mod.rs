pub mod rope;

use std::collections::HashMap;

pub use rope::{RopeLeaf, StringBuilder, StringRope};

use crate::heap::{Handle, ObjString, Slab};

const DJB2_SEED: u32 = 5381;

/// djb2 rolling hash: `h = h * 33 + byte`, wrapping.
pub fn djb2(bytes: &[u8]) -> u32 {
    djb2_extend(DJB2_SEED, bytes)
}

pub fn djb2_extend(mut hash: u32, bytes: &[u8]) -> u32 {
    for &b in bytes {
        hash = hash.wrapping_mul(33).wrapping_add(b as u32);
    }
    hash
}

/// Hash of `a ++ b` from the hashes of its halves, without touching bytes.
pub fn djb2_concat(left: u32, right: u32, right_len: usize) -> u32 {
    let scale = pow33(right_len);
    left.wrapping_mul(scale)
        .wrapping_add(right.wrapping_sub(DJB2_SEED.wrapping_mul(scale)))
}

fn pow33(mut exp: usize) -> u32 {
    let mut base: u32 = 33;
    let mut acc: u32 = 1;
    while exp > 0 {
        if exp & 1 == 1 {
            acc = acc.wrapping_mul(base);
        }
        base = base.wrapping_mul(base);
        exp >>= 1;
    }
    acc
}

// ── Intern table ─────────────────────────────────────────────────────

/// Content-addressed index of canonical strings, keyed by djb2 hash.
///
/// The table only stores handles; the bytes live in the heap's string slab,
/// which is why lookups borrow it.
#[derive(Debug, Default)]
pub struct StringTable {
    buckets: HashMap<u32, Vec<Handle<ObjString>>>,
    total_interned: usize,
}

impl StringTable {
    pub fn new() -> Self {
        StringTable::default()
    }

    /// Finds the canonical string with exactly these bytes.
    pub fn find(&self, hash: u32, bytes: &[u8], strings: &Slab<ObjString>) -> Option<Handle<ObjString>> {
        let bucket = self.buckets.get(&hash)?;
        bucket.iter().copied().find(|&h| {
            strings
                .get(h)
                .and_then(|s| s.rope().leaf_bytes())
                .is_some_and(|candidate| candidate.len() == bytes.len() && candidate == bytes)
        })
    }

    pub fn insert(&mut self, hash: u32, handle: Handle<ObjString>) {
        self.buckets.entry(hash).or_default().push(handle);
        self.total_interned += 1;
    }

    /// Drops entries whose string did not survive a collection.
    pub fn retain(&mut self, mut keep: impl FnMut(Handle<ObjString>) -> bool) {
        self.buckets.retain(|_, bucket| {
            bucket.retain(|&h| keep(h));
            !bucket.is_empty()
        });
    }

    pub fn len(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Strings interned over the table's lifetime, including collected ones.
    pub fn total_interned(&self) -> usize {
        self.total_interned
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::ObjectHeap;

    #[test]
    fn djb2_known_values() {
        assert_eq!(djb2(b""), 5381);
        assert_eq!(djb2(b"a"), 5381u32.wrapping_mul(33).wrapping_add(97));
    }

    #[test]
    fn concat_hash_matches_direct_hash() {
        let cases: [(&[u8], &[u8]); 4] =
            [(b"ab", b"cd"), (b"", b"xyz"), (b"hello ", b""), (b"a much longer left side", b"and a right side")];
        for (a, b) in cases {
            let mut joined = a.to_vec();
            joined.extend_from_slice(b);
            assert_eq!(djb2_concat(djb2(a), djb2(b), b.len()), djb2(&joined));
        }
    }

    #[test]
    fn intern_same_content_same_handle() {
        let mut heap = ObjectHeap::new();
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        assert_eq!(a, b);
        assert_eq!(heap.interned_count(), 1);
    }

    #[test]
    fn intern_distinct_content_distinct_handles() {
        let mut heap = ObjectHeap::new();
        let a = heap.intern("hello");
        let b = heap.intern("world");
        let c = heap.intern("hell");
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(heap.interned_count(), 3);
    }

    #[test]
    fn hash_collision_still_compares_bytes() {
        // two different strings forced into the same bucket
        let mut heap = ObjectHeap::new();
        let real = heap.intern("abc");
        let mut table = StringTable::new();
        table.insert(djb2(b"zzz"), real);
        assert!(table.find(djb2(b"zzz"), b"zzz", heap.string_slab()).is_none());
        assert_eq!(table.find(djb2(b"zzz"), b"abc", heap.string_slab()), Some(real));
    }

    #[test]
    fn interned_strings_are_flagged() {
        let mut heap = ObjectHeap::new();
        let h = heap.intern("flagged");
        assert!(heap.get(h).unwrap().is_interned());
        let plain = heap.alloc_string("flagged");
        assert!(!heap.get(plain).unwrap().is_interned());
        assert_ne!(h, plain);
    }
}
