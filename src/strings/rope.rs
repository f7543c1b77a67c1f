use std::rc::Rc;

/// Owned bytes at the bottom of a rope.
#[derive(Debug)]
pub struct RopeLeaf {
    bytes: Box<[u8]>,
    is_ascii: bool,
    interned: bool,
}

impl RopeLeaf {
    pub fn new(bytes: impl Into<Box<[u8]>>) -> Self {
        let bytes = bytes.into();
        let is_ascii = bytes.is_ascii();
        RopeLeaf { bytes, is_ascii, interned: false }
    }

    pub fn interned(mut self) -> Self {
        self.interned = true;
        self
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn is_ascii(&self) -> bool {
        self.is_ascii
    }

    pub fn is_interned(&self) -> bool {
        self.interned
    }
}

/// Tree-shaped string: concatenation and substring never copy bytes.
#[derive(Debug, Clone)]
pub enum StringRope {
    Leaf(Rc<RopeLeaf>),
    Concat { left: Rc<StringRope>, right: Rc<StringRope>, len: usize },
    Substring { base: Rc<RopeLeaf>, start: usize, len: usize },
}

impl StringRope {
    pub fn leaf(bytes: impl Into<Box<[u8]>>) -> Self {
        StringRope::Leaf(Rc::new(RopeLeaf::new(bytes)))
    }

    pub fn concat(left: Rc<StringRope>, right: Rc<StringRope>) -> Self {
        let len = left.len() + right.len();
        StringRope::Concat { left, right, len }
    }

    /// A view of `len` bytes starting at `start`. Non-leaf ropes are
    /// flattened into a fresh leaf first so the view never nests.
    pub fn substring(rope: &StringRope, start: usize, len: usize) -> Option<StringRope> {
        let end = start.checked_add(len)?;
        if end > rope.len() {
            return None;
        }
        let node = match rope {
            StringRope::Leaf(base) => StringRope::Substring { base: Rc::clone(base), start, len },
            StringRope::Substring { base, start: s0, .. } => {
                StringRope::Substring { base: Rc::clone(base), start: s0 + start, len }
            }
            StringRope::Concat { .. } => {
                let base = Rc::new(RopeLeaf::new(rope.flatten()));
                StringRope::Substring { base, start, len }
            }
        };
        Some(node)
    }

    pub fn len(&self) -> usize {
        match self {
            StringRope::Leaf(leaf) => leaf.len(),
            StringRope::Concat { len, .. } | StringRope::Substring { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes of a plain leaf, without flattening.
    pub fn leaf_bytes(&self) -> Option<&[u8]> {
        match self {
            StringRope::Leaf(leaf) => Some(leaf.bytes()),
            _ => None,
        }
    }

    pub fn is_ascii(&self) -> bool {
        match self {
            StringRope::Leaf(leaf) => leaf.is_ascii(),
            StringRope::Concat { left, right, .. } => left.is_ascii() && right.is_ascii(),
            StringRope::Substring { base, .. } => base.is_ascii(),
        }
    }

    pub fn char_at(&self, mut index: usize) -> Option<u8> {
        let mut node = self;
        loop {
            match node {
                StringRope::Leaf(leaf) => return leaf.bytes().get(index).copied(),
                StringRope::Substring { base, start, len } => {
                    if index >= *len {
                        return None;
                    }
                    return base.bytes().get(start + index).copied();
                }
                StringRope::Concat { left, right, .. } => {
                    let left_len = left.len();
                    if index < left_len {
                        node = left;
                    } else {
                        index -= left_len;
                        node = right;
                    }
                }
            }
        }
    }

    /// Pre-order flatten: left subtree, then right. Iterative so a deep
    /// chain of concatenations cannot exhaust the native stack.
    pub fn flatten_into(&self, out: &mut StringBuilder) {
        let mut stack: Vec<&StringRope> = vec![self];
        while let Some(node) = stack.pop() {
            match node {
                StringRope::Leaf(leaf) => out.append(leaf.bytes()),
                StringRope::Concat { left, right, .. } => {
                    stack.push(right);
                    stack.push(left);
                }
                StringRope::Substring { base, start, len } => {
                    if let Some(slice) = base.bytes().get(*start..start + len) {
                        out.append(slice);
                    }
                }
            }
        }
    }

    pub fn flatten(&self) -> Vec<u8> {
        let mut builder = StringBuilder::with_capacity(self.len());
        self.flatten_into(&mut builder);
        builder.into_bytes()
    }

    pub fn to_string_lossy(&self) -> String {
        match String::from_utf8(self.flatten()) {
            Ok(s) => s,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        }
    }
}

/// Growable byte buffer used when materializing ropes.
#[derive(Debug, Default)]
pub struct StringBuilder {
    buf: Vec<u8>,
}

impl StringBuilder {
    pub fn new() -> Self {
        StringBuilder { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        StringBuilder { buf: Vec::with_capacity(capacity + 1) }
    }

    pub fn append(&mut self, bytes: &[u8]) {
        let needed = self.buf.len() + bytes.len() + 1;
        if needed > self.buf.capacity() {
            self.buf.reserve_exact(needed * 2 - self.buf.len());
        }
        self.buf.extend_from_slice(bytes);
    }

    pub fn append_str(&mut self, s: &str) {
        self.append(s.as_bytes());
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(s: &str) -> Rc<StringRope> {
        Rc::new(StringRope::leaf(s.as_bytes()))
    }

    #[test]
    fn concat_flattens_left_then_right() {
        let rope = StringRope::concat(leaf("ab"), leaf("cd"));
        assert_eq!(rope.len(), 4);
        assert_eq!(rope.flatten(), b"abcd");
    }

    #[test]
    fn substring_of_leaf_does_not_copy() {
        let hello = StringRope::leaf(&b"hello"[..]);
        let sub = StringRope::substring(&hello, 1, 3).unwrap();
        assert!(matches!(sub, StringRope::Substring { start: 1, len: 3, .. }));
        assert_eq!(sub.flatten(), b"ell");
    }

    #[test]
    fn substring_of_substring_rebases() {
        let hello = StringRope::leaf(&b"hello world"[..]);
        let world = StringRope::substring(&hello, 6, 5).unwrap();
        let orl = StringRope::substring(&world, 1, 3).unwrap();
        assert!(matches!(orl, StringRope::Substring { start: 7, len: 3, .. }));
        assert_eq!(orl.to_string_lossy(), "orl");
    }

    #[test]
    fn substring_of_concat_flattens_first() {
        let rope = StringRope::concat(leaf("foo"), leaf("bar"));
        let sub = StringRope::substring(&rope, 2, 3).unwrap();
        assert_eq!(sub.flatten(), b"oba");
    }

    #[test]
    fn substring_out_of_range() {
        let hello = StringRope::leaf(&b"hello"[..]);
        assert!(StringRope::substring(&hello, 3, 3).is_none());
        assert!(StringRope::substring(&hello, usize::MAX, 2).is_none());
    }

    #[test]
    fn char_at_walks_concat() {
        let rope = StringRope::concat(leaf("ab"), Rc::new(StringRope::concat(leaf("cd"), leaf("ef"))));
        assert_eq!(rope.char_at(0), Some(b'a'));
        assert_eq!(rope.char_at(3), Some(b'd'));
        assert_eq!(rope.char_at(5), Some(b'f'));
        assert_eq!(rope.char_at(6), None);
    }

    #[test]
    fn deep_concat_chain_flattens() {
        let mut rope = leaf("x");
        for _ in 0..2_000 {
            rope = Rc::new(StringRope::concat(rope, leaf("x")));
        }
        assert_eq!(rope.flatten().len(), 2_001);
    }

    #[test]
    fn builder_grows_geometrically() {
        let mut b = StringBuilder::new();
        b.append(b"abc");
        assert!(b.capacity() >= 8);
        b.append(b"defgh");
        assert_eq!(b.len(), 8);
        assert!(b.capacity() >= 18);
    }

    #[test]
    fn ascii_flag() {
        assert!(StringRope::leaf(&b"plain"[..]).is_ascii());
        assert!(!StringRope::leaf("héllo".as_bytes()).is_ascii());
    }
}
