//! Java string manager.
//!
//! Two hash tables keyed by UTF-16 content: the literal table, filled when a
//! `CONSTANT_String` entry is first touched and permanent for the life of
//! the VM, and the intern table, filled by `String.intern()` and purged of
//! dead strings after each sweep. A character sequence never appears in
//! both: `intern` probes the literal table first.
//!
//! The manager holds plain references into its buckets; the collector marks
//! the literal table as a root and calls `purge` for the intern table, so
//! reachability never flows through the buckets themselves.

use crate::heap::{Heap, HeapRef};
use crate::keys::ClassId;
use once_cell::sync::OnceCell;

/// Field offsets of `java.lang.String`, resolved once the class is derived.
#[derive(Debug, Clone, Copy)]
pub struct StringLayout {
    /// `value: [C`, a reference slot.
    pub value_off: i32,
    /// `offset: I`.
    pub offset_off: i32,
    /// `count: I`.
    pub count_off: i32,
    /// `cachedHashCode: I`.
    pub hash_off: i32,
}

pub struct JavaStringManager {
    str_class: OnceCell<ClassId>,
    char_array_class: OnceCell<ClassId>,
    layout: OnceCell<StringLayout>,

    load: u32,
    init_capacity: usize,

    buckets: Vec<Vec<HeapRef>>,
    entries: usize,

    lit_buckets: Vec<Vec<HeapRef>>,
    lit_entries: usize,
}

impl JavaStringManager {
    pub fn new(log2cap: u32, load: u32) -> Self {
        assert!(log2cap != 0 && log2cap < 32);
        assert!(load != 0);

        let capacity = 1usize << log2cap;
        Self {
            str_class: OnceCell::new(),
            char_array_class: OnceCell::new(),
            layout: OnceCell::new(),
            load,
            init_capacity: capacity,
            buckets: vec![Vec::new(); capacity],
            entries: 0,
            lit_buckets: vec![Vec::new(); capacity],
            lit_entries: 0,
        }
    }

    /// Second initialization step: the manager is not functional until the
    /// String and `[C` classes are known.
    pub fn set_classes(
        &self,
        str_class: ClassId,
        char_array_class: ClassId,
        layout: StringLayout,
    ) {
        let _ = self.str_class.set(str_class);
        let _ = self.char_array_class.set(char_array_class);
        let _ = self.layout.set(layout);
    }

    pub fn str_class(&self) -> ClassId {
        *self.str_class.get().expect("string manager initialized")
    }

    pub fn char_array_class(&self) -> ClassId {
        *self
            .char_array_class
            .get()
            .expect("string manager initialized")
    }

    pub fn layout(&self) -> StringLayout {
        *self.layout.get().expect("string manager initialized")
    }

    /// The hash `String.hashCode` would compute.
    pub fn hash_chars(chars: &[u16]) -> u32 {
        let mut hash = 0u32;
        for &c in chars {
            hash = hash.wrapping_mul(31).wrapping_add(c as u32);
        }
        hash
    }

    // Accessors over a java.lang.String object.

    pub fn value_of(&self, heap: &Heap, s: HeapRef) -> HeapRef {
        heap.read_word_at(s, self.layout().value_off) as HeapRef
    }

    pub fn count_of(&self, heap: &Heap, s: HeapRef) -> u32 {
        heap.read_i32_at(s, self.layout().count_off) as u32
    }

    pub fn offset_of(&self, heap: &Heap, s: HeapRef) -> u32 {
        heap.read_i32_at(s, self.layout().offset_off) as u32
    }

    pub fn chars_of<'h>(&self, heap: &'h Heap, s: HeapRef) -> &'h [u16] {
        let value = self.value_of(heap, s);
        if value == 0 {
            return &[];
        }
        let len = heap.array_length(value);
        let all = heap.char_array_slice(value, len);
        let offset = self.offset_of(heap, s) as usize;
        let count = self.count_of(heap, s) as usize;
        &all[offset..offset + count]
    }

    /// Cached hash of a string, computing and storing it when unset.
    pub fn hash_of(&self, heap: &Heap, s: HeapRef) -> u32 {
        let cached = heap.read_i32_at(s, self.layout().hash_off) as u32;
        if cached != 0 {
            return cached;
        }
        let hash = Self::hash_chars(self.chars_of(heap, s));
        heap.write_i32_at(s, self.layout().hash_off, hash as i32);
        hash
    }

    fn equal(&self, heap: &Heap, a: HeapRef, b: HeapRef) -> bool {
        a == b || self.chars_of(heap, a) == self.chars_of(heap, b)
    }

    fn find_in(
        &self,
        heap: &Heap,
        buckets: &[Vec<HeapRef>],
        hash: u32,
        needle: HeapRef,
    ) -> Option<HeapRef> {
        let bucket = &buckets[hash as usize & (buckets.len() - 1)];
        bucket
            .iter()
            .copied()
            .find(|&candidate| self.equal(heap, candidate, needle))
    }

    /// Looks up a literal by its character content.
    pub fn find_literal(&self, heap: &Heap, chars: &[u16]) -> Option<HeapRef> {
        let hash = Self::hash_chars(chars);
        let bucket = &self.lit_buckets[hash as usize & (self.lit_buckets.len() - 1)];
        bucket
            .iter()
            .copied()
            .find(|&candidate| self.chars_of(heap, candidate) == chars)
    }

    /// Registers a freshly created literal string. The literal table only
    /// ever grows.
    pub fn insert_literal(&mut self, heap: &Heap, s: HeapRef) {
        let hash = self.hash_of(heap, s);
        let at = hash as usize & (self.lit_buckets.len() - 1);
        self.lit_buckets[at].push(s);
        self.lit_entries += 1;

        if self.lit_entries > self.lit_buckets.len() * self.load as usize {
            self.rehash_literals(heap, self.lit_buckets.len() * 2);
        }
    }

    /// `String.intern()`: returns the canonical string for the receiver's
    /// character sequence, inserting the receiver when it is new.
    pub fn intern(&mut self, heap: &Heap, s: HeapRef) -> HeapRef {
        let hash = self.hash_of(heap, s);

        if let Some(found) = self.find_in(heap, &self.lit_buckets, hash, s) {
            return found;
        }
        if let Some(found) = self.find_in(heap, &self.buckets, hash, s) {
            return found;
        }

        let at = hash as usize & (self.buckets.len() - 1);
        self.buckets[at].push(s);
        self.entries += 1;

        if self.entries > self.buckets.len() * self.load as usize {
            self.rehash(heap, self.buckets.len() * 2);
        } else if self.entries < (self.buckets.len() / 2) * self.load as usize
            && self.buckets.len() > self.init_capacity
        {
            // A collection may have purged entries since the last insert,
            // so shrinking is checked here rather than during the sweep.
            self.rehash(heap, self.buckets.len() / 2);
        }

        s
    }

    fn rehash(&mut self, heap: &Heap, capacity: usize) {
        // Interned strings always have their cached hash set by now.
        let hash_off = self.layout().hash_off;
        let mut buckets = vec![Vec::new(); capacity];
        for bucket in self.buckets.drain(..) {
            for s in bucket {
                let hash = heap.read_i32_at(s, hash_off) as u32;
                buckets[hash as usize & (capacity - 1)].push(s);
            }
        }
        self.buckets = buckets;
    }

    fn rehash_literals(&mut self, heap: &Heap, capacity: usize) {
        let hash_off = self.layout().hash_off;
        let mut buckets = vec![Vec::new(); capacity];
        for bucket in self.lit_buckets.drain(..) {
            for s in bucket {
                let hash = heap.read_i32_at(s, hash_off) as u32;
                buckets[hash as usize & (capacity - 1)].push(s);
            }
        }
        self.lit_buckets = buckets;
    }

    /// Literal strings are GC roots.
    pub fn literal_roots(&self) -> impl Iterator<Item = HeapRef> + '_ {
        self.lit_buckets.iter().flatten().copied()
    }

    /// Drops interned strings that did not survive the mark phase. Runs
    /// with the world stopped, after marking.
    pub fn purge(&mut self, heap: &Heap) {
        let mut used = 0;
        for bucket in &mut self.buckets {
            bucket.retain(|&s| crate::heap::header::is_marked(heap.header_of(s)));
            used += bucket.len();
        }
        self.entries = used;
    }

    pub fn intern_count(&self) -> usize {
        self.entries
    }

    pub fn literal_count(&self) -> usize {
        self.lit_entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_matches_java_string_hash() {
        // "hi" hashes to 104 * 31 + 105.
        let chars: Vec<u16> = "hi".encode_utf16().collect();
        assert_eq!(JavaStringManager::hash_chars(&chars), 104 * 31 + 105);
        assert_eq!(JavaStringManager::hash_chars(&[]), 0);
    }
}
