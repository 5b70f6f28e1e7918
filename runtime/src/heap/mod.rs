//! The unified heap.
//!
//! One contiguous arena hosts Java objects and C book-keeping allocations
//! alike. Free memory is kept in per-size bins (2 to 17 words) plus a
//! first-fit list of large chunks; chunk headers are written into the free
//! memory itself. A bitmap with one bit per arena word records every header
//! position and is the ground truth for the sweep.
//!
//! A Java reference is the byte offset of the object's *header word* from
//! the arena base, not of the block base: reference-typed fields sit at
//! negative offsets from the header, scalar fields and array elements at
//! positive ones, so the collector can scan the reference slab without
//! knowing the class.

use crate::error::VmError;
use crate::keys::ClassId;
use crate::rt::ArrayType;
use tracing_log::log::debug;

pub mod gc;
pub mod header;

/// Byte offset of an object header from the arena base. 0 is the Java null.
pub type HeapRef = usize;

/// Size in bytes of a heap word.
pub const WORD: usize = size_of::<u64>();

/// Words taken by an object header.
pub const HEADER_WORDS: usize = 1;

/// Byte offset of the length word of an array, relative to its header.
pub const ARRAY_LENGTH_OFFSET: usize = WORD;

/// Byte offset of the first element of a non-reference array.
pub const ARRAY_DATA_OFFSET: usize = 2 * WORD;

/// Words taken by a free-chunk record (next, size).
pub(crate) const CHUNK_WORDS: usize = 2;
const MIN_BIN_SIZE: usize = CHUNK_WORDS;
const MAX_BIN_SIZE: usize = 17;
const BIN_ENTRIES: usize = MAX_BIN_SIZE - MIN_BIN_SIZE + 1;

/// Fraction of the reserved arena used before the first grow.
const HEAP_INIT_FRACTION: usize = 16;

/// CLDC mandates at least 32 KiB of heap.
const MIN_HEAP_BYTES: usize = 32 * 1024;

pub struct Heap {
    memory: *mut u8,
    reserved: usize,
    /// Current arena size in words.
    size: usize,
    /// Maximum arena size in words; the bitmap is sized for this up front.
    max_size: usize,
    bitmap: Box<[u8]>,
    /// Heads of the small free-chunk lists, as word offsets; 0 means empty.
    bins: [usize; BIN_ENTRIES],
    large_bin: usize,
    /// Chunk adjacent to the arena boundary, extended in place by `grow`.
    last_chunk: usize,
    collect_enabled: bool,
    /// Registered weak references, traversed after the mark phase.
    pub(crate) weakref_list: Vec<HeapRef>,
    /// Live finalizable objects, scanned by the post-mark pass.
    pub(crate) finalizable: Vec<HeapRef>,
}

// Safety: the raw arena pointer is only dereferenced through &self/&mut self
// methods; the struct sits behind the VM's heap lock and the collector runs
// with the world stopped.
unsafe impl Send for Heap {}
unsafe impl Sync for Heap {}

impl Heap {
    pub fn new(size_bytes: usize) -> Result<Self, VmError> {
        let size_bytes = size_bytes.max(MIN_HEAP_BYTES);
        let max_size = size_bytes.div_ceil(WORD);
        let reserved = max_size * WORD;

        let memory = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                reserved,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };

        if memory == libc::MAP_FAILED {
            return Err(VmError::VirtualMachine(
                "cannot reserve the unified heap".to_string(),
            ));
        }

        let size = (max_size / HEAP_INIT_FRACTION)
            .max(CHUNK_WORDS + 1)
            .min(max_size);

        let mut heap = Heap {
            memory: memory as *mut u8,
            reserved,
            size,
            max_size,
            bitmap: vec![0u8; max_size.div_ceil(8)].into_boxed_slice(),
            bins: [0; BIN_ENTRIES],
            large_bin: 0,
            last_chunk: 0,
            collect_enabled: false,
            weakref_list: Vec::new(),
            finalizable: Vec::new(),
        };

        // Word 0 is reserved so that offset 0 can serve as the Java null;
        // the initial free chunk covers the rest of the initial arena.
        heap.write_chunk(1, 0, size - 1);
        heap.put_chunk(1);

        Ok(heap)
    }

    pub fn set_collect_enabled(&mut self, enabled: bool) {
        self.collect_enabled = enabled;
    }

    pub fn collect_enabled(&self) -> bool {
        self.collect_enabled
    }

    pub fn size_words(&self) -> usize {
        self.size
    }

    pub fn max_size_words(&self) -> usize {
        self.max_size
    }

    /// Amount of memory available to the VM in bytes.
    pub fn total_memory(&self) -> usize {
        self.size * WORD
    }

    /// Sums the free chunks in every bin, in bytes.
    pub fn free_memory(&self) -> usize {
        let mut words = 0;

        for i in 0..BIN_ENTRIES {
            let mut chunk = self.bins[i];
            while chunk != 0 {
                words += self.chunk_size(chunk);
                chunk = self.chunk_next(chunk);
            }
        }

        let mut chunk = self.large_bin;
        while chunk != 0 {
            words += self.chunk_size(chunk);
            chunk = self.chunk_next(chunk);
        }

        words * WORD
    }

    // Raw word access.

    #[inline]
    pub(crate) fn word(&self, woff: usize) -> u64 {
        debug_assert!(woff < self.max_size);
        unsafe { *(self.memory as *const u64).add(woff) }
    }

    #[inline]
    pub(crate) fn set_word(&self, woff: usize, value: u64) {
        debug_assert!(woff < self.max_size);
        unsafe { *(self.memory as *mut u64).add(woff) = value }
    }

    #[inline]
    fn byte_ptr(&self, byte_off: usize) -> *mut u8 {
        debug_assert!(byte_off < self.reserved);
        unsafe { self.memory.add(byte_off) }
    }

    // Bitmap of header positions.

    #[inline]
    pub(crate) fn bitmap_set(&mut self, woff: usize) {
        self.bitmap[woff >> 3] |= 1 << (woff & 0x7);
    }

    #[inline]
    pub(crate) fn bitmap_clear(&mut self, woff: usize) {
        self.bitmap[woff >> 3] &= !(1 << (woff & 0x7));
    }

    #[inline]
    pub(crate) fn bitmap_get(&self, woff: usize) -> bool {
        (self.bitmap[woff >> 3] >> (woff & 0x7)) & 1 != 0
    }

    /// True when `reference` passes the potential-root admission rule:
    /// word-aligned, inside the arena and recorded as a header position.
    pub fn is_recorded_header(&self, reference: HeapRef) -> bool {
        reference % WORD == 0
            && reference != 0
            && reference < self.size * WORD
            && self.bitmap_get(reference / WORD)
    }

    // Chunk management. Chunks live inside the free memory they describe:
    // word 0 holds the next chunk's word offset, word 1 the size in words.

    fn chunk_next(&self, chunk: usize) -> usize {
        self.word(chunk) as usize
    }

    fn chunk_size(&self, chunk: usize) -> usize {
        self.word(chunk + 1) as usize
    }

    fn write_chunk(&mut self, chunk: usize, next: usize, size: usize) {
        self.set_word(chunk, next as u64);
        self.set_word(chunk + 1, size as u64);
    }

    /// Puts a chunk in the bin matching its size.
    fn put_chunk(&mut self, chunk: usize) {
        let size = self.chunk_size(chunk);
        debug_assert!(size >= MIN_BIN_SIZE);

        if size <= MAX_BIN_SIZE {
            let id = size - MIN_BIN_SIZE;
            self.set_word(chunk, self.bins[id] as u64);
            self.bins[id] = chunk;
        } else {
            self.set_word(chunk, self.large_bin as u64);
            self.large_bin = chunk;
        }

        if self.last_chunk == 0 && chunk + size == self.size {
            self.last_chunk = chunk;
        }
    }

    /// Pulls a chunk of at least `size` words from the bins: exact small
    /// match first, then any large chunk, then a larger small chunk, or a
    /// first fit walk of the large list for big requests.
    fn get_chunk(&mut self, size: usize) -> Option<usize> {
        debug_assert!(size >= MIN_BIN_SIZE);

        if size <= MAX_BIN_SIZE {
            let id = size - MIN_BIN_SIZE;

            if self.bins[id] != 0 {
                let best = self.bins[id];
                self.bins[id] = self.chunk_next(best);
                if best == self.last_chunk {
                    self.last_chunk = 0;
                }
                return Some(best);
            }

            if self.large_bin != 0 {
                let best = self.large_bin;
                self.large_bin = self.chunk_next(best);
                if best == self.last_chunk {
                    self.last_chunk = 0;
                }
                return Some(best);
            }

            for id in (id + 1)..BIN_ENTRIES {
                if self.bins[id] != 0 {
                    let best = self.bins[id];
                    self.bins[id] = self.chunk_next(best);
                    if best == self.last_chunk {
                        self.last_chunk = 0;
                    }
                    return Some(best);
                }
            }
        } else {
            let mut prev = 0;
            let mut curr = self.large_bin;

            while curr != 0 {
                if self.chunk_size(curr) >= size {
                    let next = self.chunk_next(curr);
                    if prev != 0 {
                        self.set_word(prev, next as u64);
                    } else {
                        self.large_bin = next;
                    }
                    if curr == self.last_chunk {
                        self.last_chunk = 0;
                    }
                    return Some(curr);
                }
                prev = curr;
                curr = self.chunk_next(curr);
            }
        }

        None
    }

    /// Carves `words` cleared words out of the bins. Returns the word
    /// offset of the block, or `None` when a collection is needed.
    pub(crate) fn try_alloc(&mut self, words: usize) -> Option<usize> {
        let words = words.max(MIN_BIN_SIZE);
        let chunk = self.get_chunk(words)?;
        let chunk_size = self.chunk_size(chunk);

        if chunk_size - words >= CHUNK_WORDS {
            let rest = chunk + words;
            self.write_chunk(rest, 0, chunk_size - words);
            self.put_chunk(rest);
        } else if chunk_size > words {
            // Too small to chunk, the tail is wasted until the next sweep
            // coalesces it.
            for woff in (chunk + words)..(chunk + chunk_size) {
                self.set_word(woff, 0);
            }
        }

        for woff in chunk..(chunk + words) {
            self.set_word(woff, 0);
        }

        Some(chunk)
    }

    /// Grows the arena by `words`, capped at the reserved maximum. Extends
    /// the boundary chunk in place when possible.
    pub(crate) fn grow(&mut self, words: usize) {
        let words = words.min(self.max_size - self.size);
        let chunk = self.last_chunk;

        if chunk != 0 && self.chunk_size(chunk) > MAX_BIN_SIZE {
            let new_size = self.chunk_size(chunk) + words;
            self.set_word(chunk + 1, new_size as u64);
            self.size += words;
        } else {
            if words < CHUNK_WORDS {
                return;
            }

            let chunk = self.size;
            self.size += words;
            self.write_chunk(chunk, 0, words);
            self.last_chunk = 0;
            self.put_chunk(chunk);
        }

        debug!("heap grown to {} words", self.size);
    }

    /// Empties every bin for the sweep-purge pass, clearing the boundary
    /// chunk; returns the old list heads.
    pub(crate) fn drain_bins(&mut self) -> Vec<usize> {
        let mut heads = Vec::with_capacity(BIN_ENTRIES + 1);
        for id in 0..BIN_ENTRIES {
            heads.push(self.bins[id]);
            self.bins[id] = 0;
        }
        heads.push(self.large_bin);
        self.large_bin = 0;
        self.last_chunk = 0;
        heads
    }

    /// Routes a region reclaimed by the sweep into the matching bin.
    pub(crate) fn add_reclaimed_chunk(&mut self, start: usize, words: usize) {
        self.write_chunk(start, 0, words);
        self.put_chunk(start);
    }

    // Object allocators. They place the header, record its position in the
    // bitmap and return the header offset; the caller handles the
    // collect-and-retry policy around `None`.

    /// Allocates an instance of a class with `ref_n` reference slots and
    /// `nref_size` bytes of scalar fields.
    pub fn alloc_object(
        &mut self,
        class: ClassId,
        ref_n: usize,
        nref_size: usize,
    ) -> Option<HeapRef> {
        let words = ref_n + HEADER_WORDS + nref_size.div_ceil(WORD);
        let base = self.try_alloc(words)?;
        let hoff = base + ref_n;

        self.bitmap_set(hoff);
        self.set_word(hoff, header::create_java(class));
        Some(hoff * WORD)
    }

    /// Allocates an array of a primitive element type. Boolean elements are
    /// packed eight per byte.
    pub fn alloc_array_nonref(
        &mut self,
        class: ClassId,
        elem: ArrayType,
        count: u32,
    ) -> Option<HeapRef> {
        let data_bytes = if elem == ArrayType::Boolean {
            (count as usize).div_ceil(8)
        } else {
            count as usize * elem.elem_size()
        };
        let words = 2 * HEADER_WORDS + data_bytes.div_ceil(WORD);

        let base = self.try_alloc(words)?;
        self.bitmap_set(base);
        self.set_word(base, header::create_java(class));
        self.set_word(base + 1, count as u64);
        Some(base * WORD)
    }

    /// Allocates an array of references; the elements form the reference
    /// slab below the header.
    pub fn alloc_array_ref(&mut self, class: ClassId, count: u32) -> Option<HeapRef> {
        let words = count as usize + 2 * HEADER_WORDS;
        let base = self.try_alloc(words)?;
        let hoff = base + count as usize;

        self.bitmap_set(hoff);
        self.set_word(hoff, header::create_java(class));
        self.set_word(hoff + 1, count as u64);
        Some(hoff * WORD)
    }

    /// Allocates a C block of `bytes` payload bytes. The payload has been
    /// cleared; the returned offset points past the header. A zero size is
    /// an invariant violation.
    pub fn alloc_c(&mut self, bytes: usize) -> Option<usize> {
        assert!(bytes != 0);

        let payload_words = bytes.div_ceil(WORD);
        let base = self.try_alloc(payload_words + HEADER_WORDS)?;

        self.bitmap_set(base);
        self.set_word(
            base,
            header::set_mark(header::create_c(payload_words * WORD)),
        );
        Some((base + HEADER_WORDS) * WORD)
    }

    /// Releases a C block by clearing its mark bit; the next sweep reclaims
    /// the memory.
    pub fn free_c(&mut self, payload: usize) {
        let hoff = payload / WORD - HEADER_WORDS;
        self.set_word(hoff, header::clear_mark(self.word(hoff)));
    }

    // Header and field accessors, all keyed on the header byte offset.

    pub fn header_of(&self, obj: HeapRef) -> u64 {
        self.word(obj / WORD)
    }

    pub fn class_of(&self, obj: HeapRef) -> ClassId {
        header::get_class(self.header_of(obj))
    }

    pub(crate) fn set_header(&self, obj: HeapRef, value: u64) {
        self.set_word(obj / WORD, value);
    }

    pub fn array_length(&self, obj: HeapRef) -> u32 {
        self.read_word_at(obj, ARRAY_LENGTH_OFFSET as i32) as u32
    }

    /// Reads a reference slot or scalar word at a signed byte offset from
    /// the header.
    pub fn read_word_at(&self, obj: HeapRef, offset: i32) -> u64 {
        let at = (obj as i64 + offset as i64) as usize;
        unsafe { *(self.byte_ptr(at) as *const u64) }
    }

    pub fn write_word_at(&self, obj: HeapRef, offset: i32, value: u64) {
        let at = (obj as i64 + offset as i64) as usize;
        unsafe { *(self.byte_ptr(at) as *mut u64) = value }
    }

    pub fn read_i8_at(&self, obj: HeapRef, offset: i32) -> i8 {
        let at = (obj as i64 + offset as i64) as usize;
        unsafe { *(self.byte_ptr(at) as *const i8) }
    }

    pub fn write_i8_at(&self, obj: HeapRef, offset: i32, value: i8) {
        let at = (obj as i64 + offset as i64) as usize;
        unsafe { *(self.byte_ptr(at) as *mut i8) = value }
    }

    pub fn read_u16_at(&self, obj: HeapRef, offset: i32) -> u16 {
        let at = (obj as i64 + offset as i64) as usize;
        unsafe { *(self.byte_ptr(at) as *const u16) }
    }

    pub fn write_u16_at(&self, obj: HeapRef, offset: i32, value: u16) {
        let at = (obj as i64 + offset as i64) as usize;
        unsafe { *(self.byte_ptr(at) as *mut u16) = value }
    }

    pub fn read_i16_at(&self, obj: HeapRef, offset: i32) -> i16 {
        self.read_u16_at(obj, offset) as i16
    }

    pub fn read_i32_at(&self, obj: HeapRef, offset: i32) -> i32 {
        let at = (obj as i64 + offset as i64) as usize;
        unsafe { *(self.byte_ptr(at) as *const i32) }
    }

    pub fn write_i32_at(&self, obj: HeapRef, offset: i32, value: i32) {
        let at = (obj as i64 + offset as i64) as usize;
        unsafe { *(self.byte_ptr(at) as *mut i32) = value }
    }

    pub fn read_i64_at(&self, obj: HeapRef, offset: i32) -> i64 {
        self.read_word_at(obj, offset) as i64
    }

    pub fn write_i64_at(&self, obj: HeapRef, offset: i32, value: i64) {
        self.write_word_at(obj, offset, value as u64)
    }

    /// Reads a bit field; `bit_offset` is a bit index from the header.
    pub fn read_bit_at(&self, obj: HeapRef, bit_offset: i32) -> bool {
        let byte = self.read_i8_at(obj, bit_offset / 8) as u8;
        (byte >> (bit_offset % 8)) & 1 != 0
    }

    pub fn write_bit_at(&self, obj: HeapRef, bit_offset: i32, value: bool) {
        let mut byte = self.read_i8_at(obj, bit_offset / 8) as u8;
        if value {
            byte |= 1 << (bit_offset % 8);
        } else {
            byte &= !(1 << (bit_offset % 8));
        }
        self.write_i8_at(obj, bit_offset / 8, byte as i8);
    }

    /// Reference array element `i`, stored below the header.
    pub fn ref_array_get(&self, obj: HeapRef, i: u32) -> HeapRef {
        self.read_word_at(obj, -(((i + 1) as i64 * WORD as i64) as i32)) as HeapRef
    }

    pub fn ref_array_set(&self, obj: HeapRef, i: u32, value: HeapRef) {
        self.write_word_at(obj, -(((i + 1) as i64 * WORD as i64) as i32), value as u64)
    }

    pub fn char_array_slice(&self, obj: HeapRef, len: u32) -> &[u16] {
        unsafe {
            std::slice::from_raw_parts(
                self.byte_ptr(obj + ARRAY_DATA_OFFSET) as *const u16,
                len as usize,
            )
        }
    }

    pub fn char_array_slice_mut(&self, obj: HeapRef, len: u32) -> &mut [u16] {
        unsafe {
            std::slice::from_raw_parts_mut(
                self.byte_ptr(obj + ARRAY_DATA_OFFSET) as *mut u16,
                len as usize,
            )
        }
    }

    pub fn byte_array_slice(&self, obj: HeapRef, len: u32) -> &[i8] {
        unsafe {
            std::slice::from_raw_parts(
                self.byte_ptr(obj + ARRAY_DATA_OFFSET) as *const i8,
                len as usize,
            )
        }
    }

    pub fn byte_array_slice_mut(&self, obj: HeapRef, len: u32) -> &mut [i8] {
        unsafe {
            std::slice::from_raw_parts_mut(
                self.byte_ptr(obj + ARRAY_DATA_OFFSET) as *mut i8,
                len as usize,
            )
        }
    }

    /// Copies a run of primitive array elements; the regions may overlap.
    /// Boolean arrays are bit-packed and copied bit by bit.
    pub fn copy_nonref_elements(
        &self,
        atype: ArrayType,
        src: HeapRef,
        src_pos: u32,
        dst: HeapRef,
        dst_pos: u32,
        len: u32,
    ) {
        if atype == ArrayType::Boolean {
            if src == dst && dst_pos > src_pos {
                for i in (0..len).rev() {
                    let bit = self.read_bit_at(src, (ARRAY_DATA_OFFSET as u32 * 8 + src_pos + i) as i32);
                    self.write_bit_at(dst, (ARRAY_DATA_OFFSET as u32 * 8 + dst_pos + i) as i32, bit);
                }
            } else {
                for i in 0..len {
                    let bit = self.read_bit_at(src, (ARRAY_DATA_OFFSET as u32 * 8 + src_pos + i) as i32);
                    self.write_bit_at(dst, (ARRAY_DATA_OFFSET as u32 * 8 + dst_pos + i) as i32, bit);
                }
            }
            return;
        }

        let elem = atype.elem_size();
        let src_ptr = self.byte_ptr(src + ARRAY_DATA_OFFSET + src_pos as usize * elem);
        let dst_ptr = self.byte_ptr(dst + ARRAY_DATA_OFFSET + dst_pos as usize * elem);
        unsafe {
            std::ptr::copy(src_ptr, dst_ptr, len as usize * elem);
        }
    }

    /// Copies a run of reference array elements; both slabs sit below their
    /// headers, so the copy walks in the safe direction for overlaps.
    pub fn copy_ref_elements(
        &self,
        src: HeapRef,
        src_pos: u32,
        dst: HeapRef,
        dst_pos: u32,
        len: u32,
    ) {
        if src == dst && dst_pos > src_pos {
            for i in (0..len).rev() {
                let value = self.ref_array_get(src, src_pos + i);
                self.ref_array_set(dst, dst_pos + i, value);
            }
        } else {
            for i in 0..len {
                let value = self.ref_array_get(src, src_pos + i);
                self.ref_array_set(dst, dst_pos + i, value);
            }
        }
    }

    pub fn register_weak_ref(&mut self, obj: HeapRef) {
        self.weakref_list.push(obj);
    }

    pub fn register_finalizable(&mut self, obj: HeapRef) {
        self.finalizable.push(obj);
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        unsafe {
            if libc::munmap(self.memory as *mut libc::c_void, self.reserved) != 0 {
                debug!("munmap failed while dropping the heap");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_returns_cleared_aligned_blocks() {
        let mut heap = Heap::new(64 * 1024).unwrap();

        let a = heap.try_alloc(4).unwrap();
        let b = heap.try_alloc(4).unwrap();
        assert_ne!(a, b);
        for woff in a..a + 4 {
            assert_eq!(heap.word(woff), 0);
        }
    }

    #[test]
    fn c_blocks_survive_until_freed() {
        let mut heap = Heap::new(64 * 1024).unwrap();

        let payload = heap.alloc_c(24).unwrap();
        assert_eq!(payload % WORD, 0);

        let hoff = payload / WORD - HEADER_WORDS;
        assert!(heap.bitmap_get(hoff));
        let word = heap.word(hoff);
        assert!(!header::is_java_object(word));
        assert!(header::is_marked(word));
        assert_eq!(header::get_size(word), 24);

        heap.free_c(payload);
        assert!(!header::is_marked(heap.word(hoff)));
    }

    #[test]
    #[should_panic]
    fn zero_sized_c_allocation_is_an_invariant_violation() {
        let mut heap = Heap::new(64 * 1024).unwrap();
        let _ = heap.alloc_c(0);
    }

    #[test]
    fn object_allocation_places_the_header_after_the_ref_slab() {
        let mut heap = Heap::new(64 * 1024).unwrap();
        let class = ClassId::from_usize(5);

        let obj = heap.alloc_object(class, 3, 12).unwrap();
        assert!(heap.is_recorded_header(obj));
        assert_eq!(heap.class_of(obj), class);

        // The reference slab lies below the header.
        for i in 0..3u32 {
            assert_eq!(
                heap.read_word_at(obj, -(((i + 1) as i64 * WORD as i64) as i32)),
                0
            );
        }
    }

    #[test]
    fn ref_arrays_store_elements_below_the_header() {
        let mut heap = Heap::new(64 * 1024).unwrap();
        let class = ClassId::from_usize(7);

        let array = heap.alloc_array_ref(class, 4).unwrap();
        assert_eq!(heap.array_length(array), 4);

        heap.ref_array_set(array, 0, 0x40);
        heap.ref_array_set(array, 3, 0x48);
        assert_eq!(heap.ref_array_get(array, 0), 0x40);
        assert_eq!(heap.ref_array_get(array, 3), 0x48);
    }

    #[test]
    fn zero_length_arrays_allocate() {
        let mut heap = Heap::new(64 * 1024).unwrap();
        let class = ClassId::from_usize(2);

        let prim = heap.alloc_array_nonref(class, ArrayType::Int, 0).unwrap();
        assert_eq!(heap.array_length(prim), 0);

        let refs = heap.alloc_array_ref(class, 0).unwrap();
        assert_eq!(heap.array_length(refs), 0);
    }

    #[test]
    fn boolean_arrays_pack_eight_elements_per_byte() {
        let mut heap = Heap::new(64 * 1024).unwrap();
        let class = ClassId::from_usize(2);

        let bits = heap.alloc_array_nonref(class, ArrayType::Boolean, 9).unwrap();
        heap.write_bit_at(bits, (ARRAY_DATA_OFFSET * 8 + 8) as i32, true);
        assert!(!heap.read_bit_at(bits, (ARRAY_DATA_OFFSET * 8) as i32));
        assert!(heap.read_bit_at(bits, (ARRAY_DATA_OFFSET * 8 + 8) as i32));
    }

    #[test]
    fn free_memory_shrinks_with_allocations() {
        let mut heap = Heap::new(128 * 1024).unwrap();
        let before = heap.free_memory();
        heap.try_alloc(32).unwrap();
        assert_eq!(heap.free_memory(), before - 32 * WORD);
    }

    #[test]
    fn grow_is_capped_at_the_reservation() {
        let mut heap = Heap::new(64 * 1024).unwrap();
        heap.grow(usize::MAX / WORD);
        assert_eq!(heap.size_words(), heap.max_size_words());
    }
}
