//! Object header words.
//!
//! Every heap allocation starts (or, for reference-bearing objects, is
//! anchored) at a one-word header. Bit 0 is the mark bit, bit 1 tells Java
//! objects apart from C allocations:
//!
//! - Java object: `class id << 2 | JAVA`, mark bit toggled by the collector.
//! - C allocation: the word-aligned payload size, low bits free. A live C
//!   block keeps its mark bit set until it is explicitly freed, which is
//!   what makes it survive the sweep; the sweep-purge pass writes unmarked
//!   C headers over free chunks so they coalesce with adjacent dead space.

use crate::keys::ClassId;

const MARK_BIT: u64 = 1 << 0;
const JAVA_BIT: u64 = 1 << 1;
const RESERVED_BITS: u64 = MARK_BIT | JAVA_BIT;

pub fn create_java(class: ClassId) -> u64 {
    ((class.as_raw() as u64) << 2) | JAVA_BIT
}

pub fn create_c(payload_bytes: usize) -> u64 {
    debug_assert_eq!(payload_bytes as u64 & RESERVED_BITS, 0);
    payload_bytes as u64
}

pub fn is_java_object(header: u64) -> bool {
    header & JAVA_BIT != 0
}

pub fn is_marked(header: u64) -> bool {
    header & MARK_BIT != 0
}

pub fn set_mark(header: u64) -> u64 {
    header | MARK_BIT
}

pub fn clear_mark(header: u64) -> u64 {
    header & !MARK_BIT
}

pub fn get_class(header: u64) -> ClassId {
    debug_assert!(is_java_object(header));
    ClassId::from_raw((header >> 2) as u32).expect("Java header carries a class id")
}

/// Payload size in bytes of a C allocation.
pub fn get_size(header: u64) -> usize {
    debug_assert!(!is_java_object(header));
    (header & !RESERVED_BITS) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn java_headers_round_trip_the_class_id() {
        let id = ClassId::from_usize(171);
        let header = create_java(id);
        assert!(is_java_object(header));
        assert!(!is_marked(header));
        assert_eq!(get_class(header), id);
        assert_eq!(get_class(set_mark(header)), id);
    }

    #[test]
    fn c_headers_carry_the_size() {
        let header = set_mark(create_c(64));
        assert!(!is_java_object(header));
        assert!(is_marked(header));
        assert_eq!(get_size(header), 64);
        assert!(!is_marked(clear_mark(header)));
    }
}
