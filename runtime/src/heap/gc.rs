//! Mark-sweep collection over the unified heap.
//!
//! The collector runs on the allocating thread, under the VM lock and with
//! the world stopped. Root sources: the class table (mirrors and static
//! reference slots), the Java string literal table, the finalizing queue,
//! and every thread (its Thread object, pending exception, temporary roots
//! and every slot of its Java stack, the latter admitted conservatively).
//! Marking uses an explicit work-list; each reachable object is visited
//! once and its reference slab scanned.

use crate::heap::{CHUNK_WORDS, HEADER_WORDS, Heap, HeapRef, WORD, header};
use crate::loader::ClassTable;
use crate::rt::{ArrayElement, StaticValue};
use crate::thread;
use crate::vm::VirtualMachine;
use tracing_log::log::debug;

pub fn collect(vm: &VirtualMachine, heap: &mut Heap) {
    if !heap.collect_enabled() {
        return;
    }

    let handle = thread::current();
    vm.tm.stop_the_world(&handle);
    debug!("garbage collection");

    purge_bin(heap);

    let to_finalize;
    {
        let classes = vm.classes_shared();

        // Mark phase.
        for class in classes.classes() {
            if let Some(mirror) = class.mirror() {
                mark_reference(heap, &classes, mirror);
            }
            if let Some(slots) = class.static_data() {
                for slot in slots {
                    if let StaticValue::Reference(reference) = *slot.read() {
                        mark_reference(heap, &classes, reference);
                    }
                }
            }
        }

        {
            let jsm = vm.jsm();
            for literal in jsm.literal_roots() {
                mark_reference(heap, &classes, literal);
            }
        }

        for pending in vm.tm.finalizing_snapshot() {
            mark_reference(heap, &classes, pending);
        }

        for thread in vm.tm.threads_snapshot() {
            mark_reference(heap, &classes, thread.obj());
            mark_reference(heap, &classes, thread.exception());

            // Safety: the world is stopped, every scanned thread is parked
            // in a safe region.
            if let Some(stack) = unsafe { thread.stack_for_scan() } {
                for &slot in stack.slots() {
                    mark_potential(heap, &classes, slot as usize);
                }
                for &root in stack.roots() {
                    mark_potential(heap, &classes, root);
                }
                for frame in stack.frames() {
                    mark_potential(heap, &classes, frame.sync_obj);
                }
            }
        }

        to_finalize = mark_finalizable(heap, &classes);
        purge_weakref_list(heap);

        vm.jsm().purge(heap);
        vm.tm.purge_monitors(heap);

        sweep(heap, &classes);
    }

    vm.tm.resume_the_world();
    vm.tm.queue_finalizables(to_finalize);
}

/// Admits a word as a root only if it is word-aligned, lies inside the
/// arena and targets a recorded header position.
fn mark_potential(heap: &Heap, classes: &ClassTable, candidate: usize) {
    if heap.is_recorded_header(candidate) {
        mark_reference(heap, classes, candidate);
    }
}

/// Marks `root` and everything reachable from it through reference slabs.
fn mark_reference(heap: &Heap, classes: &ClassTable, root: HeapRef) {
    if root == 0 {
        return;
    }

    let mut worklist = vec![root];

    while let Some(obj) = worklist.pop() {
        let word = heap.header_of(obj);
        if !header::is_java_object(word) || header::is_marked(word) {
            continue;
        }
        heap.set_header(obj, header::set_mark(word));

        let class = classes.get_ref(header::get_class(word));
        let ref_n = match class.derived().array {
            Some(info) => match info.element {
                ArrayElement::Reference(_) => heap.array_length(obj),
                ArrayElement::Primitive(_) => 0,
            },
            None => class.ref_n(),
        };

        for i in 0..ref_n {
            let slot = heap.read_word_at(obj, -(((i + 1) as i64 * WORD as i64) as i32)) as usize;
            if slot != 0 && !header::is_marked(heap.header_of(slot)) {
                worklist.push(slot);
            }
        }
    }
}

/// Second pass over the registered finalizables: unmarked ones move to the
/// to-be-finalized queue and are resurrected so the finalizer can run on
/// them. Each object is finalized exactly once.
fn mark_finalizable(heap: &mut Heap, classes: &ClassTable) -> Vec<HeapRef> {
    let registered = std::mem::take(&mut heap.finalizable);
    let mut kept = Vec::with_capacity(registered.len());
    let mut to_finalize = Vec::new();

    for obj in registered {
        if header::is_marked(heap.header_of(obj)) {
            kept.push(obj);
        } else {
            to_finalize.push(obj);
        }
    }

    for &obj in &to_finalize {
        mark_reference(heap, classes, obj);
    }

    heap.finalizable = kept;
    to_finalize
}

/// Clears the referent of marked weak references whose referent died and
/// drops dead weak references from the list. The referent word sits right
/// past the header, outside the reference slab.
fn purge_weakref_list(heap: &mut Heap) {
    let list = std::mem::take(&mut heap.weakref_list);
    let mut kept = Vec::with_capacity(list.len());

    for weak in list {
        if !header::is_marked(heap.header_of(weak)) {
            continue;
        }

        let referent = heap.read_word_at(weak, WORD as i32) as usize;
        if referent != 0 && !header::is_marked(heap.header_of(referent)) {
            heap.write_word_at(weak, WORD as i32, 0);
        }
        kept.push(weak);
    }

    heap.weakref_list = kept;
}

/// Turns the free chunks into fake dead C objects so the sweep can coalesce
/// them with adjacent reclaimed regions.
fn purge_bin(heap: &mut Heap) {
    let mut heads: Vec<usize> = heap.drain_bins();

    while let Some(mut chunk) = heads.pop() {
        while chunk != 0 {
            let next = heap.word(chunk) as usize;
            let size = heap.word(chunk + 1) as usize;
            heap.set_word(
                chunk,
                header::create_c((size - HEADER_WORDS) * WORD),
            );
            heap.bitmap_set(chunk);
            chunk = next;
        }
    }
}

/// Walks the bitmap end to end, rebuilding the free lists from dead
/// regions, clearing surviving marks and applying the grow policy.
fn sweep(heap: &mut Heap, classes: &ClassTable) {
    let end = heap.size_words();
    let mut scan = 0usize;
    let mut dead: Option<usize> = None;
    let mut in_use = 0usize;
    let mut reclaimed = 0usize;
    let mut wasted = 0usize;

    while scan < end {
        if !heap.bitmap_get(scan) {
            scan += 1;
            continue;
        }

        let word = heap.word(scan);
        let (is_java, ref_n, nref_words) = if !header::is_java_object(word) {
            (false, 0usize, header::get_size(word) / WORD)
        } else {
            let class = classes.get_ref(header::get_class(word));
            match class.derived().array {
                Some(ref info) => {
                    let length = heap.word(scan + 1) as u32;
                    match info.element {
                        ArrayElement::Reference(_) => (true, length as usize, 1),
                        ArrayElement::Primitive(atype) => {
                            let data_bytes = if atype == crate::rt::ArrayType::Boolean {
                                (length as usize).div_ceil(8)
                            } else {
                                length as usize * atype.elem_size()
                            };
                            (true, 0, 1 + data_bytes.div_ceil(WORD))
                        }
                    }
                }
                None => (
                    true,
                    class.ref_n() as usize,
                    (class.nref_size() as usize).div_ceil(WORD),
                ),
            }
        };

        if header::is_marked(word) {
            if is_java {
                heap.set_word(scan, header::clear_mark(word));
            }

            if let Some(dead_start) = dead.take() {
                let fred = (scan - ref_n) - dead_start;
                if fred >= CHUNK_WORDS {
                    heap.add_reclaimed_chunk(dead_start, fred);
                    reclaimed += fred * WORD;
                } else {
                    for woff in dead_start..(dead_start + fred) {
                        heap.set_word(woff, 0);
                    }
                    wasted += fred * WORD;
                }
            }

            scan += HEADER_WORDS + nref_words;
            in_use += (ref_n + HEADER_WORDS + nref_words) * WORD;
        } else {
            heap.bitmap_clear(scan);
            if dead.is_none() {
                dead = Some(scan - ref_n);
            }
            scan += HEADER_WORDS + nref_words;
        }
    }

    if let Some(dead_start) = dead {
        let fred = end - dead_start;
        if fred >= CHUNK_WORDS {
            heap.add_reclaimed_chunk(dead_start, fred);
            reclaimed += fred * WORD;
        } else {
            for woff in dead_start..(dead_start + fred) {
                heap.set_word(woff, 0);
            }
            wasted += fred * WORD;
        }
    }

    // Grow when the sweep did not free at least half of what is in use.
    if reclaimed < in_use / 2 {
        heap.grow((in_use / 2 - reclaimed) / WORD);
    }

    debug!(
        "collection done: in_use={} reclaimed={} wasted={}",
        in_use, reclaimed, wasted
    );
}
