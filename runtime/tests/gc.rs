//! Collection behaviour: root survival, full-death reclamation, weak
//! references and string table purging.

mod common;

use common::*;
use jelatine_runtime::heap::WORD;

#[test]
fn temporary_roots_keep_objects_alive_through_collections() {
    let mut tvm = boot_vm(vec![]);
    let object_class = tvm.vm.br.java_lang_object_id().unwrap();

    // 1000 objects reachable only through the array below, which itself is
    // reachable only through a temporary root.
    let array_class = tvm.class_id("[Ljava/lang/Object;");
    let array = tvm.vm.alloc_array_ref(&mut tvm.ctx, array_class, 1000).unwrap();
    tvm.ctx.stack.push_root(array);

    for i in 0..1000 {
        let obj = tvm.vm.alloc_object(&mut tvm.ctx, object_class, false).unwrap();
        tvm.vm.heap_shared().ref_array_set(array, i, obj);
    }

    tvm.vm.gc_now(&mut tvm.ctx);
    tvm.vm.gc_now(&mut tvm.ctx);

    let heap = tvm.vm.heap_shared();
    assert!(heap.is_recorded_header(array));
    for i in 0..1000 {
        let obj = heap.ref_array_get(array, i);
        assert!(heap.is_recorded_header(obj));
        assert_eq!(heap.class_of(obj), object_class);
    }
    drop(heap);

    tvm.ctx.stack.pop_root();
}

#[test]
fn unreachable_objects_are_reclaimed_in_full() {
    let mut tvm = boot_vm(vec![]);
    let object_class = tvm.vm.br.java_lang_object_id().unwrap();

    // After a sweep with no surviving objects every word except the
    // reserved null word is free again.
    for _ in 0..500 {
        tvm.vm.alloc_object(&mut tvm.ctx, object_class, false).unwrap();
    }
    assert!(tvm.ctx.stack.sp() == 0);

    tvm.vm.gc_now(&mut tvm.ctx);

    assert_eq!(tvm.vm.free_memory(), tvm.vm.total_memory() - WORD);
}

#[test]
fn collections_do_not_disturb_reachable_graphs() {
    // Build a small linked structure through reference fields and make
    // sure the collector follows the negative-offset slab.
    let node = ClassBuilder::new("demo/GcNode", Some("java/lang/Object"))
        .field(0, "next", "Ldemo/GcNode;")
        .field(0, "id", "I")
        .method(ACC_PUBLIC, "<init>", "()V", code(0, 1, vec![0xb1]))
        .build();

    let mut tvm = boot_vm(vec![("demo/GcNode".to_string(), node)]);
    let node_class = tvm.class_id("demo/GcNode");

    let (next_off, id_off) = {
        let classes = tvm.vm.classes_shared();
        let class = classes.get_ref(node_class);
        let field = |name: &str, desc: &str| {
            let key = jelatine_runtime::keys::FieldKey {
                name: tvm.vm.names().intern_str(name),
                desc: tvm.vm.names().intern_str(desc),
            };
            class.fields().find(&key, false).unwrap().1.offset()
        };
        (field("next", "Ldemo/GcNode;"), field("id", "I"))
    };

    // head -> a -> b, rooted only at head.
    let head = tvm.vm.alloc_object(&mut tvm.ctx, node_class, false).unwrap();
    tvm.ctx.stack.push_root(head);
    let a = tvm.vm.alloc_object(&mut tvm.ctx, node_class, false).unwrap();
    let b = tvm.vm.alloc_object(&mut tvm.ctx, node_class, false).unwrap();

    {
        let heap = tvm.vm.heap_shared();
        heap.write_word_at(head, next_off, a as u64);
        heap.write_word_at(a, next_off, b as u64);
        heap.write_i32_at(b, id_off, 77);
    }

    tvm.vm.gc_now(&mut tvm.ctx);

    let heap = tvm.vm.heap_shared();
    let a_again = heap.read_word_at(head, next_off) as usize;
    let b_again = heap.read_word_at(a_again, next_off) as usize;
    assert_eq!(a_again, a);
    assert_eq!(b_again, b);
    assert_eq!(heap.read_i32_at(b_again, id_off), 77);
    drop(heap);

    tvm.ctx.stack.pop_root();
}

#[test]
fn weak_referents_are_cleared_when_only_weakly_reachable() {
    let mut tvm = boot_vm(vec![]);
    let weak_class = tvm.class_id("java/lang/ref/WeakReference");
    let object_class = tvm.vm.br.java_lang_object_id().unwrap();

    let ref_class = tvm.class_id("java/lang/ref/Reference");
    let referent_off = {
        let classes = tvm.vm.classes_shared();
        let key = jelatine_runtime::keys::FieldKey {
            name: tvm.vm.names().intern_str("referent"),
            desc: tvm.vm.names().intern_str("Ljava/lang/Object;"),
        };
        classes
            .get_ref(ref_class)
            .fields()
            .find(&key, false)
            .unwrap()
            .1
            .offset()
    };
    // The referent is patched to sit right past the header, outside the
    // reference slab.
    assert_eq!(referent_off, WORD as i32);

    let weak = tvm.vm.alloc_object(&mut tvm.ctx, weak_class, false).unwrap();
    tvm.ctx.stack.push_root(weak);

    let strong = tvm.vm.alloc_object(&mut tvm.ctx, object_class, false).unwrap();
    let doomed = tvm.vm.alloc_object(&mut tvm.ctx, object_class, false).unwrap();
    tvm.ctx.stack.push_root(strong);

    // Point the weak reference at the doomed object first.
    tvm.vm.heap_shared().write_word_at(weak, referent_off, doomed as u64);
    tvm.vm.gc_now(&mut tvm.ctx);
    assert_eq!(tvm.vm.heap_shared().read_word_at(weak, referent_off), 0);

    // A strongly reachable referent survives.
    tvm.vm.heap_shared().write_word_at(weak, referent_off, strong as u64);
    tvm.vm.gc_now(&mut tvm.ctx);
    assert_eq!(
        tvm.vm.heap_shared().read_word_at(weak, referent_off),
        strong as u64
    );

    tvm.ctx.stack.pop_root();
    tvm.ctx.stack.pop_root();
}

#[test]
fn literal_strings_survive_collections_and_stay_canonical() {
    let mut tvm = boot_vm(vec![]);
    let sym = tvm.vm.names().intern_str("canonical");

    let literal = tvm.vm.create_literal(&mut tvm.ctx, sym).unwrap();
    tvm.vm.gc_now(&mut tvm.ctx);

    // The literal table is a root and intern returns the same object.
    assert!(tvm.vm.heap_shared().is_recorded_header(literal));
    let again = tvm.vm.create_literal(&mut tvm.ctx, sym).unwrap();
    assert_eq!(literal, again);
    assert_eq!(tvm.vm.rust_string_of(literal), "canonical");
}
