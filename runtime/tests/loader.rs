//! Class derivation, layout and linking limits.

mod common;

use common::*;
use jelatine_runtime::VmError;
use jelatine_runtime::heap::WORD;
use jelatine_runtime::rt::ClassState;

#[test]
fn derivation_places_fields_into_layout_bands() {
    let node = ClassBuilder::new("demo/Node", Some("java/lang/Object"))
        .field(0, "next", "Ldemo/Node;")
        .field(0, "ticks", "J")
        .field(0, "count", "I")
        .field(0, "unit", "S")
        .field(0, "tag", "B")
        .field(0, "flag", "Z")
        .method(ACC_PUBLIC, "<init>", "()V", code(0, 1, vec![0xb1]))
        .build();

    let mut tvm = boot_vm(vec![("demo/Node".to_string(), node)]);
    let class_id = tvm.class_id("demo/Node");

    let classes = tvm.vm.classes_shared();
    let class = classes.get_ref(class_id);
    assert!(class.state() >= ClassState::Linked);
    assert_eq!(class.ref_n(), 1);
    assert_eq!(class.nref_size(), 16);

    let offset_of = |name: &str, desc: &str| {
        let key = jelatine_runtime::keys::FieldKey {
            name: tvm.vm.names().intern_str(name),
            desc: tvm.vm.names().intern_str(desc),
        };
        class.fields().find(&key, false).expect("field").1.offset()
    };

    // References grow the negative slab, scalars pack in decreasing
    // alignment past the header, booleans are bit indices.
    assert_eq!(offset_of("next", "Ldemo/Node;"), -(WORD as i32));
    assert_eq!(offset_of("ticks", "J"), 8);
    assert_eq!(offset_of("count", "I"), 16);
    assert_eq!(offset_of("unit", "S"), 20);
    assert_eq!(offset_of("tag", "B"), 22);
    assert_eq!(offset_of("flag", "Z"), 23 * 8);

    // Layout distance invariant: ref_n * word + nref_size spans the
    // instance from the first reference slot to the last scalar byte.
    assert_eq!(
        tvm.vm.instance_span(class_id),
        Some(WORD + class.nref_size() as usize)
    );
}

#[test]
fn class_file_version_bounds_are_enforced() {
    for (major, ok) in [(44u16, false), (45, true), (51, true), (52, false)] {
        let name = format!("demo/V{}", major);
        let bytes = ClassBuilder::new(&name, Some("java/lang/Object"))
            .major_version(major)
            .build();

        let mut tvm = boot_vm(vec![(name.clone(), bytes)]);
        let sym = tvm.vm.names().intern_str(&name);
        let result = tvm.vm.resolve_class_name(&mut tvm.ctx, None, sym);

        match (ok, result) {
            (true, Ok(_)) => {}
            (false, Err(VmError::NoClassDefFound(_))) => {}
            (ok, other) => panic!("version {}: ok={} got {:?}", major, ok, other.err()),
        }
    }
}

fn class_with_instance_methods(name: &str, count: usize) -> Vec<u8> {
    let mut builder = ClassBuilder::new(name, Some("java/lang/Object"));
    for i in 0..count {
        builder = builder.method(
            ACC_PUBLIC,
            &format!("m{}", i),
            "()V",
            code(0, 1, vec![0xb1]),
        );
    }
    builder.build()
}

#[test]
fn dispatch_table_accepts_exactly_4096_entries() {
    let fits = class_with_instance_methods("demo/Big", 4096);
    let mut tvm = boot_vm(vec![("demo/Big".to_string(), fits)]);
    let class_id = tvm.class_id("demo/Big");
    assert_eq!(tvm.vm.classes_shared().get_ref(class_id).dtable().len(), 4096);
}

#[test]
fn dispatch_table_rejects_4097_entries() {
    let overflow = class_with_instance_methods("demo/TooBig", 4097);
    let mut tvm = boot_vm(vec![("demo/TooBig".to_string(), overflow)]);
    let sym = tvm.vm.names().intern_str("demo/TooBig");
    assert!(matches!(
        tvm.vm.resolve_class_name(&mut tvm.ctx, None, sym),
        Err(VmError::NoClassDefFound(_))
    ));
}

#[test]
fn argument_stack_size_is_capped_at_16_slots() {
    let sixteen = ClassBuilder::new("demo/Args16", Some("java/lang/Object"))
        .method(
            ACC_PUBLIC | ACC_STATIC,
            "f",
            "(IIIIIIIIIIIIIIII)V",
            code(0, 16, vec![0xb1]),
        )
        .build();
    let mut tvm = boot_vm(vec![("demo/Args16".to_string(), sixteen)]);
    tvm.class_id("demo/Args16");

    let seventeen = ClassBuilder::new("demo/Args17", Some("java/lang/Object"))
        .method(
            ACC_PUBLIC | ACC_STATIC,
            "f",
            "(IIIIIIIIIIIIIIIII)V",
            code(0, 17, vec![0xb1]),
        )
        .build();
    let mut tvm = boot_vm(vec![("demo/Args17".to_string(), seventeen)]);
    let sym = tvm.vm.names().intern_str("demo/Args17");
    assert!(matches!(
        tvm.vm.resolve_class_name(&mut tvm.ctx, None, sym),
        Err(VmError::NoClassDefFound(_))
    ));
}

#[test]
fn class_circularity_is_a_no_class_def_found_error() {
    let a = ClassBuilder::new("demo/CycleA", Some("demo/CycleB")).build();
    let b = ClassBuilder::new("demo/CycleB", Some("demo/CycleA")).build();

    let mut tvm = boot_vm(vec![
        ("demo/CycleA".to_string(), a),
        ("demo/CycleB".to_string(), b),
    ]);

    let sym = tvm.vm.names().intern_str("demo/CycleA");
    assert!(matches!(
        tvm.vm.resolve_class_name(&mut tvm.ctx, None, sym),
        Err(VmError::NoClassDefFound(_))
    ));
}

#[test]
fn array_classes_are_synthesised_with_object_as_parent() {
    let mut tvm = boot_vm(vec![]);
    let array_id = tvm.class_id("[[I");
    let object_id = tvm.class_id("java/lang/Object");

    // The element of [[I is the synthesised [I class.
    let elem_id = tvm.class_id("[I");

    let classes = tvm.vm.classes_shared();
    let array = classes.get_ref(array_id);
    assert!(array.is_array());
    assert_eq!(array.dimensions(), 2);
    assert_eq!(array.parent(), Some(object_id));
    assert!(array.methods().is_empty());

    assert!(classes.is_assignable(array_id, object_id));
    assert!(classes.is_assignable(elem_id, object_id));
    assert!(!classes.is_assignable(elem_id, array_id));
}

#[test]
fn interface_sets_are_flattened_transitively() {
    let top = ClassBuilder::new("demo/Top", Some("java/lang/Object"))
        .access(ACC_PUBLIC | ACC_ABSTRACT | 0x0200)
        .bodyless_method(ACC_PUBLIC | ACC_ABSTRACT, "top", "()I")
        .build();
    let mid = ClassBuilder::new("demo/Mid", Some("java/lang/Object"))
        .access(ACC_PUBLIC | ACC_ABSTRACT | 0x0200)
        .implements("demo/Top")
        .bodyless_method(ACC_PUBLIC | ACC_ABSTRACT, "mid", "()I")
        .build();
    let impl_class = ClassBuilder::new("demo/Impl", Some("java/lang/Object"))
        .implements("demo/Mid")
        .method(ACC_PUBLIC, "<init>", "()V", code(0, 1, vec![0xb1]))
        .method(ACC_PUBLIC, "top", "()I", code(1, 1, vec![0x04, 0xac]))
        .method(ACC_PUBLIC, "mid", "()I", code(1, 1, vec![0x05, 0xac]))
        .build();

    let mut tvm = boot_vm(vec![
        ("demo/Top".to_string(), top),
        ("demo/Mid".to_string(), mid),
        ("demo/Impl".to_string(), impl_class),
    ]);

    let impl_id = tvm.class_id("demo/Impl");
    let top_id = tvm.class_id("demo/Top");
    let mid_id = tvm.class_id("demo/Mid");

    let classes = tvm.vm.classes_shared();
    let interfaces = classes.get_ref(impl_id).interfaces();
    assert!(interfaces.contains(&top_id));
    assert!(interfaces.contains(&mid_id));

    // The interface dispatch table pairs selectors with concrete methods,
    // sorted for the binary search.
    let itable = classes.get_ref(impl_id).itable();
    assert_eq!(itable.selectors.len(), 2);
    assert!(itable.selectors[0] < itable.selectors[1]);
    assert!(classes.is_assignable(impl_id, top_id));
}

#[test]
fn resolution_rewrites_pool_entries_one_way() {
    let mut holder = ClassBuilder::new("demo/Holder", Some("java/lang/Object"));
    let value_idx = holder.int_const(42);
    let holder = holder
        .const_field(ACC_PUBLIC | ACC_STATIC | ACC_FINAL, "ANSWER", "I", value_idx)
        .build();

    // probe()I does getstatic Holder.ANSWER.
    let mut probe = ClassBuilder::new("demo/Probe", Some("java/lang/Object"));
    let field_idx = probe.fieldref("demo/Holder", "ANSWER", "I");
    let probe = probe
        .method(
            ACC_PUBLIC | ACC_STATIC,
            "probe",
            "()I",
            code(
                1,
                0,
                vec![0xb2, (field_idx >> 8) as u8, field_idx as u8, 0xac],
            ),
        )
        .build();

    let mut tvm = boot_vm(vec![
        ("demo/Holder".to_string(), holder),
        ("demo/Probe".to_string(), probe),
    ]);

    assert_eq!(tvm.call_static_int("demo/Probe", "probe").unwrap(), 42);

    // The fieldref entry has been rewritten in place with the resolved tag
    // and the direct field id.
    let probe_id = tvm.class_id("demo/Probe");
    let holder_id = tvm.class_id("demo/Holder");
    let classes = tvm.vm.classes_shared();
    let cp = classes.get_ref(probe_id).cp();
    assert_eq!(
        cp.tag(field_idx).unwrap(),
        jelatine_runtime::cpool::PoolTag::ResolvedFieldref
    );
    match cp.get_fieldref_entry(field_idx).unwrap() {
        jelatine_runtime::cpool::FieldrefEntry::Resolved(field_id) => {
            assert_eq!(field_id.class, holder_id);
            let field = classes.field_ref(field_id);
            assert_eq!(tvm.vm.names().resolve(&field.name), "ANSWER");
        }
        other => panic!("still symbolic: {:?}", other),
    }
}
