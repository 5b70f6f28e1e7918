//! Bytecode execution: the prelink rewrite, exception unwinding, dispatch
//! and the end-to-end hello world.

mod common;

use common::*;
use jelatine_runtime::opcode::Opcode;
use jelatine_runtime::{VmConfig, VmError};

fn hello_class() -> Vec<u8> {
    // main([Ljava/lang/String;)V:
    //   getstatic System.out; ldc "hi"; invokevirtual println; return
    let mut builder = ClassBuilder::new("demo/H", Some("java/lang/Object"));
    let out_ref = builder.fieldref("java/lang/System", "out", "Ljava/io/PrintStream;");
    let hi = builder.string_const("hi");
    let println = builder.methodref("java/io/PrintStream", "println", "(Ljava/lang/String;)V");
    builder
        .method(
            ACC_PUBLIC | ACC_STATIC,
            "main",
            "([Ljava/lang/String;)V",
            code(
                2,
                1,
                vec![
                    0xb2,
                    (out_ref >> 8) as u8,
                    out_ref as u8, // getstatic
                    0x12,
                    hi as u8, // ldc "hi"
                    0xb6,
                    (println >> 8) as u8,
                    println as u8, // invokevirtual
                    0xb1,          // return
                ],
            ),
        )
        .build()
}

#[test]
fn hello_world_runs_to_exit_code_zero() {
    let mut image = boot_image();
    image.add_class("demo/H", hello_class());

    let config = VmConfig {
        heap_size: 2 * 1024 * 1024,
        stack_size: 64 * 1024,
        main_class: "demo.H".to_string(),
        ..VmConfig::default()
    };

    let code = jelatine_runtime::start_with_image(config, image).unwrap();
    assert_eq!(code, 0);
}

#[test]
fn first_execution_rewrites_prelink_sites_in_place() {
    let mut tvm = boot_vm(vec![("demo/H".to_string(), hello_class())]);

    let main = tvm.find_static("demo/H", "main", "([Ljava/lang/String;)V");
    jelatine_runtime::interpreter::ensure_initialized(&tvm.vm, &mut tvm.ctx, main.class).unwrap();

    // Before the first run the method body still carries the generic
    // opcodes at their canonical byte values.
    jelatine_runtime::translator::link_method(&tvm.vm, &mut tvm.ctx, main).unwrap();
    {
        let classes = tvm.vm.classes_shared();
        let linked = classes.method_ref(main).executable_code();
        assert_eq!(linked.code.opcode(0), Opcode::GetstaticPrelink);
        assert_eq!(linked.code.opcode(3), Opcode::LdcPrelink);
        assert_eq!(linked.code.opcode(5), Opcode::InvokevirtualPrelink);
    }

    tvm.ctx.stack.push_ref(0).unwrap();
    jelatine_runtime::interpreter::invoke_method(&tvm.vm, &mut tvm.ctx, main).unwrap();

    // After the first execution every prelink site has been re-stored as
    // its resolved internal opcode.
    let classes = tvm.vm.classes_shared();
    let linked = classes.method_ref(main).executable_code();
    assert_eq!(linked.code.opcode(0), Opcode::GetstaticReference);
    assert_eq!(linked.code.opcode(3), Opcode::LdcRef);
    assert_eq!(linked.code.opcode(5), Opcode::Invokevirtual);
}

#[test]
fn division_by_zero_unwinds_with_an_arithmetic_exception() {
    let q = ClassBuilder::new("demo/Q", Some("java/lang/Object"))
        .method(
            ACC_PUBLIC | ACC_STATIC,
            "q",
            "()I",
            // iconst_1; iconst_0; idiv; ireturn
            code(2, 0, vec![0x04, 0x03, 0x6c, 0xac]),
        )
        .build();

    let mut tvm = boot_vm(vec![("demo/Q".to_string(), q)]);
    let err = tvm.call_static("demo/Q", "q", "()I").unwrap_err();

    let exception = match err {
        VmError::JavaExceptionThrown(exception) => exception,
        other => panic!("expected a thrown Java exception, got {:?}", other),
    };

    let class_id = tvm.vm.heap_shared().class_of(exception);
    let classes = tvm.vm.classes_shared();
    assert_eq!(
        tvm.vm.names().resolve(&classes.get_ref(class_id).name),
        "java/lang/ArithmeticException"
    );
}

#[test]
fn uncaught_exceptions_exit_nonzero() {
    let boom = ClassBuilder::new("demo/Boom", Some("java/lang/Object"))
        .method(
            ACC_PUBLIC | ACC_STATIC,
            "main",
            "([Ljava/lang/String;)V",
            // iconst_1; iconst_0; idiv; pop; return
            code(2, 1, vec![0x04, 0x03, 0x6c, 0x57, 0xb1]),
        )
        .build();

    let mut image = boot_image();
    image.add_class("demo/Boom", boom);

    let config = VmConfig {
        heap_size: 2 * 1024 * 1024,
        stack_size: 64 * 1024,
        main_class: "demo.Boom".to_string(),
        ..VmConfig::default()
    };

    assert_eq!(jelatine_runtime::start_with_image(config, image).unwrap(), 1);
}

#[test]
fn handler_tables_catch_assignable_exceptions() {
    let mut builder = ClassBuilder::new("demo/Catcher", Some("java/lang/Object"));
    let catch_type = builder.class_const("java/lang/ArithmeticException");
    let caught = builder
        .method(
            ACC_PUBLIC | ACC_STATIC,
            "f",
            "()I",
            // try { 1/0 } catch (ArithmeticException e) { return 7 }
            code_with_handlers(
                2,
                1,
                vec![
                    0x04, 0x03, 0x6c, 0xac, // iconst_1; iconst_0; idiv; ireturn
                    0x4b, // astore_0 (the pushed exception)
                    0x10, 0x07, // bipush 7
                    0xac, // ireturn
                ],
                vec![(0, 4, 4, catch_type)],
            ),
        )
        .build();

    let mut tvm = boot_vm(vec![("demo/Catcher".to_string(), caught)]);
    assert_eq!(tvm.call_static_int("demo/Catcher", "f").unwrap(), 7);
}

#[test]
fn string_literals_are_interned_across_classes() {
    // Two distinct ldc "foo" sites must yield the same reference.
    let make = |name: &str| {
        let mut builder = ClassBuilder::new(name, Some("java/lang/Object"));
        let foo = builder.string_const("foo");
        builder
            .method(
                ACC_PUBLIC | ACC_STATIC,
                "one",
                "()Ljava/lang/String;",
                code(1, 0, vec![0x12, foo as u8, 0xb0]), // ldc; areturn
            )
            .build()
    };

    let mut tvm = boot_vm(vec![
        ("demo/L1".to_string(), make("demo/L1")),
        ("demo/L2".to_string(), make("demo/L2")),
    ]);

    tvm.call_static("demo/L1", "one", "()Ljava/lang/String;").unwrap();
    let first = tvm.ctx.stack.pop_ref();
    tvm.call_static("demo/L2", "one", "()Ljava/lang/String;").unwrap();
    let second = tvm.ctx.stack.pop_ref();

    assert_ne!(first, 0);
    assert_eq!(first, second);
}

#[test]
fn arrays_round_trip_loads_and_stores() {
    let arr = ClassBuilder::new("demo/Arr", Some("java/lang/Object"))
        .method(
            ACC_PUBLIC | ACC_STATIC,
            "f",
            "()I",
            // int[] a = new int[3]; a[2] = 41; return a[2] + a.length - 3 + 1;
            code(
                4,
                1,
                vec![
                    0x06, // iconst_3
                    0xbc, 10, // newarray int
                    0x3a, 0x00, // astore 0
                    0x19, 0x00, // aload 0
                    0x05, // iconst_2
                    0x10, 41, // bipush 41
                    0x4f, // iastore
                    0x19, 0x00, // aload 0
                    0x05, // iconst_2
                    0x2e, // iaload
                    0x19, 0x00, // aload 0
                    0xbe, // arraylength
                    0x60, // iadd
                    0x06, // iconst_3
                    0x64, // isub
                    0x04, // iconst_1
                    0x60, // iadd
                    0xac, // ireturn
                ],
            ),
        )
        .build();

    let mut tvm = boot_vm(vec![("demo/Arr".to_string(), arr)]);
    assert_eq!(tvm.call_static_int("demo/Arr", "f").unwrap(), 42);
}

#[test]
fn zero_length_array_allocation_succeeds() {
    let arr = ClassBuilder::new("demo/Zero", Some("java/lang/Object"))
        .method(
            ACC_PUBLIC | ACC_STATIC,
            "f",
            "()I",
            // return new int[0].length;
            code(2, 0, vec![0x03, 0xbc, 10, 0xbe, 0xac]),
        )
        .build();

    let mut tvm = boot_vm(vec![("demo/Zero".to_string(), arr)]);
    assert_eq!(tvm.call_static_int("demo/Zero", "f").unwrap(), 0);
}

#[test]
fn invokeinterface_binary_searches_the_selector_table() {
    let iface = ClassBuilder::new("demo/I", Some("java/lang/Object"))
        .access(ACC_PUBLIC | ACC_ABSTRACT | 0x0200)
        .bodyless_method(ACC_PUBLIC | ACC_ABSTRACT, "f", "()I")
        .build();

    let mut impl_builder = ClassBuilder::new("demo/D", Some("java/lang/Object"))
        .implements("demo/I");
    let object_init = impl_builder.methodref("java/lang/Object", "<init>", "()V");
    let d = impl_builder
        .method(
            ACC_PUBLIC,
            "<init>",
            "()V",
            code(
                1,
                1,
                vec![0x2a, 0xb7, (object_init >> 8) as u8, object_init as u8, 0xb1],
            ),
        )
        .method(ACC_PUBLIC, "f", "()I", code(1, 1, vec![0x10, 5, 0xac]))
        .build();

    let mut caller_builder = ClassBuilder::new("demo/CallsI", Some("java/lang/Object"));
    let d_class = caller_builder.class_const("demo/D");
    let d_init = caller_builder.methodref("demo/D", "<init>", "()V");
    let imref = caller_builder.interface_methodref("demo/I", "f", "()I");
    let caller = caller_builder
        .method(
            ACC_PUBLIC | ACC_STATIC,
            "call",
            "()I",
            code(
                2,
                0,
                vec![
                    0xbb,
                    (d_class >> 8) as u8,
                    d_class as u8, // new D
                    0x59, // dup
                    0xb7,
                    (d_init >> 8) as u8,
                    d_init as u8, // invokespecial <init>
                    0xb9,
                    (imref >> 8) as u8,
                    imref as u8,
                    1,
                    0, // invokeinterface f
                    0xac, // ireturn
                ],
            ),
        )
        .build();

    let mut tvm = boot_vm(vec![
        ("demo/I".to_string(), iface),
        ("demo/D".to_string(), d),
        ("demo/CallsI".to_string(), caller),
    ]);
    assert_eq!(tvm.call_static_int("demo/CallsI", "call").unwrap(), 5);
}

#[test]
fn synchronized_methods_wrap_entry_and_returns() {
    let sync = ClassBuilder::new("demo/Sync", Some("java/lang/Object"))
        .method(
            ACC_PUBLIC | ACC_STATIC | ACC_SYNCHRONIZED,
            "f",
            "()I",
            code(1, 0, vec![0x06, 0xac]), // iconst_3; ireturn
        )
        .build();

    let mut tvm = boot_vm(vec![("demo/Sync".to_string(), sync)]);
    assert_eq!(tvm.call_static_int("demo/Sync", "f").unwrap(), 3);

    // The prologue and the rewritten return are visible in the buffer.
    let method = tvm.find_static("demo/Sync", "f", "()I");
    let classes = tvm.vm.classes_shared();
    let linked = classes.method_ref(method).executable_code();
    assert_eq!(linked.code.opcode(0), Opcode::MonitorenterSpecialStatic);
    assert_eq!(linked.code.opcode(5), Opcode::Return1Monitorexit);
}

#[test]
fn static_constant_values_are_copied_at_initialization() {
    let mut builder = ClassBuilder::new("demo/Consts", Some("java/lang/Object"));
    let answer = builder.int_const(42);
    let big = builder.long_const(1 << 40);
    let consts = builder
        .const_field(ACC_PUBLIC | ACC_STATIC | ACC_FINAL, "ANSWER", "I", answer)
        .const_field(ACC_PUBLIC | ACC_STATIC | ACC_FINAL, "BIG", "J", big)
        .build();

    // return (int)(BIG >> 40) + ANSWER;
    let mut probe = ClassBuilder::new("demo/ReadsConsts", Some("java/lang/Object"));
    let answer_ref = probe.fieldref("demo/Consts", "ANSWER", "I");
    let big_ref = probe.fieldref("demo/Consts", "BIG", "J");
    let probe = probe
        .method(
            ACC_PUBLIC | ACC_STATIC,
            "f",
            "()I",
            code(
                4,
                0,
                vec![
                    0xb2,
                    (big_ref >> 8) as u8,
                    big_ref as u8, // getstatic BIG
                    0x10,
                    40, // bipush 40
                    0x7b, // lshr
                    0x88, // l2i
                    0xb2,
                    (answer_ref >> 8) as u8,
                    answer_ref as u8, // getstatic ANSWER
                    0x60, // iadd
                    0xac, // ireturn
                ],
            ),
        )
        .build();

    let mut tvm = boot_vm(vec![
        ("demo/Consts".to_string(), consts),
        ("demo/ReadsConsts".to_string(), probe),
    ]);
    assert_eq!(tvm.call_static_int("demo/ReadsConsts", "f").unwrap(), 43);
}
