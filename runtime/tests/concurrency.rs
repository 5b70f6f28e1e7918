//! Monitors, wait/notify and Java-level threads.

mod common;

use common::*;
use jelatine_runtime::VmError;
use jelatine_runtime::interpreter::ThreadContext;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[test]
fn monitor_enter_exit_round_trip() {
    let mut tvm = boot_vm(vec![]);
    let object_class = tvm.vm.br.java_lang_object_id().unwrap();
    let obj = tvm.vm.alloc_object(&mut tvm.ctx, object_class, false).unwrap();
    let handle = tvm.ctx.handle.clone();

    tvm.vm.tm.monitor_enter(&handle, obj);
    tvm.vm.tm.monitor_enter(&handle, obj);
    assert_eq!(tvm.vm.tm.monitor_state(obj), Some((Some(handle.id), 2)));

    assert!(tvm.vm.tm.monitor_exit(&handle, obj));
    assert_eq!(tvm.vm.tm.monitor_state(obj), Some((Some(handle.id), 1)));

    assert!(tvm.vm.tm.monitor_exit(&handle, obj));
    assert_eq!(tvm.vm.tm.monitor_state(obj), Some((None, 0)));

    // A third exit fails: the caller no longer owns the monitor; the
    // interpreter maps this to IllegalMonitorStateException.
    assert!(!tvm.vm.tm.monitor_exit(&handle, obj));
}

#[test]
fn wait_blocks_until_notify_and_reacquires() {
    let mut tvm = boot_vm(vec![]);
    let object_class = tvm.vm.br.java_lang_object_id().unwrap();
    let obj = tvm.vm.alloc_object(&mut tvm.ctx, object_class, false).unwrap();

    let vm = tvm.vm.clone();
    let resumed = Arc::new(AtomicBool::new(false));
    let resumed_in_thread = resumed.clone();

    let waiter = std::thread::spawn(move || {
        let handle = vm.tm.adopt_current_thread();
        let ctx = ThreadContext::new(handle.clone(), 16 * 1024);
        vm.tm.register(&handle);

        vm.tm.monitor_enter(&handle, obj);
        vm.tm.monitor_wait(&handle, obj, 0, 0).unwrap();
        // Woken up: the monitor is held again.
        assert_eq!(vm.tm.monitor_state(obj), Some((Some(handle.id), 1)));
        resumed_in_thread.store(true, Ordering::SeqCst);
        assert!(vm.tm.monitor_exit(&handle, obj));

        vm.tm.unregister(&handle);
        drop(ctx);
    });

    // Wait for the waiter to release the monitor into its wait.
    loop {
        if tvm.vm.tm.monitor_state(obj) == Some((None, 0)) {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(!resumed.load(Ordering::SeqCst));

    let handle = tvm.ctx.handle.clone();
    tvm.vm.tm.monitor_enter(&handle, obj);
    assert!(tvm.vm.tm.monitor_notify(&handle, obj, false));
    assert!(tvm.vm.tm.monitor_exit(&handle, obj));

    waiter.join().unwrap();
    assert!(resumed.load(Ordering::SeqCst));
}

#[test]
fn notify_without_ownership_is_rejected() {
    let mut tvm = boot_vm(vec![]);
    let object_class = tvm.vm.br.java_lang_object_id().unwrap();
    let obj = tvm.vm.alloc_object(&mut tvm.ctx, object_class, false).unwrap();
    let handle = tvm.ctx.handle.clone();

    assert!(!tvm.vm.tm.monitor_notify(&handle, obj, true));
    assert!(!tvm.vm.tm.monitor_wait(&handle, obj, 0, 0).unwrap());
}

#[test]
fn wait_requires_a_non_recursive_hold() {
    let mut tvm = boot_vm(vec![]);
    let object_class = tvm.vm.br.java_lang_object_id().unwrap();
    let obj = tvm.vm.alloc_object(&mut tvm.ctx, object_class, false).unwrap();
    let handle = tvm.ctx.handle.clone();

    tvm.vm.tm.monitor_enter(&handle, obj);
    tvm.vm.tm.monitor_enter(&handle, obj);
    // count == 2: wait refuses.
    assert!(!tvm.vm.tm.monitor_wait(&handle, obj, 0, 0).unwrap());
    assert!(tvm.vm.tm.monitor_exit(&handle, obj));
    assert!(tvm.vm.tm.monitor_exit(&handle, obj));
}

#[test]
fn interrupt_wakes_a_sleeping_thread() {
    let tvm = boot_vm(vec![]);
    let vm = tvm.vm.clone();

    let (handle_tx, handle_rx) = std::sync::mpsc::channel();
    let sleeper = std::thread::spawn(move || {
        let handle = vm.tm.adopt_current_thread();
        let ctx = ThreadContext::new(handle.clone(), 16 * 1024);
        vm.tm.register(&handle);
        handle_tx.send(handle.clone()).unwrap();

        let result = vm.tm.sleep(&handle, 60_000);
        vm.tm.unregister(&handle);
        drop(ctx);
        result
    });

    let target = handle_rx.recv().unwrap();
    std::thread::sleep(Duration::from_millis(10));
    tvm.vm.tm.interrupt(&tvm.ctx.handle, &target);

    match sleeper.join().unwrap() {
        Err(VmError::JavaException(ex)) => {
            assert_eq!(
                ex.kind,
                jelatine_runtime::error::JavaExceptionKind::InterruptedException
            );
        }
        other => panic!("expected InterruptedException, got {:?}", other.err()),
    }
    // The interrupt flag was consumed by the wakeup.
    assert!(!target.interrupt_flag());
}

#[test]
fn java_threads_run_and_join() {
    // class Worker extends Thread { static int flag; run() { flag = 1; } }
    let mut worker = ClassBuilder::new("demo/Worker", Some("java/lang/Thread"));
    let thread_init = worker.methodref("java/lang/Thread", "<init>", "()V");
    let flag_ref = worker.fieldref("demo/Worker", "flag", "I");
    let worker = worker
        .field(ACC_PUBLIC | ACC_STATIC, "flag", "I")
        .method(
            ACC_PUBLIC,
            "<init>",
            "()V",
            code(
                1,
                1,
                vec![0x2a, 0xb7, (thread_init >> 8) as u8, thread_init as u8, 0xb1],
            ),
        )
        .method(
            ACC_PUBLIC,
            "run",
            "()V",
            code(
                1,
                1,
                vec![0x04, 0xb3, (flag_ref >> 8) as u8, flag_ref as u8, 0xb1],
            ),
        )
        .build();

    // start a Worker, join it, return the flag
    let mut main = ClassBuilder::new("demo/Spawns", Some("java/lang/Object"));
    let worker_class = main.class_const("demo/Worker");
    let worker_init = main.methodref("demo/Worker", "<init>", "()V");
    let start = main.methodref("demo/Worker", "start", "()V");
    let join = main.methodref("demo/Worker", "join", "()V");
    let flag_ref = main.fieldref("demo/Worker", "flag", "I");
    let main = main
        .method(
            ACC_PUBLIC | ACC_STATIC,
            "go",
            "()I",
            code(
                2,
                1,
                vec![
                    0xbb,
                    (worker_class >> 8) as u8,
                    worker_class as u8, // new Worker
                    0x59, // dup
                    0xb7,
                    (worker_init >> 8) as u8,
                    worker_init as u8, // invokespecial <init>
                    0x4b, // astore_0
                    0x2a, // aload_0
                    0xb6,
                    (start >> 8) as u8,
                    start as u8, // invokevirtual start
                    0x2a, // aload_0
                    0xb6,
                    (join >> 8) as u8,
                    join as u8, // invokevirtual join
                    0xb2,
                    (flag_ref >> 8) as u8,
                    flag_ref as u8, // getstatic flag
                    0xac, // ireturn
                ],
            ),
        )
        .build();

    let mut tvm = boot_vm(vec![
        ("demo/Worker".to_string(), worker),
        ("demo/Spawns".to_string(), main),
    ]);
    assert_eq!(tvm.call_static_int("demo/Spawns", "go").unwrap(), 1);
}
