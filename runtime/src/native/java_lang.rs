//! Native bodies of the `java.lang` boot classes.

use crate::error::VmError;
use crate::heap::HeapRef;
use crate::interpreter::{self, ThreadContext};
use crate::keys::{FullyQualifiedMethodKey, MethodId, MethodKey};
use crate::native::{KniArgs, KniRet, NativeRegistry, int_arg, long_arg, ref_arg};
use crate::rt::ArrayElement;
use crate::vm::VirtualMachine;
use crate::{build_exception, throw_exception};
use tracing_log::log::error;

pub(super) fn register(registry: &NativeRegistry) {
    let mut add = |class: &str, name: &str, desc: &str, body: crate::native::NativeFn| {
        registry.register(
            FullyQualifiedMethodKey::new_with_str(class, name, desc, &registry.string_interner),
            body,
        );
    };

    add("java/lang/Object", "getClass", "()Ljava/lang/Class;", object_get_class);
    add("java/lang/Object", "hashCode", "()I", object_hash_code);
    add("java/lang/Object", "notify", "()V", object_notify);
    add("java/lang/Object", "notifyAll", "()V", object_notify_all);
    add("java/lang/Object", "wait", "()V", object_wait);
    add("java/lang/Object", "wait", "(J)V", object_wait_millis);
    add("java/lang/Object", "wait", "(JI)V", object_wait_timed);

    add("java/lang/Thread", "currentThread", "()Ljava/lang/Thread;", thread_current);
    add("java/lang/Thread", "sleep", "(J)V", thread_sleep);
    add("java/lang/Thread", "yield", "()V", thread_yield);
    add("java/lang/Thread", "start", "()V", thread_start);
    add("java/lang/Thread", "join", "()V", thread_join);
    add("java/lang/Thread", "join", "(J)V", thread_join_millis);
    add("java/lang/Thread", "interrupt", "()V", thread_interrupt);
    add("java/lang/Thread", "isAlive", "()Z", thread_is_alive);
    add("java/lang/Thread", "activeCount", "()I", thread_active_count);

    add("java/lang/String", "intern", "()Ljava/lang/String;", string_intern);

    add("java/lang/System", "currentTimeMillis", "()J", system_current_time_millis);
    add(
        "java/lang/System",
        "arraycopy",
        "(Ljava/lang/Object;ILjava/lang/Object;II)V",
        system_arraycopy,
    );
    add(
        "java/lang/System",
        "identityHashCode",
        "(Ljava/lang/Object;)I",
        system_identity_hash_code,
    );
    add("java/lang/System", "exit", "(I)V", runtime_exit_status);

    add("java/lang/Runtime", "freeMemory", "()J", runtime_free_memory);
    add("java/lang/Runtime", "totalMemory", "()J", runtime_total_memory);
    add("java/lang/Runtime", "gc", "()V", runtime_gc);
    add("java/lang/Runtime", "exit", "(I)V", runtime_exit_status);

    add("java/lang/Class", "getName", "()Ljava/lang/String;", class_get_name);
    add(
        "java/lang/Class",
        "forName",
        "(Ljava/lang/String;)Ljava/lang/Class;",
        class_for_name,
    );
    add("java/lang/Class", "isArray", "()Z", class_is_array);
    add("java/lang/Class", "isInterface", "()Z", class_is_interface);
    add(
        "java/lang/Class",
        "newInstance",
        "()Ljava/lang/Object;",
        class_new_instance,
    );

    add("java/lang/Float", "floatToIntBits", "(F)I", float_to_int_bits);
    add("java/lang/Float", "intBitsToFloat", "(I)F", int_bits_to_float);
    add("java/lang/Double", "doubleToLongBits", "(D)J", double_to_long_bits);
    add("java/lang/Double", "longBitsToDouble", "(J)D", long_bits_to_double);
}

fn object_get_class(
    vm: &VirtualMachine,
    ctx: &mut ThreadContext,
    args: &KniArgs,
) -> Result<KniRet, VmError> {
    let this = ref_arg(args, 0);
    let class_id = vm.heap_shared().class_of(this);
    let mirror = vm.mirror_of(ctx, class_id)?;
    Ok(KniRet::reference(mirror))
}

fn object_hash_code(
    _vm: &VirtualMachine,
    _ctx: &mut ThreadContext,
    args: &KniArgs,
) -> Result<KniRet, VmError> {
    // The heap does not move objects, the reference itself is the hash.
    Ok(KniRet::int(ref_arg(args, 0) as i32))
}

fn object_notify(
    vm: &VirtualMachine,
    ctx: &mut ThreadContext,
    args: &KniArgs,
) -> Result<KniRet, VmError> {
    if !vm.tm.monitor_notify(&ctx.handle, ref_arg(args, 0), false) {
        throw_exception!(IllegalMonitorStateException)?;
    }
    Ok(KniRet::Void)
}

fn object_notify_all(
    vm: &VirtualMachine,
    ctx: &mut ThreadContext,
    args: &KniArgs,
) -> Result<KniRet, VmError> {
    if !vm.tm.monitor_notify(&ctx.handle, ref_arg(args, 0), true) {
        throw_exception!(IllegalMonitorStateException)?;
    }
    Ok(KniRet::Void)
}

fn do_wait(
    vm: &VirtualMachine,
    ctx: &mut ThreadContext,
    obj: HeapRef,
    millis: i64,
    nanos: i32,
) -> Result<KniRet, VmError> {
    if millis < 0 || nanos < 0 {
        throw_exception!(IllegalArgumentException, "negative timeout")?;
    }
    if !vm.tm.monitor_wait(&ctx.handle, obj, millis, nanos)? {
        throw_exception!(IllegalMonitorStateException)?;
    }
    Ok(KniRet::Void)
}

fn object_wait(
    vm: &VirtualMachine,
    ctx: &mut ThreadContext,
    args: &KniArgs,
) -> Result<KniRet, VmError> {
    do_wait(vm, ctx, ref_arg(args, 0), 0, 0)
}

fn object_wait_millis(
    vm: &VirtualMachine,
    ctx: &mut ThreadContext,
    args: &KniArgs,
) -> Result<KniRet, VmError> {
    do_wait(vm, ctx, ref_arg(args, 0), long_arg(args, 1), 0)
}

fn object_wait_timed(
    vm: &VirtualMachine,
    ctx: &mut ThreadContext,
    args: &KniArgs,
) -> Result<KniRet, VmError> {
    do_wait(
        vm,
        ctx,
        ref_arg(args, 0),
        long_arg(args, 1),
        int_arg(args, 3),
    )
}

fn thread_current(
    _vm: &VirtualMachine,
    ctx: &mut ThreadContext,
    _args: &KniArgs,
) -> Result<KniRet, VmError> {
    Ok(KniRet::reference(ctx.handle.obj()))
}

fn thread_sleep(
    vm: &VirtualMachine,
    ctx: &mut ThreadContext,
    args: &KniArgs,
) -> Result<KniRet, VmError> {
    let millis = long_arg(args, 0);
    if millis < 0 {
        throw_exception!(IllegalArgumentException, "negative sleep")?;
    }
    vm.tm.sleep(&ctx.handle, millis)?;
    Ok(KniRet::Void)
}

fn thread_yield(
    _vm: &VirtualMachine,
    _ctx: &mut ThreadContext,
    _args: &KniArgs,
) -> Result<KniRet, VmError> {
    std::thread::yield_now();
    Ok(KniRet::Void)
}

/// Spawns the native thread backing a `java.lang.Thread` and waits until it
/// has registered itself before returning to the caller.
fn thread_start(
    vm: &VirtualMachine,
    ctx: &mut ThreadContext,
    args: &KniArgs,
) -> Result<KniRet, VmError> {
    let obj = ref_arg(args, 0);

    let run = {
        let class_id = vm.heap_shared().class_of(obj);
        let classes = vm.classes_shared();
        let key = MethodKey {
            name: vm.br.run_sym,
            desc: vm.br.void_desc_sym,
        };
        let mut cur = Some(class_id);
        let mut found = None;
        while let Some(id) = cur {
            if let Some((index, method)) = classes.get_ref(id).methods().find(&key) {
                if !method.is_static() {
                    found = Some(MethodId::new(id, index));
                    break;
                }
            }
            cur = classes.get_ref(id).parent();
        }
        found.ok_or_else(|| VmError::VirtualMachine("thread class has no run method".to_string()))?
    };

    let vm_arc = vm.arc();
    let stack_size = vm.config.stack_size;
    let (started_tx, started_rx) = std::sync::mpsc::channel::<()>();

    std::thread::Builder::new()
        .name("java".to_string())
        .spawn(move || {
            let handle = vm_arc.tm.adopt_current_thread();
            let mut child = ThreadContext::new(handle.clone(), stack_size);
            handle.set_obj(obj);
            vm_arc.register_java_thread(obj, handle.clone());
            vm_arc.tm.register(&handle);
            let _ = started_tx.send(());

            child.stack.push_ref(obj).expect("fresh stack");
            if let Err(err) = interpreter::run_entry(&vm_arc, &mut child, run) {
                error!("fatal error in a spawned thread: {}", err);
            }
            if child.handle.exception() != 0 {
                error!("uncaught exception in a spawned thread");
            }

            vm_arc.drop_java_thread(obj);
            vm_arc.tm.unregister(&handle);
        })
        .map_err(|_| VmError::VirtualMachine("unable to create a new thread".to_string()))?;

    let _ = started_rx.recv();
    Ok(KniRet::Void)
}

fn thread_join(
    vm: &VirtualMachine,
    ctx: &mut ThreadContext,
    args: &KniArgs,
) -> Result<KniRet, VmError> {
    if let Some(target) = vm.java_thread_of(ref_arg(args, 0)) {
        vm.tm.join(&ctx.handle, &target, 0)?;
    }
    Ok(KniRet::Void)
}

fn thread_join_millis(
    vm: &VirtualMachine,
    ctx: &mut ThreadContext,
    args: &KniArgs,
) -> Result<KniRet, VmError> {
    if let Some(target) = vm.java_thread_of(ref_arg(args, 0)) {
        vm.tm.join(&ctx.handle, &target, long_arg(args, 1))?;
    }
    Ok(KniRet::Void)
}

fn thread_interrupt(
    vm: &VirtualMachine,
    ctx: &mut ThreadContext,
    args: &KniArgs,
) -> Result<KniRet, VmError> {
    if let Some(target) = vm.java_thread_of(ref_arg(args, 0)) {
        vm.tm.interrupt(&ctx.handle, &target);
    }
    Ok(KniRet::Void)
}

fn thread_is_alive(
    vm: &VirtualMachine,
    _ctx: &mut ThreadContext,
    args: &KniArgs,
) -> Result<KniRet, VmError> {
    let alive = vm
        .java_thread_of(ref_arg(args, 0))
        .map(|target| target.is_alive())
        .unwrap_or(false);
    Ok(KniRet::int(alive as i32))
}

fn thread_active_count(
    vm: &VirtualMachine,
    _ctx: &mut ThreadContext,
    _args: &KniArgs,
) -> Result<KniRet, VmError> {
    // The finalizer thread does not count.
    Ok(KniRet::int(vm.tm.active_count().saturating_sub(1) as i32))
}

fn string_intern(
    vm: &VirtualMachine,
    ctx: &mut ThreadContext,
    args: &KniArgs,
) -> Result<KniRet, VmError> {
    let interned = vm.intern_string(ctx, ref_arg(args, 0))?;
    Ok(KniRet::reference(interned))
}

fn system_current_time_millis(
    _vm: &VirtualMachine,
    _ctx: &mut ThreadContext,
    _args: &KniArgs,
) -> Result<KniRet, VmError> {
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0);
    Ok(KniRet::long(millis))
}

fn system_arraycopy(
    vm: &VirtualMachine,
    _ctx: &mut ThreadContext,
    args: &KniArgs,
) -> Result<KniRet, VmError> {
    let src = ref_arg(args, 0);
    let src_pos = int_arg(args, 1);
    let dst = ref_arg(args, 2);
    let dst_pos = int_arg(args, 3);
    let len = int_arg(args, 4);

    if src == 0 || dst == 0 {
        throw_exception!(NullPointerException)?;
    }

    let (src_elem, dst_elem) = {
        let heap = vm.heap_shared();
        let classes = vm.classes_shared();
        let elem_of = |obj: HeapRef| {
            classes
                .get_ref(heap.class_of(obj))
                .array_info()
                .map(|info| info.element)
        };
        match (elem_of(src), elem_of(dst)) {
            (Some(a), Some(b)) => (a, b),
            _ => return Err(build_exception!(ArrayStoreException)),
        }
    };

    {
        let heap = vm.heap_shared();
        let src_len = heap.array_length(src) as i64;
        let dst_len = heap.array_length(dst) as i64;
        if src_pos < 0
            || dst_pos < 0
            || len < 0
            || src_pos as i64 + len as i64 > src_len
            || dst_pos as i64 + len as i64 > dst_len
        {
            throw_exception!(
                ArrayIndexOutOfBoundsException,
                "source or destination index out of bounds"
            )?;
        }
    }

    match (src_elem, dst_elem) {
        (ArrayElement::Primitive(a), ArrayElement::Primitive(b)) => {
            if a != b {
                throw_exception!(ArrayStoreException)?;
            }
            vm.heap_shared().copy_nonref_elements(
                a,
                src,
                src_pos as u32,
                dst,
                dst_pos as u32,
                len as u32,
            );
        }
        (ArrayElement::Reference(src_of), ArrayElement::Reference(dst_of)) => {
            let bulk = vm.classes_shared().is_assignable(src_of, dst_of);
            if bulk {
                vm.heap_shared()
                    .copy_ref_elements(src, src_pos as u32, dst, dst_pos as u32, len as u32);
            } else {
                // Element-wise store checks.
                for i in 0..len as u32 {
                    let value = vm.heap_shared().ref_array_get(src, src_pos as u32 + i);
                    if value != 0 {
                        let value_class = vm.heap_shared().class_of(value);
                        if !vm.classes_shared().is_assignable(value_class, dst_of) {
                            throw_exception!(ArrayStoreException)?;
                        }
                    }
                    vm.heap_shared().ref_array_set(dst, dst_pos as u32 + i, value);
                }
            }
        }
        _ => throw_exception!(ArrayStoreException)?,
    }

    Ok(KniRet::Void)
}

fn system_identity_hash_code(
    _vm: &VirtualMachine,
    _ctx: &mut ThreadContext,
    args: &KniArgs,
) -> Result<KniRet, VmError> {
    Ok(KniRet::int(ref_arg(args, 0) as i32))
}

fn runtime_free_memory(
    vm: &VirtualMachine,
    _ctx: &mut ThreadContext,
    _args: &KniArgs,
) -> Result<KniRet, VmError> {
    Ok(KniRet::long(vm.free_memory() as i64))
}

fn runtime_total_memory(
    vm: &VirtualMachine,
    _ctx: &mut ThreadContext,
    _args: &KniArgs,
) -> Result<KniRet, VmError> {
    Ok(KniRet::long(vm.total_memory() as i64))
}

fn runtime_gc(
    vm: &VirtualMachine,
    ctx: &mut ThreadContext,
    _args: &KniArgs,
) -> Result<KniRet, VmError> {
    vm.gc_now(ctx);
    Ok(KniRet::Void)
}

fn runtime_exit_status(
    _vm: &VirtualMachine,
    _ctx: &mut ThreadContext,
    args: &KniArgs,
) -> Result<KniRet, VmError> {
    // Instance Runtime.exit has `this` in slot 0, static System.exit does
    // not; the status is the last slot either way.
    let status = int_arg(args, args.len() - 1);
    Err(VmError::Exit(status))
}

fn class_get_name(
    vm: &VirtualMachine,
    ctx: &mut ThreadContext,
    args: &KniArgs,
) -> Result<KniRet, VmError> {
    let mirror = ref_arg(args, 0);
    let class_id = vm
        .class_of_mirror(mirror)
        .ok_or_else(|| VmError::VirtualMachine("not a class mirror".to_string()))?;
    let name = {
        let classes = vm.classes_shared();
        vm.names()
            .resolve(&classes.get_ref(class_id).name)
            .replace('/', ".")
    };
    let string = vm.create_string(ctx, &name)?;
    Ok(KniRet::reference(string))
}

fn class_for_name(
    vm: &VirtualMachine,
    ctx: &mut ThreadContext,
    args: &KniArgs,
) -> Result<KniRet, VmError> {
    let name_ref = ref_arg(args, 0);
    if name_ref == 0 {
        throw_exception!(NullPointerException)?;
    }
    let name = vm.rust_string_of(name_ref);
    let class_id = vm.class_for_name(ctx, &name)?;
    let mirror = vm.mirror_of(ctx, class_id)?;
    Ok(KniRet::reference(mirror))
}

fn class_is_array(
    vm: &VirtualMachine,
    _ctx: &mut ThreadContext,
    args: &KniArgs,
) -> Result<KniRet, VmError> {
    let class_id = vm
        .class_of_mirror(ref_arg(args, 0))
        .ok_or_else(|| VmError::VirtualMachine("not a class mirror".to_string()))?;
    let is_array = vm.classes_shared().get_ref(class_id).is_array();
    Ok(KniRet::int(is_array as i32))
}

fn class_is_interface(
    vm: &VirtualMachine,
    _ctx: &mut ThreadContext,
    args: &KniArgs,
) -> Result<KniRet, VmError> {
    let class_id = vm
        .class_of_mirror(ref_arg(args, 0))
        .ok_or_else(|| VmError::VirtualMachine("not a class mirror".to_string()))?;
    let is_interface = vm.classes_shared().get_ref(class_id).is_interface();
    Ok(KniRet::int(is_interface as i32))
}

fn class_new_instance(
    vm: &VirtualMachine,
    ctx: &mut ThreadContext,
    args: &KniArgs,
) -> Result<KniRet, VmError> {
    let class_id = vm
        .class_of_mirror(ref_arg(args, 0))
        .ok_or_else(|| VmError::VirtualMachine("not a class mirror".to_string()))?;

    {
        let classes = vm.classes_shared();
        let class = classes.get_ref(class_id);
        if class.is_interface() || class.flags().is_abstract() || class.is_array() {
            return Err(build_exception!(InstantiationException));
        }
    }

    interpreter::ensure_initialized(vm, ctx, class_id)?;
    let obj = vm.alloc_object(ctx, class_id, false)?;

    let init = {
        let classes = vm.classes_shared();
        let key = MethodKey {
            name: vm.br.init_sym,
            desc: vm.br.void_desc_sym,
        };
        classes
            .get_ref(class_id)
            .methods()
            .find(&key)
            .map(|(index, _)| MethodId::new(class_id, index))
    };

    if let Some(init) = init {
        ctx.stack.push_ref(obj)?;
        interpreter::invoke_method(vm, ctx, init)?;
    }

    Ok(KniRet::reference(obj))
}

fn float_to_int_bits(
    _vm: &VirtualMachine,
    _ctx: &mut ThreadContext,
    args: &KniArgs,
) -> Result<KniRet, VmError> {
    Ok(KniRet::int(args[0] as u32 as i32))
}

fn int_bits_to_float(
    _vm: &VirtualMachine,
    _ctx: &mut ThreadContext,
    args: &KniArgs,
) -> Result<KniRet, VmError> {
    Ok(KniRet::One(args[0] as u32 as u64))
}

fn double_to_long_bits(
    _vm: &VirtualMachine,
    _ctx: &mut ThreadContext,
    args: &KniArgs,
) -> Result<KniRet, VmError> {
    Ok(KniRet::Two(args[0]))
}

fn long_bits_to_double(
    _vm: &VirtualMachine,
    _ctx: &mut ThreadContext,
    args: &KniArgs,
) -> Result<KniRet, VmError> {
    Ok(KniRet::Two(args[0]))
}
