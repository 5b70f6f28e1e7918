//! The virtual machine: subsystem wiring, allocation entry points with the
//! collect-and-retry policy, string and mirror creation, bootstrap and the
//! main-thread run loop.

use crate::class_loader::{ClassPath, MemoryImage};
use crate::error::{JavaExceptionFromVm, VmError};
use crate::heap::{Heap, HeapRef, WORD, gc};
use crate::interpreter::{self, ThreadContext};
use crate::jstring::{JavaStringManager, StringLayout};
use crate::keys::{ClassId, FieldId, FieldKey, MethodId, Symbol};
use crate::loader::{ClassTable, LoaderCtx};
use crate::native::NativeRegistry;
use crate::rt::{ArrayElement, ArrayType, ClassState};
use crate::thread::{self, ThreadHandle, ThreadManager};
use crate::utf8::{Utf8Pool, slashify};
use crate::vm::bootstrap_registry::BootstrapRegistry;
use crate::{VmConfig, throw_exception};
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::sync::Arc;
use tracing_log::log::{debug, error};

pub mod bootstrap_registry;

pub struct VirtualMachine {
    pub config: VmConfig,
    names: Utf8Pool,
    classpath: ClassPath,
    classes: RwLock<ClassTable>,
    heap: RwLock<Heap>,
    jsm: Mutex<JavaStringManager>,
    pub tm: ThreadManager,
    pub natives: NativeRegistry,
    pub br: BootstrapRegistry,
    /// Mirror object -> class id, the reverse of each class' mirror cell.
    mirrors: Mutex<HashMap<HeapRef, ClassId>>,
    /// Live java.lang.Thread objects -> VM thread handles.
    java_threads: Mutex<HashMap<HeapRef, Arc<ThreadHandle>>>,
    /// Back pointer used by natives that spawn threads.
    self_ref: once_cell::sync::OnceCell<std::sync::Weak<VirtualMachine>>,
}

impl VirtualMachine {
    pub fn new(config: VmConfig, image: MemoryImage) -> Result<Self, VmError> {
        let names = Utf8Pool::new();
        let natives = NativeRegistry::new(names.rodeo());
        let br = BootstrapRegistry::new(&names);

        let mut roots = config.boot_class_path.clone();
        roots.extend(config.class_path.iter().cloned());
        let classpath = ClassPath::new(image, &roots);

        Ok(Self {
            names: names.clone(),
            classpath,
            classes: RwLock::new(ClassTable::new(names.clone())),
            heap: RwLock::new(Heap::new(config.heap_size)?),
            jsm: Mutex::new(JavaStringManager::new(4, 4)),
            tm: ThreadManager::new(),
            natives,
            br,
            mirrors: Mutex::new(HashMap::new()),
            java_threads: Mutex::new(HashMap::new()),
            self_ref: once_cell::sync::OnceCell::new(),
            config,
        })
    }

    pub fn install_self(self_arc: &Arc<Self>) {
        let _ = self_arc.self_ref.set(Arc::downgrade(self_arc));
    }

    /// Owning handle of this machine, for natives that spawn threads.
    pub fn arc(&self) -> Arc<Self> {
        self.self_ref
            .get()
            .and_then(std::sync::Weak::upgrade)
            .expect("the VM is owned by an Arc")
    }

    pub fn names(&self) -> &Utf8Pool {
        &self.names
    }

    pub fn classpath(&self) -> &ClassPath {
        &self.classpath
    }

    pub fn loader_ctx(&self) -> LoaderCtx<'_> {
        LoaderCtx {
            classpath: &self.classpath,
            natives: &self.natives,
        }
    }

    /// Marks the thread safe while it may block on a subsystem lock, so a
    /// stopping collector does not wait for it.
    fn with_safe<T>(&self, f: impl FnOnce() -> T) -> T {
        match thread::try_current() {
            Some(handle) => {
                handle.safe_inc();
                let result = f();
                handle.safe_dec();
                result
            }
            None => f(),
        }
    }

    pub fn heap_shared(&self) -> RwLockReadGuard<'_, Heap> {
        self.with_safe(|| self.heap.read())
    }

    pub fn heap_mut(&self) -> RwLockWriteGuard<'_, Heap> {
        self.with_safe(|| self.heap.write())
    }

    pub fn classes_shared(&self) -> RwLockReadGuard<'_, ClassTable> {
        self.with_safe(|| self.classes.read())
    }

    pub fn classes_mut(&self) -> RwLockWriteGuard<'_, ClassTable> {
        self.with_safe(|| self.classes.write())
    }

    pub fn jsm(&self) -> MutexGuard<'_, JavaStringManager> {
        self.with_safe(|| self.jsm.lock())
    }

    // Resolution entry points, serialised by the VM lock.

    pub fn resolve_class_name(
        &self,
        ctx: &mut ThreadContext,
        orig: Option<ClassId>,
        name: Symbol,
    ) -> Result<ClassId, VmError> {
        let guard = self.tm.lock(&ctx.handle);
        let loader_ctx = self.loader_ctx();
        let result = self.classes_mut().resolve(&loader_ctx, orig, name);
        drop(guard);
        result
    }

    pub fn resolve_class_in(
        &self,
        ctx: &mut ThreadContext,
        owner: ClassId,
        idx: u16,
    ) -> Result<ClassId, VmError> {
        let guard = self.tm.lock(&ctx.handle);
        let loader_ctx = self.loader_ctx();
        let result = self.classes_mut().resolve_cp_class(&loader_ctx, owner, idx);
        drop(guard);
        result
    }

    pub fn resolve_field_in(
        &self,
        ctx: &mut ThreadContext,
        owner: ClassId,
        idx: u16,
        is_static: bool,
    ) -> Result<FieldId, VmError> {
        let guard = self.tm.lock(&ctx.handle);
        let loader_ctx = self.loader_ctx();
        let result = self
            .classes_mut()
            .resolve_cp_field(&loader_ctx, owner, idx, is_static);
        drop(guard);
        result
    }

    pub fn resolve_method_in(
        &self,
        ctx: &mut ThreadContext,
        owner: ClassId,
        idx: u16,
        interface: bool,
    ) -> Result<MethodId, VmError> {
        let guard = self.tm.lock(&ctx.handle);
        let loader_ctx = self.loader_ctx();
        let result = self
            .classes_mut()
            .resolve_cp_method(&loader_ctx, owner, idx, interface);
        drop(guard);
        result
    }

    pub fn primitive_array_class(
        &self,
        ctx: &mut ThreadContext,
        atype: ArrayType,
    ) -> Result<ClassId, VmError> {
        if let Some(id) = self.classes_shared().array_class_by_type(atype) {
            return Ok(id);
        }
        let name = self.names.intern_str(atype.class_name());
        self.resolve_class_name(ctx, None, name)
    }

    // Allocation with the collect-and-retry policy: on failure collect,
    // retry, grow by the request, retry once more, then give up for good.

    fn alloc_with(
        &self,
        ctx: &mut ThreadContext,
        grow_words: usize,
        mut try_alloc: impl FnMut(&mut Heap) -> Option<HeapRef>,
    ) -> Result<HeapRef, VmError> {
        let guard = self.tm.lock(&ctx.handle);
        let mut heap = self.heap_mut();

        if let Some(obj) = try_alloc(&mut heap) {
            drop(heap);
            drop(guard);
            return Ok(obj);
        }

        gc::collect(self, &mut heap);

        if let Some(obj) = try_alloc(&mut heap) {
            drop(heap);
            drop(guard);
            return Ok(obj);
        }

        heap.grow(grow_words);

        match try_alloc(&mut heap) {
            Some(obj) => {
                drop(heap);
                drop(guard);
                Ok(obj)
            }
            None => {
                error!("out of memory, try giving the VM a larger heap with --size");
                Err(VmError::OutOfMemory)
            }
        }
    }

    pub fn alloc_object(
        &self,
        ctx: &mut ThreadContext,
        class_id: ClassId,
        finalizable: bool,
    ) -> Result<HeapRef, VmError> {
        let (ref_n, nref_size, is_weakref) = {
            let classes = self.classes_shared();
            let class = classes.get_ref(class_id);
            (
                class.ref_n() as usize,
                class.nref_size() as usize,
                class.derived().is_weakref,
            )
        };

        let grow_words = ref_n + 1 + nref_size.div_ceil(WORD);
        let obj = self.alloc_with(ctx, grow_words, |heap| {
            heap.alloc_object(class_id, ref_n, nref_size)
        })?;

        if finalizable {
            self.heap_mut().register_finalizable(obj);
        }
        if is_weakref {
            self.heap_mut().register_weak_ref(obj);
        }

        Ok(obj)
    }

    pub fn alloc_array_nonref(
        &self,
        ctx: &mut ThreadContext,
        class_id: ClassId,
        atype: ArrayType,
        count: u32,
    ) -> Result<HeapRef, VmError> {
        let grow_words = 2 + (count as usize * atype.elem_size()).div_ceil(WORD);
        self.alloc_with(ctx, grow_words, |heap| {
            heap.alloc_array_nonref(class_id, atype, count)
        })
    }

    pub fn alloc_array_ref(
        &self,
        ctx: &mut ThreadContext,
        class_id: ClassId,
        count: u32,
    ) -> Result<HeapRef, VmError> {
        self.alloc_with(ctx, count as usize + 2, |heap| {
            heap.alloc_array_ref(class_id, count)
        })
    }

    /// Recursively allocates a multi-dimensional array, keeping the
    /// partially built structure reachable through a temporary root.
    pub fn alloc_multiarray(
        &self,
        ctx: &mut ThreadContext,
        class_id: ClassId,
        counts: &[i32],
    ) -> Result<HeapRef, VmError> {
        let element = {
            let classes = self.classes_shared();
            classes
                .get_ref(class_id)
                .array_info()
                .map(|info| info.element)
                .ok_or_else(|| {
                    VmError::VirtualMachine("MULTIANEWARRAY on a non-array class".to_string())
                })?
        };

        let count = counts[0] as u32;

        if counts.len() == 1 {
            return match element {
                ArrayElement::Primitive(atype) => {
                    self.alloc_array_nonref(ctx, class_id, atype, count)
                }
                ArrayElement::Reference(_) => self.alloc_array_ref(ctx, class_id, count),
            };
        }

        let elem_class = match element {
            ArrayElement::Reference(elem) => elem,
            ArrayElement::Primitive(_) => {
                return Err(VmError::VirtualMachine(
                    "multi-dimensional array with a primitive element class".to_string(),
                ));
            }
        };

        let array = self.alloc_array_ref(ctx, class_id, count)?;
        ctx.stack.push_root(array);

        for i in 0..count {
            let sub = match self.alloc_multiarray(ctx, elem_class, &counts[1..]) {
                Ok(sub) => sub,
                Err(err) => {
                    ctx.stack.pop_root();
                    return Err(err);
                }
            };
            self.heap_shared().ref_array_set(array, i, sub);
        }

        ctx.stack.pop_root();
        Ok(array)
    }

    /// The `java.lang.Class` object of a class, created on first use.
    pub fn mirror_of(
        &self,
        ctx: &mut ThreadContext,
        class_id: ClassId,
    ) -> Result<HeapRef, VmError> {
        if let Some(mirror) = self.classes_shared().get_ref(class_id).mirror() {
            return Ok(mirror);
        }

        let class_class = self.br.java_lang_class_id()?;
        let mirror = self.alloc_object(ctx, class_class, false)?;

        let guard = self.tm.lock(&ctx.handle);
        let class = self.classes_shared().get(class_id);
        class.set_mirror(mirror);
        let winner = class.mirror().expect("mirror just set");
        if winner == mirror {
            self.mirrors.lock().insert(mirror, class_id);
        }
        drop(guard);
        Ok(winner)
    }

    pub fn class_of_mirror(&self, mirror: HeapRef) -> Option<ClassId> {
        self.mirrors.lock().get(&mirror).copied()
    }

    // Java string creation.

    /// A fresh, uninterned java.lang.String holding `text`.
    pub fn create_string(
        &self,
        ctx: &mut ThreadContext,
        text: &str,
    ) -> Result<HeapRef, VmError> {
        let chars: Vec<u16> = text.encode_utf16().collect();
        self.create_string_from_chars(ctx, &chars)
    }

    fn create_string_from_chars(
        &self,
        ctx: &mut ThreadContext,
        chars: &[u16],
    ) -> Result<HeapRef, VmError> {
        let (str_class, char_array_class, layout) = {
            let jsm = self.jsm();
            (jsm.str_class(), jsm.char_array_class(), jsm.layout())
        };

        let value = self.alloc_array_nonref(
            ctx,
            char_array_class,
            ArrayType::Char,
            chars.len() as u32,
        )?;
        {
            let heap = self.heap_shared();
            heap.char_array_slice_mut(value, chars.len() as u32)
                .copy_from_slice(chars);
        }

        ctx.stack.push_root(value);
        let string = self.alloc_object(ctx, str_class, false);
        ctx.stack.pop_root();
        let string = string?;

        let heap = self.heap_shared();
        heap.write_word_at(string, layout.value_off, value as u64);
        heap.write_i32_at(string, layout.offset_off, 0);
        heap.write_i32_at(string, layout.count_off, chars.len() as i32);
        heap.write_i32_at(string, layout.hash_off, 0);
        Ok(string)
    }

    /// Resolves a `CONSTANT_String` entry to its permanent literal,
    /// creating and registering it on first touch.
    pub fn intern_string_constant(
        &self,
        ctx: &mut ThreadContext,
        owner: ClassId,
        idx: u16,
    ) -> Result<HeapRef, VmError> {
        let guard = self.tm.lock(&ctx.handle);

        let entry = {
            let classes = self.classes_shared();
            classes.get_ref(owner).cp().get_string_entry(idx)?
        };

        let sym = match entry {
            crate::cpool::StringEntry::Resolved(literal) => {
                drop(guard);
                return Ok(literal);
            }
            crate::cpool::StringEntry::Symbolic(sym) => sym,
        };

        let literal = self.create_literal(ctx, sym)?;
        self.classes_shared()
            .get_ref(owner)
            .cp()
            .resolve_string(idx, literal);
        drop(guard);
        Ok(literal)
    }

    /// Finds or creates the literal string for an interned name.
    pub fn create_literal(
        &self,
        ctx: &mut ThreadContext,
        sym: Symbol,
    ) -> Result<HeapRef, VmError> {
        let guard = self.tm.lock(&ctx.handle);
        let chars = self.names.chars(&sym);

        let found = {
            let heap = self.heap_shared();
            let jsm = self.jsm();
            jsm.find_literal(&heap, &chars)
        };
        if let Some(literal) = found {
            drop(guard);
            return Ok(literal);
        }

        let string = self.create_string_from_chars(ctx, &chars)?;
        {
            let heap = self.heap_shared();
            let mut jsm = self.jsm();
            jsm.hash_of(&heap, string);
            jsm.insert_literal(&heap, string);
        }
        drop(guard);
        Ok(string)
    }

    /// `String.intern()` on a user string.
    pub fn intern_string(
        &self,
        ctx: &mut ThreadContext,
        string: HeapRef,
    ) -> Result<HeapRef, VmError> {
        let guard = self.tm.lock(&ctx.handle);
        let interned = {
            let heap = self.heap_shared();
            let mut jsm = self.jsm();
            jsm.intern(&heap, string)
        };
        drop(guard);
        Ok(interned)
    }

    pub fn rust_string_of(&self, string: HeapRef) -> String {
        let heap = self.heap_shared();
        let jsm = self.jsm();
        String::from_utf16_lossy(jsm.chars_of(&heap, string))
    }

    /// Allocates the Java object for a runtime-raised exception and stores
    /// its message, if any, directly in the `message` field.
    pub fn materialize_exception(
        &self,
        ctx: &mut ThreadContext,
        built: JavaExceptionFromVm,
    ) -> Result<HeapRef, VmError> {
        let class_name = self.names.intern_str(built.kind.class_name());
        let class_id = self.resolve_class_name(ctx, None, class_name)?;
        interpreter::ensure_initialized(self, ctx, class_id)?;

        let exception = self.alloc_object(ctx, class_id, false)?;

        if let Some(text) = built.message {
            ctx.stack.push_root(exception);
            let string = self.create_string(ctx, &text);
            ctx.stack.pop_root();
            let string = string?;

            if let Some(offset) = self.message_field_offset(class_id) {
                self.heap_shared().write_word_at(exception, offset, string as u64);
            }
        }

        Ok(exception)
    }

    fn message_field_offset(&self, class_id: ClassId) -> Option<i32> {
        let key = FieldKey {
            name: self.br.message_sym,
            desc: self.br.string_desc_sym,
        };
        let classes = self.classes_shared();
        let mut cur = Some(class_id);
        while let Some(id) = cur {
            let class = classes.get_ref(id);
            if let Some((_, field)) = class.fields().find(&key, false) {
                return Some(field.offset());
            }
            cur = class.parent();
        }
        None
    }

    /// Explicit collection request (`Runtime.gc`).
    pub fn gc_now(&self, ctx: &mut ThreadContext) {
        let guard = self.tm.lock(&ctx.handle);
        let mut heap = self.heap_mut();
        gc::collect(self, &mut heap);
        drop(heap);
        drop(guard);
    }

    pub fn register_java_thread(&self, obj: HeapRef, handle: Arc<ThreadHandle>) {
        self.java_threads.lock().insert(obj, handle);
    }

    pub fn drop_java_thread(&self, obj: HeapRef) {
        self.java_threads.lock().remove(&obj);
    }

    pub fn java_thread_of(&self, obj: HeapRef) -> Option<Arc<ThreadHandle>> {
        self.java_threads.lock().get(&obj).cloned()
    }

    /// Resolves the bootstrap classes and switches the string manager and
    /// the collector on.
    pub fn bootstrap(&self, ctx: &mut ThreadContext) -> Result<(), VmError> {
        debug!("bootstrapping the core classes");

        let object_id = self.resolve_class_name(ctx, None, self.br.java_lang_object_sym)?;
        self.br.set_java_lang_object_id(object_id);

        let class_id = self.resolve_class_name(ctx, None, self.br.java_lang_class_sym)?;
        self.br.set_java_lang_class_id(class_id);

        let string_id = self.resolve_class_name(ctx, None, self.br.java_lang_string_sym)?;
        self.br.set_java_lang_string_id(string_id);

        let thread_id = self.resolve_class_name(ctx, None, self.br.java_lang_thread_sym)?;
        self.br.set_java_lang_thread_id(thread_id);

        let throwable_id = self.resolve_class_name(ctx, None, self.br.java_lang_throwable_sym)?;
        self.br.set_java_lang_throwable_id(throwable_id);

        let char_array_id = self.resolve_class_name(ctx, None, self.br.char_array_sym)?;

        let layout = self.string_layout(string_id)?;
        self.jsm().set_classes(string_id, char_array_id, layout);

        self.heap_mut().set_collect_enabled(true);
        Ok(())
    }

    fn string_layout(&self, string_id: ClassId) -> Result<StringLayout, VmError> {
        let classes = self.classes_shared();
        let class = classes.get_ref(string_id);

        let offset_of = |name: &str, desc: &str| -> Result<i32, VmError> {
            let key = FieldKey {
                name: self.names.intern_str(name),
                desc: self.names.intern_str(desc),
            };
            class
                .fields()
                .find(&key, false)
                .map(|(_, field)| field.offset())
                .ok_or_else(|| {
                    VmError::VirtualMachine(format!(
                        "java.lang.String is missing the {} field",
                        name
                    ))
                })
        };

        Ok(StringLayout {
            value_off: offset_of("value", "[C")?,
            offset_off: offset_of("offset", "I")?,
            count_off: offset_of("count", "I")?,
            hash_off: offset_of("cachedHashCode", "I")?,
        })
    }
}

/// Boots a VM and runs the main class. Returns the process exit status.
pub fn start_with_image(config: VmConfig, image: MemoryImage) -> Result<i32, VmError> {
    let main_class_name = slashify(&config.main_class);
    let stack_size = config.stack_size;
    let program_args = config.args.clone();

    let vm = Arc::new(VirtualMachine::new(config, image)?);
    VirtualMachine::install_self(&vm);

    let handle = vm.tm.adopt_current_thread();
    let mut ctx = ThreadContext::new(handle.clone(), stack_size);
    vm.tm.register(&handle);

    vm.bootstrap(&mut ctx)?;
    spawn_finalizer(&vm);

    let result = run_main(&vm, &mut ctx, &main_class_name, &program_args);

    // Let the remaining user threads finish; the finalizer does not count.
    while vm.tm.active_count() > 2 {
        std::thread::sleep(std::time::Duration::from_millis(1));
    }

    vm.tm.unregister(&handle);

    match result {
        Ok(code) => Ok(code),
        Err(VmError::Exit(code)) => Ok(code),
        Err(err) => Err(err),
    }
}

fn run_main(
    vm: &Arc<VirtualMachine>,
    ctx: &mut ThreadContext,
    main_class_name: &str,
    program_args: &[String],
) -> Result<i32, VmError> {
    let main_sym = vm.names().intern_str(main_class_name);
    let main_class = vm.resolve_class_name(ctx, None, main_sym)?;

    let (main_index, is_static) = {
        let classes = vm.classes_shared();
        let class = classes.get_ref(main_class);
        match class.methods().find(&vm.br.main_key()) {
            Some((index, method)) => (index, method.is_static()),
            None => {
                return Err(VmError::VirtualMachine(format!(
                    "class {} has no main method",
                    main_class_name
                )));
            }
        }
    };
    if !is_static {
        return Err(VmError::VirtualMachine(
            "the main method is not static".to_string(),
        ));
    }

    // The first Java thread is built by hand rather than by Thread.start().
    let thread_obj = vm.alloc_object(ctx, vm.br.java_lang_thread_id()?, false)?;
    ctx.handle.set_obj(thread_obj);
    vm.register_java_thread(thread_obj, ctx.handle.clone());

    let args_array = build_args_array(vm, ctx, program_args)?;

    interpreter::ensure_initialized(vm, ctx, main_class)?;

    ctx.stack.push_ref(args_array)?;
    interpreter::run_entry(vm, ctx, MethodId::new(main_class, main_index))?;

    vm.drop_java_thread(thread_obj);

    let uncaught = ctx.handle.exception();
    if uncaught != 0 {
        report_uncaught(vm, uncaught);
        return Ok(1);
    }

    Ok(0)
}

fn build_args_array(
    vm: &Arc<VirtualMachine>,
    ctx: &mut ThreadContext,
    program_args: &[String],
) -> Result<HeapRef, VmError> {
    let array_class = vm.resolve_class_name(ctx, None, vm.br.string_array_sym)?;
    let array = vm.alloc_array_ref(ctx, array_class, program_args.len() as u32)?;

    ctx.stack.push_root(array);
    for (i, arg) in program_args.iter().enumerate() {
        let string = match vm.create_string(ctx, arg) {
            Ok(string) => string,
            Err(err) => {
                ctx.stack.pop_root();
                return Err(err);
            }
        };
        vm.heap_shared().ref_array_set(array, i as u32, string);
    }
    ctx.stack.pop_root();

    Ok(array)
}

fn report_uncaught(vm: &VirtualMachine, exception: HeapRef) {
    let class_id = vm.heap_shared().class_of(exception);
    let name = {
        let classes = vm.classes_shared();
        vm.names()
            .resolve(&classes.get_ref(class_id).name)
            .replace('/', ".")
    };

    let message = vm
        .message_field_offset(class_id)
        .map(|offset| vm.heap_shared().read_word_at(exception, offset) as HeapRef)
        .filter(|&s| s != 0)
        .map(|s| vm.rust_string_of(s));

    match message {
        Some(message) => eprintln!("Uncaught exception: {}: {}", name, message),
        None => eprintln!("Uncaught exception: {}", name),
    }
}

fn spawn_finalizer(vm: &Arc<VirtualMachine>) {
    let vm = vm.clone();
    let stack_size = vm.config.stack_size;

    std::thread::Builder::new()
        .name("finalizer".to_string())
        .spawn(move || {
            let handle = vm.tm.adopt_current_thread();
            let mut ctx = ThreadContext::new(handle.clone(), stack_size);
            vm.tm.register(&handle);

            loop {
                let obj = vm.tm.take_finalizable(&handle);
                if let Err(err) = finalize_one(&vm, &mut ctx, obj) {
                    // Exceptions in finalizers are swallowed.
                    error!("exception in finalizer: {}", err);
                    ctx.handle.clear_exception();
                }
            }
        })
        .expect("finalizer thread");
}

fn finalize_one(
    vm: &Arc<VirtualMachine>,
    ctx: &mut ThreadContext,
    obj: HeapRef,
) -> Result<(), VmError> {
    let class_id = vm.heap_shared().class_of(obj);

    let target = {
        let classes = vm.classes_shared();
        let mut cur = Some(class_id);
        let mut found = None;
        while let Some(id) = cur {
            let class = classes.get_ref(id);
            if let Some((index, method)) = class.methods().find(&vm.br.finalize_key()) {
                if !method.is_static() {
                    found = Some(MethodId::new(id, index));
                    break;
                }
            }
            cur = class.parent();
        }
        found
    };

    let Some(target) = target else {
        return Ok(());
    };

    ctx.stack.push_ref(obj)?;
    match interpreter::invoke_method(vm, ctx, target) {
        Ok(()) => Ok(()),
        Err(VmError::JavaExceptionThrown(_)) => Ok(()),
        Err(other) => Err(other),
    }
}

impl VirtualMachine {
    /// Sanity probe used by the tests: the class must expose a consistent
    /// layout once linked.
    pub fn instance_span(&self, class_id: ClassId) -> Option<usize> {
        let classes = self.classes_shared();
        let class = classes.get_ref(class_id);
        if class.state() >= ClassState::Linked {
            Some(class.ref_n() as usize * WORD + class.nref_size() as usize)
        } else {
            None
        }
    }

    /// Runtime.freeMemory.
    pub fn free_memory(&self) -> usize {
        self.heap_shared().free_memory()
    }

    /// Runtime.totalMemory.
    pub fn total_memory(&self) -> usize {
        self.heap_shared().total_memory()
    }

    /// `Class.forName` support: resolution failures are downgraded to a
    /// catchable `ClassNotFoundException`.
    pub fn class_for_name(
        &self,
        ctx: &mut ThreadContext,
        name: &str,
    ) -> Result<ClassId, VmError> {
        let internal = slashify(name);
        let sym = self.names.intern_str(&internal);
        match self.resolve_class_name(ctx, None, sym) {
            Ok(class_id) => Ok(class_id),
            Err(VmError::NoClassDefFound(_)) | Err(VmError::ClassNotFound(_)) => {
                throw_exception!(ClassNotFoundException, "{}", name)
            }
            Err(other) => Err(other),
        }
    }
}
