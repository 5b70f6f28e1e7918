//! Test support: a programmatic class-file builder and a miniature boot
//! classpath image, so no binary fixtures need to be checked in.
#![allow(dead_code)]

use jelatine_runtime::class_loader::MemoryImage;
use jelatine_runtime::interpreter::{self, ThreadContext};
use jelatine_runtime::keys::MethodId;
use jelatine_runtime::vm::VirtualMachine;
use jelatine_runtime::{VmConfig, VmError};
use std::collections::HashMap;
use std::sync::Arc;

// Class-file access flags used by the fixtures.
pub const ACC_PUBLIC: u16 = 0x0001;
pub const ACC_STATIC: u16 = 0x0008;
pub const ACC_FINAL: u16 = 0x0010;
pub const ACC_SUPER: u16 = 0x0020;
pub const ACC_SYNCHRONIZED: u16 = 0x0020;
pub const ACC_NATIVE: u16 = 0x0100;
pub const ACC_ABSTRACT: u16 = 0x0400;

enum CItem {
    Utf8(String),
    Class(u16),
    Str(u16),
    Int(i32),
    Long(i64),
    Fieldref(u16, u16),
    Methodref(u16, u16),
    InterfaceMethodref(u16, u16),
    NameAndType(u16, u16),
    /// Second slot of an 8-byte constant; serialized implicitly.
    Hole,
}

pub struct CodeSpec {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    /// (start_pc, end_pc, handler_pc, catch_type_index)
    pub handlers: Vec<(u16, u16, u16, u16)>,
}

struct FieldSpec {
    flags: u16,
    name_idx: u16,
    desc_idx: u16,
    constant_value: Option<u16>,
}

struct MethodSpec {
    flags: u16,
    name_idx: u16,
    desc_idx: u16,
    code: Option<CodeSpec>,
}

/// Emits standard class files, major version 49 unless overridden.
pub struct ClassBuilder {
    major: u16,
    access: u16,
    constants: Vec<CItem>,
    utf8_index: HashMap<String, u16>,
    class_index: HashMap<String, u16>,
    this_class: u16,
    super_class: u16,
    interfaces: Vec<u16>,
    fields: Vec<FieldSpec>,
    methods: Vec<MethodSpec>,
}

impl ClassBuilder {
    pub fn new(name: &str, super_name: Option<&str>) -> Self {
        let mut builder = Self {
            major: 49,
            access: ACC_PUBLIC | ACC_SUPER,
            constants: Vec::new(),
            utf8_index: HashMap::new(),
            class_index: HashMap::new(),
            this_class: 0,
            super_class: 0,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
        };
        builder.this_class = builder.class_const(name);
        builder.super_class = match super_name {
            Some(super_name) => builder.class_const(super_name),
            None => 0,
        };
        builder
    }

    pub fn access(mut self, access: u16) -> Self {
        self.access = access;
        self
    }

    pub fn major_version(mut self, major: u16) -> Self {
        self.major = major;
        self
    }

    fn push(&mut self, item: CItem) -> u16 {
        self.constants.push(item);
        self.constants.len() as u16
    }

    pub fn utf8(&mut self, text: &str) -> u16 {
        if let Some(&idx) = self.utf8_index.get(text) {
            return idx;
        }
        let idx = self.push(CItem::Utf8(text.to_string()));
        self.utf8_index.insert(text.to_string(), idx);
        idx
    }

    pub fn class_const(&mut self, name: &str) -> u16 {
        if let Some(&idx) = self.class_index.get(name) {
            return idx;
        }
        let name_idx = self.utf8(name);
        let idx = self.push(CItem::Class(name_idx));
        self.class_index.insert(name.to_string(), idx);
        idx
    }

    pub fn string_const(&mut self, text: &str) -> u16 {
        let utf8 = self.utf8(text);
        self.push(CItem::Str(utf8))
    }

    pub fn int_const(&mut self, value: i32) -> u16 {
        self.push(CItem::Int(value))
    }

    pub fn long_const(&mut self, value: i64) -> u16 {
        let idx = self.push(CItem::Long(value));
        self.push(CItem::Hole);
        idx
    }

    fn nat(&mut self, name: &str, desc: &str) -> u16 {
        let name_idx = self.utf8(name);
        let desc_idx = self.utf8(desc);
        self.push(CItem::NameAndType(name_idx, desc_idx))
    }

    pub fn fieldref(&mut self, class: &str, name: &str, desc: &str) -> u16 {
        let class_idx = self.class_const(class);
        let nat_idx = self.nat(name, desc);
        self.push(CItem::Fieldref(class_idx, nat_idx))
    }

    pub fn methodref(&mut self, class: &str, name: &str, desc: &str) -> u16 {
        let class_idx = self.class_const(class);
        let nat_idx = self.nat(name, desc);
        self.push(CItem::Methodref(class_idx, nat_idx))
    }

    pub fn interface_methodref(&mut self, class: &str, name: &str, desc: &str) -> u16 {
        let class_idx = self.class_const(class);
        let nat_idx = self.nat(name, desc);
        self.push(CItem::InterfaceMethodref(class_idx, nat_idx))
    }

    pub fn implements(mut self, name: &str) -> Self {
        let idx = self.class_const(name);
        self.interfaces.push(idx);
        self
    }

    pub fn field(mut self, flags: u16, name: &str, desc: &str) -> Self {
        let name_idx = self.utf8(name);
        let desc_idx = self.utf8(desc);
        self.fields.push(FieldSpec {
            flags,
            name_idx,
            desc_idx,
            constant_value: None,
        });
        self
    }

    pub fn const_field(mut self, flags: u16, name: &str, desc: &str, value_idx: u16) -> Self {
        let name_idx = self.utf8(name);
        let desc_idx = self.utf8(desc);
        self.fields.push(FieldSpec {
            flags,
            name_idx,
            desc_idx,
            constant_value: Some(value_idx),
        });
        self
    }

    pub fn method(mut self, flags: u16, name: &str, desc: &str, code: CodeSpec) -> Self {
        let name_idx = self.utf8(name);
        let desc_idx = self.utf8(desc);
        self.methods.push(MethodSpec {
            flags,
            name_idx,
            desc_idx,
            code: Some(code),
        });
        self
    }

    pub fn bodyless_method(mut self, flags: u16, name: &str, desc: &str) -> Self {
        let name_idx = self.utf8(name);
        let desc_idx = self.utf8(desc);
        self.methods.push(MethodSpec {
            flags,
            name_idx,
            desc_idx,
            code: None,
        });
        self
    }

    pub fn build(mut self) -> Vec<u8> {
        // Attribute names must be in the pool before serialization starts.
        let code_attr = self.utf8("Code");
        let cv_attr = if self.fields.iter().any(|f| f.constant_value.is_some()) {
            Some(self.utf8("ConstantValue"))
        } else {
            None
        };

        let mut out = Vec::with_capacity(512);
        out.extend_from_slice(&0xCAFEBABEu32.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes()); // minor
        out.extend_from_slice(&self.major.to_be_bytes());

        out.extend_from_slice(&((self.constants.len() + 1) as u16).to_be_bytes());
        for item in &self.constants {
            match item {
                CItem::Utf8(text) => {
                    out.push(1);
                    out.extend_from_slice(&(text.len() as u16).to_be_bytes());
                    out.extend_from_slice(text.as_bytes());
                }
                CItem::Int(value) => {
                    out.push(3);
                    out.extend_from_slice(&value.to_be_bytes());
                }
                CItem::Long(value) => {
                    out.push(5);
                    out.extend_from_slice(&value.to_be_bytes());
                }
                CItem::Class(name_idx) => {
                    out.push(7);
                    out.extend_from_slice(&name_idx.to_be_bytes());
                }
                CItem::Str(utf8_idx) => {
                    out.push(8);
                    out.extend_from_slice(&utf8_idx.to_be_bytes());
                }
                CItem::Fieldref(class_idx, nat_idx) => {
                    out.push(9);
                    out.extend_from_slice(&class_idx.to_be_bytes());
                    out.extend_from_slice(&nat_idx.to_be_bytes());
                }
                CItem::Methodref(class_idx, nat_idx) => {
                    out.push(10);
                    out.extend_from_slice(&class_idx.to_be_bytes());
                    out.extend_from_slice(&nat_idx.to_be_bytes());
                }
                CItem::InterfaceMethodref(class_idx, nat_idx) => {
                    out.push(11);
                    out.extend_from_slice(&class_idx.to_be_bytes());
                    out.extend_from_slice(&nat_idx.to_be_bytes());
                }
                CItem::NameAndType(name_idx, desc_idx) => {
                    out.push(12);
                    out.extend_from_slice(&name_idx.to_be_bytes());
                    out.extend_from_slice(&desc_idx.to_be_bytes());
                }
                CItem::Hole => {}
            }
        }

        out.extend_from_slice(&self.access.to_be_bytes());
        out.extend_from_slice(&self.this_class.to_be_bytes());
        out.extend_from_slice(&self.super_class.to_be_bytes());

        out.extend_from_slice(&(self.interfaces.len() as u16).to_be_bytes());
        for iface in &self.interfaces {
            out.extend_from_slice(&iface.to_be_bytes());
        }

        out.extend_from_slice(&(self.fields.len() as u16).to_be_bytes());
        for field in &self.fields {
            out.extend_from_slice(&field.flags.to_be_bytes());
            out.extend_from_slice(&field.name_idx.to_be_bytes());
            out.extend_from_slice(&field.desc_idx.to_be_bytes());
            match field.constant_value {
                Some(value_idx) => {
                    out.extend_from_slice(&1u16.to_be_bytes());
                    out.extend_from_slice(&cv_attr.unwrap().to_be_bytes());
                    out.extend_from_slice(&2u32.to_be_bytes());
                    out.extend_from_slice(&value_idx.to_be_bytes());
                }
                None => out.extend_from_slice(&0u16.to_be_bytes()),
            }
        }

        out.extend_from_slice(&(self.methods.len() as u16).to_be_bytes());
        for method in &self.methods {
            out.extend_from_slice(&method.flags.to_be_bytes());
            out.extend_from_slice(&method.name_idx.to_be_bytes());
            out.extend_from_slice(&method.desc_idx.to_be_bytes());
            match &method.code {
                Some(code) => {
                    out.extend_from_slice(&1u16.to_be_bytes());
                    out.extend_from_slice(&code_attr.to_be_bytes());
                    let length = 2 + 2 + 4 + code.code.len() + 2 + 8 * code.handlers.len() + 2;
                    out.extend_from_slice(&(length as u32).to_be_bytes());
                    out.extend_from_slice(&code.max_stack.to_be_bytes());
                    out.extend_from_slice(&code.max_locals.to_be_bytes());
                    out.extend_from_slice(&(code.code.len() as u32).to_be_bytes());
                    out.extend_from_slice(&code.code);
                    out.extend_from_slice(&(code.handlers.len() as u16).to_be_bytes());
                    for (start, end, handler, catch) in &code.handlers {
                        out.extend_from_slice(&start.to_be_bytes());
                        out.extend_from_slice(&end.to_be_bytes());
                        out.extend_from_slice(&handler.to_be_bytes());
                        out.extend_from_slice(&catch.to_be_bytes());
                    }
                    out.extend_from_slice(&0u16.to_be_bytes());
                }
                None => out.extend_from_slice(&0u16.to_be_bytes()),
            }
        }

        out.extend_from_slice(&0u16.to_be_bytes()); // class attributes
        out
    }
}

pub fn code(max_stack: u16, max_locals: u16, code: Vec<u8>) -> CodeSpec {
    CodeSpec {
        max_stack,
        max_locals,
        code,
        handlers: Vec::new(),
    }
}

pub fn code_with_handlers(
    max_stack: u16,
    max_locals: u16,
    code_bytes: Vec<u8>,
    handlers: Vec<(u16, u16, u16, u16)>,
) -> CodeSpec {
    CodeSpec {
        max_stack,
        max_locals,
        code: code_bytes,
        handlers,
    }
}

fn empty_class(name: &str, super_name: &str) -> (String, Vec<u8>) {
    (name.to_string(), ClassBuilder::new(name, Some(super_name)).build())
}

fn default_ctor() -> CodeSpec {
    // The boot constructors do nothing; real subclasses chain through
    // invokespecial themselves.
    code(1, 1, vec![0xb1]) // return
}

/// The smallest boot classpath the runtime accepts: the bootstrap classes,
/// the exception hierarchy the runtime raises from, and the console plumbing.
pub fn boot_image() -> MemoryImage {
    let mut image = MemoryImage::new();

    let object = ClassBuilder::new("java/lang/Object", None)
        .method(ACC_PUBLIC, "<init>", "()V", code(0, 1, vec![0xb1]))
        .build();
    image.add_class("java/lang/Object", object);

    let class = ClassBuilder::new("java/lang/Class", Some("java/lang/Object"))
        .bodyless_method(
            ACC_PUBLIC | ACC_NATIVE,
            "getName",
            "()Ljava/lang/String;",
        )
        .bodyless_method(ACC_PUBLIC | ACC_NATIVE, "isArray", "()Z")
        .bodyless_method(ACC_PUBLIC | ACC_NATIVE, "isInterface", "()Z")
        .bodyless_method(
            ACC_PUBLIC | ACC_STATIC | ACC_NATIVE,
            "forName",
            "(Ljava/lang/String;)Ljava/lang/Class;",
        )
        .bodyless_method(
            ACC_PUBLIC | ACC_NATIVE,
            "newInstance",
            "()Ljava/lang/Object;",
        )
        .build();
    image.add_class("java/lang/Class", class);

    let string = ClassBuilder::new("java/lang/String", Some("java/lang/Object"))
        .field(0, "value", "[C")
        .field(0, "offset", "I")
        .field(0, "count", "I")
        .field(0, "cachedHashCode", "I")
        .method(ACC_PUBLIC, "<init>", "()V", default_ctor())
        .bodyless_method(ACC_PUBLIC | ACC_NATIVE, "intern", "()Ljava/lang/String;")
        .build();
    image.add_class("java/lang/String", string);

    let thread = ClassBuilder::new("java/lang/Thread", Some("java/lang/Object"))
        .method(ACC_PUBLIC, "<init>", "()V", default_ctor())
        .method(ACC_PUBLIC, "run", "()V", code(0, 1, vec![0xb1]))
        .bodyless_method(ACC_PUBLIC | ACC_NATIVE, "start", "()V")
        .bodyless_method(ACC_PUBLIC | ACC_NATIVE, "join", "()V")
        .bodyless_method(ACC_PUBLIC | ACC_NATIVE, "interrupt", "()V")
        .bodyless_method(ACC_PUBLIC | ACC_NATIVE, "isAlive", "()Z")
        .bodyless_method(
            ACC_PUBLIC | ACC_STATIC | ACC_NATIVE,
            "currentThread",
            "()Ljava/lang/Thread;",
        )
        .bodyless_method(ACC_PUBLIC | ACC_STATIC | ACC_NATIVE, "sleep", "(J)V")
        .bodyless_method(ACC_PUBLIC | ACC_STATIC | ACC_NATIVE, "yield", "()V")
        .build();
    image.add_class("java/lang/Thread", thread);

    let throwable = ClassBuilder::new("java/lang/Throwable", Some("java/lang/Object"))
        .field(0, "message", "Ljava/lang/String;")
        .method(ACC_PUBLIC, "<init>", "()V", default_ctor())
        .build();
    image.add_class("java/lang/Throwable", throwable);

    for (name, super_name) in [
        ("java/lang/Error", "java/lang/Throwable"),
        ("java/lang/Exception", "java/lang/Throwable"),
        ("java/lang/RuntimeException", "java/lang/Exception"),
        ("java/lang/ArithmeticException", "java/lang/RuntimeException"),
        ("java/lang/NullPointerException", "java/lang/RuntimeException"),
        ("java/lang/ClassCastException", "java/lang/RuntimeException"),
        ("java/lang/ArrayStoreException", "java/lang/RuntimeException"),
        (
            "java/lang/IndexOutOfBoundsException",
            "java/lang/RuntimeException",
        ),
        (
            "java/lang/ArrayIndexOutOfBoundsException",
            "java/lang/IndexOutOfBoundsException",
        ),
        (
            "java/lang/NegativeArraySizeException",
            "java/lang/RuntimeException",
        ),
        (
            "java/lang/IllegalMonitorStateException",
            "java/lang/RuntimeException",
        ),
        (
            "java/lang/IllegalArgumentException",
            "java/lang/RuntimeException",
        ),
        ("java/lang/InterruptedException", "java/lang/Exception"),
        ("java/lang/ClassNotFoundException", "java/lang/Exception"),
        ("java/lang/InstantiationException", "java/lang/Exception"),
        ("java/lang/OutOfMemoryError", "java/lang/Error"),
        ("java/lang/VirtualMachineError", "java/lang/Error"),
        ("java/lang/NoClassDefFoundError", "java/lang/Error"),
        ("java/lang/UnsatisfiedLinkError", "java/lang/Error"),
    ] {
        let (entry, bytes) = empty_class(name, super_name);
        image.add_class(&entry, bytes);
    }

    let print_stream = ClassBuilder::new("java/io/PrintStream", Some("java/lang/Object"))
        .method(ACC_PUBLIC, "<init>", "()V", default_ctor())
        .bodyless_method(
            ACC_PUBLIC | ACC_NATIVE,
            "println",
            "(Ljava/lang/String;)V",
        )
        .bodyless_method(ACC_PUBLIC | ACC_NATIVE, "println", "(I)V")
        .bodyless_method(ACC_PUBLIC | ACC_NATIVE, "println", "()V")
        .bodyless_method(
            ACC_PUBLIC | ACC_NATIVE,
            "print",
            "(Ljava/lang/String;)V",
        )
        .bodyless_method(ACC_PUBLIC | ACC_NATIVE, "write", "(I)V")
        .build();
    image.add_class("java/io/PrintStream", print_stream);

    // System.<clinit> builds System.out: new PrintStream; dup;
    // invokespecial <init>; putstatic out; return.
    let mut system = ClassBuilder::new("java/lang/System", Some("java/lang/Object"));
    let ps_class = system.class_const("java/io/PrintStream");
    let ps_init = system.methodref("java/io/PrintStream", "<init>", "()V");
    let out_ref = system.fieldref("java/lang/System", "out", "Ljava/io/PrintStream;");
    let system = system
        .field(
            ACC_PUBLIC | ACC_STATIC | ACC_FINAL,
            "out",
            "Ljava/io/PrintStream;",
        )
        .method(
            ACC_STATIC,
            "<clinit>",
            "()V",
            code(
                2,
                0,
                vec![
                    0xbb,
                    (ps_class >> 8) as u8,
                    ps_class as u8, // new PrintStream
                    0x59, // dup
                    0xb7,
                    (ps_init >> 8) as u8,
                    ps_init as u8, // invokespecial <init>
                    0xb3,
                    (out_ref >> 8) as u8,
                    out_ref as u8, // putstatic out
                    0xb1, // return
                ],
            ),
        )
        .bodyless_method(
            ACC_PUBLIC | ACC_STATIC | ACC_NATIVE,
            "currentTimeMillis",
            "()J",
        )
        .bodyless_method(
            ACC_PUBLIC | ACC_STATIC | ACC_NATIVE,
            "arraycopy",
            "(Ljava/lang/Object;ILjava/lang/Object;II)V",
        )
        .build();
    image.add_class("java/lang/System", system);

    let reference = ClassBuilder::new("java/lang/ref/Reference", Some("java/lang/Object"))
        .field(0, "referent", "Ljava/lang/Object;")
        .method(ACC_PUBLIC, "<init>", "()V", default_ctor())
        .build();
    image.add_class("java/lang/ref/Reference", reference);

    let weak_reference =
        ClassBuilder::new("java/lang/ref/WeakReference", Some("java/lang/ref/Reference"))
            .method(ACC_PUBLIC, "<init>", "()V", default_ctor())
            .build();
    image.add_class("java/lang/ref/WeakReference", weak_reference);

    image
}

/// A booted machine plus the main thread's context, for tests that poke at
/// the internals rather than going through `start`.
pub struct TestVm {
    pub vm: Arc<VirtualMachine>,
    pub ctx: ThreadContext,
}

pub fn boot_vm(extra_classes: Vec<(String, Vec<u8>)>) -> TestVm {
    let mut image = boot_image();
    for (name, bytes) in extra_classes {
        image.add_class(&name, bytes);
    }

    let config = VmConfig {
        heap_size: 4 * 1024 * 1024,
        stack_size: 64 * 1024,
        ..VmConfig::default()
    };

    let vm = Arc::new(VirtualMachine::new(config, image).expect("vm boots"));
    VirtualMachine::install_self(&vm);

    let handle = vm.tm.adopt_current_thread();
    let mut ctx = ThreadContext::new(handle.clone(), 64 * 1024);
    vm.tm.register(&handle);
    vm.bootstrap(&mut ctx).expect("bootstrap classes load");

    TestVm { vm, ctx }
}

impl TestVm {
    pub fn class_id(&mut self, name: &str) -> jelatine_runtime::ClassId {
        let sym = self.vm.names().intern_str(name);
        self.vm
            .resolve_class_name(&mut self.ctx, None, sym)
            .expect("class resolves")
    }

    pub fn find_static(&mut self, class_name: &str, name: &str, desc: &str) -> MethodId {
        let class_id = self.class_id(class_name);
        let classes = self.vm.classes_shared();
        let key = jelatine_runtime::keys::MethodKey {
            name: self.vm.names().intern_str(name),
            desc: self.vm.names().intern_str(desc),
        };
        let (index, _) = classes
            .get_ref(class_id)
            .methods()
            .find(&key)
            .expect("method exists");
        MethodId::new(class_id, index)
    }

    /// Initializes the class and invokes a static method with no arguments.
    pub fn call_static(
        &mut self,
        class_name: &str,
        name: &str,
        desc: &str,
    ) -> Result<(), VmError> {
        let method = self.find_static(class_name, name, desc);
        interpreter::ensure_initialized(&self.vm, &mut self.ctx, method.class)?;
        interpreter::invoke_method(&self.vm, &mut self.ctx, method)
    }

    /// Like `call_static` for an `()I` method, returning the result.
    pub fn call_static_int(
        &mut self,
        class_name: &str,
        name: &str,
    ) -> Result<i32, VmError> {
        self.call_static(class_name, name, "()I")?;
        Ok(self.ctx.stack.pop_int())
    }
}
