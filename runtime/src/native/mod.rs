//! The KNI surface.
//!
//! Native method bodies are plain functions registered under their
//! (class internal name, method name, descriptor) triple and resolved at
//! class-link time. A native reads its parameters positionally from the
//! caller's locals region (passed in as raw slots, bit 0 being `this` for
//! instance methods), may throw by returning a Java exception error, and
//! returns through the width-typed `KniRet`.

use crate::error::VmError;
use crate::heap::HeapRef;
use crate::interpreter::ThreadContext;
use crate::interpreter::stack::JavaStack;
use crate::keys::{FullyQualifiedMethodKey, Symbol};
use crate::vm::VirtualMachine;
use dashmap::DashMap;
use lasso::ThreadedRodeo;
use smallvec::SmallVec;
use std::sync::Arc;

pub mod java_io;
pub mod java_lang;

/// The native method's view of its argument slots.
pub type KniArgs = SmallVec<[u64; 8]>;

/// Width-typed return value of a native body.
pub enum KniRet {
    Void,
    One(u64),
    Two(u64),
}

impl KniRet {
    pub fn int(value: i32) -> Self {
        KniRet::One(value as u32 as u64)
    }

    pub fn long(value: i64) -> Self {
        KniRet::Two(value as u64)
    }

    pub fn float(value: f32) -> Self {
        KniRet::One(value.to_bits() as u64)
    }

    pub fn double(value: f64) -> Self {
        KniRet::Two(value.to_bits())
    }

    pub fn reference(value: HeapRef) -> Self {
        KniRet::One(value as u64)
    }
}

pub type NativeFn = fn(&VirtualMachine, &mut ThreadContext, &KniArgs) -> Result<KniRet, VmError>;

// Positional parameter readers; long and double parameters take two
// consecutive slots with the value in the first.

pub fn int_arg(args: &KniArgs, at: usize) -> i32 {
    args[at] as u32 as i32
}

pub fn long_arg(args: &KniArgs, at: usize) -> i64 {
    args[at] as i64
}

pub fn float_arg(args: &KniArgs, at: usize) -> f32 {
    f32::from_bits(args[at] as u32)
}

pub fn double_arg(args: &KniArgs, at: usize) -> f64 {
    f64::from_bits(args[at])
}

pub fn ref_arg(args: &KniArgs, at: usize) -> HeapRef {
    args[at] as HeapRef
}

/// Handle scope: sugar over the temporary-root stack. Every reference a
/// native keeps across an allocation must live in a handle so the
/// collector sees it.
pub struct HandleScope<'s> {
    stack: &'s mut JavaStack,
    pushed: usize,
}

impl<'s> HandleScope<'s> {
    pub fn start(stack: &'s mut JavaStack) -> Self {
        Self { stack, pushed: 0 }
    }

    /// Declares a handle holding `reference`; returns its index in the
    /// scope.
    pub fn declare(&mut self, reference: HeapRef) -> usize {
        self.stack.push_root(reference);
        self.pushed += 1;
        self.pushed - 1
    }

    pub fn get(&self, handle: usize) -> HeapRef {
        let base = self.stack.roots().len() - self.pushed;
        self.stack.roots()[base + handle]
    }

    pub fn set(&mut self, handle: usize, reference: HeapRef) {
        let base = self.stack.roots.len() - self.pushed;
        self.stack.roots[base + handle] = reference;
    }

    pub fn stack(&mut self) -> &mut JavaStack {
        self.stack
    }
}

impl Drop for HandleScope<'_> {
    fn drop(&mut self) {
        for _ in 0..self.pushed {
            self.stack.pop_root();
        }
    }
}

pub struct NativeRegistry {
    map: DashMap<FullyQualifiedMethodKey, NativeFn>,
    pub string_interner: Arc<ThreadedRodeo>,
}

impl NativeRegistry {
    pub fn new(interner: &Arc<ThreadedRodeo>) -> Self {
        let registry = Self {
            map: DashMap::new(),
            string_interner: interner.clone(),
        };
        java_lang::register(&registry);
        java_io::register(&registry);
        registry
    }

    pub fn register(&self, key: FullyQualifiedMethodKey, body: NativeFn) {
        self.map.insert(key, body);
    }

    pub fn lookup(&self, key: &FullyQualifiedMethodKey) -> Option<NativeFn> {
        self.map.get(key).map(|entry| *entry.value())
    }

    pub fn lookup_by_names(&self, class: &str, name: Symbol, desc: Symbol) -> Option<NativeFn> {
        let class_sym = self.string_interner.get(class)?;
        self.lookup(&FullyQualifiedMethodKey::new(class_sym, name, desc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_scopes_balance_the_root_stack() {
        let mut stack = JavaStack::new(4096);
        stack.push_root(0x100);

        {
            let mut scope = HandleScope::start(&mut stack);
            let a = scope.declare(0x200);
            let b = scope.declare(0x300);
            assert_eq!(scope.get(a), 0x200);
            scope.set(b, 0x308);
            assert_eq!(scope.get(b), 0x308);
            assert_eq!(scope.stack().roots().len(), 3);
        }

        assert_eq!(stack.roots(), &[0x100]);
    }

    #[test]
    fn argument_readers_decode_slot_values() {
        let mut args = KniArgs::new();
        args.push((-7i32) as u32 as u64);
        args.push((-9i64) as u64);
        args.push(0); // second slot of the long
        args.push(2.5f32.to_bits() as u64);

        assert_eq!(int_arg(&args, 0), -7);
        assert_eq!(long_arg(&args, 1), -9);
        assert_eq!(float_arg(&args, 3), 2.5);
    }
}
