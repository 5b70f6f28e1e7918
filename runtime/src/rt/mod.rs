//! Runtime class model.
//!
//! Classes live in a grow-only table and are referenced by stable ids. A
//! table entry is created in the `Preloaded` state as soon as a name is
//! first resolved; everything derivation computes is published at once
//! through the `derived` cell. Static data and the `java.lang.Class` mirror
//! come later (initialization and first use respectively), so they have
//! their own cells.

use crate::classfile::flags::ClassFlags;
use crate::cpool::ConstantPool;
use crate::error::VmError;
use crate::heap::HeapRef;
use crate::keys::{ClassId, Symbol, ThreadId};
use crate::rt::field::FieldManager;
use crate::rt::method::MethodManager;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};

pub mod field;
pub mod method;

/// Class lifecycle. The state is monotonic except for the transition to
/// `Erroneous`, which is terminal.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, IntoPrimitive, TryFromPrimitive)]
pub enum ClassState {
    Dummy = 0,
    Preloaded = 1,
    Linking = 2,
    Linked = 3,
    Initializing = 4,
    Initialized = 5,
    Erroneous = 6,
}

/// Element type tag of `newarray`, with the encoding used in bytecode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ArrayType {
    Boolean = 4,
    Char = 5,
    Float = 6,
    Double = 7,
    Byte = 8,
    Short = 9,
    Int = 10,
    Long = 11,
}

impl ArrayType {
    /// Element size in bytes; boolean arrays are bit-packed and handled
    /// separately by the allocator.
    pub fn elem_size(self) -> usize {
        match self {
            ArrayType::Boolean | ArrayType::Byte => 1,
            ArrayType::Char | ArrayType::Short => 2,
            ArrayType::Float | ArrayType::Int => 4,
            ArrayType::Double | ArrayType::Long => 8,
        }
    }

    /// Internal name of the corresponding array class.
    pub const fn class_name(self) -> &'static str {
        match self {
            ArrayType::Boolean => "[Z",
            ArrayType::Char => "[C",
            ArrayType::Float => "[F",
            ArrayType::Double => "[D",
            ArrayType::Byte => "[B",
            ArrayType::Short => "[S",
            ArrayType::Int => "[I",
            ArrayType::Long => "[J",
        }
    }

    pub fn from_descriptor_char(c: u8) -> Option<Self> {
        match c {
            b'Z' => Some(ArrayType::Boolean),
            b'C' => Some(ArrayType::Char),
            b'F' => Some(ArrayType::Float),
            b'D' => Some(ArrayType::Double),
            b'B' => Some(ArrayType::Byte),
            b'S' => Some(ArrayType::Short),
            b'I' => Some(ArrayType::Int),
            b'J' => Some(ArrayType::Long),
            _ => None,
        }
    }
}

/// Element description of an array class.
#[derive(Debug, Clone, Copy)]
pub enum ArrayElement {
    Primitive(ArrayType),
    Reference(ClassId),
}

#[derive(Debug, Clone, Copy)]
pub struct ArrayInfo {
    pub dimensions: u8,
    pub element: ArrayElement,
}

/// Instance layout distilled by the field layout pass: number of reference
/// slots below the header and byte size of the scalar area past it.
#[derive(Debug, Clone, Copy, Default)]
pub struct InstanceLayout {
    pub ref_n: u32,
    pub nref_size: u32,
}

/// Interface dispatch table: a parallel pair of arrays sorted by the
/// process-wide interface-method selector so invokes can binary search.
#[derive(Debug, Default)]
pub struct ITable {
    pub selectors: Box<[u16]>,
    pub methods: Box<[crate::keys::MethodId]>,
}

impl ITable {
    pub fn lookup(&self, selector: u16) -> Option<crate::keys::MethodId> {
        self.selectors
            .binary_search(&selector)
            .ok()
            .map(|at| self.methods[at])
    }
}

/// Everything class derivation publishes in one shot.
pub struct Derived {
    pub access_flags: ClassFlags,
    pub parent: Option<ClassId>,
    pub array: Option<ArrayInfo>,
    pub has_finalizer: bool,
    /// Subclasses of `java.lang.ref.Reference`; their referent word is
    /// special-cased by the collector.
    pub is_weakref: bool,
    pub cp: ConstantPool,
    pub layout: InstanceLayout,
    pub fields: FieldManager,
    pub methods: MethodManager,
    /// Flattened set of implemented interfaces, transitive ones included.
    pub interfaces: Box<[ClassId]>,
    /// Virtual dispatch table, inherited then extended.
    pub dtable: Box<[crate::keys::MethodId]>,
    pub itable: ITable,
}

/// A value slot in a class' static data array.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StaticValue {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Reference(HeapRef),
}

pub struct Class {
    pub id: ClassId,
    pub name: Symbol,
    state: AtomicU8,
    /// Thread currently running the initialization protocol, 0 when none.
    init_thread: AtomicU32,
    mirror: OnceCell<HeapRef>,
    static_data: OnceCell<Box<[RwLock<StaticValue>]>>,
    derived: OnceCell<Derived>,
}

impl Class {
    pub fn preloaded(id: ClassId, name: Symbol) -> Self {
        Self {
            id,
            name,
            state: AtomicU8::new(ClassState::Preloaded.into()),
            init_thread: AtomicU32::new(0),
            mirror: OnceCell::new(),
            static_data: OnceCell::new(),
            derived: OnceCell::new(),
        }
    }

    pub fn state(&self) -> ClassState {
        ClassState::try_from(self.state.load(Ordering::Acquire)).expect("valid class state")
    }

    /// Advances the state machine. States only move forward; `Erroneous` is
    /// terminal.
    pub fn set_state(&self, state: ClassState) {
        debug_assert!(self.state() != ClassState::Erroneous);
        debug_assert!(state == ClassState::Erroneous || state > self.state());
        self.state.store(state.into(), Ordering::Release);
    }

    pub fn is_linked(&self) -> bool {
        self.state() >= ClassState::Linked
    }

    pub fn is_initialized(&self) -> bool {
        self.state() == ClassState::Initialized
    }

    pub fn is_erroneous(&self) -> bool {
        self.state() == ClassState::Erroneous
    }

    pub fn set_init_thread(&self, thread: Option<ThreadId>) {
        self.init_thread.store(
            thread.map(|t| t.as_raw()).unwrap_or(0),
            Ordering::Release,
        );
    }

    pub fn init_thread(&self) -> Option<ThreadId> {
        ThreadId::from_raw(self.init_thread.load(Ordering::Acquire))
    }

    pub fn publish_derived(&self, derived: Derived) {
        if self.derived.set(derived).is_err() {
            unreachable!("class derived twice");
        }
    }

    pub fn derived(&self) -> &Derived {
        self.derived.get().expect("class is at least linked")
    }

    pub fn try_derived(&self) -> Option<&Derived> {
        self.derived.get()
    }

    pub fn flags(&self) -> ClassFlags {
        self.derived().access_flags
    }

    pub fn parent(&self) -> Option<ClassId> {
        self.derived().parent
    }

    pub fn is_interface(&self) -> bool {
        self.flags().is_interface()
    }

    pub fn is_array(&self) -> bool {
        self.derived().array.is_some()
    }

    pub fn array_info(&self) -> Option<&ArrayInfo> {
        self.derived().array.as_ref()
    }

    pub fn dimensions(&self) -> u8 {
        self.array_info().map(|info| info.dimensions).unwrap_or(0)
    }

    pub fn layout(&self) -> InstanceLayout {
        self.derived().layout
    }

    /// Number of reference slots, as scanned by the collector.
    pub fn ref_n(&self) -> u32 {
        self.derived().layout.ref_n
    }

    /// Byte size of the non-reference area.
    pub fn nref_size(&self) -> u32 {
        self.derived().layout.nref_size
    }

    pub fn cp(&self) -> &ConstantPool {
        &self.derived().cp
    }

    pub fn fields(&self) -> &FieldManager {
        &self.derived().fields
    }

    pub fn methods(&self) -> &MethodManager {
        &self.derived().methods
    }

    pub fn interfaces(&self) -> &[ClassId] {
        &self.derived().interfaces
    }

    pub fn dtable(&self) -> &[crate::keys::MethodId] {
        &self.derived().dtable
    }

    pub fn itable(&self) -> &ITable {
        &self.derived().itable
    }

    pub fn set_mirror(&self, mirror: HeapRef) {
        let _ = self.mirror.set(mirror);
    }

    pub fn mirror(&self) -> Option<HeapRef> {
        self.mirror.get().copied()
    }

    pub fn install_static_data(&self, data: Box<[RwLock<StaticValue>]>) {
        if self.static_data.set(data).is_err() {
            unreachable!("static data installed twice");
        }
    }

    pub fn static_data(&self) -> Option<&[RwLock<StaticValue>]> {
        self.static_data.get().map(|data| data.as_ref())
    }

    pub fn static_value(&self, slot: usize) -> StaticValue {
        *self.static_data().expect("class is initialized")[slot].read()
    }

    pub fn set_static_value(&self, slot: usize, value: StaticValue) {
        *self.static_data().expect("class is initialized")[slot].write() = value;
    }

    /// Package prefix of the internal name, i.e. everything before the last
    /// `/`.
    pub fn package_of(name: &str) -> &str {
        name.rfind('/').map(|at| &name[..at]).unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_orders_states() {
        assert!(ClassState::Preloaded < ClassState::Linking);
        assert!(ClassState::Linking < ClassState::Linked);
        assert!(ClassState::Linked < ClassState::Initializing);
        assert!(ClassState::Initializing < ClassState::Initialized);
    }

    #[test]
    fn package_is_the_prefix_before_the_last_slash() {
        assert_eq!(Class::package_of("java/lang/Object"), "java/lang");
        assert_eq!(Class::package_of("Main"), "");
        assert_eq!(Class::package_of("a/b/C$D"), "a/b");
    }

    #[test]
    fn array_type_names_match_descriptors() {
        for atype in [
            ArrayType::Boolean,
            ArrayType::Char,
            ArrayType::Float,
            ArrayType::Double,
            ArrayType::Byte,
            ArrayType::Short,
            ArrayType::Int,
            ArrayType::Long,
        ] {
            let name = atype.class_name().as_bytes();
            assert_eq!(name[0], b'[');
            assert_eq!(ArrayType::from_descriptor_char(name[1]), Some(atype));
        }
    }
}
