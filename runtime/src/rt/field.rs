//! Per-class field directory.

use crate::classfile::flags::FieldFlags;
use crate::error::VmError;
use crate::keys::{FieldKey, Symbol};
use std::sync::atomic::{AtomicI32, Ordering};

/// Width class of a field, derived from the first character of its
/// descriptor. Booleans are bit fields packed eight per byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Byte,
    Bool,
    Char,
    Short,
    Int,
    Float,
    Long,
    Double,
    Reference,
}

impl FieldKind {
    pub fn from_descriptor(desc: &str) -> Result<Self, VmError> {
        match desc.as_bytes().first() {
            Some(b'B') => Ok(FieldKind::Byte),
            Some(b'Z') => Ok(FieldKind::Bool),
            Some(b'C') => Ok(FieldKind::Char),
            Some(b'S') => Ok(FieldKind::Short),
            Some(b'I') => Ok(FieldKind::Int),
            Some(b'F') => Ok(FieldKind::Float),
            Some(b'J') => Ok(FieldKind::Long),
            Some(b'D') => Ok(FieldKind::Double),
            Some(b'L') | Some(b'[') => Ok(FieldKind::Reference),
            _ => Err(VmError::NoClassDefFound(format!(
                "malformed field descriptor {:?}",
                desc
            ))),
        }
    }
}

pub struct Field {
    pub name: Symbol,
    pub desc: Symbol,
    pub flags: FieldFlags,
    pub kind: FieldKind,
    /// Constant-pool index of the field's `ConstantValue`, if declared.
    pub constant_value: Option<u16>,
    /// For instance fields: byte offset from the header for scalars,
    /// negative byte offset into the reference slab for references, bit
    /// index for booleans. For static fields: index into the class' static
    /// data array, assigned when the class is initialized.
    offset: AtomicI32,
}

impl Field {
    pub fn new(
        name: Symbol,
        desc: Symbol,
        flags: FieldFlags,
        kind: FieldKind,
        constant_value: Option<u16>,
    ) -> Self {
        Self {
            name,
            desc,
            flags,
            kind,
            constant_value,
            offset: AtomicI32::new(0),
        }
    }

    pub fn offset(&self) -> i32 {
        self.offset.load(Ordering::Acquire)
    }

    pub fn set_offset(&self, offset: i32) {
        self.offset.store(offset, Ordering::Release);
    }

    pub fn is_static(&self) -> bool {
        self.flags.is_static()
    }

    pub fn key(&self) -> FieldKey {
        FieldKey {
            name: self.name,
            desc: self.desc,
        }
    }
}

/// The fields of one class, in declaration order.
pub struct FieldManager {
    fields: Box<[Field]>,
}

impl FieldManager {
    pub fn new(fields: Vec<Field>) -> Self {
        Self {
            fields: fields.into_boxed_slice(),
        }
    }

    pub fn empty() -> Self {
        Self {
            fields: Box::new([]),
        }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, index: u16) -> &Field {
        &self.fields[index as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter()
    }

    pub fn instance_iter(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(|field| !field.is_static())
    }

    pub fn static_iter(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(|field| field.is_static())
    }

    /// Finds a declared field by name, descriptor and staticness.
    pub fn find(&self, key: &FieldKey, is_static: bool) -> Option<(u16, &Field)> {
        self.fields
            .iter()
            .enumerate()
            .find(|(_, field)| {
                field.name == key.name && field.desc == key.desc && field.is_static() == is_static
            })
            .map(|(at, field)| (at as u16, field))
    }
}
