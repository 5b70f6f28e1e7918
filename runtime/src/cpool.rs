//! Runtime constant pool.
//!
//! Each entry is a tag byte plus one payload word. Resolution rewrites an
//! entry in place with its resolved tag variant and a direct id payload;
//! the state only ever advances. The payload is stored before the tag so a
//! lock-free reader observes either the symbolic or the resolved form,
//! never a mixed one. Entry 0 points back at the owning class.

use crate::classfile::RawConstant;
use crate::error::VmError;
use crate::heap::HeapRef;
use crate::keys::{ClassId, FieldId, FieldKey, MethodId, MethodKey, Symbol};
use lasso::Key;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum PoolTag {
    Unused = 0,
    Utf8,
    Integer,
    Float,
    Long,
    Double,
    Class,
    Str,
    Fieldref,
    Methodref,
    InterfaceMethodref,
    NameAndType,
    ResolvedClass,
    ResolvedString,
    ResolvedFieldref,
    ResolvedMethodref,
    ResolvedInterfaceMethodref,
}

/// A class entry before or after resolution.
#[derive(Debug, Clone, Copy)]
pub enum ClassEntry {
    Symbolic(Symbol),
    Resolved(ClassId),
}

#[derive(Debug, Clone, Copy)]
pub enum StringEntry {
    Symbolic(Symbol),
    Resolved(HeapRef),
}

#[derive(Debug, Clone, Copy)]
pub enum FieldrefEntry {
    Symbolic { class_idx: u16, key: FieldKey },
    Resolved(FieldId),
}

#[derive(Debug, Clone, Copy)]
pub enum MethodrefEntry {
    Symbolic { class_idx: u16, key: MethodKey },
    Resolved(MethodId),
}

struct PoolEntry {
    tag: AtomicU8,
    value: AtomicU64,
}

impl PoolEntry {
    fn new(tag: PoolTag, value: u64) -> Self {
        Self {
            tag: AtomicU8::new(tag.into()),
            value: AtomicU64::new(value),
        }
    }
}

pub struct ConstantPool {
    entries: Box<[PoolEntry]>,
}

fn symbol_to_word(sym: Symbol) -> u64 {
    sym.into_usize() as u64
}

fn word_to_symbol(word: u64) -> Symbol {
    Symbol::try_from_usize(word as usize).expect("interned symbol payload")
}

impl ConstantPool {
    pub fn new(constants: &[RawConstant]) -> Self {
        let entries = constants
            .iter()
            .map(|constant| match *constant {
                RawConstant::Unusable => PoolEntry::new(PoolTag::Unused, 0),
                RawConstant::Utf8(sym) => PoolEntry::new(PoolTag::Utf8, symbol_to_word(sym)),
                RawConstant::Integer(v) => PoolEntry::new(PoolTag::Integer, v as u32 as u64),
                RawConstant::Float(v) => PoolEntry::new(PoolTag::Float, v.to_bits() as u64),
                RawConstant::Long(v) => PoolEntry::new(PoolTag::Long, v as u64),
                RawConstant::Double(v) => PoolEntry::new(PoolTag::Double, v.to_bits()),
                RawConstant::Class { name_idx } => {
                    PoolEntry::new(PoolTag::Class, name_idx as u64)
                }
                RawConstant::Str { utf8_idx } => PoolEntry::new(PoolTag::Str, utf8_idx as u64),
                RawConstant::Fieldref { class_idx, nat_idx } => PoolEntry::new(
                    PoolTag::Fieldref,
                    ((class_idx as u64) << 16) | nat_idx as u64,
                ),
                RawConstant::Methodref { class_idx, nat_idx } => PoolEntry::new(
                    PoolTag::Methodref,
                    ((class_idx as u64) << 16) | nat_idx as u64,
                ),
                RawConstant::InterfaceMethodref { class_idx, nat_idx } => PoolEntry::new(
                    PoolTag::InterfaceMethodref,
                    ((class_idx as u64) << 16) | nat_idx as u64,
                ),
                RawConstant::NameAndType { name_idx, desc_idx } => PoolEntry::new(
                    PoolTag::NameAndType,
                    ((name_idx as u64) << 16) | desc_idx as u64,
                ),
            })
            .collect();

        Self { entries }
    }

    /// Single-entry pool shared by all array classes.
    pub fn dummy() -> Self {
        Self {
            entries: vec![PoolEntry::new(PoolTag::Unused, 0)].into_boxed_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry(&self, idx: u16) -> Result<&PoolEntry, VmError> {
        self.entries.get(idx as usize).ok_or_else(|| {
            VmError::NoClassDefFound(format!("invalid constant pool index {}", idx))
        })
    }

    fn mismatch(&self, idx: u16, expected: PoolTag, actual: PoolTag) -> VmError {
        VmError::NoClassDefFound(format!(
            "constant pool entry {} holds {:?}, expected {:?}",
            idx, actual, expected
        ))
    }

    pub fn tag(&self, idx: u16) -> Result<PoolTag, VmError> {
        let raw = self.entry(idx)?.tag.load(Ordering::Acquire);
        PoolTag::try_from(raw)
            .map_err(|_| VmError::VirtualMachine(format!("corrupted pool tag {}", raw)))
    }

    fn load(&self, idx: u16) -> Result<(PoolTag, u64), VmError> {
        let entry = self.entry(idx)?;
        let tag = PoolTag::try_from(entry.tag.load(Ordering::Acquire))
            .map_err(|raw| VmError::VirtualMachine(format!("corrupted pool tag {:?}", raw)))?;
        Ok((tag, entry.value.load(Ordering::Acquire)))
    }

    fn store(&self, idx: u16, tag: PoolTag, value: u64) {
        let entry = &self.entries[idx as usize];
        entry.value.store(value, Ordering::Release);
        entry.tag.store(tag.into(), Ordering::Release);
    }

    /// Installs the back pointer to the owning class in entry 0.
    pub fn set_owner(&self, owner: ClassId) {
        self.store(0, PoolTag::Unused, owner.as_raw() as u64);
    }

    pub fn owner(&self) -> ClassId {
        let raw = self.entries[0].value.load(Ordering::Acquire) as u32;
        ClassId::from_raw(raw).expect("constant pool owner installed at derivation")
    }

    pub fn get_utf8(&self, idx: u16) -> Result<Symbol, VmError> {
        match self.load(idx)? {
            (PoolTag::Utf8, word) => Ok(word_to_symbol(word)),
            (tag, _) => Err(self.mismatch(idx, PoolTag::Utf8, tag)),
        }
    }

    pub fn get_integer(&self, idx: u16) -> Result<i32, VmError> {
        match self.load(idx)? {
            (PoolTag::Integer, word) => Ok(word as u32 as i32),
            (tag, _) => Err(self.mismatch(idx, PoolTag::Integer, tag)),
        }
    }

    pub fn get_float(&self, idx: u16) -> Result<f32, VmError> {
        match self.load(idx)? {
            (PoolTag::Float, word) => Ok(f32::from_bits(word as u32)),
            (tag, _) => Err(self.mismatch(idx, PoolTag::Float, tag)),
        }
    }

    pub fn get_long(&self, idx: u16) -> Result<i64, VmError> {
        match self.load(idx)? {
            (PoolTag::Long, word) => Ok(word as i64),
            (tag, _) => Err(self.mismatch(idx, PoolTag::Long, tag)),
        }
    }

    pub fn get_double(&self, idx: u16) -> Result<f64, VmError> {
        match self.load(idx)? {
            (PoolTag::Double, word) => Ok(f64::from_bits(word)),
            (tag, _) => Err(self.mismatch(idx, PoolTag::Double, tag)),
        }
    }

    pub fn get_class_entry(&self, idx: u16) -> Result<ClassEntry, VmError> {
        match self.load(idx)? {
            (PoolTag::Class, word) => Ok(ClassEntry::Symbolic(self.get_utf8(word as u16)?)),
            (PoolTag::ResolvedClass, word) => Ok(ClassEntry::Resolved(
                ClassId::from_raw(word as u32).expect("resolved class payload"),
            )),
            (tag, _) => Err(self.mismatch(idx, PoolTag::Class, tag)),
        }
    }

    pub fn get_string_entry(&self, idx: u16) -> Result<StringEntry, VmError> {
        match self.load(idx)? {
            (PoolTag::Str, word) => Ok(StringEntry::Symbolic(self.get_utf8(word as u16)?)),
            (PoolTag::ResolvedString, word) => Ok(StringEntry::Resolved(word as HeapRef)),
            (tag, _) => Err(self.mismatch(idx, PoolTag::Str, tag)),
        }
    }

    fn get_nat(&self, idx: u16) -> Result<(Symbol, Symbol), VmError> {
        match self.load(idx)? {
            (PoolTag::NameAndType, word) => Ok((
                self.get_utf8((word >> 16) as u16)?,
                self.get_utf8((word & 0xffff) as u16)?,
            )),
            (tag, _) => Err(self.mismatch(idx, PoolTag::NameAndType, tag)),
        }
    }

    pub fn get_fieldref_entry(&self, idx: u16) -> Result<FieldrefEntry, VmError> {
        match self.load(idx)? {
            (PoolTag::Fieldref, word) => {
                let (name, desc) = self.get_nat((word & 0xffff) as u16)?;
                Ok(FieldrefEntry::Symbolic {
                    class_idx: (word >> 16) as u16,
                    key: FieldKey { name, desc },
                })
            }
            (PoolTag::ResolvedFieldref, word) => Ok(FieldrefEntry::Resolved(
                FieldId::unpack(word).expect("resolved fieldref payload"),
            )),
            (tag, _) => Err(self.mismatch(idx, PoolTag::Fieldref, tag)),
        }
    }

    pub fn get_methodref_entry(&self, idx: u16, interface: bool) -> Result<MethodrefEntry, VmError> {
        let (symbolic, resolved) = if interface {
            (PoolTag::InterfaceMethodref, PoolTag::ResolvedInterfaceMethodref)
        } else {
            (PoolTag::Methodref, PoolTag::ResolvedMethodref)
        };

        match self.load(idx)? {
            (tag, word) if tag == symbolic => {
                let (name, desc) = self.get_nat((word & 0xffff) as u16)?;
                Ok(MethodrefEntry::Symbolic {
                    class_idx: (word >> 16) as u16,
                    key: MethodKey { name, desc },
                })
            }
            (tag, word) if tag == resolved => Ok(MethodrefEntry::Resolved(
                MethodId::unpack(word).expect("resolved methodref payload"),
            )),
            (tag, _) => Err(self.mismatch(idx, symbolic, tag)),
        }
    }

    // Resolution rewrites. All run under the VM lock; the tag byte is
    // written last.

    pub fn resolve_class(&self, idx: u16, class: ClassId) {
        self.store(idx, PoolTag::ResolvedClass, class.as_raw() as u64);
    }

    pub fn resolve_string(&self, idx: u16, literal: HeapRef) {
        self.store(idx, PoolTag::ResolvedString, literal as u64);
    }

    pub fn resolve_field(&self, idx: u16, field: FieldId) {
        self.store(idx, PoolTag::ResolvedFieldref, field.pack());
    }

    pub fn resolve_method(&self, idx: u16, method: MethodId, interface: bool) {
        let tag = if interface {
            PoolTag::ResolvedInterfaceMethodref
        } else {
            PoolTag::ResolvedMethodref
        };
        self.store(idx, tag, method.pack());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utf8::Utf8Pool;

    fn pool_with(constants: Vec<RawConstant>) -> ConstantPool {
        ConstantPool::new(&constants)
    }

    #[test]
    fn eight_byte_constants_take_two_entries() {
        let cp = pool_with(vec![
            RawConstant::Unusable,
            RawConstant::Long(-2),
            RawConstant::Unusable,
            RawConstant::Integer(7),
        ]);
        assert_eq!(cp.get_long(1).unwrap(), -2);
        assert_eq!(cp.tag(2).unwrap(), PoolTag::Unused);
        assert_eq!(cp.get_integer(3).unwrap(), 7);
    }

    #[test]
    fn class_resolution_rewrites_in_place_once() {
        let pool = Utf8Pool::new();
        let name = pool.intern_str("java/lang/Object");
        let cp = pool_with(vec![
            RawConstant::Unusable,
            RawConstant::Utf8(name),
            RawConstant::Class { name_idx: 1 },
        ]);

        match cp.get_class_entry(2).unwrap() {
            ClassEntry::Symbolic(sym) => assert_eq!(sym, name),
            other => panic!("unexpected {:?}", other),
        }

        let id = ClassId::from_usize(3);
        cp.resolve_class(2, id);
        assert_eq!(cp.tag(2).unwrap(), PoolTag::ResolvedClass);
        match cp.get_class_entry(2).unwrap() {
            ClassEntry::Resolved(resolved) => assert_eq!(resolved, id),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn mismatched_tags_surface_as_pool_inconsistencies() {
        let cp = pool_with(vec![RawConstant::Unusable, RawConstant::Integer(1)]);
        assert!(matches!(
            cp.get_float(1),
            Err(VmError::NoClassDefFound(_))
        ));
    }
}
