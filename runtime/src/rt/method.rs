//! Per-class method directory, code buffers and the packed method index.

use crate::classfile::RawCode;
use crate::classfile::flags::MethodFlags;
use crate::error::VmError;
use crate::keys::{ClassId, MethodKey, Symbol};
use crate::native::NativeFn;
use crate::opcode::Opcode;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

/// Bits of a packed method index used for the argument stack size.
pub const METHOD_ARGUMENTS_BITS: u16 = 4;
/// Maximum argument stack size of a method.
pub const METHOD_ARGUMENTS_MAX: u16 = 1 << METHOD_ARGUMENTS_BITS;
/// Bits used for the dispatch-table index.
pub const METHOD_INDEX_BITS: u16 = 12;
/// Maximum number of dispatch-table entries of a class.
pub const METHOD_INDEX_MAX: u16 = 1 << METHOD_INDEX_BITS;

/// Packs a dispatch-table index and an argument stack size into the 16-bit
/// immediate of a translated invoke. Only instance methods are packed, so
/// the argument size (which includes `this`) is biased by one: sizes 1 to
/// 16 are encodable.
pub fn create_packed_index(index: u16, args_size: u16) -> u16 {
    debug_assert!(index < METHOD_INDEX_MAX);
    debug_assert!((1..=METHOD_ARGUMENTS_MAX).contains(&args_size));
    (index << METHOD_ARGUMENTS_BITS) | (args_size - 1)
}

pub fn unpack_arguments(packed: u16) -> u16 {
    (packed & (METHOD_ARGUMENTS_MAX - 1)) + 1
}

pub fn unpack_index(packed: u16) -> u16 {
    packed >> METHOD_ARGUMENTS_BITS
}

/// Stack slots taken by the arguments of a descriptor, not counting `this`.
pub fn descriptor_arg_slots(desc: &str) -> Result<u16, VmError> {
    let bytes = desc.as_bytes();
    if bytes.first() != Some(&b'(') {
        return Err(VmError::NoClassDefFound(format!(
            "malformed method descriptor {:?}",
            desc
        )));
    }

    let malformed =
        || VmError::NoClassDefFound(format!("malformed method descriptor {:?}", desc));

    let mut slots = 0u16;
    let mut i = 1;

    loop {
        match *bytes.get(i).ok_or_else(malformed)? {
            b')' => return Ok(slots),
            b'J' | b'D' => {
                slots += 2;
                i += 1;
            }
            b'B' | b'Z' | b'C' | b'S' | b'I' | b'F' => {
                slots += 1;
                i += 1;
            }
            b'L' => {
                slots += 1;
                while *bytes.get(i).ok_or_else(malformed)? != b';' {
                    i += 1;
                }
                i += 1;
            }
            b'[' => {
                slots += 1;
                while *bytes.get(i).ok_or_else(malformed)? == b'[' {
                    i += 1;
                }
                if *bytes.get(i).ok_or_else(malformed)? == b'L' {
                    while *bytes.get(i).ok_or_else(malformed)? != b';' {
                        i += 1;
                    }
                }
                i += 1;
            }
            _ => return Err(malformed()),
        }
    }
}

/// Stack slots of the return value: 0, 1 or 2.
pub fn descriptor_return_slots(desc: &str) -> Result<u8, VmError> {
    let at = desc.rfind(')').ok_or_else(|| {
        VmError::NoClassDefFound(format!("malformed method descriptor {:?}", desc))
    })?;

    match desc.as_bytes().get(at + 1) {
        Some(b'V') => Ok(0),
        Some(b'J') | Some(b'D') => Ok(2),
        Some(_) => Ok(1),
        None => Err(VmError::NoClassDefFound(format!(
            "malformed method descriptor {:?}",
            desc
        ))),
    }
}

/// Mutable bytecode buffer. Rewrites store the immediate bytes first and the
/// opcode byte last, so a racing reader sees either the prelink or the
/// final form of an instruction.
pub struct CodeBuffer {
    bytes: Box<[AtomicU8]>,
}

impl CodeBuffer {
    pub fn from_bytes(src: &[u8]) -> Self {
        Self {
            bytes: src.iter().map(|&b| AtomicU8::new(b)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[inline]
    pub fn get(&self, pc: usize) -> u8 {
        self.bytes[pc].load(Ordering::Acquire)
    }

    pub fn opcode(&self, pc: usize) -> Opcode {
        Opcode::from(self.get(pc))
    }

    /// Writes an immediate byte; ordinary release store.
    pub fn set(&self, pc: usize, value: u8) {
        self.bytes[pc].store(value, Ordering::Release);
    }

    pub fn set_u16(&self, pc: usize, value: u16) {
        self.set(pc, (value >> 8) as u8);
        self.set(pc + 1, value as u8);
    }

    pub fn get_u16(&self, pc: usize) -> u16 {
        ((self.get(pc) as u16) << 8) | self.get(pc + 1) as u16
    }

    pub fn get_i32(&self, pc: usize) -> i32 {
        ((self.get(pc) as i32) << 24)
            | ((self.get(pc + 1) as i32) << 16)
            | ((self.get(pc + 2) as i32) << 8)
            | self.get(pc + 3) as i32
    }

    /// Publishes the final opcode byte of a rewritten instruction.
    pub fn set_opcode(&self, pc: usize, opcode: Opcode) {
        self.bytes[pc].store(opcode.into(), Ordering::Release);
    }

    /// Plain byte view for the translator, which runs before the buffer is
    /// shared.
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.iter().map(|b| b.load(Ordering::Acquire)).collect()
    }
}

/// One-byte trampoline executed in place of not-yet-linked methods.
pub static METHOD_LOAD_STUB: Lazy<Arc<LinkedCode>> = Lazy::new(|| {
    Arc::new(LinkedCode {
        code: CodeBuffer::from_bytes(&[Opcode::MethodLoad.into()]),
        handlers: Box::new([]),
    })
});

/// One-byte stub dispatching to the native table.
pub static NATIVE_STUB: Lazy<Arc<LinkedCode>> = Lazy::new(|| {
    Arc::new(LinkedCode {
        code: CodeBuffer::from_bytes(&[Opcode::InvokeNative.into()]),
        handlers: Box::new([]),
    })
});

/// Resolved exception handler. `catch_type` is `None` for the catch-all
/// entries emitted by `finally` blocks.
#[derive(Debug, Clone, Copy)]
pub struct ExceptionHandler {
    pub start_pc: u32,
    pub end_pc: u32,
    pub handler_pc: u32,
    pub catch_type: Option<ClassId>,
}

pub struct LinkedCode {
    pub code: CodeBuffer,
    pub handlers: Box<[ExceptionHandler]>,
}

/// Discriminated extra data of a method: the class-file location of its
/// `Code` attribute before linking, the translated buffer afterwards, a
/// function pointer for natives.
pub enum MethodCode {
    Unlinked(RawCode),
    Linked(Arc<LinkedCode>),
    Native(NativeFn),
    Abstract,
    /// A `<clinit>` whose buffer was released after the one-shot run.
    Purged,
}

pub struct Method {
    pub class: ClassId,
    pub name: Symbol,
    pub desc: Symbol,
    pub flags: MethodFlags,
    /// Stack slots of the arguments, `this` included for instance methods.
    pub args_size: u16,
    pub return_slots: u8,
    /// Dispatch-table index; 0 for static, private and init methods.
    pub index: u16,
    pub max_stack: u16,
    pub max_locals: u16,
    pub exception_table_length: u16,
    code: RwLock<MethodCode>,
}

impl Method {
    pub fn new(
        class: ClassId,
        name: Symbol,
        desc: Symbol,
        flags: MethodFlags,
        args_size: u16,
        return_slots: u8,
        code: MethodCode,
    ) -> Self {
        let (max_stack, max_locals, exception_table_length) = match &code {
            MethodCode::Unlinked(raw) => (raw.max_stack, raw.max_locals, raw.exception_table_length),
            _ => (0, 0, 0),
        };

        Self {
            class,
            name,
            desc,
            flags,
            args_size,
            return_slots,
            index: 0,
            max_stack,
            max_locals,
            exception_table_length,
            code: RwLock::new(code),
        }
    }

    pub fn key(&self) -> MethodKey {
        MethodKey {
            name: self.name,
            desc: self.desc,
        }
    }

    pub fn is_static(&self) -> bool {
        self.flags.is_static()
    }

    pub fn is_native(&self) -> bool {
        self.flags.is_native()
    }

    pub fn is_abstract(&self) -> bool {
        self.flags.is_abstract()
    }

    pub fn is_synchronized(&self) -> bool {
        self.flags.is_synchronized()
    }

    pub fn is_linked(&self) -> bool {
        matches!(&*self.code.read(), MethodCode::Linked(_) | MethodCode::Native(_))
    }

    /// The code to execute right now: the translated buffer when linked,
    /// otherwise the one-byte `MethodLoad`/`InvokeNative` trampoline.
    pub fn executable_code(&self) -> Arc<LinkedCode> {
        match &*self.code.read() {
            MethodCode::Linked(linked) => linked.clone(),
            MethodCode::Native(_) => NATIVE_STUB.clone(),
            _ => METHOD_LOAD_STUB.clone(),
        }
    }

    pub fn native_fn(&self) -> Option<NativeFn> {
        match &*self.code.read() {
            MethodCode::Native(native) => Some(*native),
            _ => None,
        }
    }

    pub fn unlinked_location(&self) -> Option<RawCode> {
        match &*self.code.read() {
            MethodCode::Unlinked(raw) => Some(*raw),
            _ => None,
        }
    }

    pub fn install_linked(&self, linked: LinkedCode) {
        *self.code.write() = MethodCode::Linked(Arc::new(linked));
    }

    pub fn install_native(&self, native: NativeFn) {
        *self.code.write() = MethodCode::Native(native);
    }

    /// Releases the code buffer of a class initializer once it has run.
    pub fn purge_code(&self) {
        *self.code.write() = MethodCode::Purged;
    }
}

/// The methods of one class, in declaration order.
pub struct MethodManager {
    methods: Box<[Method]>,
}

impl MethodManager {
    pub fn new(methods: Vec<Method>) -> Self {
        Self {
            methods: methods.into_boxed_slice(),
        }
    }

    pub fn empty() -> Self {
        Self {
            methods: Box::new([]),
        }
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub fn get(&self, index: u16) -> &Method {
        &self.methods[index as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Method> {
        self.methods.iter()
    }

    pub fn find(&self, key: &MethodKey) -> Option<(u16, &Method)> {
        self.methods
            .iter()
            .enumerate()
            .find(|(_, method)| method.name == key.name && method.desc == key.desc)
            .map(|(at, method)| (at as u16, method))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("()V", 0, 0)]
    #[case("(I)V", 1, 0)]
    #[case("(IJ)J", 3, 2)]
    #[case("(Ljava/lang/String;[[IDZ)Ljava/lang/Object;", 5, 1)]
    #[case("([Ljava/lang/String;)V", 1, 0)]
    #[case("(BCSIFJD)D", 9, 2)]
    fn descriptor_slot_accounting(
        #[case] desc: &str,
        #[case] args: u16,
        #[case] ret: u8,
    ) {
        assert_eq!(descriptor_arg_slots(desc).unwrap(), args);
        assert_eq!(descriptor_return_slots(desc).unwrap(), ret);
    }

    #[test]
    fn packed_index_round_trips() {
        let packed = create_packed_index(4095, 16);
        assert_eq!(unpack_index(packed), 4095);
        assert_eq!(unpack_arguments(packed), 16);

        let packed = create_packed_index(0, 1);
        assert_eq!(unpack_index(packed), 0);
        assert_eq!(unpack_arguments(packed), 1);
    }

    #[test]
    fn rewrites_publish_the_opcode_byte_last() {
        let buffer = CodeBuffer::from_bytes(&[
            Opcode::GetstaticPrelink.into(),
            0x00,
            0x07,
        ]);
        buffer.set_u16(1, 0x1234);
        buffer.set_opcode(0, Opcode::GetstaticReference);
        assert_eq!(buffer.opcode(0), Opcode::GetstaticReference);
        assert_eq!(buffer.get_u16(1), 0x1234);
    }
}
