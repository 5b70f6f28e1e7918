//! The prelink bytecode rewriter.
//!
//! Methods are linked on first invocation: the bytecode and exception
//! handlers are loaded from the class file, synchronized-method entry/exit
//! opcodes are woven in, and the buffer is installed. The sixteen generic
//! opcodes sit at their canonical byte values, interpreted as `*Prelink`
//! forms; on first execution each site is rewritten under the VM lock into
//! its resolved, type-specialised internal form. The immediate bytes are
//! written before the opcode byte, and the opcode byte is re-checked after
//! taking the lock, so concurrent executions of the same site observe
//! either the prelink or the final form with consistent immediates.

use crate::classfile::RawCode;
use crate::error::VmError;
use crate::interpreter::{self, ThreadContext};
use crate::keys::MethodId;
use crate::opcode::{Opcode, standard_len};
use crate::rt::field::FieldKind;
use crate::rt::method::{CodeBuffer, ExceptionHandler, LinkedCode, create_packed_index};
use byteorder::{BigEndian, ByteOrder};
use std::sync::Arc;
use tracing_log::log::debug;

/// Bytes prepended to a synchronized method: the monitor-enter opcode plus
/// padding that keeps switch alignment intact.
const SYNC_PROLOGUE: usize = 4;

/// Loads, translates and installs the code of `method_id`. Runs under the
/// VM lock; a second caller finds the method already linked and returns.
pub fn link_method(
    vm: &crate::vm::VirtualMachine,
    ctx: &mut ThreadContext,
    method_id: MethodId,
) -> Result<(), VmError> {
    let guard = vm.tm.lock(&ctx.handle);

    let class = vm.classes_shared().get(method_id.class);
    let method = class.methods().get(method_id.index);

    let Some(raw) = method.unlinked_location() else {
        // Another thread linked it in the meantime.
        drop(guard);
        return Ok(());
    };

    let class_name = vm.names().resolve(&class.name).to_owned();
    let bytes = vm.classpath().read_class(&class_name)?;

    let code_start = raw.code_offset as usize;
    let code_end = code_start + raw.code_length as usize;
    if code_end > bytes.len() {
        return Err(VmError::NoClassDefFound(
            "class file is truncated".to_string(),
        ));
    }
    let code = &bytes[code_start..code_end];

    let handlers = load_exception_handlers(vm, ctx, method_id, &bytes, &raw)?;
    let linked = translate_bytecode(method.is_synchronized(), method.is_static(), code, handlers);

    debug!(
        "linked {}.{} ({} bytes)",
        class_name,
        vm.names().resolve(&method.name),
        raw.code_length
    );

    method.install_linked(linked);
    drop(guard);
    Ok(())
}

fn load_exception_handlers(
    vm: &crate::vm::VirtualMachine,
    ctx: &mut ThreadContext,
    method_id: MethodId,
    bytes: &[u8],
    raw: &RawCode,
) -> Result<Box<[ExceptionHandler]>, VmError> {
    let shift = {
        let class = vm.classes_shared().get(method_id.class);
        if class.methods().get(method_id.index).is_synchronized() {
            SYNC_PROLOGUE as u32
        } else {
            0
        }
    };

    let mut handlers = Vec::with_capacity(raw.exception_table_length as usize);
    let mut at = raw.exception_table_offset as usize;

    for _ in 0..raw.exception_table_length {
        if at + 8 > bytes.len() {
            return Err(VmError::NoClassDefFound(
                "class file is truncated".to_string(),
            ));
        }
        let start_pc = BigEndian::read_u16(&bytes[at..]) as u32;
        let end_pc = BigEndian::read_u16(&bytes[at + 2..]) as u32;
        let handler_pc = BigEndian::read_u16(&bytes[at + 4..]) as u32;
        let catch_idx = BigEndian::read_u16(&bytes[at + 6..]);
        at += 8;

        let catch_type = if catch_idx == 0 {
            None
        } else {
            Some(vm.resolve_class_in(ctx, method_id.class, catch_idx)?)
        };

        handlers.push(ExceptionHandler {
            start_pc: start_pc + shift,
            end_pc: end_pc + shift,
            handler_pc: handler_pc + shift,
            catch_type,
        });
    }

    Ok(handlers.into_boxed_slice())
}

/// Builds the executable buffer. Synchronized methods get a
/// `MonitorenterSpecial` prologue (padded to keep switch alignment) and
/// their terminal returns rewritten as `*Monitorexit` forms.
fn translate_bytecode(
    synchronized: bool,
    is_static: bool,
    code: &[u8],
    handlers: Box<[ExceptionHandler]>,
) -> LinkedCode {
    if !synchronized {
        return LinkedCode {
            code: CodeBuffer::from_bytes(code),
            handlers,
        };
    }

    let mut out = Vec::with_capacity(code.len() + SYNC_PROLOGUE);
    out.push(
        if is_static {
            Opcode::MonitorenterSpecialStatic
        } else {
            Opcode::MonitorenterSpecial
        }
        .into(),
    );
    out.extend_from_slice(&[Opcode::Nop.into(); SYNC_PROLOGUE - 1]);
    out.extend_from_slice(code);

    let mut pc = 0;
    while pc < code.len() {
        let replacement = match Opcode::from(code[pc]) {
            Opcode::Ireturn | Opcode::Freturn | Opcode::Areturn => {
                Some(Opcode::Return1Monitorexit)
            }
            Opcode::Lreturn | Opcode::Dreturn => Some(Opcode::Return2Monitorexit),
            Opcode::Return => Some(Opcode::ReturnMonitorexit),
            _ => None,
        };
        if let Some(opcode) = replacement {
            out[pc + SYNC_PROLOGUE] = opcode.into();
        }
        pc += standard_len(code, pc);
    }

    LinkedCode {
        code: CodeBuffer::from_bytes(&out),
        handlers,
    }
}

/// Turns a non-typed field prelink opcode into its typed version.
fn type_specific_opcode(opcode: Opcode, kind: FieldKind) -> Opcode {
    use FieldKind::*;
    use Opcode::*;

    match (opcode, kind) {
        (GetstaticPrelink, Byte) => GetstaticByte,
        (GetstaticPrelink, Bool) => GetstaticBool,
        (GetstaticPrelink, Char) => GetstaticChar,
        (GetstaticPrelink, Short) => GetstaticShort,
        (GetstaticPrelink, Int) => GetstaticInt,
        (GetstaticPrelink, Float) => GetstaticFloat,
        (GetstaticPrelink, Long) => GetstaticLong,
        (GetstaticPrelink, Double) => GetstaticDouble,
        (GetstaticPrelink, Reference) => GetstaticReference,
        (PutstaticPrelink, Byte) => PutstaticByte,
        (PutstaticPrelink, Bool) => PutstaticBool,
        (PutstaticPrelink, Char) => PutstaticChar,
        (PutstaticPrelink, Short) => PutstaticShort,
        (PutstaticPrelink, Int) => PutstaticInt,
        (PutstaticPrelink, Float) => PutstaticFloat,
        (PutstaticPrelink, Long) => PutstaticLong,
        (PutstaticPrelink, Double) => PutstaticDouble,
        (PutstaticPrelink, Reference) => PutstaticReference,
        (GetfieldPrelink, Byte) => GetfieldByte,
        (GetfieldPrelink, Bool) => GetfieldBool,
        (GetfieldPrelink, Char) => GetfieldChar,
        (GetfieldPrelink, Short) => GetfieldShort,
        (GetfieldPrelink, Int) => GetfieldInt,
        (GetfieldPrelink, Float) => GetfieldFloat,
        (GetfieldPrelink, Long) => GetfieldLong,
        (GetfieldPrelink, Double) => GetfieldDouble,
        (GetfieldPrelink, Reference) => GetfieldReference,
        (PutfieldPrelink, Byte) => PutfieldByte,
        (PutfieldPrelink, Bool) => PutfieldBool,
        (PutfieldPrelink, Char) => PutfieldChar,
        (PutfieldPrelink, Short) => PutfieldShort,
        (PutfieldPrelink, Int) => PutfieldInt,
        (PutfieldPrelink, Float) => PutfieldFloat,
        (PutfieldPrelink, Long) => PutfieldLong,
        (PutfieldPrelink, Double) => PutfieldDouble,
        (PutfieldPrelink, Reference) => PutfieldReference,
        _ => unreachable!("not a field prelink opcode"),
    }
}

/// Links a prelink site in place. The caller observed `opcode` at `pc`; if
/// another thread already rewrote the site the function returns without
/// touching it. All resolution runs under the VM lock; the opcode byte is
/// stored last.
pub fn link_opcode(
    vm: &crate::vm::VirtualMachine,
    ctx: &mut ThreadContext,
    method_id: MethodId,
    linked: &Arc<LinkedCode>,
    pc: usize,
    opcode: Opcode,
) -> Result<(), VmError> {
    let guard = vm.tm.lock(&ctx.handle);

    let code = &linked.code;
    if code.opcode(pc) != opcode {
        // Another thread has processed this site in the meantime.
        drop(guard);
        return Ok(());
    }

    let owner = method_id.class;
    let index = if opcode == Opcode::LdcPrelink {
        code.get(pc + 1) as u16
    } else {
        code.get_u16(pc + 1)
    };

    match opcode {
        Opcode::GetstaticPrelink | Opcode::PutstaticPrelink => {
            let field_id = vm.resolve_field_in(ctx, owner, index, true)?;
            interpreter::ensure_initialized(vm, ctx, field_id.class)?;
            let kind = vm.classes_shared().field_ref(field_id).kind;
            code.set_u16(pc + 1, index);
            code.set_opcode(pc, type_specific_opcode(opcode, kind));
        }
        Opcode::GetfieldPrelink | Opcode::PutfieldPrelink => {
            let field_id = vm.resolve_field_in(ctx, owner, index, false)?;
            let classes = vm.classes_shared();
            let field = classes.field_ref(field_id);
            let (kind, offset) = (field.kind, field.offset());
            drop(classes);
            code.set_u16(pc + 1, offset as i16 as u16);
            code.set_opcode(pc, type_specific_opcode(opcode, kind));
        }
        Opcode::InvokevirtualPrelink => {
            let target = vm.resolve_method_in(ctx, owner, index, false)?;
            let classes = vm.classes_shared();
            let method = classes.method_ref(target);
            if method.is_static() {
                return Err(VmError::VirtualMachine(
                    "INVOKEVIRTUAL invokes a static method".to_string(),
                ));
            }
            if vm.names().resolve(&method.name).starts_with('<') {
                return Err(VmError::VirtualMachine(
                    "INVOKEVIRTUAL invokes an instance or class initializer".to_string(),
                ));
            }
            let packed = create_packed_index(method.index, method.args_size);
            drop(classes);
            code.set_u16(pc + 1, packed);
            code.set_opcode(pc, Opcode::Invokevirtual);
        }
        Opcode::InvokespecialPrelink => {
            let target = vm.resolve_method_in(ctx, owner, index, false)?;
            let classes = vm.classes_shared();
            let method = classes.method_ref(target);
            if method.is_static() {
                return Err(VmError::VirtualMachine(
                    "INVOKESPECIAL invokes a static method".to_string(),
                ));
            }

            let is_init = vm.names().resolve(&method.name).starts_with('<');
            let target_class = target.class;
            let current = classes.get_ref(owner);
            let use_super = target_class != owner
                && current.flags().has_super_semantics()
                && !is_init
                && {
                    let mut cur = current.parent();
                    let mut found = false;
                    while let Some(id) = cur {
                        if id == target_class {
                            found = true;
                            break;
                        }
                        cur = classes.get_ref(id).parent();
                    }
                    found
                };

            if use_super {
                let packed = create_packed_index(method.index, method.args_size);
                drop(classes);
                code.set_u16(pc + 1, packed);
                code.set_opcode(pc, Opcode::Invokesuper);
            } else {
                // The resolved pool entry is read directly at dispatch, the
                // immediate stays the pool index.
                drop(classes);
                code.set_u16(pc + 1, index);
                code.set_opcode(pc, Opcode::Invokespecial);
            }
        }
        Opcode::InvokestaticPrelink => {
            let target = vm.resolve_method_in(ctx, owner, index, false)?;
            if !vm.classes_shared().method_ref(target).is_static() {
                return Err(VmError::VirtualMachine(
                    "INVOKESTATIC invokes a non-static method".to_string(),
                ));
            }
            interpreter::ensure_initialized(vm, ctx, target.class)?;
            code.set_u16(pc + 1, index);
            code.set_opcode(pc, Opcode::Invokestatic);
        }
        Opcode::InvokeinterfacePrelink => {
            let target = vm.resolve_method_in(ctx, owner, index, true)?;
            let classes = vm.classes_shared();
            let method = classes.method_ref(target);
            if method.is_static() {
                return Err(VmError::VirtualMachine(
                    "INVOKEINTERFACE invokes a static method".to_string(),
                ));
            }
            if vm.names().resolve(&method.name).starts_with('<') {
                return Err(VmError::VirtualMachine(
                    "INVOKEINTERFACE invokes an instance or class initializer".to_string(),
                ));
            }
            // The packed index carries the interface-method selector.
            let packed = create_packed_index(method.index, method.args_size);
            drop(classes);
            code.set_u16(pc + 1, packed);
            code.set_opcode(pc, Opcode::Invokeinterface);
        }
        Opcode::NewPrelink => {
            let class_id = vm.resolve_class_in(ctx, owner, index)?;
            interpreter::ensure_initialized(vm, ctx, class_id)?;
            let (is_abstract, has_finalizer) = {
                let classes = vm.classes_shared();
                let class = classes.get_ref(class_id);
                (
                    class.flags().is_abstract() || class.is_interface(),
                    class.derived().has_finalizer,
                )
            };
            if is_abstract {
                return Err(VmError::VirtualMachine(
                    "NEW tries to instantiate an abstract class".to_string(),
                ));
            }
            code.set_u16(pc + 1, index);
            code.set_opcode(
                pc,
                if has_finalizer {
                    Opcode::NewFinalizer
                } else {
                    Opcode::New
                },
            );
        }
        Opcode::AnewarrayPrelink => {
            // The symbolic element class is replaced by the synthesised
            // array class id.
            let elem = vm.resolve_class_in(ctx, owner, index)?;
            let array = {
                let ctx_l = vm.loader_ctx();
                vm.classes_mut().resolve_array_of(&ctx_l, owner, elem)?
            };
            if array.as_raw() > u16::MAX as u32 {
                return Err(VmError::VirtualMachine(
                    "array class id exceeds the immediate range".to_string(),
                ));
            }
            code.set_u16(pc + 1, array.as_raw() as u16);
            code.set_opcode(pc, Opcode::Anewarray);
        }
        Opcode::LdcPrelink | Opcode::LdcWPrelink => {
            match vm.classes_shared().get_ref(owner).cp().tag(index)? {
                crate::cpool::PoolTag::Class => {
                    vm.resolve_class_in(ctx, owner, index)?;
                }
                crate::cpool::PoolTag::Str => {
                    // First touch of a CONSTANT_String populates the
                    // literal table.
                    vm.intern_string_constant(ctx, owner, index)?;
                }
                _ => {}
            }
            if opcode == Opcode::LdcWPrelink {
                code.set_u16(pc + 1, index);
                code.set_opcode(pc, Opcode::LdcWRef);
            } else {
                code.set_opcode(pc, Opcode::LdcRef);
            }
        }
        _ => unreachable!("not a prelink opcode: {:?}", opcode),
    }

    drop(guard);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synchronized_prologue_preserves_switch_alignment() {
        // return-only body
        let code = vec![Opcode::Return.into()];
        let linked = translate_bytecode(true, false, &code, Box::new([]));
        assert_eq!(linked.code.opcode(0), Opcode::MonitorenterSpecial);
        assert_eq!(linked.code.opcode(1), Opcode::Nop);
        assert_eq!(linked.code.opcode(SYNC_PROLOGUE), Opcode::ReturnMonitorexit);
        assert_eq!(SYNC_PROLOGUE % 4, 0);
    }

    #[test]
    fn returns_inside_synchronized_methods_release_the_monitor() {
        let code = vec![
            Opcode::Iconst0.into(),
            Opcode::Ireturn.into(),
            Opcode::Lconst0.into(),
            Opcode::Lreturn.into(),
        ];
        let linked = translate_bytecode(true, true, &code, Box::new([]));
        assert_eq!(
            linked.code.opcode(0),
            Opcode::MonitorenterSpecialStatic
        );
        assert_eq!(
            linked.code.opcode(SYNC_PROLOGUE + 1),
            Opcode::Return1Monitorexit
        );
        assert_eq!(
            linked.code.opcode(SYNC_PROLOGUE + 3),
            Opcode::Return2Monitorexit
        );
    }

    #[test]
    fn plain_methods_keep_their_bytes() {
        let code = vec![Opcode::Iconst1.into(), Opcode::Ireturn.into()];
        let linked = translate_bytecode(false, false, &code, Box::new([]));
        assert_eq!(linked.code.snapshot(), code);
    }
}
