//! Handlers for the instructions that touch the heap, the constant pool or
//! the dispatch tables.

use crate::cpool::{ClassEntry, FieldrefEntry, MethodrefEntry, PoolTag, StringEntry};
use crate::error::VmError;
use crate::heap::{ARRAY_DATA_OFFSET, HeapRef};
use crate::interpreter::{
    ThreadContext, array_index_check, elem_data_offset, invoke_method, null_check, ref_elem_check,
};
use crate::keys::{ClassId, MethodId};
use crate::native::{KniArgs, KniRet};
use crate::opcode::Opcode;
use crate::rt::method::{CodeBuffer, unpack_arguments, unpack_index};
use crate::rt::{ArrayElement, ArrayType, StaticValue};
use crate::throw_exception;
use crate::vm::VirtualMachine;

#[inline]
pub(super) fn handle_ldc(
    vm: &VirtualMachine,
    ctx: &mut ThreadContext,
    method_id: MethodId,
    idx: u16,
) -> Result<(), VmError> {
    let tag = {
        let classes = vm.classes_shared();
        classes.get_ref(method_id.class).cp().tag(idx)?
    };

    match tag {
        PoolTag::Integer => {
            let value = {
                let classes = vm.classes_shared();
                classes.get_ref(method_id.class).cp().get_integer(idx)?
            };
            ctx.stack.push_int(value)
        }
        PoolTag::Float => {
            let value = {
                let classes = vm.classes_shared();
                classes.get_ref(method_id.class).cp().get_float(idx)?
            };
            ctx.stack.push_float(value)
        }
        PoolTag::Str | PoolTag::ResolvedString => {
            let entry = {
                let classes = vm.classes_shared();
                classes.get_ref(method_id.class).cp().get_string_entry(idx)?
            };
            let literal = match entry {
                StringEntry::Resolved(literal) => literal,
                StringEntry::Symbolic(_) => vm.intern_string_constant(ctx, method_id.class, idx)?,
            };
            ctx.stack.push_ref(literal)
        }
        PoolTag::Class | PoolTag::ResolvedClass => {
            let entry = {
                let classes = vm.classes_shared();
                classes.get_ref(method_id.class).cp().get_class_entry(idx)?
            };
            let class_id = match entry {
                ClassEntry::Resolved(class_id) => class_id,
                ClassEntry::Symbolic(_) => vm.resolve_class_in(ctx, method_id.class, idx)?,
            };
            let mirror = vm.mirror_of(ctx, class_id)?;
            ctx.stack.push_ref(mirror)
        }
        other => Err(VmError::NoClassDefFound(format!(
            "LDC on a {:?} constant",
            other
        ))),
    }
}

#[inline]
pub(super) fn handle_ldc2(
    vm: &VirtualMachine,
    ctx: &mut ThreadContext,
    method_id: MethodId,
    idx: u16,
) -> Result<(), VmError> {
    let classes = vm.classes_shared();
    let cp = classes.get_ref(method_id.class).cp();
    match cp.tag(idx)? {
        PoolTag::Long => {
            let value = cp.get_long(idx)?;
            drop(classes);
            ctx.stack.push_long(value)
        }
        PoolTag::Double => {
            let value = cp.get_double(idx)?;
            drop(classes);
            ctx.stack.push_double(value)
        }
        other => Err(VmError::NoClassDefFound(format!(
            "LDC2_W on a {:?} constant",
            other
        ))),
    }
}

/// Element kind of the array an opcode operates on. `baload`/`bastore`
/// also serve boolean arrays, whose elements are bit-packed.
fn check_elem_kind(
    vm: &VirtualMachine,
    array: HeapRef,
    opcode: Opcode,
) -> Result<ArrayElement, VmError> {
    let class_id = vm.heap_shared().class_of(array);
    let classes = vm.classes_shared();
    let info = classes
        .get_ref(class_id)
        .derived()
        .array
        .ok_or_else(|| VmError::VirtualMachine("array opcode on a non-array".to_string()))?;

    let ok = match (opcode, info.element) {
        (Opcode::Aaload | Opcode::Aastore, ArrayElement::Reference(_)) => true,
        (
            Opcode::Baload | Opcode::Bastore,
            ArrayElement::Primitive(ArrayType::Byte | ArrayType::Boolean),
        ) => true,
        (Opcode::Caload | Opcode::Castore, ArrayElement::Primitive(ArrayType::Char)) => true,
        (Opcode::Saload | Opcode::Sastore, ArrayElement::Primitive(ArrayType::Short)) => true,
        (Opcode::Iaload | Opcode::Iastore, ArrayElement::Primitive(ArrayType::Int)) => true,
        (Opcode::Laload | Opcode::Lastore, ArrayElement::Primitive(ArrayType::Long)) => true,
        (Opcode::Faload | Opcode::Fastore, ArrayElement::Primitive(ArrayType::Float)) => true,
        (Opcode::Daload | Opcode::Dastore, ArrayElement::Primitive(ArrayType::Double)) => true,
        _ => false,
    };

    if !ok {
        return Err(VmError::VirtualMachine(
            "array opcode does not match the element type".to_string(),
        ));
    }
    Ok(info.element)
}

#[inline]
pub(super) fn handle_array_load(
    vm: &VirtualMachine,
    ctx: &mut ThreadContext,
    opcode: Opcode,
) -> Result<(), VmError> {
    let index = ctx.stack.pop_int();
    let array = null_check(ctx.stack.pop_ref())?;
    let element = check_elem_kind(vm, array, opcode)?;

    let heap = vm.heap_shared();
    let index = array_index_check(index, heap.array_length(array))?;

    match (opcode, element) {
        (Opcode::Aaload, _) => {
            let value = heap.ref_array_get(array, index);
            drop(heap);
            ctx.stack.push_ref(value)
        }
        (Opcode::Baload, ArrayElement::Primitive(ArrayType::Boolean)) => {
            let bit = heap.read_bit_at(array, (ARRAY_DATA_OFFSET * 8) as i32 + index as i32);
            drop(heap);
            ctx.stack.push_int(bit as i32)
        }
        (Opcode::Baload, _) => {
            let value = heap.read_i8_at(array, elem_data_offset(index, ArrayType::Byte));
            drop(heap);
            ctx.stack.push_int(value as i32)
        }
        (Opcode::Caload, _) => {
            let value = heap.read_u16_at(array, elem_data_offset(index, ArrayType::Char));
            drop(heap);
            ctx.stack.push_int(value as i32)
        }
        (Opcode::Saload, _) => {
            let value = heap.read_i16_at(array, elem_data_offset(index, ArrayType::Short));
            drop(heap);
            ctx.stack.push_int(value as i32)
        }
        (Opcode::Iaload, _) => {
            let value = heap.read_i32_at(array, elem_data_offset(index, ArrayType::Int));
            drop(heap);
            ctx.stack.push_int(value)
        }
        (Opcode::Faload, _) => {
            let value = heap.read_i32_at(array, elem_data_offset(index, ArrayType::Float));
            drop(heap);
            ctx.stack.push(value as u32 as u64)
        }
        (Opcode::Laload, _) => {
            let value = heap.read_i64_at(array, elem_data_offset(index, ArrayType::Long));
            drop(heap);
            ctx.stack.push_long(value)
        }
        (Opcode::Daload, _) => {
            let value = heap.read_word_at(array, elem_data_offset(index, ArrayType::Double));
            drop(heap);
            ctx.stack.push(value)?;
            ctx.stack.push(0)
        }
        _ => unreachable!(),
    }
}

#[inline]
pub(super) fn handle_array_store(
    vm: &VirtualMachine,
    ctx: &mut ThreadContext,
    opcode: Opcode,
) -> Result<(), VmError> {
    // Value first (it is on top), two slots for long and double.
    let value = match opcode {
        Opcode::Lastore | Opcode::Dastore => {
            ctx.stack.pop();
            ctx.stack.pop()
        }
        _ => ctx.stack.pop(),
    };
    let index = ctx.stack.pop_int();
    let array = null_check(ctx.stack.pop_ref())?;
    let element = check_elem_kind(vm, array, opcode)?;

    if opcode == Opcode::Aastore {
        ref_elem_check(vm, array, value as HeapRef)?;
    }

    let heap = vm.heap_shared();
    let index = array_index_check(index, heap.array_length(array))?;

    match (opcode, element) {
        (Opcode::Aastore, _) => heap.ref_array_set(array, index, value as HeapRef),
        (Opcode::Bastore, ArrayElement::Primitive(ArrayType::Boolean)) => heap.write_bit_at(
            array,
            (ARRAY_DATA_OFFSET * 8) as i32 + index as i32,
            value as u32 & 1 != 0,
        ),
        (Opcode::Bastore, _) => {
            heap.write_i8_at(array, elem_data_offset(index, ArrayType::Byte), value as i8)
        }
        (Opcode::Castore, _) => heap.write_u16_at(
            array,
            elem_data_offset(index, ArrayType::Char),
            value as u16,
        ),
        (Opcode::Sastore, _) => heap.write_u16_at(
            array,
            elem_data_offset(index, ArrayType::Short),
            value as u16,
        ),
        (Opcode::Iastore, _) | (Opcode::Fastore, _) => heap.write_i32_at(
            array,
            elem_data_offset(index, ArrayType::Int),
            value as u32 as i32,
        ),
        (Opcode::Lastore, _) | (Opcode::Dastore, _) => {
            heap.write_word_at(array, elem_data_offset(index, ArrayType::Long), value)
        }
        _ => unreachable!(),
    }

    Ok(())
}

fn resolved_field(
    vm: &VirtualMachine,
    method_id: MethodId,
    idx: u16,
) -> Result<crate::keys::FieldId, VmError> {
    let classes = vm.classes_shared();
    match classes.get_ref(method_id.class).cp().get_fieldref_entry(idx)? {
        FieldrefEntry::Resolved(field_id) => Ok(field_id),
        FieldrefEntry::Symbolic { .. } => Err(VmError::VirtualMachine(
            "typed field opcode with an unresolved pool entry".to_string(),
        )),
    }
}

#[inline]
pub(super) fn handle_getstatic(
    vm: &VirtualMachine,
    ctx: &mut ThreadContext,
    method_id: MethodId,
    idx: u16,
) -> Result<(), VmError> {
    let field_id = resolved_field(vm, method_id, idx)?;
    let value = {
        let classes = vm.classes_shared();
        let slot = classes.field_ref(field_id).offset() as usize;
        classes.get_ref(field_id.class).static_value(slot)
    };

    match value {
        StaticValue::Int(v) => ctx.stack.push_int(v),
        StaticValue::Float(v) => ctx.stack.push_float(v),
        StaticValue::Long(v) => ctx.stack.push_long(v),
        StaticValue::Double(v) => ctx.stack.push_double(v),
        StaticValue::Reference(v) => ctx.stack.push_ref(v),
    }
}

#[inline]
pub(super) fn handle_putstatic(
    vm: &VirtualMachine,
    ctx: &mut ThreadContext,
    method_id: MethodId,
    opcode: Opcode,
    idx: u16,
) -> Result<(), VmError> {
    let field_id = resolved_field(vm, method_id, idx)?;

    let value = match opcode {
        Opcode::PutstaticByte => StaticValue::Int(ctx.stack.pop_int() as i8 as i32),
        Opcode::PutstaticBool => StaticValue::Int((ctx.stack.pop_int() & 1 != 0) as i32),
        Opcode::PutstaticChar => StaticValue::Int(ctx.stack.pop_int() as u16 as i32),
        Opcode::PutstaticShort => StaticValue::Int(ctx.stack.pop_int() as i16 as i32),
        Opcode::PutstaticInt => StaticValue::Int(ctx.stack.pop_int()),
        Opcode::PutstaticFloat => StaticValue::Float(ctx.stack.pop_float()),
        Opcode::PutstaticLong => StaticValue::Long(ctx.stack.pop_long()),
        Opcode::PutstaticDouble => StaticValue::Double(ctx.stack.pop_double()),
        _ => StaticValue::Reference(ctx.stack.pop_ref()),
    };

    let classes = vm.classes_shared();
    let slot = classes.field_ref(field_id).offset() as usize;
    classes.get_ref(field_id.class).set_static_value(slot, value);
    Ok(())
}

#[inline]
pub(super) fn handle_getfield(
    vm: &VirtualMachine,
    ctx: &mut ThreadContext,
    opcode: Opcode,
    offset: i32,
) -> Result<(), VmError> {
    let obj = null_check(ctx.stack.pop_ref())?;
    let heap = vm.heap_shared();

    match opcode {
        Opcode::GetfieldByte => {
            let value = heap.read_i8_at(obj, offset) as i32;
            drop(heap);
            ctx.stack.push_int(value)
        }
        Opcode::GetfieldBool => {
            let value = heap.read_bit_at(obj, offset) as i32;
            drop(heap);
            ctx.stack.push_int(value)
        }
        Opcode::GetfieldChar => {
            let value = heap.read_u16_at(obj, offset) as i32;
            drop(heap);
            ctx.stack.push_int(value)
        }
        Opcode::GetfieldShort => {
            let value = heap.read_i16_at(obj, offset) as i32;
            drop(heap);
            ctx.stack.push_int(value)
        }
        Opcode::GetfieldInt | Opcode::GetfieldFloat => {
            let value = heap.read_i32_at(obj, offset);
            drop(heap);
            ctx.stack.push(value as u32 as u64)
        }
        Opcode::GetfieldLong | Opcode::GetfieldDouble => {
            let value = heap.read_word_at(obj, offset);
            drop(heap);
            ctx.stack.push(value)?;
            ctx.stack.push(0)
        }
        _ => {
            let value = heap.read_word_at(obj, offset) as HeapRef;
            drop(heap);
            ctx.stack.push_ref(value)
        }
    }
}

#[inline]
pub(super) fn handle_putfield(
    vm: &VirtualMachine,
    ctx: &mut ThreadContext,
    opcode: Opcode,
    offset: i32,
) -> Result<(), VmError> {
    let value = match opcode {
        Opcode::PutfieldLong | Opcode::PutfieldDouble => {
            ctx.stack.pop();
            ctx.stack.pop()
        }
        _ => ctx.stack.pop(),
    };
    let obj = null_check(ctx.stack.pop_ref())?;
    let heap = vm.heap_shared();

    match opcode {
        Opcode::PutfieldByte => heap.write_i8_at(obj, offset, value as i8),
        Opcode::PutfieldBool => heap.write_bit_at(obj, offset, value as u32 & 1 != 0),
        Opcode::PutfieldChar | Opcode::PutfieldShort => {
            heap.write_u16_at(obj, offset, value as u16)
        }
        Opcode::PutfieldInt | Opcode::PutfieldFloat => {
            heap.write_i32_at(obj, offset, value as u32 as i32)
        }
        Opcode::PutfieldLong | Opcode::PutfieldDouble => heap.write_word_at(obj, offset, value),
        _ => heap.write_word_at(obj, offset, value),
    }

    Ok(())
}

#[inline]
pub(super) fn handle_invokevirtual(
    vm: &VirtualMachine,
    ctx: &mut ThreadContext,
    packed: u16,
) -> Result<(), VmError> {
    let args = unpack_arguments(packed) as usize;
    let index = unpack_index(packed) as usize;

    let this = null_check(ctx.stack.peek(args - 1) as HeapRef)?;
    let class_id = vm.heap_shared().class_of(this);
    let target = vm.classes_shared().get_ref(class_id).dtable()[index];

    invoke_method(vm, ctx, target)
}

#[inline]
pub(super) fn handle_invokesuper(
    vm: &VirtualMachine,
    ctx: &mut ThreadContext,
    method_id: MethodId,
    packed: u16,
) -> Result<(), VmError> {
    let args = unpack_arguments(packed) as usize;
    let index = unpack_index(packed) as usize;

    null_check(ctx.stack.peek(args - 1) as HeapRef)?;

    let target = {
        let classes = vm.classes_shared();
        let parent = classes
            .get_ref(method_id.class)
            .parent()
            .expect("INVOKESUPER below java.lang.Object");
        classes.get_ref(parent).dtable()[index]
    };

    invoke_method(vm, ctx, target)
}

#[inline]
pub(super) fn handle_invokespecial(
    vm: &VirtualMachine,
    ctx: &mut ThreadContext,
    method_id: MethodId,
    idx: u16,
) -> Result<(), VmError> {
    let target = {
        let classes = vm.classes_shared();
        match classes
            .get_ref(method_id.class)
            .cp()
            .get_methodref_entry(idx, false)?
        {
            MethodrefEntry::Resolved(target) => target,
            MethodrefEntry::Symbolic { .. } => {
                return Err(VmError::VirtualMachine(
                    "INVOKESPECIAL with an unresolved pool entry".to_string(),
                ));
            }
        }
    };

    let args = vm.classes_shared().method_ref(target).args_size as usize;
    null_check(ctx.stack.peek(args - 1) as HeapRef)?;

    invoke_method(vm, ctx, target)
}

#[inline]
pub(super) fn handle_invokestatic(
    vm: &VirtualMachine,
    ctx: &mut ThreadContext,
    method_id: MethodId,
    idx: u16,
) -> Result<(), VmError> {
    let target = {
        let classes = vm.classes_shared();
        match classes
            .get_ref(method_id.class)
            .cp()
            .get_methodref_entry(idx, false)?
        {
            MethodrefEntry::Resolved(target) => target,
            MethodrefEntry::Symbolic { .. } => {
                return Err(VmError::VirtualMachine(
                    "INVOKESTATIC with an unresolved pool entry".to_string(),
                ));
            }
        }
    };

    invoke_method(vm, ctx, target)
}

#[inline]
pub(super) fn handle_invokeinterface(
    vm: &VirtualMachine,
    ctx: &mut ThreadContext,
    packed: u16,
) -> Result<(), VmError> {
    let args = unpack_arguments(packed) as usize;
    let selector = unpack_index(packed);

    let this = null_check(ctx.stack.peek(args - 1) as HeapRef)?;
    let class_id = vm.heap_shared().class_of(this);

    let target = {
        let classes = vm.classes_shared();
        let target = classes
            .get_ref(class_id)
            .itable()
            .lookup(selector)
            .ok_or_else(|| {
                VmError::VirtualMachine("interface method not implemented".to_string())
            })?;
        if classes.method_ref(target).is_abstract() {
            return Err(VmError::VirtualMachine(
                "abstract interface method invoked".to_string(),
            ));
        }
        target
    };

    invoke_method(vm, ctx, target)
}

/// The single native call site: looks up and calls the registered body,
/// passing the locals region as arguments. Synchronized natives hold their
/// monitor across the call.
#[inline]
pub(super) fn handle_invoke_native(
    vm: &VirtualMachine,
    ctx: &mut ThreadContext,
    method_id: MethodId,
) -> Result<KniRet, VmError> {
    let (native, args_size, is_synchronized, is_static) = {
        let classes = vm.classes_shared();
        let method = classes.method_ref(method_id);
        (
            method.native_fn().ok_or_else(|| {
                VmError::VirtualMachine("INVOKE_NATIVE on a non-native method".to_string())
            })?,
            method.args_size,
            method.is_synchronized(),
            method.is_static(),
        )
    };

    let locals = ctx.stack.cur_frame().locals;
    let args: KniArgs = (0..args_size)
        .map(|i| ctx.stack.local(locals, i))
        .collect();

    let sync_obj = if is_synchronized {
        let obj = if is_static {
            vm.mirror_of(ctx, method_id.class)?
        } else {
            null_check(args[0] as HeapRef)?
        };
        vm.tm.monitor_enter(&ctx.handle, obj);
        Some(obj)
    } else {
        None
    };

    let result = native(vm, ctx, &args);

    if let Some(obj) = sync_obj {
        vm.tm.monitor_exit(&ctx.handle, obj);
    }

    result
}

#[inline]
pub(super) fn handle_new(
    vm: &VirtualMachine,
    ctx: &mut ThreadContext,
    method_id: MethodId,
    idx: u16,
    finalizer: bool,
) -> Result<(), VmError> {
    let class_id = {
        let classes = vm.classes_shared();
        match classes.get_ref(method_id.class).cp().get_class_entry(idx)? {
            ClassEntry::Resolved(class_id) => class_id,
            ClassEntry::Symbolic(_) => {
                return Err(VmError::VirtualMachine(
                    "NEW with an unresolved pool entry".to_string(),
                ));
            }
        }
    };

    let obj = vm.alloc_object(ctx, class_id, finalizer)?;
    ctx.stack.push_ref(obj)
}

#[inline]
pub(super) fn handle_newarray(
    vm: &VirtualMachine,
    ctx: &mut ThreadContext,
    atype: u8,
) -> Result<(), VmError> {
    let atype = ArrayType::try_from(atype)
        .map_err(|_| VmError::VirtualMachine("malformed NEWARRAY type".to_string()))?;
    let count = ctx.stack.pop_int();
    if count < 0 {
        throw_exception!(NegativeArraySizeException, "{}", count)?;
    }

    let class_id = vm.primitive_array_class(ctx, atype)?;
    let array = vm.alloc_array_nonref(ctx, class_id, atype, count as u32)?;
    ctx.stack.push_ref(array)
}

#[inline]
pub(super) fn handle_anewarray(
    vm: &VirtualMachine,
    ctx: &mut ThreadContext,
    array_class_raw: u16,
) -> Result<(), VmError> {
    let class_id = ClassId::from_raw(array_class_raw as u32)
        .ok_or_else(|| VmError::VirtualMachine("malformed ANEWARRAY immediate".to_string()))?;
    let count = ctx.stack.pop_int();
    if count < 0 {
        throw_exception!(NegativeArraySizeException, "{}", count)?;
    }

    let array = vm.alloc_array_ref(ctx, class_id, count as u32)?;
    ctx.stack.push_ref(array)
}

#[inline]
pub(super) fn handle_multianewarray(
    vm: &VirtualMachine,
    ctx: &mut ThreadContext,
    method_id: MethodId,
    idx: u16,
    dims: u8,
) -> Result<(), VmError> {
    let class_id = {
        let entry = {
            let classes = vm.classes_shared();
            classes.get_ref(method_id.class).cp().get_class_entry(idx)?
        };
        match entry {
            ClassEntry::Resolved(class_id) => class_id,
            ClassEntry::Symbolic(_) => vm.resolve_class_in(ctx, method_id.class, idx)?,
        }
    };

    if vm.classes_shared().get_ref(class_id).dimensions() < dims {
        return Err(VmError::NoClassDefFound(
            "MULTIANEWARRAY specifies an erroneous number of dimensions".to_string(),
        ));
    }

    let mut counts = vec![0i32; dims as usize];
    for at in (0..dims as usize).rev() {
        counts[at] = ctx.stack.pop_int();
    }
    for &count in &counts {
        if count < 0 {
            throw_exception!(NegativeArraySizeException, "{}", count)?;
        }
    }

    let array = vm.alloc_multiarray(ctx, class_id, &counts)?;
    ctx.stack.push_ref(array)
}

#[inline]
pub(super) fn handle_checkcast(
    vm: &VirtualMachine,
    ctx: &mut ThreadContext,
    method_id: MethodId,
    idx: u16,
) -> Result<(), VmError> {
    let obj = ctx.stack.peek(0) as HeapRef;
    if obj == 0 {
        return Ok(());
    }

    let target = resolve_class_operand(vm, ctx, method_id, idx)?;
    let source = vm.heap_shared().class_of(obj);

    if !vm.classes_shared().is_assignable(source, target) {
        throw_exception!(ClassCastException)?;
    }
    Ok(())
}

#[inline]
pub(super) fn handle_instanceof(
    vm: &VirtualMachine,
    ctx: &mut ThreadContext,
    method_id: MethodId,
    idx: u16,
) -> Result<(), VmError> {
    let obj = ctx.stack.pop_ref();
    if obj == 0 {
        return ctx.stack.push_int(0);
    }

    let target = resolve_class_operand(vm, ctx, method_id, idx)?;
    let source = vm.heap_shared().class_of(obj);
    let result = vm.classes_shared().is_assignable(source, target);
    ctx.stack.push_int(result as i32)
}

fn resolve_class_operand(
    vm: &VirtualMachine,
    ctx: &mut ThreadContext,
    method_id: MethodId,
    idx: u16,
) -> Result<ClassId, VmError> {
    let entry = {
        let classes = vm.classes_shared();
        classes.get_ref(method_id.class).cp().get_class_entry(idx)?
    };
    match entry {
        ClassEntry::Resolved(class_id) => Ok(class_id),
        ClassEntry::Symbolic(_) => vm.resolve_class_in(ctx, method_id.class, idx),
    }
}

#[inline]
pub(super) fn handle_tableswitch(
    ctx: &mut ThreadContext,
    buffer: &CodeBuffer,
    pc: usize,
) -> Result<usize, VmError> {
    let base = (pc + 4) & !3;
    let default = buffer.get_i32(base);
    let low = buffer.get_i32(base + 4);
    let high = buffer.get_i32(base + 8);

    let key = ctx.stack.pop_int();
    let offset = if key < low || key > high {
        default
    } else {
        buffer.get_i32(base + 12 + (key - low) as usize * 4)
    };

    Ok((pc as isize + offset as isize) as usize)
}

#[inline]
pub(super) fn handle_lookupswitch(
    ctx: &mut ThreadContext,
    buffer: &CodeBuffer,
    pc: usize,
) -> Result<usize, VmError> {
    let base = (pc + 4) & !3;
    let default = buffer.get_i32(base);
    let npairs = buffer.get_i32(base + 4);

    let key = ctx.stack.pop_int();
    let mut offset = default;

    for at in 0..npairs as usize {
        let pair = base + 8 + at * 8;
        if buffer.get_i32(pair) == key {
            offset = buffer.get_i32(pair + 4);
            break;
        }
    }

    Ok((pc as isize + offset as isize) as usize)
}

/// `wide` prefixed loads, stores, `iinc` and `ret`. Returns the next pc.
#[inline]
pub(super) fn handle_wide(
    ctx: &mut ThreadContext,
    buffer: &CodeBuffer,
    pc: usize,
) -> Result<usize, VmError> {
    let locals = ctx.stack.cur_frame().locals;
    let sub = buffer.opcode(pc + 1);
    let index = buffer.get_u16(pc + 2);

    match sub {
        Opcode::Iload | Opcode::Fload | Opcode::Aload => {
            let value = ctx.stack.local(locals, index);
            ctx.stack.push(value)?;
        }
        Opcode::Lload | Opcode::Dload => {
            let value = ctx.stack.local(locals, index);
            ctx.stack.push(value)?;
            ctx.stack.push(0)?;
        }
        Opcode::Istore | Opcode::Fstore | Opcode::Astore => {
            let value = ctx.stack.pop();
            ctx.stack.set_local(locals, index, value);
        }
        Opcode::Lstore | Opcode::Dstore => {
            ctx.stack.pop();
            let value = ctx.stack.pop();
            ctx.stack.set_local(locals, index, value);
        }
        Opcode::Iinc => {
            let delta = buffer.get_u16(pc + 4) as i16 as i32;
            let value = ctx.stack.local(locals, index) as u32 as i32;
            ctx.stack
                .set_local(locals, index, value.wrapping_add(delta) as u32 as u64);
            return Ok(pc + 6);
        }
        Opcode::Ret => {
            return Ok(ctx.stack.local(locals, index) as usize);
        }
        other => {
            return Err(VmError::VirtualMachine(format!(
                "malformed wide prefix on {:?}",
                other
            )));
        }
    }

    Ok(pc + 4)
}
