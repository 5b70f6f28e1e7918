//! Bytecode execution.
//!
//! A thread context owns one contiguous slot stack; invocations alias the
//! caller's argument slots as the callee's first locals. The dispatch loop
//! runs the translated internal opcode family; a `*Prelink` opcode routes
//! through the rewriter and the site is re-executed in its linked form.
//! Exceptions travel as `VmError::JavaExceptionThrown`: each frame scans
//! its handler table, releases its monitor when synchronized and rethrows
//! to the caller, until the thread entry boundary parks the object in the
//! thread's exception slot.

use crate::error::VmError;
use crate::heap::{ARRAY_DATA_OFFSET, HeapRef};
use crate::interpreter::stack::{Frame, JavaStack};
use crate::keys::{ClassId, MethodId, MethodKey};
use crate::native::KniRet;
use crate::opcode::Opcode;
use crate::rt::method::{unpack_arguments, unpack_index};
use crate::rt::{ArrayElement, ArrayType, ClassState, StaticValue};
use crate::thread::ThreadHandle;
use crate::translator;
use crate::vm::VirtualMachine;
use crate::{build_exception, throw_exception};
use std::sync::Arc;
use tracing_log::log::error;

pub mod handlers;
pub mod stack;

use handlers::*;

/// Per-thread execution state: the VM handle plus the Java stack. The
/// stack is boxed so its address stays stable for the collector.
pub struct ThreadContext {
    pub handle: Arc<crate::thread::ThreadHandle>,
    pub stack: Box<JavaStack>,
}

impl ThreadContext {
    pub fn new(handle: Arc<ThreadHandle>, stack_bytes: usize) -> Self {
        let stack = Box::new(JavaStack::new(stack_bytes));
        handle.set_stack_ptr(&*stack);
        Self { handle, stack }
    }
}

/// Invokes `method_id` with its arguments already pushed on the stack.
/// On return the argument slots are gone and the return value (if any) has
/// been pushed.
pub fn invoke_method(
    vm: &VirtualMachine,
    ctx: &mut ThreadContext,
    method_id: MethodId,
) -> Result<(), VmError> {
    let (args_size, max_locals) = {
        let classes = vm.classes_shared();
        let method = classes.method_ref(method_id);
        (method.args_size, method.max_locals)
    };

    let locals = ctx.stack.sp() - args_size as usize;
    let frame_top = locals + (max_locals as usize).max(args_size as usize);
    while ctx.stack.sp() < frame_top {
        ctx.stack.push(0)?;
    }

    ctx.stack.push_frame(Frame {
        method: method_id,
        locals,
        saved_pc: 0,
        sync_obj: 0,
    })?;

    let result = interpret(vm, ctx, method_id);

    let frame = ctx.stack.pop_frame();
    ctx.stack.set_sp(frame.locals);

    match result {
        Ok(KniRet::Void) => Ok(()),
        Ok(KniRet::One(value)) => ctx.stack.push(value),
        Ok(KniRet::Two(value)) => {
            ctx.stack.push(value)?;
            ctx.stack.push(0)
        }
        Err(err) => Err(err),
    }
}

/// Runs a thread entry method and implements the halt boundary: an
/// exception escaping the outermost frame is parked in the thread's
/// exception slot for the bootstrapper to observe.
pub fn run_entry(
    vm: &VirtualMachine,
    ctx: &mut ThreadContext,
    method_id: MethodId,
) -> Result<(), VmError> {
    match invoke_method(vm, ctx, method_id) {
        Ok(()) => Ok(()),
        Err(VmError::JavaExceptionThrown(exception)) => {
            ctx.handle.set_exception(exception);
            Ok(())
        }
        Err(other) => Err(other),
    }
}

/// Turns a runtime-built Java exception into a heap object.
fn materialize(
    vm: &VirtualMachine,
    ctx: &mut ThreadContext,
    err: VmError,
) -> Result<HeapRef, VmError> {
    match err {
        VmError::JavaExceptionThrown(exception) => Ok(exception),
        VmError::JavaException(built) => vm.materialize_exception(ctx, built),
        other => Err(other),
    }
}

/// The dispatch loop of one frame. Assumes the frame has been pushed; the
/// caller tears it down.
fn interpret(
    vm: &VirtualMachine,
    ctx: &mut ThreadContext,
    method_id: MethodId,
) -> Result<KniRet, VmError> {
    let mut code = {
        let classes = vm.classes_shared();
        classes.method_ref(method_id).executable_code()
    };
    let mut pc = 0usize;

    loop {
        let result = step(vm, ctx, method_id, &code, &mut pc);

        match result {
            Ok(StepOutcome::Next) => {}
            Ok(StepOutcome::Return(ret)) => return Ok(ret),
            Ok(StepOutcome::Relink) => {
                // METHOD_LOAD trampoline: link and restart at the same pc.
                translator::link_method(vm, ctx, method_id)?;
                let relinked = {
                    let classes = vm.classes_shared();
                    classes.method_ref(method_id).executable_code()
                };
                if relinked.code.opcode(0) == Opcode::MethodLoad {
                    return Err(VmError::VirtualMachine(
                        "abstract method invoked".to_string(),
                    ));
                }
                code = relinked;
            }
            Err(err) => {
                let exception = match materialize(vm, ctx, err) {
                    Ok(exception) => exception,
                    Err(fatal) => return Err(fatal),
                };

                match find_handler(vm, ctx, &code, pc, exception)? {
                    Some(handler_pc) => pc = handler_pc,
                    None => {
                        let frame = *ctx.stack.cur_frame();
                        if frame.sync_obj != 0 {
                            vm.tm.monitor_exit(&ctx.handle, frame.sync_obj);
                        }
                        return Err(VmError::JavaExceptionThrown(exception));
                    }
                }
            }
        }
    }
}

/// Scans the current frame's handler table for the first entry covering
/// `pc` whose catch type is assignable from the thrown class. On a hit the
/// operand stack is discarded and the exception pushed.
fn find_handler(
    vm: &VirtualMachine,
    ctx: &mut ThreadContext,
    code: &Arc<crate::rt::method::LinkedCode>,
    pc: usize,
    exception: HeapRef,
) -> Result<Option<usize>, VmError> {
    let exception_class = {
        let heap = vm.heap_shared();
        heap.class_of(exception)
    };

    let frame = *ctx.stack.cur_frame();
    let max_locals = {
        let classes = vm.classes_shared();
        classes.method_ref(frame.method).max_locals
    };

    for handler in code.handlers.iter() {
        if (pc as u32) < handler.start_pc || (pc as u32) >= handler.end_pc {
            continue;
        }

        let matched = match handler.catch_type {
            None => true,
            Some(catch) => vm.classes_shared().is_assignable(exception_class, catch),
        };

        if matched {
            ctx.stack.set_sp(frame.locals + max_locals as usize);
            ctx.stack.push_ref(exception)?;
            return Ok(Some(handler.handler_pc as usize));
        }
    }

    Ok(None)
}

enum StepOutcome {
    Next,
    Return(KniRet),
    Relink,
}

/// Executes one instruction. `pc` is advanced in place; branch opcodes set
/// it directly.
fn step(
    vm: &VirtualMachine,
    ctx: &mut ThreadContext,
    method_id: MethodId,
    code: &Arc<crate::rt::method::LinkedCode>,
    pc: &mut usize,
) -> Result<StepOutcome, VmError> {
    use Opcode::*;

    let buffer = &code.code;
    let opcode = buffer.opcode(*pc);
    let locals = ctx.stack.cur_frame().locals;

    macro_rules! imm_u8 {
        () => {
            buffer.get(*pc + 1)
        };
    }
    macro_rules! imm_u16 {
        () => {
            buffer.get_u16(*pc + 1)
        };
    }
    macro_rules! branch16 {
        () => {{
            let off = imm_u16!() as i16 as isize;
            if off < 0 {
                vm.tm.safepoint(&ctx.handle);
            }
            *pc = (*pc as isize + off) as usize;
            return Ok(StepOutcome::Next);
        }};
    }

    match opcode {
        Nop => *pc += 1,

        // Constants.
        AconstNull => {
            ctx.stack.push_ref(0)?;
            *pc += 1;
        }
        IconstM1 | Iconst0 | Iconst1 | Iconst2 | Iconst3 | Iconst4 | Iconst5 => {
            ctx.stack.push_int(u8::from(opcode) as i32 - u8::from(Iconst0) as i32)?;
            *pc += 1;
        }
        Lconst0 => {
            ctx.stack.push_long(0)?;
            *pc += 1;
        }
        Lconst1 => {
            ctx.stack.push_long(1)?;
            *pc += 1;
        }
        Fconst0 => {
            ctx.stack.push_float(0.0)?;
            *pc += 1;
        }
        Fconst1 => {
            ctx.stack.push_float(1.0)?;
            *pc += 1;
        }
        Fconst2 => {
            ctx.stack.push_float(2.0)?;
            *pc += 1;
        }
        Dconst0 => {
            ctx.stack.push_double(0.0)?;
            *pc += 1;
        }
        Dconst1 => {
            ctx.stack.push_double(1.0)?;
            *pc += 1;
        }
        Bipush => {
            ctx.stack.push_int(imm_u8!() as i8 as i32)?;
            *pc += 2;
        }
        Sipush => {
            ctx.stack.push_int(imm_u16!() as i16 as i32)?;
            *pc += 3;
        }
        LdcRef => {
            handle_ldc(vm, ctx, method_id, imm_u8!() as u16)?;
            *pc += 2;
        }
        LdcWRef => {
            handle_ldc(vm, ctx, method_id, imm_u16!())?;
            *pc += 3;
        }
        Ldc2W => {
            handle_ldc2(vm, ctx, method_id, imm_u16!())?;
            *pc += 3;
        }

        // Loads and stores.
        Iload | Fload | Aload => {
            let value = ctx.stack.local(locals, imm_u8!() as u16);
            ctx.stack.push(value)?;
            *pc += 2;
        }
        Lload | Dload => {
            let value = ctx.stack.local(locals, imm_u8!() as u16);
            ctx.stack.push(value)?;
            ctx.stack.push(0)?;
            *pc += 2;
        }
        Iload0 | Iload1 | Iload2 | Iload3 => {
            let value = ctx.stack.local(locals, (u8::from(opcode) - u8::from(Iload0)) as u16);
            ctx.stack.push(value)?;
            *pc += 1;
        }
        Lload0 | Lload1 | Lload2 | Lload3 => {
            let value = ctx.stack.local(locals, (u8::from(opcode) - u8::from(Lload0)) as u16);
            ctx.stack.push(value)?;
            ctx.stack.push(0)?;
            *pc += 1;
        }
        Fload0 | Fload1 | Fload2 | Fload3 => {
            let value = ctx.stack.local(locals, (u8::from(opcode) - u8::from(Fload0)) as u16);
            ctx.stack.push(value)?;
            *pc += 1;
        }
        Dload0 | Dload1 | Dload2 | Dload3 => {
            let value = ctx.stack.local(locals, (u8::from(opcode) - u8::from(Dload0)) as u16);
            ctx.stack.push(value)?;
            ctx.stack.push(0)?;
            *pc += 1;
        }
        Aload0 | Aload1 | Aload2 | Aload3 => {
            let value = ctx.stack.local(locals, (u8::from(opcode) - u8::from(Aload0)) as u16);
            ctx.stack.push(value)?;
            *pc += 1;
        }
        Istore | Fstore | Astore => {
            let value = ctx.stack.pop();
            ctx.stack.set_local(locals, imm_u8!() as u16, value);
            *pc += 2;
        }
        Lstore | Dstore => {
            ctx.stack.pop();
            let value = ctx.stack.pop();
            ctx.stack.set_local(locals, imm_u8!() as u16, value);
            *pc += 2;
        }
        Istore0 | Istore1 | Istore2 | Istore3 => {
            let value = ctx.stack.pop();
            ctx.stack
                .set_local(locals, (u8::from(opcode) - u8::from(Istore0)) as u16, value);
            *pc += 1;
        }
        Lstore0 | Lstore1 | Lstore2 | Lstore3 => {
            ctx.stack.pop();
            let value = ctx.stack.pop();
            ctx.stack
                .set_local(locals, (u8::from(opcode) - u8::from(Lstore0)) as u16, value);
            *pc += 1;
        }
        Fstore0 | Fstore1 | Fstore2 | Fstore3 => {
            let value = ctx.stack.pop();
            ctx.stack
                .set_local(locals, (u8::from(opcode) - u8::from(Fstore0)) as u16, value);
            *pc += 1;
        }
        Dstore0 | Dstore1 | Dstore2 | Dstore3 => {
            ctx.stack.pop();
            let value = ctx.stack.pop();
            ctx.stack
                .set_local(locals, (u8::from(opcode) - u8::from(Dstore0)) as u16, value);
            *pc += 1;
        }
        Astore0 | Astore1 | Astore2 | Astore3 => {
            let value = ctx.stack.pop();
            ctx.stack
                .set_local(locals, (u8::from(opcode) - u8::from(Astore0)) as u16, value);
            *pc += 1;
        }

        // Array loads and stores.
        Iaload | Laload | Faload | Daload | Aaload | Baload | Caload | Saload => {
            handle_array_load(vm, ctx, opcode)?;
            *pc += 1;
        }
        Iastore | Lastore | Fastore | Dastore | Aastore | Bastore | Castore | Sastore => {
            handle_array_store(vm, ctx, opcode)?;
            *pc += 1;
        }

        // Operand stack shuffling.
        Pop => {
            ctx.stack.pop();
            *pc += 1;
        }
        Pop2 => {
            ctx.stack.pop();
            ctx.stack.pop();
            *pc += 1;
        }
        Dup => {
            let a = ctx.stack.peek(0);
            ctx.stack.push(a)?;
            *pc += 1;
        }
        DupX1 => {
            let a = ctx.stack.pop();
            let b = ctx.stack.pop();
            ctx.stack.push(a)?;
            ctx.stack.push(b)?;
            ctx.stack.push(a)?;
            *pc += 1;
        }
        DupX2 => {
            let a = ctx.stack.pop();
            let b = ctx.stack.pop();
            let c = ctx.stack.pop();
            ctx.stack.push(a)?;
            ctx.stack.push(c)?;
            ctx.stack.push(b)?;
            ctx.stack.push(a)?;
            *pc += 1;
        }
        Dup2 => {
            let a = ctx.stack.peek(0);
            let b = ctx.stack.peek(1);
            ctx.stack.push(b)?;
            ctx.stack.push(a)?;
            *pc += 1;
        }
        Dup2X1 => {
            let a = ctx.stack.pop();
            let b = ctx.stack.pop();
            let c = ctx.stack.pop();
            ctx.stack.push(b)?;
            ctx.stack.push(a)?;
            ctx.stack.push(c)?;
            ctx.stack.push(b)?;
            ctx.stack.push(a)?;
            *pc += 1;
        }
        Dup2X2 => {
            let a = ctx.stack.pop();
            let b = ctx.stack.pop();
            let c = ctx.stack.pop();
            let d = ctx.stack.pop();
            ctx.stack.push(b)?;
            ctx.stack.push(a)?;
            ctx.stack.push(d)?;
            ctx.stack.push(c)?;
            ctx.stack.push(b)?;
            ctx.stack.push(a)?;
            *pc += 1;
        }
        Swap => {
            let a = ctx.stack.pop();
            let b = ctx.stack.pop();
            ctx.stack.push(a)?;
            ctx.stack.push(b)?;
            *pc += 1;
        }

        // Integer arithmetic.
        Iadd => int_binop(ctx, i32::wrapping_add, pc)?,
        Isub => int_binop(ctx, i32::wrapping_sub, pc)?,
        Imul => int_binop(ctx, i32::wrapping_mul, pc)?,
        Idiv => {
            let b = ctx.stack.pop_int();
            let a = ctx.stack.pop_int();
            if b == 0 {
                throw_exception!(ArithmeticException, "/ by zero")?;
            }
            ctx.stack.push_int(a.wrapping_div(b))?;
            *pc += 1;
        }
        Irem => {
            let b = ctx.stack.pop_int();
            let a = ctx.stack.pop_int();
            if b == 0 {
                throw_exception!(ArithmeticException, "/ by zero")?;
            }
            ctx.stack.push_int(a.wrapping_rem(b))?;
            *pc += 1;
        }
        Ineg => {
            let a = ctx.stack.pop_int();
            ctx.stack.push_int(a.wrapping_neg())?;
            *pc += 1;
        }
        Ishl => {
            let b = ctx.stack.pop_int();
            let a = ctx.stack.pop_int();
            ctx.stack.push_int(a.wrapping_shl(b as u32 & 0x1f))?;
            *pc += 1;
        }
        Ishr => {
            let b = ctx.stack.pop_int();
            let a = ctx.stack.pop_int();
            ctx.stack.push_int(a.wrapping_shr(b as u32 & 0x1f))?;
            *pc += 1;
        }
        Iushr => {
            let b = ctx.stack.pop_int();
            let a = ctx.stack.pop_int();
            ctx.stack.push_int(((a as u32) >> (b as u32 & 0x1f)) as i32)?;
            *pc += 1;
        }
        Iand => int_binop(ctx, |a, b| a & b, pc)?,
        Ior => int_binop(ctx, |a, b| a | b, pc)?,
        Ixor => int_binop(ctx, |a, b| a ^ b, pc)?,

        // Long arithmetic.
        Ladd => long_binop(ctx, i64::wrapping_add, pc)?,
        Lsub => long_binop(ctx, i64::wrapping_sub, pc)?,
        Lmul => long_binop(ctx, i64::wrapping_mul, pc)?,
        Ldiv => {
            let b = ctx.stack.pop_long();
            let a = ctx.stack.pop_long();
            if b == 0 {
                throw_exception!(ArithmeticException, "/ by zero")?;
            }
            ctx.stack.push_long(a.wrapping_div(b))?;
            *pc += 1;
        }
        Lrem => {
            let b = ctx.stack.pop_long();
            let a = ctx.stack.pop_long();
            if b == 0 {
                throw_exception!(ArithmeticException, "/ by zero")?;
            }
            ctx.stack.push_long(a.wrapping_rem(b))?;
            *pc += 1;
        }
        Lneg => {
            let a = ctx.stack.pop_long();
            ctx.stack.push_long(a.wrapping_neg())?;
            *pc += 1;
        }
        Lshl => {
            let b = ctx.stack.pop_int();
            let a = ctx.stack.pop_long();
            ctx.stack.push_long(a.wrapping_shl(b as u32 & 0x3f))?;
            *pc += 1;
        }
        Lshr => {
            let b = ctx.stack.pop_int();
            let a = ctx.stack.pop_long();
            ctx.stack.push_long(a.wrapping_shr(b as u32 & 0x3f))?;
            *pc += 1;
        }
        Lushr => {
            let b = ctx.stack.pop_int();
            let a = ctx.stack.pop_long();
            ctx.stack
                .push_long(((a as u64) >> (b as u32 & 0x3f)) as i64)?;
            *pc += 1;
        }
        Land => long_binop(ctx, |a, b| a & b, pc)?,
        Lor => long_binop(ctx, |a, b| a | b, pc)?,
        Lxor => long_binop(ctx, |a, b| a ^ b, pc)?,

        // Float and double arithmetic.
        Fadd => float_binop(ctx, |a, b| a + b, pc)?,
        Fsub => float_binop(ctx, |a, b| a - b, pc)?,
        Fmul => float_binop(ctx, |a, b| a * b, pc)?,
        Fdiv => float_binop(ctx, |a, b| a / b, pc)?,
        Frem => float_binop(ctx, |a, b| a % b, pc)?,
        Fneg => {
            let a = ctx.stack.pop_float();
            ctx.stack.push_float(-a)?;
            *pc += 1;
        }
        Dadd => double_binop(ctx, |a, b| a + b, pc)?,
        Dsub => double_binop(ctx, |a, b| a - b, pc)?,
        Dmul => double_binop(ctx, |a, b| a * b, pc)?,
        Ddiv => double_binop(ctx, |a, b| a / b, pc)?,
        Drem => double_binop(ctx, |a, b| a % b, pc)?,
        Dneg => {
            let a = ctx.stack.pop_double();
            ctx.stack.push_double(-a)?;
            *pc += 1;
        }

        Iinc => {
            let index = imm_u8!() as u16;
            let delta = buffer.get(*pc + 2) as i8 as i32;
            let value = ctx.stack.local(locals, index) as u32 as i32;
            ctx.stack
                .set_local(locals, index, value.wrapping_add(delta) as u32 as u64);
            *pc += 3;
        }

        // Conversions.
        I2l => {
            let a = ctx.stack.pop_int();
            ctx.stack.push_long(a as i64)?;
            *pc += 1;
        }
        I2f => {
            let a = ctx.stack.pop_int();
            ctx.stack.push_float(a as f32)?;
            *pc += 1;
        }
        I2d => {
            let a = ctx.stack.pop_int();
            ctx.stack.push_double(a as f64)?;
            *pc += 1;
        }
        L2i => {
            let a = ctx.stack.pop_long();
            ctx.stack.push_int(a as i32)?;
            *pc += 1;
        }
        L2f => {
            let a = ctx.stack.pop_long();
            ctx.stack.push_float(a as f32)?;
            *pc += 1;
        }
        L2d => {
            let a = ctx.stack.pop_long();
            ctx.stack.push_double(a as f64)?;
            *pc += 1;
        }
        F2i => {
            let a = ctx.stack.pop_float();
            ctx.stack.push_int(a as i32)?;
            *pc += 1;
        }
        F2l => {
            let a = ctx.stack.pop_float();
            ctx.stack.push_long(a as i64)?;
            *pc += 1;
        }
        F2d => {
            let a = ctx.stack.pop_float();
            ctx.stack.push_double(a as f64)?;
            *pc += 1;
        }
        D2i => {
            let a = ctx.stack.pop_double();
            ctx.stack.push_int(a as i32)?;
            *pc += 1;
        }
        D2l => {
            let a = ctx.stack.pop_double();
            ctx.stack.push_long(a as i64)?;
            *pc += 1;
        }
        D2f => {
            let a = ctx.stack.pop_double();
            ctx.stack.push_float(a as f32)?;
            *pc += 1;
        }
        I2b => {
            let a = ctx.stack.pop_int();
            ctx.stack.push_int(a as i8 as i32)?;
            *pc += 1;
        }
        I2c => {
            let a = ctx.stack.pop_int();
            ctx.stack.push_int(a as u16 as i32)?;
            *pc += 1;
        }
        I2s => {
            let a = ctx.stack.pop_int();
            ctx.stack.push_int(a as i16 as i32)?;
            *pc += 1;
        }

        // Comparisons.
        Lcmp => {
            let b = ctx.stack.pop_long();
            let a = ctx.stack.pop_long();
            ctx.stack.push_int(match a.cmp(&b) {
                std::cmp::Ordering::Less => -1,
                std::cmp::Ordering::Equal => 0,
                std::cmp::Ordering::Greater => 1,
            })?;
            *pc += 1;
        }
        Fcmpl | Fcmpg => {
            let b = ctx.stack.pop_float();
            let a = ctx.stack.pop_float();
            ctx.stack.push_int(fp_compare(
                a as f64,
                b as f64,
                opcode == Fcmpg,
            ))?;
            *pc += 1;
        }
        Dcmpl | Dcmpg => {
            let b = ctx.stack.pop_double();
            let a = ctx.stack.pop_double();
            ctx.stack.push_int(fp_compare(a, b, opcode == Dcmpg))?;
            *pc += 1;
        }

        // Branches.
        Ifeq | Ifne | Iflt | Ifge | Ifgt | Ifle => {
            let a = ctx.stack.pop_int();
            let taken = match opcode {
                Ifeq => a == 0,
                Ifne => a != 0,
                Iflt => a < 0,
                Ifge => a >= 0,
                Ifgt => a > 0,
                _ => a <= 0,
            };
            if taken {
                branch16!();
            }
            *pc += 3;
        }
        IfIcmpeq | IfIcmpne | IfIcmplt | IfIcmpge | IfIcmpgt | IfIcmple => {
            let b = ctx.stack.pop_int();
            let a = ctx.stack.pop_int();
            let taken = match opcode {
                IfIcmpeq => a == b,
                IfIcmpne => a != b,
                IfIcmplt => a < b,
                IfIcmpge => a >= b,
                IfIcmpgt => a > b,
                _ => a <= b,
            };
            if taken {
                branch16!();
            }
            *pc += 3;
        }
        IfAcmpeq | IfAcmpne => {
            let b = ctx.stack.pop_ref();
            let a = ctx.stack.pop_ref();
            let taken = (a == b) == (opcode == IfAcmpeq);
            if taken {
                branch16!();
            }
            *pc += 3;
        }
        Ifnull | Ifnonnull => {
            let a = ctx.stack.pop_ref();
            let taken = (a == 0) == (opcode == Ifnull);
            if taken {
                branch16!();
            }
            *pc += 3;
        }
        Goto => branch16!(),
        GotoW => {
            let off = buffer.get_i32(*pc + 1) as isize;
            if off < 0 {
                vm.tm.safepoint(&ctx.handle);
            }
            *pc = (*pc as isize + off) as usize;
        }
        Jsr => {
            ctx.stack.push((*pc + 3) as u64)?;
            branch16!();
        }
        JsrW => {
            ctx.stack.push((*pc + 5) as u64)?;
            let off = buffer.get_i32(*pc + 1) as isize;
            *pc = (*pc as isize + off) as usize;
        }
        Ret => {
            let index = imm_u8!() as u16;
            *pc = ctx.stack.local(locals, index) as usize;
        }
        Tableswitch => {
            *pc = handle_tableswitch(ctx, buffer, *pc)?;
        }
        Lookupswitch => {
            *pc = handle_lookupswitch(ctx, buffer, *pc)?;
        }

        // Returns.
        Return => return Ok(StepOutcome::Return(KniRet::Void)),
        Ireturn | Freturn | Areturn => {
            let value = ctx.stack.pop();
            return Ok(StepOutcome::Return(KniRet::One(value)));
        }
        Lreturn | Dreturn => {
            ctx.stack.pop();
            let value = ctx.stack.pop();
            return Ok(StepOutcome::Return(KniRet::Two(value)));
        }
        ReturnMonitorexit | Return1Monitorexit | Return2Monitorexit => {
            let sync_obj = ctx.stack.cur_frame().sync_obj;
            if !vm.tm.monitor_exit(&ctx.handle, sync_obj) {
                throw_exception!(IllegalMonitorStateException)?;
            }
            return Ok(StepOutcome::Return(match opcode {
                ReturnMonitorexit => KniRet::Void,
                Return1Monitorexit => KniRet::One(ctx.stack.pop()),
                _ => {
                    ctx.stack.pop();
                    KniRet::Two(ctx.stack.pop())
                }
            }));
        }

        // Field access.
        GetstaticByte | GetstaticBool | GetstaticChar | GetstaticShort | GetstaticInt
        | GetstaticFloat | GetstaticLong | GetstaticDouble | GetstaticReference => {
            handle_getstatic(vm, ctx, method_id, imm_u16!())?;
            *pc += 3;
        }
        PutstaticByte | PutstaticBool | PutstaticChar | PutstaticShort | PutstaticInt
        | PutstaticFloat | PutstaticLong | PutstaticDouble | PutstaticReference => {
            handle_putstatic(vm, ctx, method_id, opcode, imm_u16!())?;
            *pc += 3;
        }
        GetfieldByte | GetfieldBool | GetfieldChar | GetfieldShort | GetfieldInt
        | GetfieldFloat | GetfieldLong | GetfieldDouble | GetfieldReference => {
            handle_getfield(vm, ctx, opcode, imm_u16!() as i16 as i32)?;
            *pc += 3;
        }
        PutfieldByte | PutfieldBool | PutfieldChar | PutfieldShort | PutfieldInt
        | PutfieldFloat | PutfieldLong | PutfieldDouble | PutfieldReference => {
            handle_putfield(vm, ctx, opcode, imm_u16!() as i16 as i32)?;
            *pc += 3;
        }

        // Invokes.
        Invokevirtual => {
            save_pc(ctx, *pc);
            handle_invokevirtual(vm, ctx, imm_u16!())?;
            *pc += 3;
        }
        Invokesuper => {
            save_pc(ctx, *pc);
            handle_invokesuper(vm, ctx, method_id, imm_u16!())?;
            *pc += 3;
        }
        Invokespecial => {
            save_pc(ctx, *pc);
            handle_invokespecial(vm, ctx, method_id, imm_u16!())?;
            *pc += 3;
        }
        Invokestatic => {
            save_pc(ctx, *pc);
            handle_invokestatic(vm, ctx, method_id, imm_u16!())?;
            *pc += 3;
        }
        Invokeinterface => {
            save_pc(ctx, *pc);
            handle_invokeinterface(vm, ctx, imm_u16!())?;
            *pc += 5;
        }
        InvokeNative => {
            return handle_invoke_native(vm, ctx, method_id).map(StepOutcome::Return);
        }
        Invokedynamic => {
            return Err(VmError::VirtualMachine(
                "invokedynamic is not supported".to_string(),
            ));
        }

        // Allocation.
        New | NewFinalizer => {
            handle_new(vm, ctx, method_id, imm_u16!(), opcode == NewFinalizer)?;
            *pc += 3;
        }
        Newarray => {
            handle_newarray(vm, ctx, imm_u8!())?;
            *pc += 2;
        }
        Anewarray => {
            handle_anewarray(vm, ctx, imm_u16!())?;
            *pc += 3;
        }
        Multianewarray => {
            let dims = buffer.get(*pc + 3);
            handle_multianewarray(vm, ctx, method_id, imm_u16!(), dims)?;
            *pc += 4;
        }
        Arraylength => {
            let array = ctx.stack.pop_ref();
            if array == 0 {
                throw_exception!(NullPointerException)?;
            }
            let length = vm.heap_shared().array_length(array);
            ctx.stack.push_int(length as i32)?;
            *pc += 1;
        }

        // Type checks.
        Checkcast => {
            handle_checkcast(vm, ctx, method_id, imm_u16!())?;
            *pc += 3;
        }
        Instanceof => {
            handle_instanceof(vm, ctx, method_id, imm_u16!())?;
            *pc += 3;
        }

        Athrow => {
            let exception = ctx.stack.pop_ref();
            if exception == 0 {
                throw_exception!(NullPointerException)?;
            }
            return Err(VmError::JavaExceptionThrown(exception));
        }

        // Monitors.
        Monitorenter => {
            let obj = ctx.stack.pop_ref();
            if obj == 0 {
                throw_exception!(NullPointerException)?;
            }
            vm.tm.monitor_enter(&ctx.handle, obj);
            *pc += 1;
        }
        Monitorexit => {
            let obj = ctx.stack.pop_ref();
            if obj == 0 {
                throw_exception!(NullPointerException)?;
            }
            if !vm.tm.monitor_exit(&ctx.handle, obj) {
                throw_exception!(IllegalMonitorStateException)?;
            }
            *pc += 1;
        }
        MonitorenterSpecial => {
            let obj = ctx.stack.local(locals, 0) as HeapRef;
            vm.tm.monitor_enter(&ctx.handle, obj);
            ctx.stack.cur_frame_mut().sync_obj = obj;
            *pc += 1;
        }
        MonitorenterSpecialStatic => {
            let mirror = vm.mirror_of(ctx, method_id.class)?;
            vm.tm.monitor_enter(&ctx.handle, mirror);
            ctx.stack.cur_frame_mut().sync_obj = mirror;
            *pc += 1;
        }

        Wide => {
            *pc = handle_wide(ctx, buffer, *pc)?;
        }

        // Trampolines.
        MethodLoad => return Ok(StepOutcome::Relink),
        Halt => {
            // The halt sentinel never executes through a regular invoke.
            return Ok(StepOutcome::Return(KniRet::Void));
        }

        // Prelink forms: rewrite the site under the VM lock and re-execute
        // it. The pc does not move.
        LdcPrelink | LdcWPrelink | GetstaticPrelink | PutstaticPrelink | GetfieldPrelink
        | PutfieldPrelink | InvokevirtualPrelink | InvokespecialPrelink | InvokestaticPrelink
        | InvokeinterfacePrelink | NewPrelink | AnewarrayPrelink => {
            translator::link_opcode(vm, ctx, method_id, code, *pc, opcode)?;
        }
    }

    Ok(StepOutcome::Next)
}

fn save_pc(ctx: &mut ThreadContext, pc: usize) {
    ctx.stack.cur_frame_mut().saved_pc = pc;
}

fn int_binop(
    ctx: &mut ThreadContext,
    op: impl Fn(i32, i32) -> i32,
    pc: &mut usize,
) -> Result<(), VmError> {
    let b = ctx.stack.pop_int();
    let a = ctx.stack.pop_int();
    ctx.stack.push_int(op(a, b))?;
    *pc += 1;
    Ok(())
}

fn long_binop(
    ctx: &mut ThreadContext,
    op: impl Fn(i64, i64) -> i64,
    pc: &mut usize,
) -> Result<(), VmError> {
    let b = ctx.stack.pop_long();
    let a = ctx.stack.pop_long();
    ctx.stack.push_long(op(a, b))?;
    *pc += 1;
    Ok(())
}

fn float_binop(
    ctx: &mut ThreadContext,
    op: impl Fn(f32, f32) -> f32,
    pc: &mut usize,
) -> Result<(), VmError> {
    let b = ctx.stack.pop_float();
    let a = ctx.stack.pop_float();
    ctx.stack.push_float(op(a, b))?;
    *pc += 1;
    Ok(())
}

fn double_binop(
    ctx: &mut ThreadContext,
    op: impl Fn(f64, f64) -> f64,
    pc: &mut usize,
) -> Result<(), VmError> {
    let b = ctx.stack.pop_double();
    let a = ctx.stack.pop_double();
    ctx.stack.push_double(op(a, b))?;
    *pc += 1;
    Ok(())
}

fn fp_compare(a: f64, b: f64, nan_is_one: bool) -> i32 {
    if a.is_nan() || b.is_nan() {
        if nan_is_one { 1 } else { -1 }
    } else if a < b {
        -1
    } else if a > b {
        1
    } else {
        0
    }
}

/// Lazily runs the initialization protocol of a class: the class object's
/// monitor guards the state transitions, another initializing thread is
/// waited for, the parent initializes first, statics are laid out, and
/// `<clinit>` runs once with its code purged afterwards.
pub fn ensure_initialized(
    vm: &VirtualMachine,
    ctx: &mut ThreadContext,
    class_id: ClassId,
) -> Result<(), VmError> {
    let class = vm.classes_shared().get(class_id);

    match class.state() {
        ClassState::Initialized => return Ok(()),
        ClassState::Erroneous => {
            return Err(VmError::NoClassDefFound(format!(
                "class {} is erroneous",
                vm.names().resolve(&class.name)
            )));
        }
        _ => {}
    }

    let mirror = vm.mirror_of(ctx, class_id)?;
    vm.tm.monitor_enter(&ctx.handle, mirror);

    loop {
        match class.state() {
            ClassState::Initializing => {
                if class.init_thread() == Some(ctx.handle.id) {
                    // Recursive request from the initializing thread.
                    vm.tm.monitor_exit(&ctx.handle, mirror);
                    return Ok(());
                }
                vm.tm.monitor_wait(&ctx.handle, mirror, 0, 0)?;
            }
            ClassState::Initialized => {
                vm.tm.monitor_exit(&ctx.handle, mirror);
                return Ok(());
            }
            ClassState::Erroneous => {
                vm.tm.monitor_exit(&ctx.handle, mirror);
                return Err(VmError::NoClassDefFound(format!(
                    "class {} is erroneous",
                    vm.names().resolve(&class.name)
                )));
            }
            ClassState::Linked => {
                class.set_state(ClassState::Initializing);
                class.set_init_thread(Some(ctx.handle.id));
                vm.tm.monitor_exit(&ctx.handle, mirror);
                break;
            }
            other => {
                vm.tm.monitor_exit(&ctx.handle, mirror);
                return Err(VmError::VirtualMachine(format!(
                    "initializing a class in state {:?}",
                    other
                )));
            }
        }
    }

    let fail = |vm: &VirtualMachine, ctx: &mut ThreadContext, err: VmError| {
        vm.tm.monitor_enter(&ctx.handle, mirror);
        class.set_state(ClassState::Erroneous);
        class.set_init_thread(None);
        vm.tm.monitor_notify(&ctx.handle, mirror, true);
        vm.tm.monitor_exit(&ctx.handle, mirror);
        Err(err)
    };

    if let Some(parent) = class.parent() {
        if let Err(err) = ensure_initialized(vm, ctx, parent) {
            return fail(vm, ctx, err);
        }
    }

    if let Err(err) = initialize_static_fields(vm, ctx, class_id) {
        return fail(vm, ctx, err);
    }

    let clinit_key = MethodKey {
        name: vm.names().intern_str("<clinit>"),
        desc: vm.names().intern_str("()V"),
    };
    if let Some((index, _)) = class.methods().find(&clinit_key) {
        let clinit_id = MethodId::new(class_id, index);
        if let Err(err) = invoke_method(vm, ctx, clinit_id) {
            error!(
                "exception in the initializer of {}",
                vm.names().resolve(&class.name)
            );
            return fail(vm, ctx, err);
        }
        // The initializer runs once, its code buffer is dead weight now.
        class.methods().get(index).purge_code();
    }

    vm.tm.monitor_enter(&ctx.handle, mirror);
    class.set_state(ClassState::Initialized);
    class.set_init_thread(None);
    vm.tm.monitor_notify(&ctx.handle, mirror, true);
    vm.tm.monitor_exit(&ctx.handle, mirror);
    Ok(())
}

/// Lays out the static data array and copies `ConstantValue` defaults.
fn initialize_static_fields(
    vm: &VirtualMachine,
    ctx: &mut ThreadContext,
    class_id: ClassId,
) -> Result<(), VmError> {
    use crate::rt::field::FieldKind;
    use parking_lot::RwLock;

    let class = vm.classes_shared().get(class_id);
    if class.static_data().is_some() {
        return Ok(());
    }

    let mut slots: Vec<RwLock<StaticValue>> = Vec::new();

    for field in class.fields().iter() {
        if !field.is_static() {
            continue;
        }

        let value = match field.constant_value {
            Some(cv_idx) => match field.kind {
                FieldKind::Byte => StaticValue::Int(class.cp().get_integer(cv_idx)? as i8 as i32),
                FieldKind::Bool => {
                    StaticValue::Int((class.cp().get_integer(cv_idx)? != 0) as i32)
                }
                FieldKind::Char => {
                    StaticValue::Int(class.cp().get_integer(cv_idx)? as u16 as i32)
                }
                FieldKind::Short => {
                    StaticValue::Int(class.cp().get_integer(cv_idx)? as i16 as i32)
                }
                FieldKind::Int => StaticValue::Int(class.cp().get_integer(cv_idx)?),
                FieldKind::Float => StaticValue::Float(class.cp().get_float(cv_idx)?),
                FieldKind::Long => StaticValue::Long(class.cp().get_long(cv_idx)?),
                FieldKind::Double => StaticValue::Double(class.cp().get_double(cv_idx)?),
                FieldKind::Reference => {
                    let literal = vm.intern_string_constant(ctx, class_id, cv_idx)?;
                    StaticValue::Reference(literal)
                }
            },
            None => match field.kind {
                FieldKind::Long => StaticValue::Long(0),
                FieldKind::Float => StaticValue::Float(0.0),
                FieldKind::Double => StaticValue::Double(0.0),
                FieldKind::Reference => StaticValue::Reference(0),
                _ => StaticValue::Int(0),
            },
        };

        field.set_offset(slots.len() as i32);
        slots.push(RwLock::new(value));
    }

    class.install_static_data(slots.into_boxed_slice());
    Ok(())
}

// Re-exported helpers used by the handlers module.
pub(crate) fn null_check(reference: HeapRef) -> Result<HeapRef, VmError> {
    if reference == 0 {
        Err(build_exception!(NullPointerException))
    } else {
        Ok(reference)
    }
}

pub(crate) fn array_index_check(index: i32, length: u32) -> Result<u32, VmError> {
    if index < 0 || index as u32 >= length {
        Err(build_exception!(
            ArrayIndexOutOfBoundsException,
            "index {} out of bounds for length {}",
            index,
            length
        ))
    } else {
        Ok(index as u32)
    }
}

pub(crate) fn elem_data_offset(index: u32, atype: ArrayType) -> i32 {
    (ARRAY_DATA_OFFSET + index as usize * atype.elem_size()) as i32
}

pub(crate) fn ref_elem_check(
    vm: &VirtualMachine,
    array: HeapRef,
    value: HeapRef,
) -> Result<(), VmError> {
    if value == 0 {
        return Ok(());
    }

    let (value_class, array_class) = {
        let heap = vm.heap_shared();
        (heap.class_of(value), heap.class_of(array))
    };

    let classes = vm.classes_shared();
    let elem = match classes.get_ref(array_class).derived().array {
        Some(info) => match info.element {
            ArrayElement::Reference(elem) => elem,
            ArrayElement::Primitive(_) => {
                return Err(build_exception!(ArrayStoreException));
            }
        },
        None => return Err(build_exception!(ArrayStoreException)),
    };

    if classes.is_assignable(value_class, elem) {
        Ok(())
    } else {
        Err(build_exception!(ArrayStoreException))
    }
}

