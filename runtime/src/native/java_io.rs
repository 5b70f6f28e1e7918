//! Native bodies of the `java.io` boot classes: the byte sink behind
//! `System.out` and `System.err`.

use crate::error::VmError;
use crate::interpreter::ThreadContext;
use crate::keys::FullyQualifiedMethodKey;
use crate::native::{KniArgs, KniRet, NativeRegistry, int_arg, ref_arg};
use crate::throw_exception;
use crate::vm::VirtualMachine;
use std::io::Write;

pub(super) fn register(registry: &NativeRegistry) {
    let mut add = |class: &str, name: &str, desc: &str, body: crate::native::NativeFn| {
        registry.register(
            FullyQualifiedMethodKey::new_with_str(class, name, desc, &registry.string_interner),
            body,
        );
    };

    add("java/io/PrintStream", "print", "(Ljava/lang/String;)V", print_string);
    add(
        "java/io/PrintStream",
        "println",
        "(Ljava/lang/String;)V",
        println_string,
    );
    add("java/io/PrintStream", "println", "()V", println_empty);
    add("java/io/PrintStream", "println", "(I)V", println_int);
    add("java/io/PrintStream", "write", "(I)V", write_byte);
}

fn print_string(
    vm: &VirtualMachine,
    _ctx: &mut ThreadContext,
    args: &KniArgs,
) -> Result<KniRet, VmError> {
    let string = ref_arg(args, 1);
    if string == 0 {
        throw_exception!(NullPointerException)?;
    }
    print!("{}", vm.rust_string_of(string));
    let _ = std::io::stdout().flush();
    Ok(KniRet::Void)
}

fn println_string(
    vm: &VirtualMachine,
    _ctx: &mut ThreadContext,
    args: &KniArgs,
) -> Result<KniRet, VmError> {
    let string = ref_arg(args, 1);
    if string == 0 {
        throw_exception!(NullPointerException)?;
    }
    println!("{}", vm.rust_string_of(string));
    Ok(KniRet::Void)
}

fn println_empty(
    _vm: &VirtualMachine,
    _ctx: &mut ThreadContext,
    _args: &KniArgs,
) -> Result<KniRet, VmError> {
    println!();
    Ok(KniRet::Void)
}

fn println_int(
    _vm: &VirtualMachine,
    _ctx: &mut ThreadContext,
    args: &KniArgs,
) -> Result<KniRet, VmError> {
    println!("{}", int_arg(args, 1));
    Ok(KniRet::Void)
}

fn write_byte(
    _vm: &VirtualMachine,
    _ctx: &mut ThreadContext,
    args: &KniArgs,
) -> Result<KniRet, VmError> {
    let byte = int_arg(args, 1) as u8;
    let _ = std::io::stdout().write_all(&[byte]);
    Ok(KniRet::Void)
}
