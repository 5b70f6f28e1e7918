use crate::heap::HeapRef;
use std::fmt::Display;

/// Errors raised by the runtime itself while loading, linking or executing.
///
/// The first three variants mirror the CLDC pseudo-exception kinds: they are
/// carried as plain Rust errors until they either reach the bootstrap
/// boundary (fatal) or are downgraded into Java objects for the bytecode to
/// observe. `JavaException` and `JavaExceptionThrown` carry in-flight Java
/// exceptions through the interpreter's unwinding path.
#[derive(Debug)]
pub enum VmError {
    /// Malformed class file, resolution failure, exhausted VM limits.
    VirtualMachine(String),
    /// Class not found, class circularity, access violation, constant-pool
    /// inconsistency. CLDC folds circularity into this kind.
    NoClassDefFound(String),
    /// Surfaced only through `Class.forName`.
    ClassNotFound(String),
    /// I/O failure while reading a class file.
    Io(std::io::Error),
    /// Arena exhausted; the allocator retries after a collection and a grow
    /// before reporting this.
    OutOfMemory,
    /// A Java exception built by the runtime, not yet allocated on the heap.
    JavaException(JavaExceptionFromVm),
    /// A Java exception object travelling through the frame walker.
    JavaExceptionThrown(HeapRef),
    /// `Runtime.exit` was invoked with the given status.
    Exit(i32),
}

impl From<std::io::Error> for VmError {
    fn from(value: std::io::Error) -> Self {
        VmError::Io(value)
    }
}

impl From<JavaExceptionFromVm> for VmError {
    fn from(value: JavaExceptionFromVm) -> Self {
        VmError::JavaException(value)
    }
}

impl Display for VmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmError::VirtualMachine(msg) => write!(f, "java.lang.VirtualMachineError: {}", msg),
            VmError::NoClassDefFound(msg) => write!(f, "java.lang.NoClassDefFoundError: {}", msg),
            VmError::ClassNotFound(msg) => write!(f, "java.lang.ClassNotFoundException: {}", msg),
            VmError::Io(err) => write!(f, "i/o error while reading a class: {}", err),
            VmError::OutOfMemory => write!(f, "out of memory"),
            VmError::JavaException(ex) => match &ex.message {
                Some(message) => write!(f, "{}: {}", ex.kind.class_name_dot(), message),
                None => write!(f, "{}", ex.kind.class_name_dot()),
            },
            VmError::JavaExceptionThrown(_) => write!(f, "uncaught Java exception"),
            VmError::Exit(code) => write!(f, "exit({})", code),
        }
    }
}

/// Java exception classes the runtime can raise on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JavaExceptionKind {
    ArithmeticException,
    ArrayIndexOutOfBoundsException,
    ArrayStoreException,
    ClassCastException,
    ClassNotFoundException,
    IllegalArgumentException,
    IllegalMonitorStateException,
    InstantiationException,
    InterruptedException,
    NegativeArraySizeException,
    NullPointerException,
    OutOfMemoryError,
    VirtualMachineError,
    NoClassDefFoundError,
    UnsatisfiedLinkError,
}

impl JavaExceptionKind {
    pub const fn class_name(self) -> &'static str {
        match self {
            Self::ArithmeticException => "java/lang/ArithmeticException",
            Self::ArrayIndexOutOfBoundsException => "java/lang/ArrayIndexOutOfBoundsException",
            Self::ArrayStoreException => "java/lang/ArrayStoreException",
            Self::ClassCastException => "java/lang/ClassCastException",
            Self::ClassNotFoundException => "java/lang/ClassNotFoundException",
            Self::IllegalArgumentException => "java/lang/IllegalArgumentException",
            Self::IllegalMonitorStateException => "java/lang/IllegalMonitorStateException",
            Self::InstantiationException => "java/lang/InstantiationException",
            Self::InterruptedException => "java/lang/InterruptedException",
            Self::NegativeArraySizeException => "java/lang/NegativeArraySizeException",
            Self::NullPointerException => "java/lang/NullPointerException",
            Self::OutOfMemoryError => "java/lang/OutOfMemoryError",
            Self::VirtualMachineError => "java/lang/VirtualMachineError",
            Self::NoClassDefFoundError => "java/lang/NoClassDefFoundError",
            Self::UnsatisfiedLinkError => "java/lang/UnsatisfiedLinkError",
        }
    }

    pub fn class_name_dot(self) -> String {
        self.class_name().replace('/', ".")
    }
}

/// A Java exception described by the runtime, materialized into a heap
/// object by the interpreter when it reaches the unwinding path.
#[derive(Debug, Clone)]
pub struct JavaExceptionFromVm {
    pub kind: JavaExceptionKind,
    pub message: Option<String>,
}

impl JavaExceptionFromVm {
    pub fn new(kind: JavaExceptionKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    pub fn with_message(kind: JavaExceptionKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
        }
    }
}

/// Builds a `VmError::JavaException` for one of the kinds above.
#[macro_export]
macro_rules! build_exception {
    ($kind:ident) => {
        $crate::error::VmError::JavaException($crate::error::JavaExceptionFromVm::new(
            $crate::error::JavaExceptionKind::$kind,
        ))
    };
    ($kind:ident, $($arg:tt)*) => {
        $crate::error::VmError::JavaException($crate::error::JavaExceptionFromVm::with_message(
            $crate::error::JavaExceptionKind::$kind,
            format!($($arg)*),
        ))
    };
}

/// `Err(...)` wrapper around `build_exception!`, usable in tail position or
/// with `?`.
#[macro_export]
macro_rules! throw_exception {
    ($kind:ident) => {
        Err($crate::build_exception!($kind))
    };
    ($kind:ident, $($arg:tt)*) => {
        Err($crate::build_exception!($kind, $($arg)*))
    };
}
