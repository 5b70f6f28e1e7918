//! Raw class-file parsing.
//!
//! The parser validates structure and interns every name, but deliberately
//! does not read method bodies: a method's `Code` payload is located by
//! offset and loaded only when the method is linked. `LineNumberTable`,
//! `LocalVariableTable` and all unknown attributes are skipped after
//! checking their declared lengths; `Exceptions` is parsed and discarded.

use crate::error::VmError;
use crate::keys::Symbol;
use crate::utf8::Utf8Pool;

pub mod cursor;
pub mod flags;

use cursor::ClassFileCursor;
use flags::{ClassFlags, FieldFlags, MethodFlags};

/// Lowest accepted class file major version.
pub const MIN_MAJOR_VERSION: u16 = 45;
/// Highest accepted class file major version.
pub const MAX_MAJOR_VERSION: u16 = 51;

/// Constant-pool entry as written in the class file, names already interned.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawConstant {
    /// Index 0 and the second slot of 8-byte constants.
    Unusable,
    Utf8(Symbol),
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Class { name_idx: u16 },
    Str { utf8_idx: u16 },
    Fieldref { class_idx: u16, nat_idx: u16 },
    Methodref { class_idx: u16, nat_idx: u16 },
    InterfaceMethodref { class_idx: u16, nat_idx: u16 },
    NameAndType { name_idx: u16, desc_idx: u16 },
}

#[derive(Debug, Clone, Copy)]
pub struct RawField {
    pub flags: FieldFlags,
    pub name: Symbol,
    pub desc: Symbol,
    /// Constant-pool index of the `ConstantValue` payload, if any.
    pub constant_value: Option<u16>,
}

/// Location of a method's `Code` payload inside the class file.
#[derive(Debug, Clone, Copy)]
pub struct RawCode {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code_offset: u32,
    pub code_length: u32,
    pub exception_table_offset: u32,
    pub exception_table_length: u16,
}

#[derive(Debug, Clone, Copy)]
pub struct RawMethod {
    pub flags: MethodFlags,
    pub name: Symbol,
    pub desc: Symbol,
    pub code: Option<RawCode>,
}

pub struct RawClassFile {
    pub major_version: u16,
    pub constants: Vec<RawConstant>,
    pub access_flags: ClassFlags,
    pub this_class: u16,
    pub super_class: u16,
    pub interfaces: Vec<u16>,
    pub fields: Vec<RawField>,
    pub methods: Vec<RawMethod>,
}

impl RawClassFile {
    pub fn parse(data: &[u8], pool: &Utf8Pool) -> Result<Self, VmError> {
        let mut cursor = ClassFileCursor::new(data);

        if cursor.u4()? != 0xCAFEBABE {
            return Err(VmError::NoClassDefFound(
                "malformed class, 0xCAFEBABE magic value is missing".to_string(),
            ));
        }

        let _minor = cursor.u2()?;
        let major_version = cursor.u2()?;

        if !(MIN_MAJOR_VERSION..=MAX_MAJOR_VERSION).contains(&major_version) {
            return Err(VmError::NoClassDefFound(format!(
                "unsupported class file version {}",
                major_version
            )));
        }

        let constants = parse_constants(&mut cursor, pool)?;
        let access_flags = ClassFlags::from_raw(cursor.u2()?);
        let this_class = cursor.u2()?;
        let super_class = cursor.u2()?;

        let interface_count = cursor.u2()?;
        let mut interfaces = Vec::with_capacity(interface_count as usize);
        for _ in 0..interface_count {
            interfaces.push(cursor.u2()?);
        }

        let field_count = cursor.u2()?;
        let mut fields = Vec::with_capacity(field_count as usize);
        for _ in 0..field_count {
            fields.push(parse_field(&mut cursor, &constants, pool)?);
        }

        let method_count = cursor.u2()?;
        let mut methods = Vec::with_capacity(method_count as usize);
        for _ in 0..method_count {
            methods.push(parse_method(&mut cursor, &constants, pool)?);
        }

        // Class-level attributes are all ignored, only their lengths are
        // validated.
        skip_attributes(&mut cursor)?;

        if !cursor.at_end() {
            return Err(VmError::NoClassDefFound(
                "trailing bytes after the class file".to_string(),
            ));
        }

        Ok(Self {
            major_version,
            constants,
            access_flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
        })
    }

    pub fn constant(&self, idx: u16) -> Result<&RawConstant, VmError> {
        self.constants.get(idx as usize).ok_or_else(|| {
            VmError::NoClassDefFound(format!("constant pool index {} out of range", idx))
        })
    }

    pub fn utf8(&self, idx: u16) -> Result<Symbol, VmError> {
        match self.constant(idx)? {
            RawConstant::Utf8(sym) => Ok(*sym),
            other => Err(VmError::NoClassDefFound(format!(
                "constant pool entry {} is {:?}, expected Utf8",
                idx, other
            ))),
        }
    }

    pub fn class_name(&self, idx: u16) -> Result<Symbol, VmError> {
        match self.constant(idx)? {
            RawConstant::Class { name_idx } => self.utf8(*name_idx),
            other => Err(VmError::NoClassDefFound(format!(
                "constant pool entry {} is {:?}, expected Class",
                idx, other
            ))),
        }
    }
}

fn parse_constants(
    cursor: &mut ClassFileCursor<'_>,
    pool: &Utf8Pool,
) -> Result<Vec<RawConstant>, VmError> {
    let count = cursor.u2()?;
    let mut constants = Vec::with_capacity(count as usize);
    constants.push(RawConstant::Unusable);

    let mut i = 1;
    while i < count {
        let tag = cursor.u1()?;

        let constant = match tag {
            1 => {
                let len = cursor.u2()? as usize;
                RawConstant::Utf8(pool.intern_modified(cursor.bytes(len)?)?)
            }
            3 => RawConstant::Integer(cursor.u4()? as i32),
            4 => RawConstant::Float(f32::from_bits(cursor.u4()?)),
            5 => {
                let value = ((cursor.u4()? as u64) << 32) | cursor.u4()? as u64;
                RawConstant::Long(value as i64)
            }
            6 => {
                let value = ((cursor.u4()? as u64) << 32) | cursor.u4()? as u64;
                RawConstant::Double(f64::from_bits(value))
            }
            7 => RawConstant::Class {
                name_idx: cursor.u2()?,
            },
            8 => RawConstant::Str {
                utf8_idx: cursor.u2()?,
            },
            9 => RawConstant::Fieldref {
                class_idx: cursor.u2()?,
                nat_idx: cursor.u2()?,
            },
            10 => RawConstant::Methodref {
                class_idx: cursor.u2()?,
                nat_idx: cursor.u2()?,
            },
            11 => RawConstant::InterfaceMethodref {
                class_idx: cursor.u2()?,
                nat_idx: cursor.u2()?,
            },
            12 => RawConstant::NameAndType {
                name_idx: cursor.u2()?,
                desc_idx: cursor.u2()?,
            },
            other => {
                return Err(VmError::NoClassDefFound(format!(
                    "unsupported constant pool tag {}",
                    other
                )));
            }
        };

        let double_width = matches!(constant, RawConstant::Long(_) | RawConstant::Double(_));
        constants.push(constant);
        i += 1;

        // 8-byte constants take two entries, the second one is unusable.
        if double_width {
            constants.push(RawConstant::Unusable);
            i += 1;
        }
    }

    Ok(constants)
}

fn constant_utf8(constants: &[RawConstant], idx: u16) -> Result<Symbol, VmError> {
    match constants.get(idx as usize) {
        Some(RawConstant::Utf8(sym)) => Ok(*sym),
        _ => Err(VmError::NoClassDefFound(format!(
            "constant pool entry {} is not a Utf8 entry",
            idx
        ))),
    }
}

fn parse_field(
    cursor: &mut ClassFileCursor<'_>,
    constants: &[RawConstant],
    pool: &Utf8Pool,
) -> Result<RawField, VmError> {
    let flags = FieldFlags::from_raw(cursor.u2()?);
    let name = constant_utf8(constants, cursor.u2()?)?;
    let desc = constant_utf8(constants, cursor.u2()?)?;

    let constant_value_sym = pool.intern_str("ConstantValue");
    let mut constant_value = None;

    let attr_count = cursor.u2()?;
    for _ in 0..attr_count {
        let attr_name = constant_utf8(constants, cursor.u2()?)?;
        let attr_length = cursor.u4()? as usize;

        if attr_name == constant_value_sym {
            if attr_length != 2 || constant_value.is_some() {
                return Err(VmError::NoClassDefFound(
                    "malformed ConstantValue attribute".to_string(),
                ));
            }
            constant_value = Some(cursor.u2()?);
        } else {
            cursor.skip(attr_length)?;
        }
    }

    Ok(RawField {
        flags,
        name,
        desc,
        constant_value,
    })
}

fn parse_method(
    cursor: &mut ClassFileCursor<'_>,
    constants: &[RawConstant],
    pool: &Utf8Pool,
) -> Result<RawMethod, VmError> {
    let flags = MethodFlags::from_raw(cursor.u2()?);
    let name = constant_utf8(constants, cursor.u2()?)?;
    let desc = constant_utf8(constants, cursor.u2()?)?;

    let code_sym = pool.intern_str("Code");
    let exceptions_sym = pool.intern_str("Exceptions");

    let mut code = None;
    let mut exceptions_found = false;

    let attr_count = cursor.u2()?;
    for _ in 0..attr_count {
        let attr_name = constant_utf8(constants, cursor.u2()?)?;
        let attr_length = cursor.u4()? as usize;
        let attr_start = cursor.tell();

        if attr_name == code_sym {
            if code.is_some() {
                return Err(VmError::NoClassDefFound(
                    "duplicated Code attribute found".to_string(),
                ));
            }
            code = Some(parse_code(cursor)?);
        } else if attr_name == exceptions_sym {
            // Parsed and discarded; only the compiler cares.
            if exceptions_found {
                return Err(VmError::NoClassDefFound(
                    "duplicated Exceptions attribute found".to_string(),
                ));
            }
            let count = cursor.u2()?;
            for _ in 0..count {
                cursor.u2()?;
            }
            exceptions_found = true;
        } else {
            cursor.skip(attr_length)?;
        }

        if cursor.tell() - attr_start != attr_length {
            return Err(VmError::NoClassDefFound(
                "actual length of an attribute is different from the length provided in the \
                 class file"
                    .to_string(),
            ));
        }
    }

    Ok(RawMethod {
        flags,
        name,
        desc,
        code,
    })
}

fn parse_code(cursor: &mut ClassFileCursor<'_>) -> Result<RawCode, VmError> {
    let max_stack = cursor.u2()?;
    let max_locals = cursor.u2()?;
    let code_length = cursor.u4()?;

    if code_length == 0 || code_length > 65536 {
        return Err(VmError::NoClassDefFound(
            "code length is either 0 or more than 65536".to_string(),
        ));
    }

    let code_offset = cursor.tell() as u32;
    cursor.skip(code_length as usize)?;

    let exception_table_length = cursor.u2()?;
    let exception_table_offset = cursor.tell() as u32;
    cursor.skip(exception_table_length as usize * 8)?;

    // Nested LineNumberTable/LocalVariableTable attributes are ignored.
    skip_attributes(cursor)?;

    Ok(RawCode {
        max_stack,
        max_locals,
        code_offset,
        code_length,
        exception_table_offset,
        exception_table_length,
    })
}

fn skip_attributes(cursor: &mut ClassFileCursor<'_>) -> Result<(), VmError> {
    let count = cursor.u2()?;
    for _ in 0..count {
        let _name = cursor.u2()?;
        let length = cursor.u4()? as usize;
        cursor.skip(length)?;
    }
    Ok(())
}
