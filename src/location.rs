//! Bytecode that materializes a location value at a call site.
//!
//! The emitted sequence is
//!
//! ```text
//! ldc          "<source file>"
//! ldc          "<enclosing method>"
//! <push int>   <line>
//! invokestatic <Location>.<factory>(Ljava/lang/String;Ljava/lang/String;I)L<Location>;
//! ```
//!
//! and leaves exactly one location reference on top of whatever the call's
//! own arguments already put on the operand stack.

use anyhow::Result;

use crate::classfile::ConstantPool;
use crate::classfile::reader::put_u16;
use crate::descriptor::object_descriptor;
use crate::opcodes;

/// Operand stack slots the sequence needs above the call's arguments.
pub(crate) const EXTRA_STACK: u16 = 3;

/// Line number used when no line number record covers a call site.
pub(crate) const UNKNOWN_LINE: u16 = 0;

/// Class and static factory used to build location values.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct LocationType {
    pub(crate) class_name: String,
    pub(crate) factory_name: String,
}

impl Default for LocationType {
    fn default() -> Self {
        Self {
            class_name: "org/chromium/base/Location".to_string(),
            factory_name: "from".to_string(),
        }
    }
}

impl LocationType {
    /// Field descriptor of the location class, the parameter appended to
    /// rewritten call sites.
    pub(crate) fn descriptor(&self) -> String {
        object_descriptor(&self.class_name)
    }

    pub(crate) fn factory_descriptor(&self) -> String {
        format!("(Ljava/lang/String;Ljava/lang/String;I){}", self.descriptor())
    }
}

/// Static facts about a call site.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct SourcePosition {
    pub(crate) file: String,
    pub(crate) method: String,
    pub(crate) line: u16,
}

/// Emit the location construction sequence, adding constant pool entries as
/// needed.
pub(crate) fn synthesize(
    location_type: &LocationType,
    position: &SourcePosition,
    constant_pool: &mut ConstantPool,
) -> Result<Vec<u8>> {
    let mut code = Vec::with_capacity(12);
    let file = constant_pool.add_string(&position.file)?;
    push_constant(&mut code, file);
    let method = constant_pool.add_string(&position.method)?;
    push_constant(&mut code, method);
    push_int(&mut code, constant_pool, position.line as i32)?;

    let class_index = constant_pool.add_class(&location_type.class_name)?;
    let factory = constant_pool.add_method_ref(
        class_index,
        &location_type.factory_name,
        &location_type.factory_descriptor(),
        false,
    )?;
    code.push(opcodes::INVOKESTATIC);
    put_u16(&mut code, factory);
    Ok(code)
}

fn push_constant(code: &mut Vec<u8>, index: u16) {
    if index <= u8::MAX as u16 {
        code.push(opcodes::LDC);
        code.push(index as u8);
    } else {
        code.push(opcodes::LDC_W);
        put_u16(code, index);
    }
}

fn push_int(code: &mut Vec<u8>, constant_pool: &mut ConstantPool, value: i32) -> Result<()> {
    match value {
        -1..=5 => code.push((opcodes::ICONST_0 as i32 + value) as u8),
        -128..=127 => {
            code.push(opcodes::BIPUSH);
            code.push(value as i8 as u8);
        }
        -32768..=32767 => {
            code.push(opcodes::SIPUSH);
            put_u16(code, value as i16 as u16);
        }
        _ => {
            let index = constant_pool.add_integer(value)?;
            push_constant(code, index);
        }
    }
    Ok(())
}
