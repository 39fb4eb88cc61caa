//! Verifier types for straight-line code.
//!
//! A conditional branch that no longer reaches its target is rewritten as the
//! inverted condition jumping over a `goto_w`. The instruction after the
//! `goto_w` is then both a branch target and the successor of an
//! unconditional jump, so class files carrying a `StackMapTable` need a frame
//! there. Code between the closest preceding frame and the branch cannot be
//! entered from anywhere else, so simulating it from that frame gives the
//! state the new frame must describe.

use std::str::FromStr;

use anyhow::{Context, Result};
use jdescriptor::{MethodDescriptor, TypeDescriptor};

use crate::bytecode::read_u16;
use crate::classfile::ConstantPool;
use crate::classfile::code::CodeAttribute;
use crate::classfile::constant_pool::Constant;
use crate::classfile::stack_map::{self, ResolvedFrame, VerificationType};
use crate::ir::Instruction;
use crate::opcodes;

/// The parts of a method that fix its entry frame.
pub(crate) struct MethodShape<'a> {
    pub(crate) class_name: &'a str,
    pub(crate) name: &'a str,
    pub(crate) descriptor: &'a str,
    pub(crate) is_static: bool,
}

/// Add a frame after every branch in `widened`, where the verifier will look
/// for one once the branch is rewritten as an inverted condition.
pub(crate) fn add_branch_frames(
    code: &mut CodeAttribute,
    instructions: &[Instruction],
    widened: &[usize],
    method: &MethodShape<'_>,
    constant_pool: &mut ConstantPool,
) -> Result<()> {
    let mut slot = None;
    for (index, attribute) in code.attributes.iter().enumerate() {
        if constant_pool.utf8(attribute.name_index)? == "StackMapTable" {
            slot = Some(index);
            break;
        }
    }
    // Without a table the class predates type checking verification.
    let Some(slot) = slot else {
        return Ok(());
    };

    let initial = initial_locals(method, constant_pool)?;
    let this_class = constant_pool.add_class(method.class_name)?;
    let frames = stack_map::resolve(&stack_map::parse(&code.attributes[slot].info)?, &initial)?;
    let mut added = Vec::new();
    for &index in widened {
        let branch = &instructions[index];
        let next = branch.offset + branch.length;
        if frames.iter().any(|frame| frame.offset == next) {
            continue;
        }
        let start = frames
            .iter()
            .rev()
            .find(|frame| frame.offset <= branch.offset)
            .cloned()
            .unwrap_or_else(|| ResolvedFrame {
                offset: 0,
                locals: initial.clone(),
                stack: Vec::new(),
            });
        let first =
            instructions.partition_point(|instruction| instruction.offset < start.offset);
        let mut state = TypeState::from_frame(&start, this_class);
        for instruction in &instructions[first..=index] {
            state
                .step(&code.code, instruction, constant_pool)
                .with_context(|| format!("simulate instruction at offset {}", instruction.offset))?;
        }
        added.push(state.into_frame(next));
    }
    code.attributes[slot].info =
        stack_map::insert_frames(&code.attributes[slot].info, &initial, added)
            .context("insert StackMapTable frames")?;
    Ok(())
}

/// Locals on entry: the receiver (uninitialized inside a constructor) and
/// then each parameter.
pub(crate) fn initial_locals(
    method: &MethodShape<'_>,
    constant_pool: &mut ConstantPool,
) -> Result<Vec<VerificationType>> {
    let descriptor = MethodDescriptor::from_str(method.descriptor)
        .with_context(|| format!("parse method descriptor {}", method.descriptor))?;
    let mut locals = Vec::with_capacity(descriptor.parameter_types().len() + 1);
    if !method.is_static {
        locals.push(if method.name == "<init>" {
            VerificationType::UninitializedThis
        } else {
            VerificationType::Object(constant_pool.add_class(method.class_name)?)
        });
    }
    for parameter in descriptor.parameter_types() {
        if let Some(ty) = value_type(parameter, constant_pool)? {
            locals.push(ty);
        }
    }
    Ok(locals)
}

fn value_type(
    descriptor: &TypeDescriptor,
    constant_pool: &mut ConstantPool,
) -> Result<Option<VerificationType>> {
    let ty = match descriptor {
        TypeDescriptor::Void => return Ok(None),
        TypeDescriptor::Boolean
        | TypeDescriptor::Byte
        | TypeDescriptor::Char
        | TypeDescriptor::Short
        | TypeDescriptor::Integer => VerificationType::Integer,
        TypeDescriptor::Float => VerificationType::Float,
        TypeDescriptor::Long => VerificationType::Long,
        TypeDescriptor::Double => VerificationType::Double,
        TypeDescriptor::Object(name) => VerificationType::Object(constant_pool.add_class(name)?),
        // Array classes are named by their descriptor.
        TypeDescriptor::Array(..) => {
            VerificationType::Object(constant_pool.add_class(&descriptor.to_string())?)
        }
    };
    Ok(Some(ty))
}

fn field_type(
    descriptor: &str,
    constant_pool: &mut ConstantPool,
) -> Result<Option<VerificationType>> {
    let parsed = TypeDescriptor::from_str(descriptor)
        .with_context(|| format!("parse field descriptor {descriptor}"))?;
    value_type(&parsed, constant_pool)
}

fn is_wide(ty: VerificationType) -> bool {
    matches!(ty, VerificationType::Long | VerificationType::Double)
}

/// Locals by slot and the operand stack by value.
#[derive(Clone, Debug, Eq, PartialEq)]
struct TypeState {
    locals: Vec<VerificationType>,
    stack: Vec<VerificationType>,
    this_class: u16,
}

impl TypeState {
    fn from_frame(frame: &ResolvedFrame, this_class: u16) -> Self {
        let mut locals = Vec::with_capacity(frame.locals.len() * 2);
        for &local in &frame.locals {
            locals.push(local);
            if is_wide(local) {
                locals.push(VerificationType::Top);
            }
        }
        Self {
            locals,
            stack: frame.stack.clone(),
            this_class,
        }
    }

    fn into_frame(self, offset: u32) -> ResolvedFrame {
        let mut locals = Vec::with_capacity(self.locals.len());
        let mut slot = 0;
        while let Some(&local) = self.locals.get(slot) {
            locals.push(local);
            slot += if is_wide(local) { 2 } else { 1 };
        }
        while locals.last() == Some(&VerificationType::Top) {
            locals.pop();
        }
        ResolvedFrame {
            offset,
            locals,
            stack: self.stack,
        }
    }

    fn push(&mut self, ty: VerificationType) {
        self.stack.push(ty);
    }

    fn pop(&mut self) -> Result<VerificationType> {
        self.stack.pop().context("operand stack underflow")
    }

    fn pop_n(&mut self, count: usize) -> Result<()> {
        let kept = self
            .stack
            .len()
            .checked_sub(count)
            .context("operand stack underflow")?;
        self.stack.truncate(kept);
        Ok(())
    }

    /// Pop values covering exactly `words` stack words, bottom first.
    fn take_words(&mut self, words: usize) -> Result<Vec<VerificationType>> {
        let mut taken = Vec::new();
        let mut covered = 0;
        while covered < words {
            let ty = self.pop()?;
            covered += if is_wide(ty) { 2 } else { 1 };
            taken.push(ty);
        }
        if covered != words {
            anyhow::bail!("stack manipulation splits a long or double");
        }
        taken.reverse();
        Ok(taken)
    }

    fn load(&self, slot: usize) -> Result<VerificationType> {
        self.locals
            .get(slot)
            .copied()
            .with_context(|| format!("local {slot} is not set"))
    }

    fn store(&mut self, slot: usize, ty: VerificationType) {
        let size = if is_wide(ty) { 2 } else { 1 };
        if self.locals.len() < slot + size {
            self.locals.resize(slot + size, VerificationType::Top);
        }
        // Overwriting the upper half of a long or double kills the whole value.
        if slot > 0 && is_wide(self.locals[slot - 1]) {
            self.locals[slot - 1] = VerificationType::Top;
        }
        self.locals[slot] = ty;
        if size == 2 {
            self.locals[slot + 1] = VerificationType::Top;
        }
    }

    /// Replace an uninitialized value everywhere once its constructor ran.
    fn initialize(&mut self, uninitialized: VerificationType, ty: VerificationType) {
        for value in self.locals.iter_mut().chain(self.stack.iter_mut()) {
            if *value == uninitialized {
                *value = ty;
            }
        }
    }

    fn step(
        &mut self,
        code: &[u8],
        instruction: &Instruction,
        constant_pool: &mut ConstantPool,
    ) -> Result<()> {
        use VerificationType::{Double, Float, Integer, Long, Null, Object};

        let at = instruction.offset as usize;
        let opcode = instruction.opcode;
        let operand_u8 = || code.get(at + 1).copied().context("missing operand");
        let operand_u16 = || read_u16(code, at + 1);
        match opcode {
            0x00 => {}
            0x01 => self.push(Null),
            0x02..=0x08 | opcodes::BIPUSH | opcodes::SIPUSH => self.push(Integer),
            0x09 | 0x0a => self.push(Long),
            0x0b..=0x0d => self.push(Float),
            0x0e | 0x0f => self.push(Double),
            opcodes::LDC => {
                let ty = constant_type(u16::from(operand_u8()?), constant_pool)?;
                self.push(ty);
            }
            opcodes::LDC_W | opcodes::LDC2_W => {
                let ty = constant_type(operand_u16()?, constant_pool)?;
                self.push(ty);
            }
            0x15 => self.push(Integer),
            0x16 => self.push(Long),
            0x17 => self.push(Float),
            0x18 => self.push(Double),
            0x19 => self.push(self.load(usize::from(operand_u8()?))?),
            0x1a..=0x1d => self.push(Integer),
            0x1e..=0x21 => self.push(Long),
            0x22..=0x25 => self.push(Float),
            0x26..=0x29 => self.push(Double),
            0x2a..=0x2d => self.push(self.load(usize::from(opcode - 0x2a))?),
            0x2e | 0x33..=0x35 => self.binary(Integer)?,
            0x2f => self.binary(Long)?,
            0x30 => self.binary(Float)?,
            0x31 => self.binary(Double)?,
            0x32 => {
                self.pop()?;
                let array = self.pop()?;
                let component = component_type(array, constant_pool)?;
                self.push(component);
            }
            0x36..=0x3a => {
                let value = self.pop()?;
                self.store(usize::from(operand_u8()?), value);
            }
            0x3b..=0x4e => {
                let value = self.pop()?;
                self.store(usize::from((opcode - 0x3b) % 4), value);
            }
            0x4f..=0x56 => self.pop_n(3)?,
            0x57 => {
                self.take_words(1)?;
            }
            0x58 => {
                self.take_words(2)?;
            }
            0x59..=0x5e => {
                let (top_words, under_words) = match opcode {
                    0x59 => (1, 0),
                    0x5a => (1, 1),
                    0x5b => (1, 2),
                    0x5c => (2, 0),
                    0x5d => (2, 1),
                    _ => (2, 2),
                };
                let top = self.take_words(top_words)?;
                let under = self.take_words(under_words)?;
                self.stack.extend(&top);
                self.stack.extend(under);
                self.stack.extend(top);
            }
            0x5f => {
                let top = self.take_words(1)?;
                let under = self.take_words(1)?;
                self.stack.extend(top);
                self.stack.extend(under);
            }
            0x60..=0x73 => self.binary([Integer, Long, Float, Double][usize::from(opcode % 4)])?,
            0x74..=0x77 => {
                self.pop()?;
                self.push([Integer, Long, Float, Double][usize::from(opcode - 0x74)]);
            }
            0x78..=0x83 => self.binary(if opcode % 2 == 0 { Integer } else { Long })?,
            opcodes::IINC => {}
            0x85..=0x93 => {
                self.pop()?;
                self.push(match opcode {
                    0x85 | 0x8c | 0x8f => Long,
                    0x86 | 0x89 | 0x90 => Float,
                    0x87 | 0x8a | 0x8d => Double,
                    _ => Integer,
                });
            }
            0x94..=0x98 => self.binary(Integer)?,
            opcodes::IFEQ..=0x9e | opcodes::IFNULL | opcodes::IFNONNULL => {
                self.pop()?;
            }
            0x9f..=opcodes::IF_ACMPNE => self.pop_n(2)?,
            0xb2 | 0xb4 => {
                if opcode == 0xb4 {
                    self.pop()?;
                }
                let descriptor = member_descriptor(operand_u16()?, constant_pool)?;
                if let Some(ty) = field_type(&descriptor, constant_pool)? {
                    self.push(ty);
                }
            }
            0xb3 => {
                self.pop()?;
            }
            0xb5 => self.pop_n(2)?,
            opcodes::INVOKEVIRTUAL
            | opcodes::INVOKESPECIAL
            | opcodes::INVOKESTATIC
            | opcodes::INVOKEINTERFACE => {
                let method = constant_pool.method_ref(operand_u16()?)?;
                let descriptor = MethodDescriptor::from_str(&method.descriptor)
                    .with_context(|| format!("parse method descriptor {}", method.descriptor))?;
                self.pop_n(descriptor.parameter_types().len())?;
                if opcode != opcodes::INVOKESTATIC {
                    let receiver = self.pop()?;
                    if opcode == opcodes::INVOKESPECIAL && method.name == "<init>" {
                        // A constructor chaining to `super` still initializes this class.
                        let class_index = match receiver {
                            VerificationType::UninitializedThis => self.this_class,
                            _ => method.class_index,
                        };
                        self.initialize(receiver, Object(class_index));
                    }
                }
                if let Some(ty) = value_type(descriptor.return_type(), constant_pool)? {
                    self.push(ty);
                }
            }
            opcodes::INVOKEDYNAMIC => {
                let descriptor = member_descriptor(operand_u16()?, constant_pool)?;
                let descriptor = MethodDescriptor::from_str(&descriptor)
                    .with_context(|| format!("parse method descriptor {descriptor}"))?;
                self.pop_n(descriptor.parameter_types().len())?;
                if let Some(ty) = value_type(descriptor.return_type(), constant_pool)? {
                    self.push(ty);
                }
            }
            0xbb => {
                let offset = u16::try_from(at).context("new beyond 65535")?;
                self.push(VerificationType::Uninitialized(offset));
            }
            0xbc => {
                self.pop()?;
                let name = match operand_u8()? {
                    4 => "[Z",
                    5 => "[C",
                    6 => "[F",
                    7 => "[D",
                    8 => "[B",
                    9 => "[S",
                    10 => "[I",
                    11 => "[J",
                    other => anyhow::bail!("invalid newarray type {other}"),
                };
                self.push(Object(constant_pool.add_class(name)?));
            }
            0xbd => {
                self.pop()?;
                let element = constant_pool.class_name(operand_u16()?)?;
                let name = if element.starts_with('[') {
                    format!("[{element}")
                } else {
                    format!("[L{element};")
                };
                self.push(Object(constant_pool.add_class(&name)?));
            }
            0xbe | 0xc1 => {
                self.pop()?;
                self.push(Integer);
            }
            0xc0 => {
                self.pop()?;
                self.push(Object(operand_u16()?));
            }
            0xc2 | 0xc3 => {
                self.pop()?;
            }
            opcodes::WIDE => {
                let inner = code.get(at + 1).copied().context("missing wide opcode")?;
                let slot = usize::from(read_u16(code, at + 2)?);
                match inner {
                    0x15 => self.push(Integer),
                    0x16 => self.push(Long),
                    0x17 => self.push(Float),
                    0x18 => self.push(Double),
                    0x19 => self.push(self.load(slot)?),
                    0x36..=0x3a => {
                        let value = self.pop()?;
                        self.store(slot, value);
                    }
                    opcodes::IINC => {}
                    _ => anyhow::bail!("unsupported wide opcode 0x{inner:02x}"),
                }
            }
            0xc5 => {
                let dimensions = code.get(at + 3).copied().context("missing dimensions")?;
                self.pop_n(usize::from(dimensions))?;
                self.push(Object(operand_u16()?));
            }
            _ => anyhow::bail!(
                "opcode 0x{opcode:02x} at offset {at} leaves straight-line code without a frame"
            ),
        }
        Ok(())
    }

    fn binary(&mut self, result: VerificationType) -> Result<()> {
        self.pop_n(2)?;
        self.push(result);
        Ok(())
    }
}

/// Type pushed by `ldc`, `ldc_w` or `ldc2_w`.
fn constant_type(index: u16, constant_pool: &mut ConstantPool) -> Result<VerificationType> {
    let class = match constant_pool.get(index)? {
        Constant::Integer(_) => return Ok(VerificationType::Integer),
        Constant::Float(_) => return Ok(VerificationType::Float),
        Constant::Long(_) => return Ok(VerificationType::Long),
        Constant::Double(_) => return Ok(VerificationType::Double),
        Constant::String { .. } => "java/lang/String",
        Constant::Class { .. } => "java/lang/Class",
        Constant::MethodType { .. } => "java/lang/invoke/MethodType",
        Constant::MethodHandle { .. } => "java/lang/invoke/MethodHandle",
        Constant::Dynamic { .. } => {
            let descriptor = member_descriptor(index, constant_pool)?;
            return field_type(&descriptor, constant_pool)?
                .context("dynamic constant of type void");
        }
        other => anyhow::bail!("constant pool entry {index} is not loadable: {other:?}"),
    };
    Ok(VerificationType::Object(constant_pool.add_class(class)?))
}

/// Descriptor of a field, method, or dynamic reference.
fn member_descriptor(index: u16, constant_pool: &ConstantPool) -> Result<String> {
    let name_and_type_index = match constant_pool.get(index)? {
        Constant::Fieldref {
            name_and_type_index,
            ..
        }
        | Constant::Dynamic {
            name_and_type_index,
            ..
        }
        | Constant::InvokeDynamic {
            name_and_type_index,
            ..
        } => *name_and_type_index,
        other => anyhow::bail!("constant pool entry {index} is not a member reference: {other:?}"),
    };
    let (_, descriptor) = constant_pool.name_and_type(name_and_type_index)?;
    Ok(descriptor)
}

/// Element type read by `aaload` from an array of the given type.
fn component_type(
    array: VerificationType,
    constant_pool: &mut ConstantPool,
) -> Result<VerificationType> {
    match array {
        VerificationType::Null => Ok(VerificationType::Null),
        VerificationType::Object(index) => {
            let name = constant_pool.class_name(index)?;
            let component = name
                .strip_prefix('[')
                .with_context(|| format!("aaload from non-array {name}"))?;
            field_type(component, constant_pool)?.context("array of void")
        }
        other => anyhow::bail!("aaload from {other:?}"),
    }
}
