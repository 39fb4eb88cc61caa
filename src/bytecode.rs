use anyhow::{Context, Result};

use crate::classfile::ConstantPool;
use crate::ir::{CallKind, CallSite, Instruction, InstructionKind};
use crate::opcodes;

/// Decode a method's code array into a linear instruction list.
pub(crate) fn decode(code: &[u8], constant_pool: &ConstantPool) -> Result<Vec<Instruction>> {
    let mut instructions = Vec::new();
    let mut offset = 0usize;
    while offset < code.len() {
        let opcode = code[offset];
        let length = opcode_length(code, offset)?;
        if length == 0 || offset + length > code.len() {
            anyhow::bail!("invalid bytecode length at offset {}", offset);
        }
        let start_offset = offset as u32;
        let kind = match opcode {
            opcodes::INVOKEVIRTUAL
            | opcodes::INVOKESPECIAL
            | opcodes::INVOKESTATIC
            | opcodes::INVOKEINTERFACE => {
                let method_index = read_u16(code, offset + 1)?;
                let method_ref = constant_pool
                    .method_ref(method_index)
                    .with_context(|| format!("resolve method ref at offset {offset}"))?;
                let kind = CallKind::from_opcode(opcode).context("invoke opcode")?;
                InstructionKind::Invoke(CallSite {
                    owner: method_ref.owner,
                    name: method_ref.name,
                    descriptor: method_ref.descriptor,
                    kind,
                    is_interface: method_ref.is_interface,
                    class_index: method_ref.class_index,
                    offset: start_offset,
                })
            }
            opcodes::IFEQ..=opcodes::IF_ACMPNE
            | opcodes::GOTO
            | opcodes::JSR
            | opcodes::IFNULL
            | opcodes::IFNONNULL => {
                let branch = read_i16(code, offset + 1)?;
                InstructionKind::Branch {
                    target: branch_target(offset, branch as i32)?,
                }
            }
            opcodes::GOTO_W | opcodes::JSR_W => {
                let branch = read_i32(code, offset + 1)?;
                InstructionKind::Branch {
                    target: branch_target(offset, branch)?,
                }
            }
            opcodes::TABLESWITCH => decode_tableswitch(code, offset)?,
            opcodes::LOOKUPSWITCH => decode_lookupswitch(code, offset)?,
            _ => InstructionKind::Other,
        };

        instructions.push(Instruction {
            offset: start_offset,
            length: length as u32,
            opcode,
            kind,
        });
        offset += length;
    }
    Ok(instructions)
}

fn branch_target(offset: usize, branch: i32) -> Result<u32> {
    let target = offset as i64 + branch as i64;
    u32::try_from(target).with_context(|| format!("branch at {offset} targets {target}"))
}

fn decode_tableswitch(code: &[u8], offset: usize) -> Result<InstructionKind> {
    let base = offset + 1 + padding(offset);
    let default = branch_target(offset, read_i32(code, base)?)?;
    let low = read_i32(code, base + 4)?;
    let high = read_i32(code, base + 8)?;
    let count = switch_count(low, high)?;
    let mut targets = Vec::with_capacity(count);
    let mut idx = base + 12;
    for _ in 0..count {
        targets.push(branch_target(offset, read_i32(code, idx)?)?);
        idx += 4;
    }
    Ok(InstructionKind::TableSwitch {
        default,
        low,
        high,
        targets,
    })
}

fn decode_lookupswitch(code: &[u8], offset: usize) -> Result<InstructionKind> {
    let base = offset + 1 + padding(offset);
    let default = branch_target(offset, read_i32(code, base)?)?;
    let npairs = read_i32(code, base + 4)?;
    if npairs < 0 {
        anyhow::bail!("invalid lookupswitch pairs");
    }
    let mut pairs = Vec::with_capacity(npairs as usize);
    let mut idx = base + 8;
    for _ in 0..npairs {
        let key = read_i32(code, idx)?;
        let target = branch_target(offset, read_i32(code, idx + 4)?)?;
        pairs.push((key, target));
        idx += 8;
    }
    Ok(InstructionKind::LookupSwitch { default, pairs })
}

fn switch_count(low: i32, high: i32) -> Result<usize> {
    let count = (high as i64) - (low as i64) + 1;
    if count < 0 {
        anyhow::bail!("invalid tableswitch range");
    }
    Ok(count as usize)
}

pub(crate) fn opcode_length(code: &[u8], offset: usize) -> Result<usize> {
    let opcode = code[offset];
    let length = match opcode {
        0x00..=0x0f => 1,
        opcodes::BIPUSH => 2,
        opcodes::SIPUSH => 3,
        opcodes::LDC => 2,
        opcodes::LDC_W | opcodes::LDC2_W => 3,
        0x15..=0x19 => 2,
        0x1a..=0x35 => 1,
        0x36..=0x3a => 2,
        0x3b..=0x83 => 1,
        opcodes::IINC => 3,
        0x85..=0x98 => 1,
        opcodes::IFEQ..=opcodes::IF_ACMPNE => 3,
        opcodes::GOTO | opcodes::JSR => 3,
        opcodes::RET => 2,
        opcodes::TABLESWITCH => tableswitch_length(code, offset)?,
        opcodes::LOOKUPSWITCH => lookupswitch_length(code, offset)?,
        opcodes::IRETURN..=opcodes::RETURN => 1,
        0xb2..=0xb5 => 3,
        opcodes::INVOKEVIRTUAL | opcodes::INVOKESPECIAL | opcodes::INVOKESTATIC => 3,
        opcodes::INVOKEINTERFACE | opcodes::INVOKEDYNAMIC => 5,
        0xbb => 3,
        0xbc => 2,
        0xbd => 3,
        0xbe | 0xbf => 1,
        0xc0 | 0xc1 => 3,
        0xc2 | 0xc3 => 1,
        opcodes::WIDE => wide_length(code, offset)?,
        0xc5 => 4,
        opcodes::IFNULL | opcodes::IFNONNULL => 3,
        opcodes::GOTO_W | opcodes::JSR_W => 5,
        0xca => 1,
        0xfe | 0xff => 1,
        _ => anyhow::bail!("unsupported opcode 0x{:02x} at offset {}", opcode, offset),
    };
    Ok(length)
}

fn tableswitch_length(code: &[u8], offset: usize) -> Result<usize> {
    let padding = padding(offset);
    let base = offset + 1 + padding;
    let low = read_i32(code, base + 4)?;
    let high = read_i32(code, base + 8)?;
    let count = switch_count(low, high)?;
    Ok(1 + padding + 12 + count * 4)
}

fn lookupswitch_length(code: &[u8], offset: usize) -> Result<usize> {
    let padding = padding(offset);
    let base = offset + 1 + padding;
    let npairs = read_i32(code, base + 4)?;
    if npairs < 0 {
        anyhow::bail!("invalid lookupswitch pairs");
    }
    Ok(1 + padding + 8 + (npairs as usize) * 8)
}

fn wide_length(code: &[u8], offset: usize) -> Result<usize> {
    let opcode = code
        .get(offset + 1)
        .copied()
        .context("missing wide opcode")?;
    if opcode == opcodes::IINC { Ok(6) } else { Ok(4) }
}

/// Alignment bytes between a switch opcode at `offset` and its operands.
pub(crate) fn padding(offset: usize) -> usize {
    (4 - ((offset + 1) % 4)) % 4
}

pub(crate) fn read_u16(code: &[u8], offset: usize) -> Result<u16> {
    let slice = code
        .get(offset..offset + 2)
        .context("bytecode u16 out of bounds")?;
    Ok(u16::from_be_bytes([slice[0], slice[1]]))
}

pub(crate) fn read_u32(code: &[u8], offset: usize) -> Result<u32> {
    let slice = code
        .get(offset..offset + 4)
        .context("bytecode u32 out of bounds")?;
    Ok(u32::from_be_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

fn read_i16(code: &[u8], offset: usize) -> Result<i16> {
    let value = read_u16(code, offset)?;
    Ok(i16::from_be_bytes(value.to_be_bytes()))
}

fn read_i32(code: &[u8], offset: usize) -> Result<i32> {
    let value = read_u32(code, offset)?;
    Ok(i32::from_be_bytes(value.to_be_bytes()))
}
