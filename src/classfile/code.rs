use anyhow::{Context, Result};

use crate::classfile::reader::{put_u16, put_u32, read_bytes, read_u16, read_u32, to_u16, to_u32};
use crate::classfile::{
    Attribute, ConstantPool, parse_attributes, stack_map, type_annotations, write_attributes,
};

/// Decoded `Code` attribute.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct CodeAttribute {
    pub(crate) max_stack: u16,
    pub(crate) max_locals: u16,
    pub(crate) code: Vec<u8>,
    pub(crate) exception_table: Vec<ExceptionEntry>,
    pub(crate) attributes: Vec<Attribute>,
}

/// Exception table record from the Code attribute.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct ExceptionEntry {
    pub(crate) start_pc: u16,
    pub(crate) end_pc: u16,
    pub(crate) handler_pc: u16,
    pub(crate) catch_type: u16,
}

/// `LineNumberTable` record.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct LineNumber {
    pub(crate) start_pc: u16,
    pub(crate) line: u16,
}

/// `LocalVariableTable` / `LocalVariableTypeTable` record. The third field is
/// a descriptor index in the former and a signature index in the latter.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct LocalVariable {
    start_pc: u16,
    length: u16,
    name_index: u16,
    type_index: u16,
    index: u16,
}

/// Maps instruction start offsets of the original code to offsets in the
/// relaid code. The original code length maps to the new code length.
#[derive(Clone, Debug)]
pub(crate) struct OffsetMap {
    targets: Vec<u32>,
}

const NOT_AN_INSTRUCTION: u32 = u32::MAX;

impl OffsetMap {
    pub(crate) fn new(old_code_len: usize) -> Self {
        Self {
            targets: vec![NOT_AN_INSTRUCTION; old_code_len + 1],
        }
    }

    pub(crate) fn insert(&mut self, old: u32, new: u32) {
        self.targets[old as usize] = new;
    }

    pub(crate) fn map(&self, old: u32) -> Result<u32> {
        match self.targets.get(old as usize) {
            Some(&new) if new != NOT_AN_INSTRUCTION => Ok(new),
            _ => anyhow::bail!("offset {old} is not an instruction boundary"),
        }
    }

    pub(crate) fn map_u16(&self, old: u16) -> Result<u16> {
        let new = self.map(old as u32)?;
        u16::try_from(new).with_context(|| format!("relocated offset {new} exceeds 65535"))
    }

    /// Relocate a `[start, start + length)` range given in original offsets.
    pub(crate) fn map_range(&self, start: u16, length: u16) -> Result<(u16, u16)> {
        let end = start as u32 + length as u32;
        let new_start = self.map_u16(start)?;
        let new_end = self.map(end)?;
        let new_length = new_end
            .checked_sub(new_start as u32)
            .context("relocated range is inverted")?;
        Ok((new_start, to_u16(new_length as usize, "relocated range length")?))
    }
}

impl CodeAttribute {
    pub(crate) fn parse(info: &[u8]) -> Result<Self> {
        let mut offset = 0usize;
        let max_stack = read_u16(info, &mut offset)?;
        let max_locals = read_u16(info, &mut offset)?;
        let code_length = read_u32(info, &mut offset)? as usize;
        if code_length == 0 || code_length > u16::MAX as usize {
            anyhow::bail!("invalid code length {code_length}");
        }
        let code = read_bytes(info, &mut offset, code_length)?.to_vec();
        let handler_count = read_u16(info, &mut offset)?;
        let mut exception_table = Vec::with_capacity(handler_count as usize);
        for _ in 0..handler_count {
            exception_table.push(ExceptionEntry {
                start_pc: read_u16(info, &mut offset)?,
                end_pc: read_u16(info, &mut offset)?,
                handler_pc: read_u16(info, &mut offset)?,
                catch_type: read_u16(info, &mut offset)?,
            });
        }
        let attributes = parse_attributes(info, &mut offset).context("parse code attributes")?;
        if offset != info.len() {
            anyhow::bail!("{} trailing bytes in Code attribute", info.len() - offset);
        }
        Ok(Self {
            max_stack,
            max_locals,
            code,
            exception_table,
            attributes,
        })
    }

    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.code.len() + 32);
        put_u16(&mut out, self.max_stack);
        put_u16(&mut out, self.max_locals);
        put_u32(&mut out, to_u32(self.code.len(), "code length")?);
        out.extend_from_slice(&self.code);
        put_u16(
            &mut out,
            to_u16(self.exception_table.len(), "exception table length")?,
        );
        for entry in &self.exception_table {
            put_u16(&mut out, entry.start_pc);
            put_u16(&mut out, entry.end_pc);
            put_u16(&mut out, entry.handler_pc);
            put_u16(&mut out, entry.catch_type);
        }
        write_attributes(&mut out, &self.attributes)?;
        Ok(out)
    }

    /// All line number records of the method, ordered by start pc. Records
    /// sharing a pc keep their table order.
    pub(crate) fn line_numbers(&self, constant_pool: &ConstantPool) -> Result<Vec<LineNumber>> {
        let mut lines = Vec::new();
        for attribute in &self.attributes {
            if constant_pool.utf8(attribute.name_index)? != "LineNumberTable" {
                continue;
            }
            lines.extend(parse_line_numbers(&attribute.info).context("parse LineNumberTable")?);
        }
        lines.sort_by_key(|line| line.start_pc);
        Ok(lines)
    }

    /// Rewrite every offset-bearing part of the attribute after the code
    /// array has been replaced by a relaid copy.
    pub(crate) fn relocate(&mut self, constant_pool: &ConstantPool, map: &OffsetMap) -> Result<()> {
        for entry in &mut self.exception_table {
            entry.start_pc = map.map_u16(entry.start_pc).context("relocate handler start")?;
            entry.end_pc = map.map_u16(entry.end_pc).context("relocate handler end")?;
            entry.handler_pc = map.map_u16(entry.handler_pc).context("relocate handler pc")?;
        }
        for attribute in &mut self.attributes {
            let name = constant_pool.utf8(attribute.name_index)?;
            attribute.info = match name.as_str() {
                "LineNumberTable" => {
                    relocate_line_numbers(&attribute.info, map).context("relocate LineNumberTable")?
                }
                "LocalVariableTable" | "LocalVariableTypeTable" => {
                    relocate_local_variables(&attribute.info, map)
                        .with_context(|| format!("relocate {name}"))?
                }
                "StackMapTable" => {
                    stack_map::relocate(&attribute.info, map).context("relocate StackMapTable")?
                }
                "RuntimeVisibleTypeAnnotations" | "RuntimeInvisibleTypeAnnotations" => {
                    type_annotations::relocate(&attribute.info, map)
                        .with_context(|| format!("relocate {name}"))?
                }
                _ => continue,
            };
        }
        Ok(())
    }
}

pub(crate) fn parse_line_numbers(info: &[u8]) -> Result<Vec<LineNumber>> {
    let mut offset = 0usize;
    let count = read_u16(info, &mut offset)?;
    let mut lines = Vec::with_capacity(count as usize);
    for _ in 0..count {
        lines.push(LineNumber {
            start_pc: read_u16(info, &mut offset)?,
            line: read_u16(info, &mut offset)?,
        });
    }
    Ok(lines)
}

pub(crate) fn write_line_numbers(lines: &[LineNumber]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(2 + lines.len() * 4);
    put_u16(&mut out, to_u16(lines.len(), "line number count")?);
    for line in lines {
        put_u16(&mut out, line.start_pc);
        put_u16(&mut out, line.line);
    }
    Ok(out)
}

fn relocate_line_numbers(info: &[u8], map: &OffsetMap) -> Result<Vec<u8>> {
    let mut lines = parse_line_numbers(info)?;
    for line in &mut lines {
        line.start_pc = map.map_u16(line.start_pc)?;
    }
    write_line_numbers(&lines)
}

fn relocate_local_variables(info: &[u8], map: &OffsetMap) -> Result<Vec<u8>> {
    let mut offset = 0usize;
    let count = read_u16(info, &mut offset)?;
    let mut variables = Vec::with_capacity(count as usize);
    for _ in 0..count {
        variables.push(LocalVariable {
            start_pc: read_u16(info, &mut offset)?,
            length: read_u16(info, &mut offset)?,
            name_index: read_u16(info, &mut offset)?,
            type_index: read_u16(info, &mut offset)?,
            index: read_u16(info, &mut offset)?,
        });
    }

    let mut out = Vec::with_capacity(info.len());
    put_u16(&mut out, count);
    for variable in variables {
        let (start_pc, length) = map.map_range(variable.start_pc, variable.length)?;
        put_u16(&mut out, start_pc);
        put_u16(&mut out, length);
        put_u16(&mut out, variable.name_index);
        put_u16(&mut out, variable.type_index);
        put_u16(&mut out, variable.index);
    }
    Ok(out)
}
