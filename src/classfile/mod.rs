//! Lossless model of the JVM class file container (JVMS chapter 4).
//!
//! Only what the rewriter edits is decoded: the constant pool and, on demand,
//! `Code` attributes. Everything else is carried as raw attribute bytes and
//! written back unchanged, so `parse` followed by `to_bytes` reproduces the
//! input exactly.

use anyhow::{Context, Result};

use crate::classfile::reader::{put_u16, put_u32, read_bytes, read_u16, read_u32, to_u16, to_u32};

pub(crate) mod code;
pub(crate) mod constant_pool;
pub(crate) mod mutf8;
pub(crate) mod reader;
pub(crate) mod stack_map;
pub(crate) mod type_annotations;

pub(crate) use constant_pool::ConstantPool;

const MAGIC: u32 = 0xCAFE_BABE;

/// Attribute kept as its name index plus the undecoded `info` bytes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Attribute {
    pub(crate) name_index: u16,
    pub(crate) info: Vec<u8>,
}

/// Field or method entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Member {
    pub(crate) access_flags: u16,
    pub(crate) name_index: u16,
    pub(crate) descriptor_index: u16,
    pub(crate) attributes: Vec<Attribute>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ClassFile {
    pub(crate) minor_version: u16,
    pub(crate) major_version: u16,
    pub(crate) constant_pool: ConstantPool,
    pub(crate) access_flags: u16,
    pub(crate) this_class: u16,
    pub(crate) super_class: u16,
    pub(crate) interfaces: Vec<u16>,
    pub(crate) fields: Vec<Member>,
    pub(crate) methods: Vec<Member>,
    pub(crate) attributes: Vec<Attribute>,
}

impl ClassFile {
    pub(crate) fn parse(data: &[u8]) -> Result<Self> {
        let mut offset = 0usize;
        let magic = read_u32(data, &mut offset)?;
        if magic != MAGIC {
            anyhow::bail!("invalid class file magic 0x{magic:08x}");
        }
        let minor_version = read_u16(data, &mut offset)?;
        let major_version = read_u16(data, &mut offset)?;
        let constant_pool =
            ConstantPool::parse(data, &mut offset).context("parse constant pool")?;
        let access_flags = read_u16(data, &mut offset)?;
        let this_class = read_u16(data, &mut offset)?;
        let super_class = read_u16(data, &mut offset)?;
        let interface_count = read_u16(data, &mut offset)?;
        let mut interfaces = Vec::with_capacity(interface_count as usize);
        for _ in 0..interface_count {
            interfaces.push(read_u16(data, &mut offset)?);
        }
        let fields = parse_members(data, &mut offset).context("parse fields")?;
        let methods = parse_members(data, &mut offset).context("parse methods")?;
        let attributes = parse_attributes(data, &mut offset).context("parse class attributes")?;
        if offset != data.len() {
            anyhow::bail!(
                "{} trailing bytes after class file",
                data.len() - offset
            );
        }

        Ok(Self {
            minor_version,
            major_version,
            constant_pool,
            access_flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            attributes,
        })
    }

    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        put_u32(&mut out, MAGIC);
        put_u16(&mut out, self.minor_version);
        put_u16(&mut out, self.major_version);
        self.constant_pool.write(&mut out);
        put_u16(&mut out, self.access_flags);
        put_u16(&mut out, self.this_class);
        put_u16(&mut out, self.super_class);
        put_u16(&mut out, to_u16(self.interfaces.len(), "interface count")?);
        for interface in &self.interfaces {
            put_u16(&mut out, *interface);
        }
        write_members(&mut out, &self.fields).context("write fields")?;
        write_members(&mut out, &self.methods).context("write methods")?;
        write_attributes(&mut out, &self.attributes).context("write class attributes")?;
        Ok(out)
    }

    pub(crate) fn class_name(&self) -> Result<String> {
        self.constant_pool
            .class_name(self.this_class)
            .context("resolve this class")
    }

    /// Value of the `SourceFile` attribute, if the class carries one.
    pub(crate) fn source_file(&self) -> Result<Option<String>> {
        let Some(attribute) = find_attribute(&self.constant_pool, &self.attributes, "SourceFile")?
        else {
            return Ok(None);
        };
        let mut offset = 0;
        let index = read_u16(&attribute.info, &mut offset).context("read SourceFile index")?;
        let name = self
            .constant_pool
            .utf8(index)
            .context("resolve SourceFile name")?;
        Ok(Some(name))
    }
}

impl Member {
    pub(crate) fn name(&self, constant_pool: &ConstantPool) -> Result<String> {
        constant_pool.utf8(self.name_index)
    }

    pub(crate) fn descriptor(&self, constant_pool: &ConstantPool) -> Result<String> {
        constant_pool.utf8(self.descriptor_index)
    }
}

/// First attribute named `name`, resolving names through the constant pool.
pub(crate) fn find_attribute<'a>(
    constant_pool: &ConstantPool,
    attributes: &'a [Attribute],
    name: &str,
) -> Result<Option<&'a Attribute>> {
    for attribute in attributes {
        if constant_pool.utf8(attribute.name_index)? == name {
            return Ok(Some(attribute));
        }
    }
    Ok(None)
}

fn parse_members(data: &[u8], offset: &mut usize) -> Result<Vec<Member>> {
    let count = read_u16(data, offset)?;
    let mut members = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let access_flags = read_u16(data, offset)?;
        let name_index = read_u16(data, offset)?;
        let descriptor_index = read_u16(data, offset)?;
        let attributes = parse_attributes(data, offset)?;
        members.push(Member {
            access_flags,
            name_index,
            descriptor_index,
            attributes,
        });
    }
    Ok(members)
}

pub(crate) fn parse_attributes(data: &[u8], offset: &mut usize) -> Result<Vec<Attribute>> {
    let count = read_u16(data, offset)?;
    let mut attributes = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name_index = read_u16(data, offset)?;
        let length = read_u32(data, offset)? as usize;
        let info = read_bytes(data, offset, length)?.to_vec();
        attributes.push(Attribute { name_index, info });
    }
    Ok(attributes)
}

fn write_members(out: &mut Vec<u8>, members: &[Member]) -> Result<()> {
    put_u16(out, to_u16(members.len(), "member count")?);
    for member in members {
        put_u16(out, member.access_flags);
        put_u16(out, member.name_index);
        put_u16(out, member.descriptor_index);
        write_attributes(out, &member.attributes)?;
    }
    Ok(())
}

pub(crate) fn write_attributes(out: &mut Vec<u8>, attributes: &[Attribute]) -> Result<()> {
    put_u16(out, to_u16(attributes.len(), "attribute count")?);
    for attribute in attributes {
        put_u16(out, attribute.name_index);
        put_u32(out, to_u32(attribute.info.len(), "attribute length")?);
        out.extend_from_slice(&attribute.info);
    }
    Ok(())
}
