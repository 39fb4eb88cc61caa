use std::collections::HashMap;

use anyhow::{Context, Result};

use crate::classfile::mutf8;
use crate::classfile::reader::{put_u8, put_u16, put_u32, read_bytes, read_u8, read_u16, read_u32};

/// Raw constant pool entry. UTF-8 payloads keep their modified UTF-8 bytes so
/// an untouched pool serializes byte-for-byte.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub(crate) enum Constant {
    /// Index 0 and the slot following a long or double.
    Unusable,
    Utf8(Vec<u8>),
    Integer(i32),
    Float(u32),
    Long(u64),
    Double(u64),
    Class {
        name_index: u16,
    },
    String {
        string_index: u16,
    },
    Fieldref {
        class_index: u16,
        name_and_type_index: u16,
    },
    Methodref {
        class_index: u16,
        name_and_type_index: u16,
    },
    InterfaceMethodref {
        class_index: u16,
        name_and_type_index: u16,
    },
    NameAndType {
        name_index: u16,
        descriptor_index: u16,
    },
    MethodHandle {
        reference_kind: u8,
        reference_index: u16,
    },
    MethodType {
        descriptor_index: u16,
    },
    Dynamic {
        bootstrap_method_attr_index: u16,
        name_and_type_index: u16,
    },
    InvokeDynamic {
        bootstrap_method_attr_index: u16,
        name_and_type_index: u16,
    },
    Module {
        name_index: u16,
    },
    Package {
        name_index: u16,
    },
}

/// Method reference resolved from a `Methodref` or `InterfaceMethodref` entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct MemberRef {
    pub(crate) class_index: u16,
    pub(crate) owner: String,
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) is_interface: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ConstantPool {
    entries: Vec<Constant>,
    /// First index holding each entry, used to deduplicate additions.
    index: HashMap<Constant, u16>,
}

impl ConstantPool {
    pub(crate) fn parse(data: &[u8], offset: &mut usize) -> Result<Self> {
        let count = read_u16(data, offset)?;
        if count == 0 {
            anyhow::bail!("constant pool count must be at least 1");
        }
        let mut entries = Vec::with_capacity(count as usize);
        entries.push(Constant::Unusable);
        while entries.len() < count as usize {
            let index = entries.len();
            let tag = read_u8(data, offset)?;
            let entry = match tag {
                1 => {
                    let len = read_u16(data, offset)? as usize;
                    Constant::Utf8(read_bytes(data, offset, len)?.to_vec())
                }
                3 => Constant::Integer(read_u32(data, offset)? as i32),
                4 => Constant::Float(read_u32(data, offset)?),
                5 | 6 => {
                    let high = read_u32(data, offset)? as u64;
                    let low = read_u32(data, offset)? as u64;
                    let bits = (high << 32) | low;
                    if index + 1 >= count as usize {
                        anyhow::bail!("8-byte constant at index {index} overruns the pool");
                    }
                    if tag == 5 {
                        Constant::Long(bits)
                    } else {
                        Constant::Double(bits)
                    }
                }
                7 => Constant::Class {
                    name_index: read_u16(data, offset)?,
                },
                8 => Constant::String {
                    string_index: read_u16(data, offset)?,
                },
                9 | 10 | 11 => {
                    let class_index = read_u16(data, offset)?;
                    let name_and_type_index = read_u16(data, offset)?;
                    match tag {
                        9 => Constant::Fieldref {
                            class_index,
                            name_and_type_index,
                        },
                        10 => Constant::Methodref {
                            class_index,
                            name_and_type_index,
                        },
                        _ => Constant::InterfaceMethodref {
                            class_index,
                            name_and_type_index,
                        },
                    }
                }
                12 => Constant::NameAndType {
                    name_index: read_u16(data, offset)?,
                    descriptor_index: read_u16(data, offset)?,
                },
                15 => Constant::MethodHandle {
                    reference_kind: read_u8(data, offset)?,
                    reference_index: read_u16(data, offset)?,
                },
                16 => Constant::MethodType {
                    descriptor_index: read_u16(data, offset)?,
                },
                17 | 18 => {
                    let bootstrap_method_attr_index = read_u16(data, offset)?;
                    let name_and_type_index = read_u16(data, offset)?;
                    if tag == 17 {
                        Constant::Dynamic {
                            bootstrap_method_attr_index,
                            name_and_type_index,
                        }
                    } else {
                        Constant::InvokeDynamic {
                            bootstrap_method_attr_index,
                            name_and_type_index,
                        }
                    }
                }
                19 => Constant::Module {
                    name_index: read_u16(data, offset)?,
                },
                20 => Constant::Package {
                    name_index: read_u16(data, offset)?,
                },
                _ => anyhow::bail!("unsupported constant pool tag {tag} at index {index}"),
            };
            let wide = matches!(entry, Constant::Long(_) | Constant::Double(_));
            entries.push(entry);
            if wide {
                entries.push(Constant::Unusable);
            }
        }
        Ok(Self::from_entries(entries))
    }

    fn from_entries(entries: Vec<Constant>) -> Self {
        let mut index = HashMap::with_capacity(entries.len());
        for (position, entry) in entries.iter().enumerate() {
            if *entry != Constant::Unusable {
                // `parse` bounds the entry count by a u16.
                index.entry(entry.clone()).or_insert(position as u16);
            }
        }
        Self { entries, index }
    }

    pub(crate) fn write(&self, out: &mut Vec<u8>) {
        // `push` keeps the length within u16 range.
        put_u16(out, self.entries.len() as u16);
        for entry in &self.entries {
            match entry {
                Constant::Unusable => {}
                Constant::Utf8(bytes) => {
                    put_u8(out, 1);
                    put_u16(out, bytes.len() as u16);
                    out.extend_from_slice(bytes);
                }
                Constant::Integer(value) => {
                    put_u8(out, 3);
                    put_u32(out, *value as u32);
                }
                Constant::Float(bits) => {
                    put_u8(out, 4);
                    put_u32(out, *bits);
                }
                Constant::Long(bits) | Constant::Double(bits) => {
                    let tag = if matches!(entry, Constant::Long(_)) { 5 } else { 6 };
                    put_u8(out, tag);
                    put_u32(out, (bits >> 32) as u32);
                    put_u32(out, *bits as u32);
                }
                Constant::Class { name_index } => {
                    put_u8(out, 7);
                    put_u16(out, *name_index);
                }
                Constant::String { string_index } => {
                    put_u8(out, 8);
                    put_u16(out, *string_index);
                }
                Constant::Fieldref {
                    class_index,
                    name_and_type_index,
                } => {
                    put_u8(out, 9);
                    put_u16(out, *class_index);
                    put_u16(out, *name_and_type_index);
                }
                Constant::Methodref {
                    class_index,
                    name_and_type_index,
                } => {
                    put_u8(out, 10);
                    put_u16(out, *class_index);
                    put_u16(out, *name_and_type_index);
                }
                Constant::InterfaceMethodref {
                    class_index,
                    name_and_type_index,
                } => {
                    put_u8(out, 11);
                    put_u16(out, *class_index);
                    put_u16(out, *name_and_type_index);
                }
                Constant::NameAndType {
                    name_index,
                    descriptor_index,
                } => {
                    put_u8(out, 12);
                    put_u16(out, *name_index);
                    put_u16(out, *descriptor_index);
                }
                Constant::MethodHandle {
                    reference_kind,
                    reference_index,
                } => {
                    put_u8(out, 15);
                    put_u8(out, *reference_kind);
                    put_u16(out, *reference_index);
                }
                Constant::MethodType { descriptor_index } => {
                    put_u8(out, 16);
                    put_u16(out, *descriptor_index);
                }
                Constant::Dynamic {
                    bootstrap_method_attr_index,
                    name_and_type_index,
                } => {
                    put_u8(out, 17);
                    put_u16(out, *bootstrap_method_attr_index);
                    put_u16(out, *name_and_type_index);
                }
                Constant::InvokeDynamic {
                    bootstrap_method_attr_index,
                    name_and_type_index,
                } => {
                    put_u8(out, 18);
                    put_u16(out, *bootstrap_method_attr_index);
                    put_u16(out, *name_and_type_index);
                }
                Constant::Module { name_index } => {
                    put_u8(out, 19);
                    put_u16(out, *name_index);
                }
                Constant::Package { name_index } => {
                    put_u8(out, 20);
                    put_u16(out, *name_index);
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn get(&self, index: u16) -> Result<&Constant> {
        match self.entries.get(index as usize) {
            None | Some(Constant::Unusable) => {
                anyhow::bail!("invalid constant pool index {index}")
            }
            Some(entry) => Ok(entry),
        }
    }

    pub(crate) fn utf8(&self, index: u16) -> Result<String> {
        match self.get(index)? {
            Constant::Utf8(bytes) => {
                mutf8::decode(bytes).with_context(|| format!("decode utf8 entry {index}"))
            }
            _ => anyhow::bail!("constant pool entry {index} is not utf8"),
        }
    }

    pub(crate) fn class_name(&self, index: u16) -> Result<String> {
        match self.get(index)? {
            Constant::Class { name_index } => self.utf8(*name_index),
            _ => anyhow::bail!("constant pool entry {index} is not a class"),
        }
    }

    pub(crate) fn name_and_type(&self, index: u16) -> Result<(String, String)> {
        match self.get(index)? {
            Constant::NameAndType {
                name_index,
                descriptor_index,
            } => Ok((self.utf8(*name_index)?, self.utf8(*descriptor_index)?)),
            _ => anyhow::bail!("constant pool entry {index} is not a name and type"),
        }
    }

    pub(crate) fn method_ref(&self, index: u16) -> Result<MemberRef> {
        let (class_index, name_and_type_index, is_interface) = match self.get(index)? {
            Constant::Methodref {
                class_index,
                name_and_type_index,
            } => (*class_index, *name_and_type_index, false),
            Constant::InterfaceMethodref {
                class_index,
                name_and_type_index,
            } => (*class_index, *name_and_type_index, true),
            _ => anyhow::bail!("constant pool entry {index} is not a method ref"),
        };
        let owner = self.class_name(class_index).context("resolve owner")?;
        let (name, descriptor) = self
            .name_and_type(name_and_type_index)
            .context("resolve name and type")?;
        Ok(MemberRef {
            class_index,
            owner,
            name,
            descriptor,
            is_interface,
        })
    }

    pub(crate) fn add_utf8(&mut self, value: &str) -> Result<u16> {
        let bytes = mutf8::encode(value);
        if bytes.len() > u16::MAX as usize {
            anyhow::bail!("utf8 constant too long ({} bytes)", bytes.len());
        }
        self.intern(Constant::Utf8(bytes))
    }

    pub(crate) fn add_class(&mut self, name: &str) -> Result<u16> {
        let name_index = self.add_utf8(name)?;
        self.intern(Constant::Class { name_index })
    }

    pub(crate) fn add_string(&mut self, value: &str) -> Result<u16> {
        let string_index = self.add_utf8(value)?;
        self.intern(Constant::String { string_index })
    }

    pub(crate) fn add_integer(&mut self, value: i32) -> Result<u16> {
        self.intern(Constant::Integer(value))
    }

    pub(crate) fn add_name_and_type(&mut self, name: &str, descriptor: &str) -> Result<u16> {
        let name_index = self.add_utf8(name)?;
        let descriptor_index = self.add_utf8(descriptor)?;
        self.intern(Constant::NameAndType {
            name_index,
            descriptor_index,
        })
    }

    /// Add a method reference against an existing class entry.
    pub(crate) fn add_method_ref(
        &mut self,
        class_index: u16,
        name: &str,
        descriptor: &str,
        is_interface: bool,
    ) -> Result<u16> {
        let name_and_type_index = self.add_name_and_type(name, descriptor)?;
        let entry = if is_interface {
            Constant::InterfaceMethodref {
                class_index,
                name_and_type_index,
            }
        } else {
            Constant::Methodref {
                class_index,
                name_and_type_index,
            }
        };
        self.intern(entry)
    }

    fn intern(&mut self, entry: Constant) -> Result<u16> {
        if let Some(&index) = self.index.get(&entry) {
            return Ok(index);
        }
        self.push(entry)
    }

    fn push(&mut self, entry: Constant) -> Result<u16> {
        let index = self.entries.len();
        if index >= u16::MAX as usize {
            anyhow::bail!("constant pool is full (65535 entries)");
        }
        self.index.insert(entry.clone(), index as u16);
        self.entries.push(entry);
        Ok(index as u16)
    }
}

#[cfg(test)]
impl ConstantPool {
    pub(crate) fn new() -> Self {
        Self::from_entries(vec![Constant::Unusable])
    }
}
