//! Fixture assembler for synthetic class files used across unit tests.

use crate::classfile::code::{CodeAttribute, ExceptionEntry, LineNumber, write_line_numbers};
use crate::classfile::{Attribute, ClassFile, ConstantPool, Member};
use crate::opcodes;

const ACC_PUBLIC: u16 = 0x0001;
const ACC_SUPER: u16 = 0x0020;

pub(crate) struct ClassBuilder {
    pool: ConstantPool,
    this_class: u16,
    super_class: u16,
    methods: Vec<Member>,
    attributes: Vec<Attribute>,
}

/// Body of one synthetic method.
pub(crate) struct MethodBody {
    pub(crate) code: Vec<u8>,
    pub(crate) max_stack: u16,
    pub(crate) lines: Vec<(u16, u16)>,
    pub(crate) exception_table: Vec<ExceptionEntry>,
    /// Extra Code attributes as `(name, info)`.
    pub(crate) attributes: Vec<(&'static str, Vec<u8>)>,
}

impl MethodBody {
    pub(crate) fn new(code: Vec<u8>) -> Self {
        Self {
            code,
            max_stack: 4,
            lines: Vec::new(),
            exception_table: Vec::new(),
            attributes: Vec::new(),
        }
    }

    pub(crate) fn lines(mut self, lines: &[(u16, u16)]) -> Self {
        self.lines = lines.to_vec();
        self
    }
}

impl ClassBuilder {
    pub(crate) fn new(name: &str, source_file: Option<&str>) -> Self {
        let mut pool = ConstantPool::new();
        let this_class = pool.add_class(name).expect("this class");
        let super_class = pool.add_class("java/lang/Object").expect("super class");
        let mut attributes = Vec::new();
        if let Some(source_file) = source_file {
            let name_index = pool.add_utf8("SourceFile").expect("attribute name");
            let value = pool.add_utf8(source_file).expect("source file");
            attributes.push(Attribute {
                name_index,
                info: value.to_be_bytes().to_vec(),
            });
        }
        Self {
            pool,
            this_class,
            super_class,
            methods: Vec::new(),
            attributes,
        }
    }

    pub(crate) fn pool(&mut self) -> &mut ConstantPool {
        &mut self.pool
    }

    pub(crate) fn method_ref(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
        is_interface: bool,
    ) -> u16 {
        let class_index = self.pool.add_class(owner).expect("owner class");
        self.pool
            .add_method_ref(class_index, name, descriptor, is_interface)
            .expect("method ref")
    }

    pub(crate) fn method(
        &mut self,
        name: &str,
        descriptor: &str,
        code: Vec<u8>,
        lines: Vec<(u16, u16)>,
    ) {
        self.method_with(name, descriptor, MethodBody::new(code).lines(&lines));
    }

    pub(crate) fn method_with(&mut self, name: &str, descriptor: &str, body: MethodBody) {
        let mut code_attributes = Vec::new();
        if !body.lines.is_empty() {
            let lines: Vec<LineNumber> = body
                .lines
                .iter()
                .map(|(start_pc, line)| LineNumber {
                    start_pc: *start_pc,
                    line: *line,
                })
                .collect();
            code_attributes.push(Attribute {
                name_index: self.pool.add_utf8("LineNumberTable").expect("name"),
                info: write_line_numbers(&lines).expect("line table"),
            });
        }
        for (attribute_name, info) in body.attributes {
            code_attributes.push(Attribute {
                name_index: self.pool.add_utf8(attribute_name).expect("name"),
                info,
            });
        }
        let code = CodeAttribute {
            max_stack: body.max_stack,
            max_locals: 4,
            code: body.code,
            exception_table: body.exception_table,
            attributes: code_attributes,
        };
        let member = Member {
            access_flags: ACC_PUBLIC,
            name_index: self.pool.add_utf8(name).expect("method name"),
            descriptor_index: self.pool.add_utf8(descriptor).expect("method descriptor"),
            attributes: vec![Attribute {
                name_index: self.pool.add_utf8("Code").expect("Code"),
                info: code.to_bytes().expect("code bytes"),
            }],
        };
        self.methods.push(member);
    }

    pub(crate) fn build(&self) -> Vec<u8> {
        ClassFile {
            minor_version: 0,
            major_version: 52,
            constant_pool: self.pool.clone(),
            access_flags: ACC_PUBLIC | ACC_SUPER,
            this_class: self.this_class,
            super_class: self.super_class,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: self.methods.clone(),
            attributes: self.attributes.clone(),
        }
        .to_bytes()
        .expect("class bytes")
    }
}

/// Encode an invoke instruction; `count` is only used for `invokeinterface`.
pub(crate) fn invoke(opcode: u8, method_index: u16, count: u8) -> Vec<u8> {
    let [hi, lo] = method_index.to_be_bytes();
    if opcode == opcodes::INVOKEINTERFACE {
        vec![opcode, hi, lo, count, 0]
    } else {
        vec![opcode, hi, lo]
    }
}

/// Decoded `Code` attribute of the named method.
pub(crate) fn method_code(bytes: &[u8], name: &str) -> CodeAttribute {
    let class = ClassFile::parse(bytes).expect("parse class");
    let method = class
        .methods
        .iter()
        .find(|method| method.name(&class.constant_pool).expect("name") == name)
        .expect("method present");
    let attribute =
        crate::classfile::find_attribute(&class.constant_pool, &method.attributes, "Code")
            .expect("attributes")
            .expect("Code attribute");
    CodeAttribute::parse(&attribute.info).expect("parse code")
}
