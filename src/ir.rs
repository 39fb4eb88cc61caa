use crate::opcodes;
use crate::signature::MethodKey;

/// Bytecode instruction decoded from a method body.
#[derive(Clone, Debug)]
pub(crate) struct Instruction {
    pub(crate) offset: u32,
    pub(crate) length: u32,
    pub(crate) opcode: u8,
    pub(crate) kind: InstructionKind,
}

/// Instruction categories the rewriter treats differently. Branch and switch
/// targets are absolute offsets in the original code.
#[derive(Clone, Debug)]
pub(crate) enum InstructionKind {
    Invoke(CallSite),
    Branch {
        target: u32,
    },
    TableSwitch {
        default: u32,
        low: i32,
        high: i32,
        targets: Vec<u32>,
    },
    LookupSwitch {
        default: u32,
        pairs: Vec<(i32, u32)>,
    },
    Other,
}

/// Call site extracted from bytecode.
#[derive(Clone, Debug)]
pub(crate) struct CallSite {
    pub(crate) owner: String,
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) kind: CallKind,
    pub(crate) is_interface: bool,
    /// Constant pool index of the class entry the method ref points at.
    pub(crate) class_index: u16,
    pub(crate) offset: u32,
}

/// Dispatch kind of an invocation instruction.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub(crate) enum CallKind {
    Virtual,
    Interface,
    Special,
    Static,
}

impl CallSite {
    pub(crate) fn key(&self) -> MethodKey {
        MethodKey::new(
            self.kind,
            &self.owner,
            &self.name,
            &self.descriptor,
            self.is_interface,
        )
    }
}

impl CallKind {
    pub(crate) fn from_opcode(opcode: u8) -> Option<Self> {
        match opcode {
            opcodes::INVOKEVIRTUAL => Some(CallKind::Virtual),
            opcodes::INVOKEINTERFACE => Some(CallKind::Interface),
            opcodes::INVOKESPECIAL => Some(CallKind::Special),
            opcodes::INVOKESTATIC => Some(CallKind::Static),
            _ => None,
        }
    }
}
