use std::fmt;

use crate::ir::CallKind;

/// Identity of an invoked method as it appears at a call site: owning class,
/// name, descriptor, dispatch kind and whether the owner is an interface.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub(crate) struct MethodKey {
    pub(crate) owner: String,
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) kind: CallKind,
    pub(crate) is_interface: bool,
}

impl MethodKey {
    pub(crate) fn new(
        kind: CallKind,
        owner: &str,
        name: &str,
        descriptor: &str,
        is_interface: bool,
    ) -> Self {
        Self {
            owner: owner.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            kind,
            is_interface,
        }
    }

    /// Same call shape with a different descriptor.
    pub(crate) fn with_descriptor(&self, descriptor: String) -> Self {
        Self {
            descriptor,
            ..self.clone()
        }
    }
}

impl fmt::Display for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.owner, self.name, self.descriptor)
    }
}
