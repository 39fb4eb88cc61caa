use std::str::FromStr;

use anyhow::{Context, Result};
use jdescriptor::{MethodDescriptor, TypeDescriptor};

/// Insert `parameter` as the last parameter of a method descriptor, directly
/// before the closing parenthesis.
pub(crate) fn append_parameter(descriptor: &str, parameter: &str) -> Result<String> {
    if !descriptor.starts_with('(') || descriptor.matches(')').count() != 1 {
        anyhow::bail!("malformed method descriptor {descriptor}");
    }
    let close = descriptor
        .find(')')
        .context("method descriptor without closing parenthesis")?;
    let mut rewritten = String::with_capacity(descriptor.len() + parameter.len());
    rewritten.push_str(&descriptor[..close]);
    rewritten.push_str(parameter);
    rewritten.push_str(&descriptor[close..]);
    Ok(rewritten)
}

/// Check that `rewritten` is `original` with exactly one trailing object
/// parameter of type `parameter` added and nothing else changed.
pub(crate) fn check_appended(original: &str, rewritten: &str, parameter: &str) -> Result<()> {
    let before = MethodDescriptor::from_str(original)
        .with_context(|| format!("parse method descriptor {original}"))?;
    let after = MethodDescriptor::from_str(rewritten)
        .with_context(|| format!("parse method descriptor {rewritten}"))?;
    if after.parameter_types().len() != before.parameter_types().len() + 1 {
        anyhow::bail!("{rewritten} does not add exactly one parameter to {original}");
    }
    if !matches!(after.parameter_types().last(), Some(TypeDescriptor::Object(_))) {
        anyhow::bail!("{rewritten} does not end with an object parameter");
    }
    if append_parameter(original, parameter)? != rewritten {
        anyhow::bail!("{rewritten} is not {original} with trailing {parameter}");
    }
    Ok(())
}

/// `Lpkg/Name;` for an internal class name.
pub(crate) fn object_descriptor(internal_name: &str) -> String {
    format!("L{internal_name};")
}
