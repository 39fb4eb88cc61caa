use anyhow::{Context, Result};
use jclassfile::attributes::Attribute;
use jclassfile::class_file;
use jclassfile::methods::MethodInfo;

/// Re-read rewritten bytes with an independent class-file parser and compare
/// the method layout against the input.
///
/// Inputs the parser cannot read themselves are not held against the output;
/// only a regression from readable to unreadable fails.
pub(crate) fn verify_rewritten(original: &[u8], rewritten: &[u8]) -> Result<()> {
    let Ok(before) = class_file::parse(original) else {
        return Ok(());
    };
    let after = class_file::parse(rewritten).context("rewritten class no longer parses")?;

    let before_methods = code_presence(before.methods());
    let after_methods = code_presence(after.methods());
    if before_methods.len() != after_methods.len() {
        anyhow::bail!(
            "method count changed from {} to {}",
            before_methods.len(),
            after_methods.len()
        );
    }
    for (index, (before, after)) in before_methods.iter().zip(&after_methods).enumerate() {
        if before != after {
            anyhow::bail!("Code attribute presence changed for method #{index}");
        }
    }
    Ok(())
}

fn code_presence(methods: &[MethodInfo]) -> Vec<bool> {
    methods
        .iter()
        .map(|method| {
            method
                .attributes()
                .iter()
                .any(|attribute| matches!(attribute, Attribute::Code { .. }))
        })
        .collect()
}
