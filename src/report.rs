use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::driver::{CallSiteRecord, Summary};

/// JSON document describing one batch run.
#[derive(Debug, Serialize)]
pub(crate) struct Report {
    pub(crate) classes_scanned: usize,
    pub(crate) classes_rewritten: usize,
    pub(crate) call_sites: Vec<CallSiteEntry>,
}

#[derive(Debug, Serialize)]
pub(crate) struct CallSiteEntry {
    pub(crate) class_file: String,
    pub(crate) class_name: String,
    pub(crate) source_file: String,
    pub(crate) method: String,
    pub(crate) line: u16,
    pub(crate) owner: String,
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) rewritten_descriptor: String,
    pub(crate) fallback: bool,
}

impl Report {
    pub(crate) fn from_summary(summary: &Summary) -> Self {
        Self {
            classes_scanned: summary.classes_scanned,
            classes_rewritten: summary.classes_rewritten,
            call_sites: summary.call_sites.iter().map(CallSiteEntry::from).collect(),
        }
    }
}

impl From<&CallSiteRecord> for CallSiteEntry {
    fn from(record: &CallSiteRecord) -> Self {
        let call = &record.call;
        Self {
            class_file: record.class_file.to_string_lossy().to_string(),
            class_name: call.class_name.clone(),
            source_file: call.position.file.clone(),
            method: call.position.method.clone(),
            line: call.position.line,
            owner: call.target.owner.clone(),
            name: call.target.name.clone(),
            descriptor: call.target.descriptor.clone(),
            rewritten_descriptor: call.rewritten_descriptor.clone(),
            fallback: call.fallback,
        }
    }
}

/// Write the report as pretty JSON; `-` selects stdout.
pub(crate) fn write_report(report: &Report, output: &Path) -> Result<()> {
    let mut writer = output_writer(output)?;
    serde_json::to_writer_pretty(&mut writer, report).context("failed to serialize report")?;
    writer
        .write_all(b"\n")
        .context("failed to write report")?;
    writer.flush().context("failed to write report")?;
    Ok(())
}

fn output_writer(output: &Path) -> Result<Box<dyn Write>> {
    if output == Path::new("-") {
        return Ok(Box::new(io::stdout()));
    }
    Ok(Box::new(
        File::create(output).with_context(|| format!("failed to open {}", output.display()))?,
    ))
}
