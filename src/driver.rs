use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rayon::prelude::*;
use tempfile::NamedTempFile;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::registry::TargetRegistry;
use crate::rewrite::{Rewrite, RewrittenCall, rewrite_class};
use crate::verify::verify_rewritten;

/// Knobs for a batch run.
#[derive(Clone, Debug)]
pub(crate) struct DriverOptions {
    /// Worker threads; `None` uses the available parallelism.
    pub(crate) jobs: Option<usize>,
    pub(crate) verify: bool,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            jobs: None,
            verify: true,
        }
    }
}

/// A rewritten call site together with the class file it was found in.
#[derive(Clone, Debug)]
pub(crate) struct CallSiteRecord {
    pub(crate) class_file: PathBuf,
    pub(crate) call: RewrittenCall,
}

/// Totals for a batch run. Call sites are ordered by class file path, then
/// by bytecode order within the class.
#[derive(Clone, Debug, Default)]
pub(crate) struct Summary {
    pub(crate) classes_scanned: usize,
    pub(crate) classes_rewritten: usize,
    pub(crate) call_sites: Vec<CallSiteRecord>,
}

enum Outcome {
    Unchanged,
    Rewritten(Vec<RewrittenCall>),
}

/// Rewrite every class file under `root` in place.
pub(crate) fn rewrite_tree(
    root: &Path,
    registry: &TargetRegistry,
    options: &DriverOptions,
) -> Result<Summary> {
    let paths = collect_class_files(root)?;
    info!(
        root = %root.display(),
        classes = paths.len(),
        targets = registry.len(),
        "rewriting class files"
    );

    let mut builder = rayon::ThreadPoolBuilder::new();
    if let Some(jobs) = options.jobs {
        builder = builder.num_threads(jobs);
    }
    let pool = builder.build().context("failed to start worker pool")?;

    // The first failing file fails the batch.
    let outcomes: Vec<Outcome> = pool.install(|| {
        paths
            .par_iter()
            .map(|path| process_file(path, registry, options))
            .collect::<Result<Vec<_>>>()
    })?;

    let mut summary = Summary {
        classes_scanned: paths.len(),
        ..Summary::default()
    };
    for (path, outcome) in paths.into_iter().zip(outcomes) {
        if let Outcome::Rewritten(calls) = outcome {
            summary.classes_rewritten += 1;
            summary
                .call_sites
                .extend(calls.into_iter().map(|call| CallSiteRecord {
                    class_file: path.clone(),
                    call,
                }));
        }
    }
    info!(
        scanned = summary.classes_scanned,
        rewritten = summary.classes_rewritten,
        call_sites = summary.call_sites.len(),
        "finished rewriting"
    );
    Ok(summary)
}

fn collect_class_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in WalkDir::new(root) {
        let entry =
            entry.with_context(|| format!("failed to read directory under {}", root.display()))?;
        if entry.file_type().is_file()
            && entry.path().extension().and_then(|ext| ext.to_str()) == Some("class")
        {
            paths.push(entry.into_path());
        }
    }
    // Keep deterministic ordering regardless of directory iteration order.
    paths.sort_by(|a, b| path_key(a).cmp(&path_key(b)));
    Ok(paths)
}

fn process_file(
    path: &Path,
    registry: &TargetRegistry,
    options: &DriverOptions,
) -> Result<Outcome> {
    let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let rewrite = rewrite_class(&data, registry)
        .with_context(|| format!("failed to rewrite {}", path.display()))?;
    let Rewrite::Changed { bytes, call_sites } = rewrite else {
        debug!(path = %path.display(), "no call sites to rewrite");
        return Ok(Outcome::Unchanged);
    };
    if options.verify {
        verify_rewritten(&data, &bytes)
            .with_context(|| format!("failed to verify {}", path.display()))?;
    }
    replace_file(path, &bytes)?;
    debug!(path = %path.display(), call_sites = call_sites.len(), "rewrote class file");
    Ok(Outcome::Rewritten(call_sites))
}

/// Write through a sibling temporary file so readers never observe a
/// partially written class.
fn replace_file(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    let permissions = fs::metadata(path)
        .with_context(|| format!("failed to read metadata of {}", path.display()))?
        .permissions();
    let mut temp = NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temporary file in {}", dir.display()))?;
    temp.write_all(bytes)
        .with_context(|| format!("failed to write temporary file for {}", path.display()))?;
    // The temporary file starts owner-only; the class keeps its own mode.
    temp.as_file()
        .set_permissions(permissions)
        .with_context(|| format!("failed to copy permissions of {}", path.display()))?;
    temp.as_file()
        .sync_all()
        .with_context(|| format!("failed to flush temporary file for {}", path.display()))?;
    temp.persist(path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}
