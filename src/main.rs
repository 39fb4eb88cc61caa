mod bytecode;
mod classfile;
mod descriptor;
mod driver;
mod frames;
mod ir;
mod location;
mod logging;
mod opcodes;
mod registry;
mod report;
mod rewrite;
mod signature;
#[cfg(test)]
mod testing;
mod verify;

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;

use crate::driver::{DriverOptions, rewrite_tree};
use crate::registry::TargetRegistry;
use crate::report::{Report, write_report};

/// CLI arguments for locrewrite execution.
#[derive(Parser, Debug)]
#[command(
    name = "locrewrite",
    about = "Rewrite task posting calls in compiled JVM classes to pass the caller's source location.",
    version
)]
struct Cli {
    /// Directory tree of .class files, rewritten in place.
    #[arg(value_name = "CLASSES_DIR")]
    classes_dir: PathBuf,
    /// Worker threads (defaults to available parallelism).
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u16).range(1..))]
    jobs: Option<u16>,
    /// Write a JSON report of rewritten call sites; `-` for stdout.
    #[arg(long, value_name = "PATH")]
    report: Option<PathBuf>,
    /// Skip re-reading rewritten classes with an independent parser.
    #[arg(long)]
    no_verify: bool,
    #[arg(long)]
    quiet: bool,
    #[arg(long)]
    timing: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.quiet);
    run(cli)
}

fn run(cli: Cli) -> Result<()> {
    if !cli.classes_dir.is_dir() {
        anyhow::bail!("classes directory not found: {}", cli.classes_dir.display());
    }

    let started_at = Instant::now();
    let registry = TargetRegistry::chromium()?;
    let options = DriverOptions {
        jobs: cli.jobs.map(usize::from),
        verify: !cli.no_verify,
    };
    let summary = rewrite_tree(&cli.classes_dir, &registry, &options)
        .with_context(|| format!("failed to rewrite {}", cli.classes_dir.display()))?;

    if let Some(path) = &cli.report {
        write_report(&Report::from_summary(&summary), path)?;
    }

    if cli.timing && !cli.quiet {
        eprintln!(
            "timing: total_ms={} classes={} rewritten={} call_sites={}",
            started_at.elapsed().as_millis(),
            summary.classes_scanned,
            summary.classes_rewritten,
            summary.call_sites.len()
        );
    }

    Ok(())
}
