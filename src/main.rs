//! `aurora-encrypt` - protect a Python project by compiling its modules
//!
//! ```text
//! aurora-encrypt ./my_project                      # -> ./my_project.encrypt
//! aurora-encrypt ./my_project -o dist/app -p python3.11
//! aurora-encrypt ./my_project -f core/engine.py -f plugins
//! ```
//!
//! Exit status: 0 when every module compiled, 1 when some builds failed,
//! 2 when the run aborted.

use anyhow::{Context, Result};
use aurora_encrypt::telemetry::init_tracing;
use aurora_encrypt::{EncryptConfig, ProgressSink, ProjectSpec, ProtectError, Protector, RunSummary};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::Level;

#[derive(Parser)]
#[command(name = "aurora-encrypt")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Compile a Python project to native extensions with Cython", long_about = None)]
struct Cli {
    /// Project directory to protect (never modified)
    source: PathBuf,

    /// Destination directory (default: <source>.encrypt)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Python interpreter with Cython and setuptools installed
    #[arg(short, long)]
    python: Option<PathBuf>,

    /// Only protect these paths, relative to the source directory
    #[arg(short, long = "file", value_name = "PATH")]
    files: Vec<PathBuf>,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Kill a single build after this many seconds
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Glob of files to copy without compiling (repeatable)
    #[arg(long, value_name = "GLOB")]
    exclude: Vec<String>,

    /// Keep a module's source when its build fails
    #[arg(long)]
    keep_failed: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON logs and a JSON summary on stdout
    #[arg(long)]
    json: bool,
}

/// Prints `[n/total] label` lines to stderr
struct ConsoleProgress;

impl ProgressSink for ConsoleProgress {
    fn report(&self, current: usize, total: usize, label: &str) {
        eprintln!("[{current}/{total}] {label}");
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.json, if cli.verbose { Level::DEBUG } else { Level::INFO });

    match run(cli) {
        Ok(summary) if summary.is_success() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::from(1),
        Err(err) => {
            eprintln!("error: {err:#}");
            eprintln!("aborted before completion");
            ExitCode::from(2)
        }
    }
}

fn run(cli: Cli) -> Result<RunSummary> {
    let mut config = match &cli.config {
        Some(path) => EncryptConfig::from_toml_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EncryptConfig::default(),
    };
    config.exclude.extend(cli.exclude);
    if let Some(secs) = cli.timeout {
        config.build_timeout_secs = Some(secs);
    }
    if cli.keep_failed {
        config.keep_failed_sources = true;
    }

    let mut spec = ProjectSpec::new(&cli.source);
    if let Some(output) = cli.output {
        spec = spec.destination(output);
    }
    if let Some(python) = cli.python.or_else(|| config.python_path.as_ref().map(PathBuf::from)) {
        spec = spec.toolchain(python);
    }
    if !cli.files.is_empty() {
        spec = spec.files(cli.files);
    }

    let protector = Protector::new(spec, config);
    let result = if cli.json {
        protector.run()
    } else {
        protector.with_progress(ConsoleProgress).run()
    };

    match result {
        Ok(summary) => {
            print_summary(&summary, cli.json)?;
            Ok(summary)
        }
        // The builds ran; report them before failing the run
        Err(ProtectError::MarkersNotRestored { summary, source }) => {
            print_summary(&summary, cli.json)?;
            Err(ProtectError::MarkersNotRestored { summary, source }.into())
        }
        Err(err) => Err(err.into()),
    }
}

fn print_summary(summary: &RunSummary, json: bool) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    if json {
        serde_json::to_writer_pretty(&mut stdout, summary)?;
        writeln!(stdout)?;
    } else {
        writeln!(stdout, "{summary}")?;
    }
    Ok(())
}
