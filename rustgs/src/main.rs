use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{arg, value_parser, Command};
use serde::Deserialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use librustgs::{BackendKind, VideoMemoryContext, VramConfig};

mod app;
mod trace;

/// Layout of the `--config` file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Settings {
    vram: VramConfig,
    gpu: GpuSettings,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GpuSettings {
    /// Texture memory the backend may hand out, unlimited when unset
    budget: Option<usize>,
}

fn load_settings(path: &Path) -> Result<Settings> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn run() -> Result<()> {
    let arguments = Command::new("RustGS")
        .version("0.0.1")
        .about("Replays GS video memory traces")
        .arg(arg!(<TRACE> "Trace file to replay").value_parser(value_parser!(PathBuf)))
        .arg(arg!(-c --config <FILE> "TOML settings").value_parser(value_parser!(PathBuf)))
        .arg(arg!(--reference "Disable every reconciliation heuristic"))
        .arg(arg!(--"gpu-budget" <BYTES> "Texture memory limit").value_parser(value_parser!(usize)))
        .arg(arg!(-v --verbose "Debug logging"))
        .get_matches();

    let verbose = arguments.get_flag("verbose");
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" })),
        )
        .init();

    let mut settings = match arguments.get_one::<PathBuf>("config") {
        Some(path) => load_settings(path)?,
        None => Settings::default(),
    };

    if arguments.get_flag("reference") {
        settings.vram = settings.vram.into_reference();
    }

    if let Some(&budget) = arguments.get_one::<usize>("gpu-budget") {
        settings.gpu.budget = Some(budget);
    }

    let trace_path = arguments
        .get_one::<PathBuf>("TRACE")
        .context("no trace file given")?;
    let text = std::fs::read_to_string(trace_path).with_context(|| format!("reading {}", trace_path.display()))?;
    let ops = trace::parse(&text)?;
    info!("Loaded {} operations from {}", ops.len(), trace_path.display());

    let backend = BackendKind::Software;
    info!("Using the {} backend", backend.display_name());
    let gpu = backend.create(settings.gpu.budget);
    let ctx = VideoMemoryContext::new(settings.vram, gpu)?;

    let mut replay = app::Replay::new(ctx);
    let result = replay.run(&ops);
    replay.print_summary();
    result
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("rustgs: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
