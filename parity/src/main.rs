//! Parity - local vs. served model output check
//!
//! Runs one seeded random image through a pretrained ResNet-50 in-process
//! and through the same model on a KServe v2 / Triton HTTP server, prints the
//! first ten logits of each, and exits non-zero unless every element agrees
//! within tolerance.
//!
//! ```text
//! parity --model resnet50
//! parity -m resnet50 --url triton:8000 --report parity.json
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use parity::{
    bootstrap_subscriber, init_file_logging, init_simple_logging, run_from_config,
    ExecutionMode, ParityConfig, RunSummary,
};
use std::path::{Path, PathBuf};
use tracing::info;

/// Logits printed per side
const SAMPLES: usize = 10;

/// Compare a local ResNet-50 against the same model on an inference server
#[derive(Parser, Debug)]
#[command(name = "parity")]
#[command(about = "Check local vs. remote ResNet-50 output parity", long_about = None)]
#[command(version)]
struct Cli {
    /// Model name on the inference server
    #[arg(short, long)]
    model: String,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Inference server address (host:port or URL)
    #[arg(short, long)]
    url: Option<String>,

    /// Seed for the random input
    #[arg(long)]
    seed: Option<u64>,

    /// Remote request timeout in seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Local safetensors file instead of the cached download
    #[arg(long)]
    weights: Option<PathBuf>,

    /// Run batch-norm with batch statistics (outputs will diverge)
    #[arg(long)]
    training_mode: bool,

    /// Write a JSON report here
    #[arg(long)]
    report: Option<PathBuf>,

    /// Log level
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // The log directory comes from the config, so loading it logs to stderr
    let bootstrap = bootstrap_subscriber(cli.log_level.as_deref().unwrap_or("info"));
    let config = tracing::subscriber::with_default(bootstrap, || build_config(&cli))?;

    match &config.logging.log_dir {
        Some(dir) => init_file_logging(&config.logging.level, dir)?,
        None => init_simple_logging(&config.logging.level)?,
    }

    info!(
        model = %cli.model,
        server = %config.server.url,
        seed = config.input.seed,
        mode = %config.execution.mode,
        "Starting parity check"
    );

    let outcome = run_from_config(&config, &cli.model)
        .await
        .with_context(|| format!("Parity check against model '{}' failed", cli.model))?;

    println!("local:  {:?}", outcome.local_head(SAMPLES));
    println!("remote: {:?}", outcome.remote_head(SAMPLES));

    if let Some(path) = &cli.report {
        write_report(path, &outcome.summary(SAMPLES))?;
        info!(path = %path.display(), "Report written");
    }

    outcome
        .report
        .ensure_passed()
        .context("Local and remote outputs are not equivalent")?;

    println!(
        "✅ {} elements match (rtol={}, atol={})",
        outcome.report.elements, config.tolerance.rtol, config.tolerance.atol
    );
    Ok(())
}

/// Config file (if any) with command-line overrides applied
fn build_config(cli: &Cli) -> Result<ParityConfig> {
    let mut config = match &cli.config {
        Some(path) => ParityConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ParityConfig::default(),
    };

    if let Some(url) = &cli.url {
        config.server.url = url.clone();
    }
    if let Some(seed) = cli.seed {
        config.input.seed = seed;
    }
    if let Some(timeout) = cli.timeout_secs {
        config.server.timeout_secs = timeout;
    }
    if let Some(weights) = &cli.weights {
        config.weights.path = Some(weights.clone());
    }
    if cli.training_mode {
        config.execution.mode = ExecutionMode::Training;
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn write_report(path: &Path, summary: &RunSummary) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(summary).context("Failed to serialize report")?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write report to {}", path.display()))?;
    Ok(())
}
