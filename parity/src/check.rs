//! The parity check: one input through the local model and the served one

use crate::config::ParityConfig;
use crate::equivalence::{compare, EquivalenceReport, Tolerance};
use crate::errors::{ParityError, Result};
use crate::input::generate_input;
use crate::local::LocalExecutor;
use crate::model::ResNetConfig;
use crate::remote::{InferInput, InferenceClient, RequestedOutput};
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{info, warn};

/// What to ask the server for and how to judge the answer
#[derive(Debug, Clone, PartialEq)]
pub struct CheckSettings {
    pub model: String,
    pub model_version: Option<String>,
    pub input_name: String,
    pub output_name: String,
    pub binary_data: bool,
    pub check_ready: bool,
    pub tolerance: Tolerance,
}

impl CheckSettings {
    pub fn from_config(config: &ParityConfig, model: &str) -> Self {
        Self {
            model: model.to_string(),
            model_version: config.server.model_version.clone(),
            input_name: config.tensors.input.clone(),
            output_name: config.tensors.output.clone(),
            binary_data: config.tensors.binary_data,
            check_ready: config.server.check_ready,
            tolerance: config.tolerance,
        }
    }
}

/// Wall-clock time of each side
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Timings {
    pub local_ms: u64,
    pub remote_ms: u64,
}

/// Both outputs and their comparison
#[derive(Debug, Clone)]
pub struct ParityOutcome {
    pub model: String,
    pub local: Tensor,
    pub remote: Tensor,
    pub report: EquivalenceReport,
    pub timings: Timings,
}

impl ParityOutcome {
    pub fn passed(&self) -> bool {
        self.report.passed()
    }

    /// First `n` elements of the local output's first row
    pub fn local_head(&self, n: usize) -> &[f32] {
        self.local.head(n)
    }

    /// First `n` elements of the remote output's first row
    pub fn remote_head(&self, n: usize) -> &[f32] {
        self.remote.head(n)
    }

    /// Serializable digest for the JSON report file
    pub fn summary(&self, samples: usize) -> RunSummary {
        RunSummary {
            model: self.model.clone(),
            passed: self.passed(),
            local_head: self.local_head(samples).to_vec(),
            remote_head: self.remote_head(samples).to_vec(),
            report: self.report.clone(),
            timings: self.timings,
        }
    }
}

/// JSON report written with `--report`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub model: String,
    pub passed: bool,
    pub local_head: Vec<f32>,
    pub remote_head: Vec<f32>,
    pub report: EquivalenceReport,
    pub timings: Timings,
}

/// Runs one input locally, then remotely, then compares
#[derive(Debug)]
pub struct ParityCheck {
    executor: LocalExecutor,
    client: InferenceClient,
    settings: CheckSettings,
}

impl ParityCheck {
    pub fn new(executor: LocalExecutor, client: InferenceClient, settings: CheckSettings) -> Self {
        Self {
            executor,
            client,
            settings,
        }
    }

    pub fn settings(&self) -> &CheckSettings {
        &self.settings
    }

    /// Steps run strictly in order; the first failure ends the check
    pub async fn run(&self, input: &Tensor) -> Result<ParityOutcome> {
        let settings = &self.settings;

        let start = Instant::now();
        let local = self.executor.execute(input)?;
        let local_ms = start.elapsed().as_millis() as u64;
        info!(shape = ?local.shape, elapsed_ms = local_ms, "Local inference complete");

        let version = settings.model_version.as_deref();
        if settings.check_ready && !self.client.is_model_ready(&settings.model, version).await? {
            return Err(ParityError::Invocation {
                model: settings.model.clone(),
                status: 503,
                message: "Model is not ready".to_string(),
            });
        }

        let start = Instant::now();
        let result = self
            .client
            .infer(
                &settings.model,
                version,
                &[InferInput::from_tensor(
                    settings.input_name.as_str(),
                    input,
                    settings.binary_data,
                )],
                &[RequestedOutput::new(
                    settings.output_name.as_str(),
                    settings.binary_data,
                )],
            )
            .await?;
        let remote = result.as_tensor(&settings.output_name)?;
        let remote_ms = start.elapsed().as_millis() as u64;
        info!(
            model = %settings.model,
            version = ?result.model_version,
            shape = ?remote.shape,
            elapsed_ms = remote_ms,
            "Remote inference complete"
        );

        let report = compare(&local, &remote, settings.tolerance)?;
        if report.passed() {
            info!(
                elements = report.elements,
                max_abs_diff = report.max_abs_diff,
                "Outputs match"
            );
        } else {
            warn!(
                mismatched = report.mismatched,
                elements = report.elements,
                max_abs_diff = report.max_abs_diff,
                "Outputs diverge"
            );
        }

        Ok(ParityOutcome {
            model: settings.model.clone(),
            local,
            remote,
            report,
            timings: Timings {
                local_ms,
                remote_ms,
            },
        })
    }
}

/// Build everything from `config` and run the check against `model`
pub async fn run_from_config(config: &ParityConfig, model: &str) -> Result<ParityOutcome> {
    config.validate()?;

    let http = reqwest::Client::builder()
        .connect_timeout(config.server.timeout())
        .build()
        .map_err(|e| ParityError::ModelLoad(format!("Failed to build HTTP client: {}", e)))?;
    let executor = LocalExecutor::load(
        &config.weights,
        ResNetConfig::resnet50(),
        config.execution.mode,
        &http,
    )
    .await?;
    let client = InferenceClient::new(&config.server.url, config.server.timeout())?;

    let input = generate_input(&config.input.spec(), config.input.seed);
    info!(seed = config.input.seed, shape = ?input.shape, "Input generated");

    ParityCheck::new(executor, client, CheckSettings::from_config(config, model))
        .run(&input)
        .await
}
