use crate::equivalence::Tolerance;
use crate::errors::{ParityError, Result};
use crate::graph::ExecutionMode;
use crate::input::{InputSpec, DEFAULT_SEED};
use crate::model::WeightsSource;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for a parity run
///
/// Every section has defaults, so a file only needs the values it changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParityConfig {
    pub server: ServerConfig,
    pub tensors: TensorNames,
    pub weights: WeightsSource,
    pub input: InputConfig,
    pub tolerance: Tolerance,
    pub execution: ExecutionConfig,
    pub logging: LoggingConfig,
}

/// Inference server endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// `host:port` or full URL
    pub url: String,
    /// Model version; the server picks one when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
    pub timeout_secs: u64,
    /// Check model readiness before sending the request
    pub check_ready: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: "127.0.0.1:8000".to_string(),
            model_version: None,
            timeout_secs: 30,
            check_ready: false,
        }
    }
}

impl ServerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Tensor names and encoding on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TensorNames {
    pub input: String,
    pub output: String,
    pub binary_data: bool,
}

impl Default for TensorNames {
    fn default() -> Self {
        Self {
            input: "INPUT_0".to_string(),
            output: "OUTPUT_0".to_string(),
            binary_data: true,
        }
    }
}

/// Generated input tensor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    pub shape: Vec<usize>,
    pub seed: u64,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            shape: InputSpec::default().shape,
            seed: DEFAULT_SEED,
        }
    }
}

impl InputConfig {
    pub fn spec(&self) -> InputSpec {
        InputSpec::new(self.shape.clone())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub mode: ExecutionMode,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Also write daily-rotated log files here
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl ParityConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        tracing::info!(path = %path.display(), "Loading configuration");

        let content = std::fs::read_to_string(path).map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "Failed to read config file");
            e
        })?;

        let config: ParityConfig = toml::from_str(&content)?;

        config.validate()?;

        tracing::info!("Configuration loaded successfully");
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.url.trim().is_empty() {
            return Err(ParityError::Config("server.url must not be empty".into()));
        }

        if self.server.timeout_secs == 0 {
            return Err(ParityError::Config(
                "server.timeout_secs must be at least 1".into(),
            ));
        }

        if self.tensors.input.is_empty() || self.tensors.output.is_empty() {
            return Err(ParityError::Config(
                "tensors.input and tensors.output must not be empty".into(),
            ));
        }

        if self.weights.name.is_empty() {
            return Err(ParityError::Config("weights.name must not be empty".into()));
        }

        // NCHW with an RGB channel axis
        match self.input.shape.as_slice() {
            [n, 3, h, w] if *n > 0 && *h > 0 && *w > 0 => {}
            other => {
                return Err(ParityError::Config(format!(
                    "input.shape must be [N, 3, H, W] with non-zero dimensions, got {:?}",
                    other
                )))
            }
        }

        for (name, value) in [("rtol", self.tolerance.rtol), ("atol", self.tolerance.atol)] {
            if !value.is_finite() || value < 0.0 {
                return Err(ParityError::Config(format!(
                    "tolerance.{} must be a finite non-negative number, got {}",
                    name, value
                )));
            }
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ParityError::Config(
                    "log level must be one of: trace, debug, info, warn, error".into(),
                ))
            }
        }

        Ok(())
    }
}
