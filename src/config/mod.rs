//! Configuration parsing and validation.
//!
//! Handles loading configuration from YAML files with environment variable
//! interpolation, and derives the runtime settings used by the scheduler,
//! retry controller and response parsers.

mod vars;

use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::classify::parser::{AssessmentField, ResponseFormat};
use crate::classify::retry::RetryPolicy;
use crate::error::{
    ConfigError, EmptyAssessmentFieldsSnafu, EmptyInputPathSnafu, EmptyOutputPathSnafu,
    EnvInterpolationSnafu, InvalidBatchSizeSnafu, InvalidConcurrencySnafu,
    InvalidRequestSizeSnafu, InvalidRetrySnafu, InvalidStageSnafu, ReadFileSnafu, YamlParseSnafu,
};
use crate::source::InputFormat;

pub use vars::{interpolate, interpolate_with};

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Name of this stage; prefixes the checkpoint and partial file names.
    #[serde(default = "default_stage")]
    pub stage: String,
    pub input: InputConfig,
    pub output: OutputConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    pub classifier: ClassifierConfig,
    /// Metrics configuration (optional, disabled by default).
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Anomaly log configuration (optional).
    #[serde(default)]
    pub anomalies: AnomalyConfig,
}

fn default_stage() -> String {
    "classify".to_string()
}

/// Where the items come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub format: InputFormat,
    /// Field holding the item key in NDJSON input (default: "search_term").
    #[serde(default = "default_key_field")]
    pub key_field: String,
}

fn default_key_field() -> String {
    "search_term".to_string()
}

/// Where results and run artifacts go.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Final NDJSON output, written once when every batch is complete.
    pub path: PathBuf,
    /// Directory holding the checkpoint and partial results (default: ".flurry").
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
}

fn default_work_dir() -> PathBuf {
    PathBuf::from(".flurry")
}

/// Batch partitioning and pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Items per batch (default: 20).
    #[serde(default = "default_batch_size")]
    pub size: usize,
    /// Pause between batches in milliseconds (default: 2000).
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    /// Items per service request inside a batch (default: the whole batch).
    #[serde(default)]
    pub request_size: Option<usize>,
    /// Maximum service requests in flight within one batch (default: 1).
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            size: default_batch_size(),
            delay_ms: default_delay_ms(),
            request_size: None,
            max_concurrent_requests: default_max_concurrent_requests(),
        }
    }
}

fn default_batch_size() -> usize {
    20
}

fn default_delay_ms() -> u64 {
    2000
}

fn default_max_concurrent_requests() -> usize {
    1
}

impl BatchConfig {
    /// Pause between batches.
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Items per service request, never larger than the batch.
    pub fn effective_request_size(&self) -> usize {
        self.request_size.unwrap_or(self.size).min(self.size).max(1)
    }
}

/// Retry and backoff settings for service calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per call, first attempt included (default: 6).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds (default: 1000).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound for any single backoff delay in milliseconds (default: 30000).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    6
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl RetryConfig {
    /// Build the backoff policy for the retry controller.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

/// Classification service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Chat-completions endpoint.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Bearer token; usually `${OPENAI_API_KEY}`.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub system_prompt: String,
    /// User prompt; `{items}` is replaced by the comma-separated item keys.
    #[serde(default = "default_prompt_template")]
    pub prompt_template: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Per-request timeout in seconds (default: 60).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub response: ResponseConfig,
}

fn default_endpoint() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_prompt_template() -> String {
    "Classify each item. Respond as item:label pairs separated by commas.\n\nItems: {items}"
        .to_string()
}

fn default_max_tokens() -> u32 {
    300
}

fn default_timeout_secs() -> u64 {
    60
}

/// How service responses are parsed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseConfig {
    #[serde(default)]
    pub format: ResponseFormat,
    /// Output field holding the label in the label format (default: "label").
    #[serde(default = "default_label_field")]
    pub label_field: String,
    /// Field definitions for the assessment format.
    #[serde(default = "AssessmentField::defaults")]
    pub fields: Vec<AssessmentField>,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            format: ResponseFormat::default(),
            label_field: default_label_field(),
            fields: AssessmentField::defaults(),
        }
    }
}

fn default_label_field() -> String {
    "label".to_string()
}

/// Metrics configuration for the Prometheus endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether the metrics endpoint is started (default: false).
    #[serde(default)]
    pub enabled: bool,
    /// Address to bind the metrics HTTP server (default: "0.0.0.0:9090").
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}

/// Anomaly log configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnomalyConfig {
    /// NDJSON file receiving one record per parse anomaly.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text after environment interpolation.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let content = match interpolate(content) {
            Ok(text) => text,
            Err(problems) => {
                return EnvInterpolationSnafu {
                    message: problems.join("\n"),
                }
                .fail();
            }
        };

        let config: Config = serde_yaml::from_str(&content).context(YamlParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(
            !self.stage.is_empty() && !self.stage.contains(['/', '\\']),
            InvalidStageSnafu {
                stage: self.stage.clone()
            }
        );
        ensure!(
            !self.input.path.as_os_str().is_empty(),
            EmptyInputPathSnafu
        );
        ensure!(
            !self.output.path.as_os_str().is_empty(),
            EmptyOutputPathSnafu
        );
        ensure!(self.batch.size >= 1, InvalidBatchSizeSnafu);
        ensure!(
            self.batch.request_size.is_none_or(|n| n >= 1),
            InvalidRequestSizeSnafu
        );
        ensure!(
            self.batch.max_concurrent_requests >= 1,
            InvalidConcurrencySnafu
        );
        ensure!(
            self.retry.max_attempts >= 1,
            InvalidRetrySnafu {
                message: "max_attempts must be at least 1"
            }
        );
        ensure!(
            self.retry.base_delay_ms <= self.retry.max_delay_ms,
            InvalidRetrySnafu {
                message: "base_delay_ms cannot exceed max_delay_ms"
            }
        );
        if self.classifier.response.format == ResponseFormat::Assessment {
            ensure!(
                !self.classifier.response.fields.is_empty(),
                EmptyAssessmentFieldsSnafu
            );
        }
        Ok(())
    }

    /// Path of the checkpoint file for this stage.
    pub fn checkpoint_path(&self) -> PathBuf {
        self.output
            .work_dir
            .join(format!("{}.checkpoint.json", self.stage))
    }

    /// Path of the partial results file for this stage.
    pub fn partial_path(&self) -> PathBuf {
        self.output
            .work_dir
            .join(format!("{}.partial.ndjson", self.stage))
    }
}
