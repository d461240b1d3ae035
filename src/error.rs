//! Error types for flurry using snafu.
//!
//! This module defines structured error types with context selectors for
//! all error conditions in the codebase.

use snafu::prelude::*;
use std::path::PathBuf;

// ============ Config Errors ============

/// Errors that can occur during configuration parsing and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// Input path is empty.
    #[snafu(display("Input path cannot be empty"))]
    EmptyInputPath,

    /// Output path is empty.
    #[snafu(display("Output path cannot be empty"))]
    EmptyOutputPath,

    /// Stage name is empty or contains path separators.
    #[snafu(display("Invalid stage name '{stage}': must be non-empty and contain no path separators"))]
    InvalidStage { stage: String },

    /// Batch size must be at least one.
    #[snafu(display("Batch size must be at least 1"))]
    InvalidBatchSize,

    /// Request size must be at least one when set.
    #[snafu(display("Request size must be at least 1 when set"))]
    InvalidRequestSize,

    /// At least one concurrent request is required.
    #[snafu(display("max_concurrent_requests must be at least 1"))]
    InvalidConcurrency,

    /// Retry policy is inconsistent.
    #[snafu(display("Invalid retry policy: {message}"))]
    InvalidRetry { message: String },

    /// Assessment responses need at least one field.
    #[snafu(display("Assessment response format needs at least one field"))]
    EmptyAssessmentFields,

    /// Environment variable interpolation failed.
    #[snafu(display("Environment variable interpolation failed:\n{message}"))]
    EnvInterpolation { message: String },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML configuration"))]
    YamlParse { source: serde_yaml::Error },

    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file {}", path.display()))]
    ReadFile {
        source: std::io::Error,
        path: PathBuf,
    },
}

// ============ Input Errors ============

/// Errors that can occur while loading the input dataset.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum InputError {
    /// Failed to read the input file.
    #[snafu(display("Failed to read input {}", path.display()))]
    ReadInput {
        source: std::io::Error,
        path: PathBuf,
    },

    /// Input is not valid UTF-8.
    #[snafu(display("Input {} is not valid UTF-8", path.display()))]
    InputEncoding {
        source: std::string::FromUtf8Error,
        path: PathBuf,
    },

    /// A line could not be parsed as a JSON object.
    #[snafu(display("Invalid JSON object on line {line}"))]
    InvalidRecord {
        source: serde_json::Error,
        line: usize,
    },

    /// A record is missing its key field or the key is not a string.
    #[snafu(display("Line {line} has no string field '{field}'"))]
    MissingKey { line: usize, field: String },

    /// Keys must be unique within a dataset.
    #[snafu(display("Duplicate key '{key}' on line {line}"))]
    DuplicateKey { key: String, line: usize },
}

// ============ Checkpoint Errors ============

/// Errors that can occur while persisting or loading checkpoints.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CheckpointError {
    /// Failed to read the checkpoint file.
    #[snafu(display("Failed to read checkpoint {}", path.display()))]
    CheckpointRead {
        source: std::io::Error,
        path: PathBuf,
    },

    /// Failed to write the checkpoint file.
    #[snafu(display("Failed to write checkpoint {}", path.display()))]
    CheckpointWrite {
        source: std::io::Error,
        path: PathBuf,
    },

    /// Failed to remove the checkpoint file.
    #[snafu(display("Failed to remove checkpoint {}", path.display()))]
    CheckpointRemove {
        source: std::io::Error,
        path: PathBuf,
    },

    /// JSON serialization/deserialization error for checkpoint data.
    #[snafu(display("JSON error in checkpoint {}", path.display()))]
    CheckpointJson {
        source: serde_json::Error,
        path: PathBuf,
    },
}

// ============ Sink Errors ============

/// Errors that can occur in the partial result sink and final output.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SinkError {
    /// IO error on a sink file.
    #[snafu(display("IO error on {}", path.display()))]
    SinkIo {
        source: std::io::Error,
        path: PathBuf,
    },

    /// Failed to serialize a record.
    #[snafu(display("Failed to serialize record for key '{key}'"))]
    RecordSerialize {
        source: serde_json::Error,
        key: String,
    },

    /// A complete line in the partial file could not be decoded.
    #[snafu(display("Corrupt row on line {line} of {}", path.display()))]
    CorruptRow {
        source: serde_json::Error,
        path: PathBuf,
        line: usize,
    },

    /// The partial file does not start with a header line.
    #[snafu(display("Partial file {} has no header", path.display()))]
    MissingHeader { path: PathBuf },
}

// ============ Classification Errors ============

/// Failures reported by the classification service collaborator.
///
/// The variant decides how the retry controller and the scheduler react:
/// rate limits and transient failures are retried with backoff, fatal
/// failures stop the run immediately.
#[derive(Debug, Clone, Snafu)]
#[snafu(visibility(pub))]
pub enum ClassifyError {
    /// The service asked us to slow down (HTTP 429 or equivalent).
    #[snafu(display("Rate limited: {message}"))]
    RateLimited { message: String },

    /// Network failure, timeout or server-side error.
    #[snafu(display("Transient failure: {message}"))]
    Transient { message: String },

    /// Authentication, validation or configuration failure.
    #[snafu(display("Fatal failure: {message}"))]
    Fatal { message: String },
}

impl ClassifyError {
    /// Short label used for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ClassifyError::RateLimited { .. } => "rate_limited",
            ClassifyError::Transient { .. } => "transient",
            ClassifyError::Fatal { .. } => "fatal",
        }
    }

    /// Whether the retry controller may try again.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ClassifyError::Fatal { .. })
    }
}

// ============ Metrics Errors ============

/// Errors that can occur during metrics initialization.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetricsError {
    /// Failed to initialize Prometheus recorder.
    #[snafu(display("Failed to initialize Prometheus recorder"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },
}

// ============ Anomaly Log Errors ============

/// Errors that can occur while writing the anomaly log.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
#[allow(clippy::enum_variant_names)]
pub enum AnomalyLogError {
    /// Failed to write to the anomaly log.
    #[snafu(display("Failed to write anomaly log {}", path.display()))]
    AnomalyWrite {
        source: std::io::Error,
        path: PathBuf,
    },

    /// Failed to serialize an anomaly record.
    #[snafu(display("Failed to serialize anomaly record"))]
    AnomalySerialize { source: serde_json::Error },
}

// ============ Pipeline Error (top-level) ============

/// Top-level pipeline errors that aggregate all error types.
///
/// Stops caused by the classification service (rate limits, fatal service
/// errors, interrupts) are not errors: they are reported through
/// [`crate::pipeline::RunStatus`]. The variants here are conditions the
/// engine cannot recover from on its own.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PipelineError {
    /// Configuration error.
    #[snafu(display("Configuration error"))]
    Config { source: ConfigError },

    /// Input error.
    #[snafu(display("Input error"))]
    Input { source: InputError },

    /// Checkpoint store error.
    #[snafu(display("Checkpoint error"))]
    Checkpoint { source: CheckpointError },

    /// Partial sink or final output error.
    #[snafu(display("Sink error"))]
    Sink { source: SinkError },

    /// Anomaly log error.
    #[snafu(display("Anomaly log error"))]
    AnomalyLog { source: AnomalyLogError },

    /// The classification client could not be constructed.
    #[snafu(display("Failed to set up classifier"))]
    ClassifierSetup { source: ClassifyError },

    /// The checkpoint on disk belongs to a different input dataset.
    #[snafu(display(
        "Checkpoint fingerprint {found} does not match current input {expected}; rerun with --restart to discard it"
    ))]
    FingerprintMismatch { expected: String, found: String },

    /// The checkpoint was written with a different batch size.
    #[snafu(display(
        "Checkpoint was written with batch size {found}, current batch size is {expected}"
    ))]
    BatchSizeMismatch { expected: usize, found: usize },

    /// Checkpoint, partial results and input disagree. Artifacts are kept.
    #[snafu(display("Data integrity error: {message}"))]
    Integrity { message: String },

    /// Address parsing error.
    #[snafu(display("Failed to parse address"))]
    AddressParse { source: std::net::AddrParseError },

    /// Metrics error.
    #[snafu(display("Metrics error"))]
    Metrics { source: MetricsError },
}

impl PipelineError {
    /// Whether this error signals inconsistent on-disk state.
    pub fn is_integrity(&self) -> bool {
        matches!(self, PipelineError::Integrity { .. })
    }
}
