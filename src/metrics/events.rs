//! Internal events for metrics emission.
//!
//! Each event struct represents a measurable occurrence in a run. Events
//! implement the `InternalEvent` trait which records the corresponding
//! Prometheus metric.

use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::trace;

use crate::sink::AnomalyKind;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

/// Event emitted when a batch is committed.
pub struct BatchCompleted {
    pub items: usize,
    pub duration: Duration,
}

impl InternalEvent for BatchCompleted {
    fn emit(self) {
        trace!(
            items = self.items,
            duration_ms = self.duration.as_millis(),
            "Batch completed"
        );
        counter!("flurry_batches_completed_total").increment(1);
        counter!("flurry_items_processed_total").increment(self.items as u64);
        histogram!("flurry_batch_duration_seconds").record(self.duration.as_secs_f64());
    }
}

/// Outcome of a single service request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Success,
    RateLimited,
    Transient,
    Fatal,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::RateLimited => "rate_limited",
            RequestStatus::Transient => "transient",
            RequestStatus::Fatal => "fatal",
        }
    }
}

/// Event emitted when a service request finishes.
pub struct ServiceRequestCompleted {
    pub status: RequestStatus,
    pub duration: Duration,
}

impl InternalEvent for ServiceRequestCompleted {
    fn emit(self) {
        trace!(status = self.status.as_str(), "Service request completed");
        counter!("flurry_service_requests_total", "status" => self.status.as_str()).increment(1);
        histogram!("flurry_service_request_duration_seconds")
            .record(self.duration.as_secs_f64());
    }
}

/// Event emitted before a backoff sleep.
pub struct RetryScheduled {
    pub kind: &'static str,
    pub wait: Duration,
}

impl InternalEvent for RetryScheduled {
    fn emit(self) {
        trace!(kind = self.kind, wait_ms = self.wait.as_millis(), "Retry scheduled");
        counter!("flurry_retries_total", "kind" => self.kind).increment(1);
        histogram!("flurry_backoff_wait_seconds").record(self.wait.as_secs_f64());
    }
}

/// Event emitted when a call runs out of attempts.
pub struct RetriesExhausted {
    pub kind: &'static str,
}

impl InternalEvent for RetriesExhausted {
    fn emit(self) {
        trace!(kind = self.kind, "Retries exhausted");
        counter!("flurry_retries_exhausted_total", "kind" => self.kind).increment(1);
    }
}

/// Event emitted for each parse anomaly.
pub struct ParseAnomaly {
    pub kind: AnomalyKind,
}

impl InternalEvent for ParseAnomaly {
    fn emit(self) {
        trace!(kind = self.kind.as_str(), "Parse anomaly");
        counter!("flurry_parse_anomalies_total", "kind" => self.kind.as_str()).increment(1);
    }
}

/// Event emitted after a checkpoint is durably saved.
pub struct CheckpointSaved {
    pub batch_index: usize,
}

impl InternalEvent for CheckpointSaved {
    fn emit(self) {
        trace!(batch_index = self.batch_index, "Checkpoint saved");
        counter!("flurry_checkpoints_saved_total").increment(1);
        gauge!("flurry_last_completed_batch").set(self.batch_index as f64);
    }
}

/// Gauge event for run progress.
pub struct ProgressUpdated {
    pub percent: f64,
    pub items_per_minute: f64,
}

impl InternalEvent for ProgressUpdated {
    fn emit(self) {
        gauge!("flurry_progress_percent").set(self.percent);
        gauge!("flurry_items_per_minute").set(self.items_per_minute);
    }
}

/// Event emitted when a run stops, whatever the reason.
pub struct RunTerminated {
    pub status: &'static str,
}

impl InternalEvent for RunTerminated {
    fn emit(self) {
        trace!(status = self.status, "Run terminated");
        counter!("flurry_runs_total", "status" => self.status).increment(1);
    }
}

/// Kind of local file operation.
#[derive(Debug, Clone, Copy)]
pub enum FileOperation {
    AtomicWrite,
    Append,
    Remove,
}

impl FileOperation {
    fn as_str(&self) -> &'static str {
        match self {
            FileOperation::AtomicWrite => "atomic_write",
            FileOperation::Append => "append",
            FileOperation::Remove => "remove",
        }
    }
}

/// Event emitted when a durable file operation completes.
pub struct FileOperationCompleted {
    pub operation: FileOperation,
    pub duration: Duration,
}

impl InternalEvent for FileOperationCompleted {
    fn emit(self) {
        trace!(
            operation = self.operation.as_str(),
            duration_ms = self.duration.as_millis(),
            "File operation completed"
        );
        counter!("flurry_file_operations_total", "operation" => self.operation.as_str())
            .increment(1);
        histogram!("flurry_file_operation_duration_seconds", "operation" => self.operation.as_str())
            .record(self.duration.as_secs_f64());
    }
}
