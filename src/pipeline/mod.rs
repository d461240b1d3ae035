//! Batch scheduling.
//!
//! Connects the input, the classifier, the partial sink and the checkpoint
//! store into a single sequential loop with graceful shutdown.
//!
//! # Commit protocol
//!
//! For each batch, in index order:
//! 1. call the service (through the retry controller), optionally split into
//!    sub-requests with bounded parallelism
//! 2. parse the responses into one outcome per item
//! 3. append the records to the partial file and fsync
//! 4. save the checkpoint atomically
//!
//! A crash before step 4 leaves an uncommitted tail in the partial file,
//! which is truncated on resume. Any stop other than completion leaves the
//! checkpoint at the last committed batch.

mod progress;
mod signal;
mod status;

pub use progress::{PerformanceReport, ProgressTracker, format_eta};
pub use signal::{cancel_on, shutdown_signal, spawn_listener};
pub use status::{RunPlan, StatusReport, plan, status};

use futures::stream::{self, StreamExt};
use snafu::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::anomaly::AnomalyLog;
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::classify::parser::{self, ParsedBatch, ResponseParser};
use crate::classify::{Classifier, HttpClassifier, RetryController};
use crate::config::Config;
use crate::emit;
use crate::error::{
    BatchSizeMismatchSnafu, CheckpointSnafu, ClassifierSetupSnafu, ClassifyError,
    FingerprintMismatchSnafu, InputSnafu, IntegritySnafu, PipelineError, SinkIoSnafu, SinkSnafu,
};
use crate::metrics::events::{BatchCompleted, ParseAnomaly, ProgressUpdated, RunTerminated};
use crate::sink::{Finalizer, PartialHeader, PartialResultSink};
use crate::source::{InputItem, InputSet};
use crate::storage;

/// What to do with an existing checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeMode {
    /// Continue from the checkpoint when it matches the input.
    Resume,
    /// Discard the checkpoint and partial results and start at batch 0.
    Restart,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    StoppedRateLimited,
    StoppedFatalError,
    StoppedUserInterrupt,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::StoppedRateLimited => "stopped_rate_limited",
            RunStatus::StoppedFatalError => "stopped_fatal_error",
            RunStatus::StoppedUserInterrupt => "stopped_user_interrupt",
        }
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            RunStatus::Completed => 0,
            RunStatus::StoppedRateLimited => 75,
            RunStatus::StoppedFatalError => 1,
            RunStatus::StoppedUserInterrupt => 130,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, RunStatus::Completed)
    }
}

/// Result of a run, successful or not.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub status: RunStatus,
    /// Why the run stopped early.
    pub reason: Option<String>,
    pub total_items: usize,
    pub total_batches: usize,
    pub items_processed: usize,
    /// Index of the batch a resume would start with.
    pub next_batch: usize,
    /// Last checkpoint state of the run, also after it was deleted.
    pub checkpoint: Option<Checkpoint>,
    pub checkpoint_path: PathBuf,
    /// Set when the final output was written.
    pub output_path: Option<PathBuf>,
    pub anomalies: usize,
    pub performance: PerformanceReport,
}

/// The batch scheduler.
pub struct Pipeline {
    config: Config,
    classifier: Arc<dyn Classifier>,
    parser: Box<dyn ResponseParser>,
    retry: RetryController,
    store: CheckpointStore,
    shutdown: CancellationToken,
}

impl Pipeline {
    /// Create a scheduler with an explicit classifier.
    pub fn new(config: Config, classifier: Arc<dyn Classifier>, shutdown: CancellationToken) -> Self {
        let parser = parser::from_config(&config.classifier.response);
        let retry = RetryController::new(config.retry.policy());
        let store = CheckpointStore::new(config.checkpoint_path());
        Self {
            config,
            classifier,
            parser,
            retry,
            store,
            shutdown,
        }
    }

    /// Replace the response parser selected by the configuration.
    pub fn with_parser(mut self, parser: Box<dyn ResponseParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn checkpoint_store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Run every remaining batch of `input`.
    ///
    /// Service stops and interrupts are reported through [`RunReport`];
    /// errors are reserved for conditions that need operator attention.
    pub async fn run(&mut self, input: &InputSet, mode: ResumeMode) -> Result<RunReport, PipelineError> {
        let batch_size = self.config.batch.size;
        let total_batches = input.total_batches(batch_size);
        let partial_path = self.config.partial_path();
        let digest = input.fingerprint().digest();

        tokio::fs::create_dir_all(&self.config.output.work_dir)
            .await
            .context(SinkIoSnafu {
                path: &self.config.output.work_dir,
            })
            .context(SinkSnafu)?;

        if mode == ResumeMode::Restart {
            info!(stage = %self.config.stage, "Restart requested, discarding previous progress");
            self.discard_artifacts().await?;
        }

        let mut progress = ProgressTracker::new();
        let mut anomaly_log = AnomalyLog::from_config(&self.config.anomalies);

        if input.is_empty() {
            if let Some(cp) = self.store.load().await.context(CheckpointSnafu)? {
                let current = input.fingerprint();
                ensure!(
                    current.matches(&cp.fingerprint),
                    FingerprintMismatchSnafu {
                        expected: current.digest(),
                        found: cp.fingerprint.digest(),
                    }
                );
            }
            info!("Input is empty, writing empty output");
            self.discard_artifacts().await?;
            Finalizer::new(&self.config.output.path, &partial_path, &self.store)
                .finalize(input)
                .await?;
            return Ok(self.report(
                RunStatus::Completed,
                None,
                input,
                None,
                Some(self.config.output.path.clone()),
                &progress,
                0,
            ));
        }

        let loaded = self.store.load().await.context(CheckpointSnafu)?;
        if let Some(cp) = &loaded
            && cp.is_complete()
            && cp.fingerprint.matches(input.fingerprint())
            && cp.batch_size == batch_size
            && Finalizer::new(&self.config.output.path, &partial_path, &self.store)
                .finish_interrupted(input)
                .await?
        {
            return Ok(self.report(
                RunStatus::Completed,
                None,
                input,
                loaded,
                Some(self.config.output.path.clone()),
                &progress,
                0,
            ));
        }

        let (mut checkpoint, mut sink) = match loaded {
            Some(cp) => {
                let sink = self.reopen(input, &cp).await?;
                (Some(cp), sink)
            }
            None => {
                if storage::remove_if_exists(&partial_path)
                    .await
                    .context(SinkIoSnafu {
                        path: &partial_path,
                    })
                    .context(SinkSnafu)?
                {
                    warn!(
                        path = %partial_path.display(),
                        "Discarded partial results without a checkpoint"
                    );
                }
                let header = PartialHeader::new(&self.config.stage, digest.clone(), batch_size);
                let sink = PartialResultSink::create(&partial_path, &header)
                    .await
                    .context(SinkSnafu)?;
                (None, sink)
            }
        };

        let base_rate_stats = checkpoint
            .as_ref()
            .map(|cp| cp.rate_limit_stats.clone())
            .unwrap_or_default();
        let mut errors = checkpoint
            .as_ref()
            .map(|cp| cp.run_stats.errors.clone())
            .unwrap_or_default();
        let start_index = checkpoint.as_ref().map_or(0, Checkpoint::next_batch_index);
        let mut anomaly_total = 0;

        info!(
            stage = %self.config.stage,
            items = input.len(),
            batches = total_batches,
            start_batch = start_index,
            batch_size,
            "Starting run"
        );

        for index in start_index..total_batches {
            if self.shutdown.is_cancelled() {
                return Ok(self.stop(
                    RunStatus::StoppedUserInterrupt,
                    None,
                    input,
                    checkpoint,
                    &progress,
                    anomaly_total,
                ));
            }

            let batch = input.batch(index, batch_size);
            let started = Instant::now();

            let parsed = match self.classify_batch(index, batch).await {
                Ok(parsed) => parsed,
                Err(err) => {
                    match &err {
                        ClassifyError::RateLimited { .. } => errors.rate_limit += 1,
                        ClassifyError::Transient { .. } => errors.transient += 1,
                        ClassifyError::Fatal { .. } => errors.fatal += 1,
                    }
                    if let Some(cp) = checkpoint.as_mut() {
                        cp.rate_limit_stats = base_rate_stats.merged(&self.retry.snapshot());
                        cp.run_stats.errors = errors.clone();
                        self.store.save(cp).await.context(CheckpointSnafu)?;
                    }
                    let status = match err {
                        ClassifyError::RateLimited { .. } => RunStatus::StoppedRateLimited,
                        _ => RunStatus::StoppedFatalError,
                    };
                    error!(batch = index, error = %err, "Batch failed");
                    return Ok(self.stop(
                        status,
                        Some(err.to_string()),
                        input,
                        checkpoint,
                        &progress,
                        anomaly_total,
                    ));
                }
            };

            let anomalies = parsed.anomalies();
            for anomaly in &anomalies {
                emit!(ParseAnomaly { kind: anomaly.kind });
            }
            if !anomalies.is_empty() {
                warn!(batch = index, count = anomalies.len(), "Response had parse anomalies");
                errors.parse += anomalies.len() as u64;
                anomaly_total += anomalies.len();
            }
            if let Some(log) = anomaly_log.as_mut() {
                log.record(index, &anomalies);
                if let Err(e) = log.flush().await {
                    warn!(error = %e, "Failed to write anomaly log");
                    errors.file_system += 1;
                }
            }

            let records = parsed.into_records(batch);
            sink.append(&records).await.context(SinkSnafu)?;

            let next = match checkpoint.take() {
                Some(mut cp) => {
                    cp.advance(index, batch.len());
                    cp
                }
                None => Checkpoint::first(
                    &self.config.stage,
                    input.fingerprint().clone(),
                    batch_size,
                    total_batches,
                    batch.len(),
                ),
            };
            let cp = checkpoint.insert(next);

            let elapsed = started.elapsed();
            progress.record(batch.len(), elapsed);
            let remaining = input.len() - cp.items_processed;
            let eta = progress.eta(remaining);

            cp.rate_limit_stats = base_rate_stats.merged(&self.retry.snapshot());
            cp.run_stats.errors = errors.clone();
            cp.run_stats.batches_processed += 1;
            cp.run_stats.items_per_minute = progress.items_per_minute();
            cp.run_stats.eta_secs = eta.map(|d| d.as_secs());
            self.store.save(cp).await.context(CheckpointSnafu)?;

            emit!(BatchCompleted {
                items: batch.len(),
                duration: elapsed,
            });
            emit!(ProgressUpdated {
                percent: cp.completion_percent(),
                items_per_minute: cp.run_stats.items_per_minute,
            });
            info!(
                batch = index + 1,
                total_batches,
                items_processed = cp.items_processed,
                total_items = input.len(),
                percent = %format!("{:.1}", cp.completion_percent()),
                speed = %format!("{:.1}/min", cp.run_stats.items_per_minute),
                eta = %format_eta(eta),
                "Batch committed"
            );

            if index + 1 < total_batches {
                tokio::select! {
                    biased;

                    _ = self.shutdown.cancelled() => {
                        info!("Shutdown requested during inter-batch delay");
                        return Ok(self.stop(
                            RunStatus::StoppedUserInterrupt,
                            None,
                            input,
                            checkpoint,
                            &progress,
                            anomaly_total,
                        ));
                    }
                    _ = tokio::time::sleep(self.config.batch.delay()) => {}
                }
            }
        }

        drop(sink);
        Finalizer::new(&self.config.output.path, &partial_path, &self.store)
            .finalize(input)
            .await?;
        if let Some(log) = anomaly_log.as_mut()
            && let Err(e) = log.finalize().await
        {
            warn!(error = %e, "Failed to finalize anomaly log");
        }

        emit!(RunTerminated {
            status: RunStatus::Completed.as_str(),
        });
        let report = self.report(
            RunStatus::Completed,
            None,
            input,
            checkpoint,
            Some(self.config.output.path.clone()),
            &progress,
            anomaly_total,
        );
        info!(performance = %report.performance, "Run completed");
        Ok(report)
    }

    /// Validate a loaded checkpoint against the input and reopen the sink.
    async fn reopen(&self, input: &InputSet, cp: &Checkpoint) -> Result<PartialResultSink, PipelineError> {
        let current = input.fingerprint();
        ensure!(
            current.matches(&cp.fingerprint),
            FingerprintMismatchSnafu {
                expected: current.digest(),
                found: cp.fingerprint.digest(),
            }
        );
        ensure!(
            cp.batch_size == self.config.batch.size,
            BatchSizeMismatchSnafu {
                expected: self.config.batch.size,
                found: cp.batch_size,
            }
        );
        ensure!(
            cp.items_processed == cp.expected_items()
                && cp.total_batches == input.total_batches(cp.batch_size),
            IntegritySnafu {
                message: format!(
                    "checkpoint records {} items after batch {}, expected {}",
                    cp.items_processed,
                    cp.last_completed_batch_index,
                    cp.expected_items()
                ),
            }
        );

        let committed = input.committed_items(cp.last_completed_batch_index, cp.batch_size);
        let sink = PartialResultSink::open_for_resume(
            self.config.partial_path(),
            &current.digest(),
            committed,
        )
        .await?;

        info!(
            last_completed_batch = cp.last_completed_batch_index,
            items_processed = cp.items_processed,
            rate_limit_hits = cp.rate_limit_stats.rate_limit_hits,
            "Resuming from checkpoint"
        );
        Ok(sink)
    }

    /// Call the service for one batch, split into sub-requests.
    ///
    /// Every sub-request resolves before the batch is judged. A fatal failure
    /// wins over a rate limit so the run does not stall retrying later.
    async fn classify_batch(&self, index: usize, batch: &[InputItem]) -> Result<ParsedBatch, ClassifyError> {
        let request_size = self.config.batch.effective_request_size();
        let requests: Vec<&[InputItem]> = batch.chunks(request_size).collect();
        let request_count = requests.len();

        let results: Vec<Result<ParsedBatch, ClassifyError>> = stream::iter(requests.into_iter().enumerate())
            .map(|(n, items)| async move {
                let label = if request_count == 1 {
                    format!("batch {index}")
                } else {
                    format!("batch {index} request {n}")
                };
                let raw = self
                    .retry
                    .run(&label, || self.classifier.classify(items))
                    .await?;
                debug!(call = %label, bytes = raw.len(), "Parsing response");
                Ok(self.parser.parse(items, &raw))
            })
            .buffered(self.config.batch.max_concurrent_requests)
            .collect()
            .await;

        let mut merged = ParsedBatch::default();
        let mut failure: Option<ClassifyError> = None;
        for result in results {
            match result {
                Ok(parsed) => merged.extend(parsed),
                Err(err) => {
                    let replace = match (&failure, &err) {
                        (None, _) => true,
                        (Some(ClassifyError::Fatal { .. }), _) => false,
                        (Some(_), ClassifyError::Fatal { .. }) => true,
                        (Some(_), _) => false,
                    };
                    if replace {
                        failure = Some(err);
                    }
                }
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(merged),
        }
    }

    async fn discard_artifacts(&self) -> Result<(), PipelineError> {
        self.store.delete().await.context(CheckpointSnafu)?;
        let partial = self.config.partial_path();
        storage::remove_if_exists(&partial)
            .await
            .context(SinkIoSnafu { path: &partial })
            .context(SinkSnafu)?;
        Ok(())
    }

    fn stop(
        &self,
        status: RunStatus,
        reason: Option<String>,
        input: &InputSet,
        checkpoint: Option<Checkpoint>,
        progress: &ProgressTracker,
        anomalies: usize,
    ) -> RunReport {
        emit!(RunTerminated {
            status: status.as_str(),
        });
        let report = self.report(status, reason, input, checkpoint, None, progress, anomalies);
        warn!(
            status = status.as_str(),
            next_batch = report.next_batch,
            items_processed = report.items_processed,
            total_items = report.total_items,
            checkpoint = %report.checkpoint_path.display(),
            "Run stopped early; run again without --restart to resume"
        );
        info!(performance = %report.performance, "Run summary");
        report
    }

    #[allow(clippy::too_many_arguments)]
    fn report(
        &self,
        status: RunStatus,
        reason: Option<String>,
        input: &InputSet,
        checkpoint: Option<Checkpoint>,
        output_path: Option<PathBuf>,
        progress: &ProgressTracker,
        anomalies: usize,
    ) -> RunReport {
        let rate_limits = checkpoint
            .as_ref()
            .map(|cp| cp.rate_limit_stats.clone())
            .unwrap_or_else(|| self.retry.snapshot());
        RunReport {
            status,
            reason,
            total_items: input.len(),
            total_batches: input.total_batches(self.config.batch.size),
            items_processed: checkpoint.as_ref().map_or(0, |cp| cp.items_processed),
            next_batch: checkpoint.as_ref().map_or(0, Checkpoint::next_batch_index),
            checkpoint,
            checkpoint_path: self.store.path().to_path_buf(),
            output_path,
            anomalies,
            performance: progress.report(rate_limits),
        }
    }
}

/// Load the input, build the HTTP classifier and run to completion or stop.
///
/// Installs the signal listener so Ctrl-C stops the run cleanly.
pub async fn run_pipeline(config: Config, mode: ResumeMode) -> Result<RunReport, PipelineError> {
    let shutdown = CancellationToken::new();
    spawn_listener(shutdown.clone());

    let input = InputSet::load(
        &config.input.path,
        config.input.format,
        &config.input.key_field,
    )
    .await
    .context(InputSnafu)?;

    let classifier =
        Arc::new(HttpClassifier::from_config(&config.classifier).context(ClassifierSetupSnafu)?);
    let mut pipeline = Pipeline::new(config, classifier, shutdown);
    pipeline.run(&input, mode).await
}
