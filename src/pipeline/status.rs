//! Read-only views of a stage: the run plan and the progress status.

use snafu::prelude::*;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::Config;
use crate::error::{CheckpointSnafu, InputSnafu, PipelineError, SinkIoSnafu, SinkSnafu};
use crate::sink::PartialRecord;
use crate::sink::partial::read_all;
use crate::source::InputSet;

use super::progress::format_eta;

/// What `run` would do, without calling the service.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub stage: String,
    pub input_path: PathBuf,
    pub items: usize,
    pub batch_size: usize,
    pub total_batches: usize,
    pub request_size: usize,
    pub max_concurrent_requests: usize,
    pub delay: Duration,
    pub fingerprint: String,
    /// Existing checkpoint, if any.
    pub checkpoint: Option<Checkpoint>,
    /// Whether the existing checkpoint can be resumed with this input.
    pub resumable: bool,
    pub output_path: PathBuf,
}

/// Validate configuration and input and describe the run.
pub async fn plan(config: &Config) -> Result<RunPlan, PipelineError> {
    let input = InputSet::load(
        &config.input.path,
        config.input.format,
        &config.input.key_field,
    )
    .await
    .context(InputSnafu)?;

    let checkpoint = CheckpointStore::new(config.checkpoint_path())
        .load()
        .await
        .context(CheckpointSnafu)?;
    let resumable = checkpoint.as_ref().is_some_and(|cp| {
        cp.fingerprint.matches(input.fingerprint()) && cp.batch_size == config.batch.size
    });

    Ok(RunPlan {
        stage: config.stage.clone(),
        input_path: config.input.path.clone(),
        items: input.len(),
        batch_size: config.batch.size,
        total_batches: input.total_batches(config.batch.size),
        request_size: config.batch.effective_request_size(),
        max_concurrent_requests: config.batch.max_concurrent_requests,
        delay: config.batch.delay(),
        fingerprint: input.fingerprint().digest(),
        checkpoint,
        resumable,
        output_path: config.output.path.clone(),
    })
}

impl fmt::Display for RunPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Stage:        {}", self.stage)?;
        writeln!(
            f,
            "Input:        {} ({} items, fingerprint {})",
            self.input_path.display(),
            self.items,
            self.fingerprint
        )?;
        writeln!(f, "Batches:      {} x {} items", self.total_batches, self.batch_size)?;
        writeln!(
            f,
            "Requests:     {} items each, {} in flight, {:.1}s between batches",
            self.request_size,
            self.max_concurrent_requests,
            self.delay.as_secs_f64()
        )?;
        writeln!(f, "Output:       {}", self.output_path.display())?;
        match (&self.checkpoint, self.resumable) {
            (None, _) => write!(f, "Checkpoint:   none, run starts at batch 0"),
            (Some(cp), true) => write!(
                f,
                "Checkpoint:   resumable from batch {} ({} items done)",
                cp.next_batch_index(),
                cp.items_processed
            ),
            (Some(_), false) => write!(
                f,
                "Checkpoint:   does not match this input or batch size; use --restart"
            ),
        }
    }
}

/// Progress of a stage as recorded on disk.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub stage: String,
    pub checkpoint_path: PathBuf,
    pub checkpoint: Option<Checkpoint>,
    /// Rows in the partial results file, when it exists.
    pub partial_rows: Option<usize>,
    /// First rows of the partial results file.
    pub preview: Vec<PartialRecord>,
}

/// Read the checkpoint and preview the first `preview_rows` partial rows.
pub async fn status(config: &Config, preview_rows: usize) -> Result<StatusReport, PipelineError> {
    let checkpoint_path = config.checkpoint_path();
    let checkpoint = CheckpointStore::new(&checkpoint_path)
        .load()
        .await
        .context(CheckpointSnafu)?;

    let partial_path = config.partial_path();
    let (partial_rows, preview) = match tokio::fs::metadata(&partial_path).await {
        Ok(_) => {
            let (_, mut rows) = read_all(&partial_path).await.context(SinkSnafu)?;
            let count = rows.len();
            rows.truncate(preview_rows);
            (Some(count), rows)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => (None, Vec::new()),
        Err(e) => {
            return Err(e)
                .context(SinkIoSnafu {
                    path: &partial_path,
                })
                .context(SinkSnafu);
        }
    };

    Ok(StatusReport {
        stage: config.stage.clone(),
        checkpoint_path,
        checkpoint,
        partial_rows,
        preview,
    })
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(cp) = &self.checkpoint else {
            return write!(
                f,
                "No checkpoint for stage '{}' at {}",
                self.stage,
                self.checkpoint_path.display()
            );
        };

        writeln!(f, "Stage:            {}", cp.stage)?;
        writeln!(
            f,
            "Batch:            {}/{}",
            cp.last_completed_batch_index + 1,
            cp.total_batches
        )?;
        writeln!(
            f,
            "Processed:        {}/{} ({:.1}%)",
            cp.items_processed,
            cp.fingerprint.item_count,
            cp.completion_percent()
        )?;
        writeln!(f, "Rate limit hits:  {}", cp.rate_limit_stats.rate_limit_hits)?;
        writeln!(
            f,
            "Total wait:       {:.1}s",
            cp.rate_limit_stats.total_wait_ms as f64 / 1000.0
        )?;
        writeln!(f, "Last update:      {}", cp.updated_at.format("%Y-%m-%d %H:%M:%S UTC"))?;
        writeln!(f, "Speed:            {:.1} items/min", cp.run_stats.items_per_minute)?;
        writeln!(
            f,
            "ETA:              {}",
            format_eta(cp.run_stats.eta_secs.map(Duration::from_secs))
        )?;
        let errors = &cp.run_stats.errors;
        write!(
            f,
            "Errors:           rate_limit={} transient={} fatal={} parse={} file_system={}",
            errors.rate_limit, errors.transient, errors.fatal, errors.parse, errors.file_system
        )?;

        if let Some(rows) = self.partial_rows {
            write!(f, "\nPartial results:  {rows} rows")?;
            for record in &self.preview {
                let outcome = serde_json::to_string(&record.outcome).unwrap_or_default();
                write!(f, "\n  {}: {}", record.key, outcome)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{ItemOutcome, PartialHeader, PartialResultSink};
    use crate::source::{InputFingerprint, InputItem};
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> Config {
        let yaml = format!(
            "input:\n  path: {}\n  format: lines\noutput:\n  path: {}\n  work_dir: {}\nbatch:\n  size: 2\nclassifier:\n  api_key: k\n",
            dir.path().join("terms.txt").display(),
            dir.path().join("out.ndjson").display(),
            dir.path().join("work").display(),
        );
        Config::from_yaml(&yaml).unwrap()
    }

    #[tokio::test]
    async fn test_status_without_checkpoint() {
        let dir = TempDir::new().unwrap();
        let report = status(&config(&dir), 5).await.unwrap();
        assert!(report.checkpoint.is_none());
        assert!(report.partial_rows.is_none());
        assert!(report.to_string().starts_with("No checkpoint"));
    }

    #[tokio::test]
    async fn test_status_previews_partial_rows() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);

        let fp = InputFingerprint::compute("terms", b"a\nb\nc\n", 3);
        let mut cp = Checkpoint::first("classify", fp.clone(), 2, 2, 2);
        cp.rate_limit_stats.rate_limit_hits = 4;
        CheckpointStore::new(config.checkpoint_path())
            .save(&cp)
            .await
            .unwrap();

        let header = PartialHeader::new("classify", fp.digest(), 2);
        let mut sink = PartialResultSink::create(config.partial_path(), &header)
            .await
            .unwrap();
        let records: Vec<_> = ["a", "b"]
            .iter()
            .map(|k| PartialRecord::new(&InputItem::new(*k), ItemOutcome::missing()))
            .collect();
        sink.append(&records).await.unwrap();

        let report = status(&config, 1).await.unwrap();
        assert_eq!(report.partial_rows, Some(2));
        assert_eq!(report.preview.len(), 1);

        let text = report.to_string();
        assert!(text.contains("Processed:        2/3"));
        assert!(text.contains("Rate limit hits:  4"));
        assert!(text.contains("Partial results:  2 rows"));
    }

    #[tokio::test]
    async fn test_plan_counts_batches() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("terms.txt"), "a\nb\nc\n").unwrap();

        let plan = plan(&config(&dir)).await.unwrap();
        assert_eq!(plan.items, 3);
        assert_eq!(plan.total_batches, 2);
        assert!(plan.checkpoint.is_none());
        assert!(plan.to_string().contains("run starts at batch 0"));
    }
}
