//! Anomaly log for parse problems.
//!
//! Items the service answered badly are still committed with an error
//! placeholder, so nothing stops the run. This log keeps the raw fragments
//! in one NDJSON file for later inspection and reprocessing.

mod types;

pub use types::{AnomalyRecord, AnomalyStats};

use chrono::Utc;
use snafu::prelude::*;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::classify::parser::Anomaly;
use crate::config::AnomalyConfig;
use crate::error::{AnomalyLogError, AnomalySerializeSnafu, AnomalyWriteSnafu};

/// Buffers anomalies for the current batch and appends them to the log.
#[derive(Debug)]
pub struct AnomalyLog {
    path: PathBuf,
    buffer: Vec<AnomalyRecord>,
    stats: AnomalyStats,
}

impl AnomalyLog {
    /// Create the log from configuration. `None` when no path is configured.
    pub fn from_config(config: &AnomalyConfig) -> Option<Self> {
        let path = config.path.clone()?;
        info!("Anomaly log enabled: {}", path.display());
        Some(Self::new(path))
    }

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            buffer: Vec::new(),
            stats: AnomalyStats::default(),
        }
    }

    /// Queue the anomalies of one batch.
    pub fn record(&mut self, batch_index: usize, anomalies: &[Anomaly]) {
        let timestamp = Utc::now();
        for anomaly in anomalies {
            self.stats.increment(anomaly.kind);
            self.buffer.push(AnomalyRecord {
                key: anomaly.key.clone(),
                kind: anomaly.kind,
                raw: anomaly.raw.clone(),
                batch_index,
                timestamp,
            });
        }
    }

    /// Append buffered records to the log file.
    pub async fn flush(&mut self) -> Result<(), AnomalyLogError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let mut ndjson = Vec::new();
        for record in &self.buffer {
            serde_json::to_writer(&mut ndjson, record).context(AnomalySerializeSnafu)?;
            ndjson.push(b'\n');
        }

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .context(AnomalyWriteSnafu { path: parent })?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .context(AnomalyWriteSnafu { path: &self.path })?;
        file.write_all(&ndjson)
            .await
            .context(AnomalyWriteSnafu { path: &self.path })?;
        file.flush()
            .await
            .context(AnomalyWriteSnafu { path: &self.path })?;

        debug!("Flushed {} anomaly records", self.buffer.len());
        self.buffer.clear();
        Ok(())
    }

    /// Flush what is left and log per-kind totals.
    pub async fn finalize(&mut self) -> Result<(), AnomalyLogError> {
        self.flush().await?;
        info!(
            "Anomaly log finalized: {} total (missing={}, malformed={}, unmatched={})",
            self.stats.total(),
            self.stats.missing,
            self.stats.malformed,
            self.stats.unmatched
        );
        Ok(())
    }

    pub fn stats(&self) -> &AnomalyStats {
        &self.stats
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
