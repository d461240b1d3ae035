//! Final output assembly.
//!
//! Runs once every batch is committed. The partial file is validated against
//! the input before anything is written, and run artifacts are only removed
//! after the output has been atomically renamed into place.

use snafu::prelude::*;
use std::io;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::checkpoint::CheckpointStore;
use crate::error::{
    CheckpointSnafu, IntegritySnafu, PipelineError, RecordSerializeSnafu, SinkIoSnafu, SinkSnafu,
};
use crate::source::InputSet;
use crate::storage;

use super::partial::read_all;
use super::record::PartialRecord;

/// Merges the partial results into the final output and cleans up.
pub struct Finalizer<'a> {
    output_path: PathBuf,
    partial_path: PathBuf,
    checkpoints: &'a CheckpointStore,
}

impl<'a> Finalizer<'a> {
    pub fn new(
        output_path: impl Into<PathBuf>,
        partial_path: impl Into<PathBuf>,
        checkpoints: &'a CheckpointStore,
    ) -> Self {
        Self {
            output_path: output_path.into(),
            partial_path: partial_path.into(),
            checkpoints,
        }
    }

    /// Validate, write the output, then delete checkpoint and partial file.
    ///
    /// Returns the number of rows written. On validation failure nothing is
    /// written or deleted.
    pub async fn finalize(&self, input: &InputSet) -> Result<usize, PipelineError> {
        let records = if input.is_empty() {
            Vec::new()
        } else {
            let (header, records) = read_all(&self.partial_path).await.context(SinkSnafu)?;

            let expected = input.fingerprint().digest();
            ensure!(
                header.fingerprint == expected,
                IntegritySnafu {
                    message: format!(
                        "partial results belong to input {} but current input is {}",
                        header.fingerprint, expected
                    ),
                }
            );
            ensure!(
                records.len() == input.len(),
                IntegritySnafu {
                    message: format!(
                        "expected {} rows in partial results, found {}",
                        input.len(),
                        records.len()
                    ),
                }
            );
            if let Some((index, (record, item))) = records
                .iter()
                .zip(input.items())
                .enumerate()
                .find(|(_, (record, item))| record.key != item.key)
            {
                return IntegritySnafu {
                    message: format!(
                        "row {} has key '{}' but input item is '{}'",
                        index, record.key, item.key
                    ),
                }
                .fail();
            }
            records
        };

        let mut buf = Vec::new();
        for record in &records {
            serde_json::to_writer(&mut buf, record)
                .context(RecordSerializeSnafu {
                    key: record.key.clone(),
                })
                .context(SinkSnafu)?;
            buf.push(b'\n');
        }
        storage::atomic_write(&self.output_path, &buf)
            .await
            .context(SinkIoSnafu {
                path: &self.output_path,
            })
            .context(SinkSnafu)?;

        self.cleanup().await?;

        info!(
            output = %self.output_path.display(),
            rows = records.len(),
            "Final output written"
        );
        Ok(records.len())
    }

    /// The partial file goes first: a checkpoint without one, next to a
    /// complete output, is recognised by [`Finalizer::finish_interrupted`].
    async fn cleanup(&self) -> Result<(), PipelineError> {
        storage::remove_if_exists(&self.partial_path)
            .await
            .context(SinkIoSnafu {
                path: &self.partial_path,
            })
            .context(SinkSnafu)?;
        self.checkpoints.delete().await.context(CheckpointSnafu)?;
        Ok(())
    }

    /// Complete a cleanup that stopped after the partial file was removed.
    ///
    /// The caller has checked that the checkpoint covers every batch of
    /// `input`. When the partial file is gone and the output holds exactly
    /// the input's keys in order, the checkpoint is deleted and `true` is
    /// returned. Anything else is left untouched.
    pub async fn finish_interrupted(&self, input: &InputSet) -> Result<bool, PipelineError> {
        let partial_exists = tokio::fs::try_exists(&self.partial_path)
            .await
            .context(SinkIoSnafu {
                path: &self.partial_path,
            })
            .context(SinkSnafu)?;
        if partial_exists {
            return Ok(false);
        }
        let content = match tokio::fs::read_to_string(&self.output_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => {
                return Err(e)
                    .context(SinkIoSnafu {
                        path: &self.output_path,
                    })
                    .context(SinkSnafu);
            }
        };

        let keys: Vec<Option<String>> = content
            .lines()
            .map(|line| {
                serde_json::from_str::<PartialRecord>(line)
                    .ok()
                    .map(|record| record.key)
            })
            .collect();
        let complete = keys.len() == input.len()
            && keys
                .iter()
                .zip(input.items())
                .all(|(key, item)| key.as_deref() == Some(item.key.as_str()));
        if !complete {
            return Ok(false);
        }

        self.checkpoints.delete().await.context(CheckpointSnafu)?;
        info!(
            output = %self.output_path.display(),
            "Output was already complete, removed leftover checkpoint"
        );
        Ok(true)
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }
}
