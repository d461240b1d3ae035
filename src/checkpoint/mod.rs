//! Checkpoint persistence for resumable runs.
//!
//! # Atomic Checkpointing
//!
//! The checkpoint is a single pretty-printed JSON file per stage. Every save
//! replaces it through a temp file, fsync and rename, so a crash at any point
//! leaves either the previous checkpoint or the new one on disk. Temp files
//! orphaned by such a crash are never read by [`CheckpointStore::load`] and
//! are swept by [`CheckpointStore::delete`].

pub mod state;

pub use state::{Checkpoint, ErrorCounts, RateLimitStats, RunStats, SCHEMA_VERSION};

use snafu::prelude::*;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::emit;
use crate::error::{
    CheckpointError, CheckpointJsonSnafu, CheckpointReadSnafu, CheckpointRemoveSnafu,
    CheckpointWriteSnafu,
};
use crate::metrics::events::CheckpointSaved;
use crate::storage;

/// Loads, saves and deletes the checkpoint of one stage.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the checkpoint, if one exists.
    pub async fn load(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).context(CheckpointReadSnafu { path: &self.path });
            }
        };

        let checkpoint: Checkpoint =
            serde_json::from_slice(&bytes).context(CheckpointJsonSnafu { path: &self.path })?;

        if checkpoint.schema_version > state::SCHEMA_VERSION {
            warn!(
                found = checkpoint.schema_version,
                supported = state::SCHEMA_VERSION,
                "Checkpoint written by a newer version; unknown fields are ignored"
            );
        }

        debug!(
            path = %self.path.display(),
            last_completed_batch = checkpoint.last_completed_batch_index,
            items_processed = checkpoint.items_processed,
            "Loaded checkpoint"
        );
        Ok(Some(checkpoint))
    }

    /// Atomically replace the on-disk checkpoint.
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let json =
            serde_json::to_vec_pretty(checkpoint).context(CheckpointJsonSnafu { path: &self.path })?;
        storage::atomic_write(&self.path, &json)
            .await
            .context(CheckpointWriteSnafu { path: &self.path })?;

        emit!(CheckpointSaved {
            batch_index: checkpoint.last_completed_batch_index,
        });
        debug!(
            batch = checkpoint.last_completed_batch_index,
            items_processed = checkpoint.items_processed,
            "Checkpoint saved"
        );
        Ok(())
    }

    /// Remove the checkpoint and any stale temp files. Absent is fine.
    pub async fn delete(&self) -> Result<(), CheckpointError> {
        storage::remove_if_exists(&self.path)
            .await
            .context(CheckpointRemoveSnafu { path: &self.path })?;
        storage::remove_stale_temps(&self.path)
            .await
            .context(CheckpointRemoveSnafu { path: &self.path })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::InputFingerprint;
    use tempfile::TempDir;

    fn checkpoint() -> Checkpoint {
        let fp = InputFingerprint::compute("terms", b"a\nb\nc\n", 3);
        Checkpoint::first("classify", fp, 2, 2, 2)
    }

    #[tokio::test]
    async fn test_load_absent_returns_none() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("classify.checkpoint.json"));
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("classify.checkpoint.json"));

        let mut cp = checkpoint();
        cp.rate_limit_stats.rate_limit_hits = 3;
        store.save(&cp).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded, cp);
    }

    #[tokio::test]
    async fn test_save_overwrites_previous() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("classify.checkpoint.json"));

        let mut cp = checkpoint();
        store.save(&cp).await.unwrap();
        cp.advance(1, 1);
        store.save(&cp).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.last_completed_batch_index, 1);
        assert_eq!(loaded.items_processed, 3);
    }

    #[tokio::test]
    async fn test_corrupt_checkpoint_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("classify.checkpoint.json");
        std::fs::write(&path, b"{\"stage\":").unwrap();

        let err = CheckpointStore::new(&path).load().await.unwrap_err();
        assert!(matches!(err, CheckpointError::CheckpointJson { .. }));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("classify.checkpoint.json"));
        store.delete().await.unwrap();

        store.save(&checkpoint()).await.unwrap();
        store.delete().await.unwrap();
        assert!(store.load().await.unwrap().is_none());
        store.delete().await.unwrap();
    }
}
