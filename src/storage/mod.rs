//! Local file primitives shared by the checkpoint store, the partial sink
//! and the finalizer.
//!
//! Whole-file replacement goes through [`atomic_write`]: the bytes land in a
//! uniquely named temp file in the destination directory, are fsynced, and
//! the temp file is renamed over the target. A reader therefore sees either
//! the previous complete file or the new one, never a mix.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use crate::emit;
use crate::metrics::events::{FileOperation, FileOperationCompleted};

/// Atomically replace `path` with `bytes`.
pub async fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let start = Instant::now();
    let parent = parent_dir(path);
    tokio::fs::create_dir_all(&parent).await?;

    let tmp = temp_path_for(path);
    if let Err(e) = write_synced(&tmp, bytes).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    sync_dir(&parent).await;

    emit!(FileOperationCompleted {
        operation: FileOperation::AtomicWrite,
        duration: start.elapsed(),
    });
    Ok(())
}

/// Remove `path`, treating an absent file as success.
///
/// Returns whether a file was actually removed.
pub async fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            emit!(FileOperationCompleted {
                operation: FileOperation::Remove,
                duration: std::time::Duration::ZERO,
            });
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Remove temp files left behind by an interrupted [`atomic_write`] of `path`.
pub async fn remove_stale_temps(path: &Path) -> io::Result<usize> {
    let parent = parent_dir(path);
    let prefix = temp_prefix(path);

    let mut entries = match tokio::fs::read_dir(&parent).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if name.to_string_lossy().starts_with(&prefix) && remove_if_exists(&entry.path()).await?
        {
            removed += 1;
        }
    }

    if removed > 0 {
        debug!(path = %path.display(), removed, "Removed stale temp files");
    }
    Ok(removed)
}

/// Fsync a directory so a completed rename survives a power loss.
///
/// Not every platform allows opening a directory; failures are ignored.
pub async fn sync_dir(dir: &Path) {
    if let Ok(handle) = tokio::fs::File::open(dir).await
        && let Err(e) = handle.sync_all().await
    {
        debug!(dir = %dir.display(), error = %e, "Directory fsync skipped");
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn temp_prefix(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    format!(".{name}.tmp.")
}

fn temp_path_for(path: &Path) -> PathBuf {
    parent_dir(path).join(format!("{}{}", temp_prefix(path), Uuid::new_v4()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_atomic_write_replaces_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");

        atomic_write(&path, b"first").await.unwrap();
        atomic_write(&path, b"second").await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1, "no temp files should remain");
    }

    #[tokio::test]
    async fn test_atomic_write_creates_parent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/deeper/out.ndjson");
        atomic_write(&path, b"x").await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_remove_if_exists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gone");
        assert!(!remove_if_exists(&path).await.unwrap());
        std::fs::write(&path, b"x").unwrap();
        assert!(remove_if_exists(&path).await.unwrap());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_remove_stale_temps_only_touches_own_prefix() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("classify.checkpoint.json");
        std::fs::write(dir.path().join(".classify.checkpoint.json.tmp.abc"), b"torn").unwrap();
        std::fs::write(dir.path().join(".other.json.tmp.abc"), b"keep").unwrap();
        std::fs::write(&path, b"{}").unwrap();

        assert_eq!(remove_stale_temps(&path).await.unwrap(), 1);
        assert!(path.exists());
        assert!(dir.path().join(".other.json.tmp.abc").exists());
    }
}
