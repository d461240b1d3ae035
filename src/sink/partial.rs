//! Append-only partial results file.
//!
//! The file starts with a single header line identifying the dataset, then
//! holds one NDJSON record per processed item in input order. Rows are only
//! ever appended; each batch is flushed and fsynced before the checkpoint
//! that covers it is saved.
//!
//! A crash between the append and the checkpoint save leaves rows the
//! checkpoint does not know about. On resume those rows are cut off again so
//! the file and the checkpoint agree before the next batch runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::emit;
use crate::error::{
    CorruptRowSnafu, IntegritySnafu, MissingHeaderSnafu, PipelineError, RecordSerializeSnafu,
    SinkError, SinkIoSnafu, SinkSnafu,
};
use crate::metrics::events::{FileOperation, FileOperationCompleted};
use crate::source::InputItem;
use crate::storage;

use super::record::PartialRecord;

/// First line of the partial file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialHeader {
    pub stage: String,
    /// [`crate::source::InputFingerprint::digest`] of the input.
    pub fingerprint: String,
    pub batch_size: usize,
    pub created_at: DateTime<Utc>,
}

impl PartialHeader {
    pub fn new(stage: &str, fingerprint: String, batch_size: usize) -> Self {
        Self {
            stage: stage.to_string(),
            fingerprint,
            batch_size,
            created_at: Utc::now(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct HeaderLine {
    header: PartialHeader,
}

/// Single writer for the partial results file.
#[derive(Debug)]
pub struct PartialResultSink {
    path: PathBuf,
    file: File,
    rows: usize,
}

impl PartialResultSink {
    /// Create a fresh file, replacing any previous one, and write the header.
    pub async fn create(path: impl Into<PathBuf>, header: &PartialHeader) -> Result<Self, SinkError> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .context(SinkIoSnafu { path: parent })?;
        }

        let mut line = serde_json::to_vec(&HeaderLine {
            header: header.clone(),
        })
        .context(RecordSerializeSnafu { key: "header" })?;
        line.push(b'\n');

        let mut file = File::create(&path).await.context(SinkIoSnafu { path: &path })?;
        file.write_all(&line).await.context(SinkIoSnafu { path: &path })?;
        file.sync_all().await.context(SinkIoSnafu { path: &path })?;
        if let Some(parent) = path.parent() {
            storage::sync_dir(parent).await;
        }

        debug!(path = %path.display(), fingerprint = %header.fingerprint, "Created partial results file");
        Ok(Self {
            path,
            file,
            rows: 0,
        })
    }

    /// Reopen an existing file for appending after a resume.
    ///
    /// `committed` are the input items of every batch the checkpoint covers,
    /// in order. The file must hold exactly these keys first. Rows past that
    /// boundary are an uncommitted tail and are truncated away. Anything else
    /// is an integrity error and nothing is modified.
    pub async fn open_for_resume(
        path: impl Into<PathBuf>,
        fingerprint: &str,
        committed: &[InputItem],
    ) -> Result<Self, PipelineError> {
        let path = path.into();
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return IntegritySnafu {
                    message: format!(
                        "checkpoint covers {} items but partial results file {} is missing",
                        committed.len(),
                        path.display()
                    ),
                }
                .fail();
            }
            Err(e) => return Err(e).context(SinkIoSnafu { path: &path }).context(SinkSnafu),
        };

        let mut lines = CompleteLines::new(&bytes);
        let header = match lines.next() {
            Some((_, line)) => serde_json::from_slice::<HeaderLine>(line).ok(),
            None => None,
        };
        let Some(HeaderLine { header }) = header else {
            return IntegritySnafu {
                message: format!("partial results file {} has no header", path.display()),
            }
            .fail();
        };
        ensure!(
            header.fingerprint == fingerprint,
            IntegritySnafu {
                message: format!(
                    "partial results file was written for input {} but the checkpoint is for {}",
                    header.fingerprint, fingerprint
                ),
            }
        );

        let mut committed_end = lines.consumed();
        let mut rows = 0;
        while rows < committed.len() {
            let Some((line_no, line)) = lines.next() else {
                break;
            };
            let record: PartialRecord = match serde_json::from_slice(line) {
                Ok(record) => record,
                Err(e) => {
                    return IntegritySnafu {
                        message: format!("corrupt row on line {line_no}: {e}"),
                    }
                    .fail();
                }
            };
            let expected = &committed[rows].key;
            ensure!(
                &record.key == expected,
                IntegritySnafu {
                    message: format!(
                        "row {} has key '{}' but input item {} is '{}'",
                        line_no, record.key, rows, expected
                    ),
                }
            );
            rows += 1;
            committed_end = lines.consumed();
        }

        ensure!(
            rows == committed.len(),
            IntegritySnafu {
                message: format!(
                    "checkpoint covers {} items but partial results file has {} rows",
                    committed.len(),
                    rows
                ),
            }
        );

        if committed_end < bytes.len() {
            warn!(
                path = %path.display(),
                surplus_bytes = bytes.len() - committed_end,
                "Truncating uncommitted rows from an interrupted batch"
            );
        }

        let mut file = OpenOptions::new()
            .write(true)
            .open(&path)
            .await
            .context(SinkIoSnafu { path: &path })
            .context(SinkSnafu)?;
        if committed_end < bytes.len() {
            file.set_len(committed_end as u64)
                .await
                .context(SinkIoSnafu { path: &path })
                .context(SinkSnafu)?;
            file.sync_all()
                .await
                .context(SinkIoSnafu { path: &path })
                .context(SinkSnafu)?;
        }
        // Writes go to the end of the (possibly truncated) file.
        drop(file);
        let file = OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .context(SinkIoSnafu { path: &path })
            .context(SinkSnafu)?;

        debug!(path = %path.display(), rows, "Reopened partial results file");
        Ok(Self { path, file, rows })
    }

    /// Durably append one batch of records.
    pub async fn append(&mut self, records: &[PartialRecord]) -> Result<(), SinkError> {
        let start = Instant::now();
        let mut buf = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buf, record).context(RecordSerializeSnafu {
                key: record.key.clone(),
            })?;
            buf.push(b'\n');
        }

        self.file
            .write_all(&buf)
            .await
            .context(SinkIoSnafu { path: &self.path })?;
        self.file
            .flush()
            .await
            .context(SinkIoSnafu { path: &self.path })?;
        self.file
            .sync_data()
            .await
            .context(SinkIoSnafu { path: &self.path })?;

        self.rows += records.len();
        emit!(FileOperationCompleted {
            operation: FileOperation::Append,
            duration: start.elapsed(),
        });
        Ok(())
    }

    /// Rows written so far, including those from earlier runs.
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read a partial results file end to end.
///
/// A torn final line is ignored; any other undecodable line is an error.
pub async fn read_all(path: &Path) -> Result<(PartialHeader, Vec<PartialRecord>), SinkError> {
    let bytes = tokio::fs::read(path).await.context(SinkIoSnafu { path })?;
    let mut lines = CompleteLines::new(&bytes);

    let header = lines
        .next()
        .and_then(|(_, line)| serde_json::from_slice::<HeaderLine>(line).ok())
        .context(MissingHeaderSnafu { path })?
        .header;

    let mut records = Vec::new();
    for (line_no, line) in lines.by_ref() {
        let record = serde_json::from_slice(line).context(CorruptRowSnafu {
            path,
            line: line_no,
        })?;
        records.push(record);
    }

    if lines.consumed() < bytes.len() {
        warn!(path = %path.display(), "Ignoring torn final line in partial results");
    }
    Ok((header, records))
}

/// Iterator over newline-terminated lines, yielding 1-based line numbers.
///
/// A trailing segment without a newline is never yielded.
struct CompleteLines<'a> {
    bytes: &'a [u8],
    pos: usize,
    line_no: usize,
}

impl<'a> CompleteLines<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            pos: 0,
            line_no: 0,
        }
    }

    /// Bytes covered by the lines yielded so far.
    fn consumed(&self) -> usize {
        self.pos
    }
}

impl<'a> Iterator for CompleteLines<'a> {
    type Item = (usize, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let rest = &self.bytes[self.pos..];
        let newline = rest.iter().position(|&b| b == b'\n')?;
        self.pos += newline + 1;
        self.line_no += 1;
        Some((self.line_no, &rest[..newline]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::record::ItemOutcome;
    use tempfile::TempDir;

    fn items(keys: &[&str]) -> Vec<InputItem> {
        keys.iter().map(|k| InputItem::new(*k)).collect()
    }

    fn records(keys: &[&str]) -> Vec<PartialRecord> {
        items(keys)
            .iter()
            .map(|item| PartialRecord::new(item, ItemOutcome::missing()))
            .collect()
    }

    fn header() -> PartialHeader {
        PartialHeader::new("classify", "abc123".into(), 2)
    }

    #[tokio::test]
    async fn test_create_append_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("classify.partial.ndjson");

        let mut sink = PartialResultSink::create(&path, &header()).await.unwrap();
        sink.append(&records(&["a", "b"])).await.unwrap();
        sink.append(&records(&["c"])).await.unwrap();
        assert_eq!(sink.rows(), 3);

        let (read_header, rows) = read_all(&path).await.unwrap();
        assert_eq!(read_header.fingerprint, "abc123");
        let keys: Vec<&str> = rows.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("{\"header\""));
        assert_eq!(content.matches("\"header\"").count(), 1);
    }

    #[tokio::test]
    async fn test_resume_appends_after_existing_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p.ndjson");

        let mut sink = PartialResultSink::create(&path, &header()).await.unwrap();
        sink.append(&records(&["a", "b"])).await.unwrap();
        drop(sink);

        let mut sink = PartialResultSink::open_for_resume(&path, "abc123", &items(&["a", "b"]))
            .await
            .unwrap();
        assert_eq!(sink.rows(), 2);
        sink.append(&records(&["c"])).await.unwrap();

        let (_, rows) = read_all(&path).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2].key, "c");
    }

    #[tokio::test]
    async fn test_resume_truncates_uncommitted_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p.ndjson");

        let mut sink = PartialResultSink::create(&path, &header()).await.unwrap();
        sink.append(&records(&["a", "b"])).await.unwrap();
        sink.append(&records(&["c", "d"])).await.unwrap();
        drop(sink);
        // Torn line from a write that never finished.
        let mut raw = std::fs::read(&path).unwrap();
        raw.extend_from_slice(b"{\"key\":\"e\",\"outc");
        std::fs::write(&path, raw).unwrap();

        let sink = PartialResultSink::open_for_resume(&path, "abc123", &items(&["a", "b"]))
            .await
            .unwrap();
        assert_eq!(sink.rows(), 2);
        drop(sink);

        let (_, rows) = read_all(&path).await.unwrap();
        let keys: Vec<&str> = rows.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_resume_with_missing_rows_is_integrity_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p.ndjson");

        let mut sink = PartialResultSink::create(&path, &header()).await.unwrap();
        sink.append(&records(&["a"])).await.unwrap();
        drop(sink);
        let before = std::fs::read(&path).unwrap();

        let err = PartialResultSink::open_for_resume(&path, "abc123", &items(&["a", "b"]))
            .await
            .unwrap_err();
        assert!(err.is_integrity());
        assert_eq!(std::fs::read(&path).unwrap(), before, "file must be untouched");
    }

    #[tokio::test]
    async fn test_resume_with_wrong_key_is_integrity_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p.ndjson");

        let mut sink = PartialResultSink::create(&path, &header()).await.unwrap();
        sink.append(&records(&["a", "x"])).await.unwrap();
        drop(sink);

        let err = PartialResultSink::open_for_resume(&path, "abc123", &items(&["a", "b"]))
            .await
            .unwrap_err();
        assert!(err.is_integrity());
        assert!(err.to_string().contains("'x'"));
    }

    #[tokio::test]
    async fn test_resume_with_other_fingerprint_is_integrity_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p.ndjson");
        PartialResultSink::create(&path, &header()).await.unwrap();

        let err = PartialResultSink::open_for_resume(&path, "different", &[])
            .await
            .unwrap_err();
        assert!(err.is_integrity());
    }

    #[tokio::test]
    async fn test_read_all_rejects_corrupt_row() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p.ndjson");
        let mut sink = PartialResultSink::create(&path, &header()).await.unwrap();
        sink.append(&records(&["a"])).await.unwrap();
        drop(sink);
        let mut raw = std::fs::read(&path).unwrap();
        raw.extend_from_slice(b"garbage\n");
        std::fs::write(&path, raw).unwrap();

        let err = read_all(&path).await.unwrap_err();
        assert!(matches!(err, SinkError::CorruptRow { line: 3, .. }));
    }
}
