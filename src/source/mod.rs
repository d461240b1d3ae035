//! Input loading and batch partitioning.
//!
//! Items are read once at startup, keyed, checked for duplicates and then
//! sliced into fixed-size batches by index. Batch `i` always covers
//! `[i * size, min((i + 1) * size, len))`, so a batch index stored in a
//! checkpoint identifies the same items on every run.

pub mod fingerprint;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use snafu::prelude::*;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{
    DuplicateKeySnafu, InputEncodingSnafu, InputError, InvalidRecordSnafu, MissingKeySnafu,
    ReadInputSnafu,
};

pub use fingerprint::InputFingerprint;

/// Layout of the input file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputFormat {
    /// One JSON object per line.
    #[default]
    Ndjson,
    /// One key per line.
    Lines,
}

/// A single item to classify.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputItem {
    pub key: String,
    /// Passthrough fields in their original order.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,
}

impl InputItem {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            attributes: Map::new(),
        }
    }
}

/// The loaded, immutable input dataset.
#[derive(Debug, Clone)]
pub struct InputSet {
    items: Vec<InputItem>,
    fingerprint: InputFingerprint,
}

impl InputSet {
    /// Load and fingerprint the input file.
    pub async fn load(
        path: impl AsRef<Path>,
        format: InputFormat,
        key_field: &str,
    ) -> Result<Self, InputError> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path)
            .await
            .context(ReadInputSnafu { path })?;
        let set = Self::from_bytes(path, &bytes, format, key_field)?;
        debug!(
            path = %path.display(),
            items = set.len(),
            digest = %set.fingerprint.digest(),
            "Loaded input"
        );
        Ok(set)
    }

    /// Parse an in-memory input.
    pub fn from_bytes(
        source: &Path,
        bytes: &[u8],
        format: InputFormat,
        key_field: &str,
    ) -> Result<Self, InputError> {
        let text = String::from_utf8(bytes.to_vec()).context(InputEncodingSnafu {
            path: PathBuf::from(source),
        })?;

        let mut items = Vec::new();
        let mut seen = HashSet::new();

        for (index, line) in text.lines().enumerate() {
            let line_no = index + 1;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let item = match format {
                InputFormat::Lines => InputItem::new(line),
                InputFormat::Ndjson => parse_record(line, line_no, key_field)?,
            };

            ensure!(
                seen.insert(item.key.clone()),
                DuplicateKeySnafu {
                    key: item.key.clone(),
                    line: line_no,
                }
            );
            items.push(item);
        }

        let fingerprint =
            InputFingerprint::compute(source.display().to_string(), bytes, items.len());
        Ok(Self { items, fingerprint })
    }

    /// Build an input set directly from items. Used by tests and embedders.
    pub fn from_items(source: &str, items: Vec<InputItem>) -> Result<Self, InputError> {
        let mut seen = HashSet::new();
        let mut canonical = Vec::new();
        for (index, item) in items.iter().enumerate() {
            ensure!(
                seen.insert(item.key.as_str()),
                DuplicateKeySnafu {
                    key: item.key.clone(),
                    line: index + 1,
                }
            );
            canonical.push(item.key.as_str());
            canonical.push("\n");
        }
        let bytes = canonical.concat();
        let fingerprint = InputFingerprint::compute(source, bytes.as_bytes(), items.len());
        Ok(Self { items, fingerprint })
    }

    pub fn items(&self) -> &[InputItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn fingerprint(&self) -> &InputFingerprint {
        &self.fingerprint
    }

    /// Number of batches of `size` items, the last one possibly short.
    pub fn total_batches(&self, size: usize) -> usize {
        self.items.len().div_ceil(size.max(1))
    }

    /// Items of batch `index`. Empty when the index is past the end.
    pub fn batch(&self, index: usize, size: usize) -> &[InputItem] {
        let size = size.max(1);
        let start = index.saturating_mul(size).min(self.items.len());
        let end = start.saturating_add(size).min(self.items.len());
        &self.items[start..end]
    }

    /// Items covered by batches `0..=last_batch`.
    pub fn committed_items(&self, last_batch: usize, size: usize) -> &[InputItem] {
        let end = last_batch
            .saturating_add(1)
            .saturating_mul(size.max(1))
            .min(self.items.len());
        &self.items[..end]
    }
}

fn parse_record(line: &str, line_no: usize, key_field: &str) -> Result<InputItem, InputError> {
    let mut attributes: Map<String, Value> =
        serde_json::from_str(line).context(InvalidRecordSnafu { line: line_no })?;

    let key = match attributes.shift_remove(key_field) {
        Some(Value::String(key)) if !key.trim().is_empty() => key.trim().to_string(),
        _ => {
            return MissingKeySnafu {
                line: line_no,
                field: key_field,
            }
            .fail();
        }
    };

    Ok(InputItem { key, attributes })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(text: &str, format: InputFormat) -> Result<InputSet, InputError> {
        InputSet::from_bytes(Path::new("terms"), text.as_bytes(), format, "search_term")
    }

    #[test]
    fn test_ndjson_keeps_attribute_order() {
        let set = load(
            r#"{"search_term":"yoga mat","jan":120,"feb":80,"dec":40}
{"search_term":"  kettle ","jan":5}
"#,
            InputFormat::Ndjson,
        )
        .unwrap();

        assert_eq!(set.len(), 2);
        assert_eq!(set.items()[0].key, "yoga mat");
        let fields: Vec<&str> = set.items()[0].attributes.keys().map(String::as_str).collect();
        assert_eq!(fields, vec!["jan", "feb", "dec"]);
        assert_eq!(set.items()[1].key, "kettle");
    }

    #[test]
    fn test_lines_format_skips_blank_lines() {
        let set = load("alpha\n\n beta \ngamma\n", InputFormat::Lines).unwrap();
        let keys: Vec<&str> = set.items().iter().map(|i| i.key.as_str()).collect();
        assert_eq!(keys, vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn test_duplicate_key_is_rejected() {
        let err = load("alpha\nbeta\nalpha\n", InputFormat::Lines).unwrap_err();
        assert!(matches!(err, InputError::DuplicateKey { ref key, line: 3 } if key == "alpha"));
    }

    #[test]
    fn test_missing_key_field() {
        let err = load(r#"{"term":"alpha"}"#, InputFormat::Ndjson).unwrap_err();
        assert!(matches!(err, InputError::MissingKey { line: 1, .. }));
    }

    #[test]
    fn test_invalid_json_line() {
        let err = load("{\"search_term\":\"a\"}\nnot json\n", InputFormat::Ndjson).unwrap_err();
        assert!(matches!(err, InputError::InvalidRecord { line: 2, .. }));
    }

    #[test]
    fn test_batch_slicing() {
        let set = load("a\nb\nc\nd\ne\nf\ng\n", InputFormat::Lines).unwrap();
        assert_eq!(set.total_batches(3), 3);
        assert_eq!(set.batch(0, 3).len(), 3);
        assert_eq!(set.batch(2, 3).len(), 1);
        assert_eq!(set.batch(2, 3)[0].key, "g");
        assert!(set.batch(3, 3).is_empty());
        assert_eq!(set.committed_items(1, 3).len(), 6);
        assert_eq!(set.committed_items(2, 3).len(), 7);
    }

    #[test]
    fn test_empty_input() {
        let set = load("", InputFormat::Lines).unwrap();
        assert!(set.is_empty());
        assert_eq!(set.total_batches(20), 0);
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("terms.txt");
        std::fs::write(&path, "alpha\nbeta\n").unwrap();

        let set = InputSet::load(&path, InputFormat::Lines, "search_term")
            .await
            .unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.fingerprint().item_count, 2);
    }
}
