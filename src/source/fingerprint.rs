//! Input dataset fingerprinting.
//!
//! A checkpoint is only valid for the exact dataset it was written against.
//! The fingerprint hashes the raw input bytes so an edited, reordered or
//! truncated input is detected before any work is resumed.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Identity of an input dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputFingerprint {
    /// Input path as configured. Informational only.
    pub source: String,
    /// Hex SHA-256 of the raw input bytes.
    pub content_sha256: String,
    /// Number of items loaded from the input.
    pub item_count: usize,
}

impl InputFingerprint {
    /// Fingerprint raw input bytes.
    pub fn compute(source: impl Into<String>, bytes: &[u8], item_count: usize) -> Self {
        Self {
            source: source.into(),
            content_sha256: hex::encode(Sha256::digest(bytes)),
            item_count,
        }
    }

    /// Short stable identifier, written into the partial file header.
    ///
    /// The source path is left out so a dataset can be moved between runs.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.content_sha256.as_bytes());
        hasher.update(b":");
        hasher.update(self.item_count.to_string().as_bytes());
        let full = hex::encode(hasher.finalize());
        full[..16].to_string()
    }

    /// Whether a checkpoint written against `other` may be resumed here.
    pub fn matches(&self, other: &InputFingerprint) -> bool {
        self.content_sha256 == other.content_sha256 && self.item_count == other.item_count
    }
}
