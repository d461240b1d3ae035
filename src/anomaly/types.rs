//! Anomaly log types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sink::AnomalyKind;

/// One line of the anomaly log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyRecord {
    /// Item key, or the key named by an unmatched segment.
    pub key: String,
    pub kind: AnomalyKind,
    /// Raw response fragment, when there was one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
    pub batch_index: usize,
    pub timestamp: DateTime<Utc>,
}

/// Anomaly counts by kind.
#[derive(Debug, Clone, Default)]
pub struct AnomalyStats {
    pub missing: usize,
    pub malformed: usize,
    pub unmatched: usize,
}

impl AnomalyStats {
    pub fn increment(&mut self, kind: AnomalyKind) {
        match kind {
            AnomalyKind::Missing => self.missing += 1,
            AnomalyKind::Malformed => self.malformed += 1,
            AnomalyKind::Unmatched => self.unmatched += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.missing + self.malformed + self.unmatched
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_increment() {
        let mut stats = AnomalyStats::default();
        stats.increment(AnomalyKind::Missing);
        stats.increment(AnomalyKind::Missing);
        stats.increment(AnomalyKind::Unmatched);

        assert_eq!(stats.missing, 2);
        assert_eq!(stats.unmatched, 1);
        assert_eq!(stats.total(), 3);
    }

    #[test]
    fn test_record_deserialization() {
        let json = r#"{"key":"nike","kind":"malformed","raw":"nike:","batch_index":4,"timestamp":"2026-01-26T10:30:00Z"}"#;
        let record: AnomalyRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.key, "nike");
        assert_eq!(record.kind, AnomalyKind::Malformed);
        assert_eq!(record.batch_index, 4);
    }
}
