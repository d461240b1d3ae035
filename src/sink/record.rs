//! Per-item result records.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::source::InputItem;

/// Why an item has no classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    /// The response said nothing about the item.
    Missing,
    /// The response mentioned the item but its segment could not be parsed.
    Malformed,
    /// The response mentioned a key that is not in the batch.
    Unmatched,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyKind::Missing => "missing",
            AnomalyKind::Malformed => "malformed",
            AnomalyKind::Unmatched => "unmatched",
        }
    }
}

/// Result for one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemOutcome {
    Classified {
        fields: Map<String, Value>,
    },
    Error {
        kind: AnomalyKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        raw: Option<String>,
    },
}

impl ItemOutcome {
    pub fn missing() -> Self {
        ItemOutcome::Error {
            kind: AnomalyKind::Missing,
            raw: None,
        }
    }

    pub fn malformed(raw: impl Into<String>) -> Self {
        ItemOutcome::Error {
            kind: AnomalyKind::Malformed,
            raw: Some(raw.into()),
        }
    }

    pub fn is_classified(&self) -> bool {
        matches!(self, ItemOutcome::Classified { .. })
    }
}

/// One row of the partial results file and of the final output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialRecord {
    pub key: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,
    pub outcome: ItemOutcome,
}

impl PartialRecord {
    pub fn new(item: &InputItem, outcome: ItemOutcome) -> Self {
        Self {
            key: item.key.clone(),
            attributes: item.attributes.clone(),
            outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outcome_wire_format() {
        let mut fields = Map::new();
        fields.insert("brand".into(), json!("nike"));
        let record = PartialRecord::new(
            &InputItem::new("nike shoes"),
            ItemOutcome::Classified { fields },
        );
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(
            value,
            json!({"key": "nike shoes", "outcome": {"status": "classified", "fields": {"brand": "nike"}}})
        );

        let record = PartialRecord::new(&InputItem::new("x"), ItemOutcome::malformed("x:9,9"));
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(
            value["outcome"],
            json!({"status": "error", "kind": "malformed", "raw": "x:9,9"})
        );
    }
}
