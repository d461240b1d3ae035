//! Response parsing.
//!
//! Service responses are free text describing every item of a batch. Items
//! are matched by the key the response repeats back (trimmed and compared
//! case-insensitively), never by position, so a response that skips or
//! reorders entries cannot shift results onto the wrong item.
//!
//! Every batch item ends up with exactly one outcome:
//! - a matched, well-formed segment gives a classification
//! - a matched segment that fails validation gives a `malformed` error with
//!   the raw segment kept, as does a segment that names an item but lacks
//!   the `:` separator
//! - an item the response never mentions gives a `missing` error
//!
//! Segments naming no batch item are reported as `unmatched` anomalies and
//! otherwise ignored. When a key appears twice the first segment wins.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::debug;

use crate::config::ResponseConfig;
use crate::sink::{AnomalyKind, ItemOutcome, PartialRecord};
use crate::source::InputItem;

/// Response layout expected from the service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseFormat {
    /// `key:label, key:label, ...`
    #[default]
    Label,
    /// `key:n,n,...; key:n,n,...`
    Assessment,
}

/// A named integer score with an inclusive range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssessmentField {
    pub name: String,
    pub min: i64,
    pub max: i64,
}

impl AssessmentField {
    pub fn new(name: &str, min: i64, max: i64) -> Self {
        Self {
            name: name.to_string(),
            min,
            max,
        }
    }

    /// Four 0-5 ratings followed by three 0/1 flags.
    pub fn defaults() -> Vec<AssessmentField> {
        vec![
            Self::new("seasonal", 0, 5),
            Self::new("specificity", 0, 5),
            Self::new("commodity", 0, 5),
            Self::new("subscribe_save", 0, 5),
            Self::new("gated", 0, 1),
            Self::new("electronics_batteries", 0, 1),
            Self::new("insurance_gov", 0, 1),
        ]
    }
}

/// A parse anomaly, reported to logs, metrics and the anomaly log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Anomaly {
    pub key: String,
    pub kind: AnomalyKind,
    pub raw: Option<String>,
}

/// Outcome of parsing one response.
#[derive(Debug, Clone, Default)]
pub struct ParsedBatch {
    /// One outcome per batch key, in batch order.
    pub outcomes: IndexMap<String, ItemOutcome>,
    /// Segments that named no batch item.
    pub unmatched: Vec<String>,
}

impl ParsedBatch {
    /// Merge the outcomes of a sub-request into this batch.
    pub fn extend(&mut self, other: ParsedBatch) {
        self.outcomes.extend(other.outcomes);
        self.unmatched.extend(other.unmatched);
    }

    /// Every anomaly in this batch, items first.
    pub fn anomalies(&self) -> Vec<Anomaly> {
        let mut anomalies: Vec<Anomaly> = self
            .outcomes
            .iter()
            .filter_map(|(key, outcome)| match outcome {
                ItemOutcome::Error { kind, raw } => Some(Anomaly {
                    key: key.clone(),
                    kind: *kind,
                    raw: raw.clone(),
                }),
                ItemOutcome::Classified { .. } => None,
            })
            .collect();
        anomalies.extend(self.unmatched.iter().map(|segment| Anomaly {
            key: segment_key(segment).to_string(),
            kind: AnomalyKind::Unmatched,
            raw: Some(segment.clone()),
        }));
        anomalies
    }

    /// Records for the partial sink, in batch order.
    ///
    /// Items without an outcome get a `missing` placeholder.
    pub fn into_records(mut self, batch: &[InputItem]) -> Vec<PartialRecord> {
        batch
            .iter()
            .map(|item| {
                let outcome = self
                    .outcomes
                    .swap_remove(&item.key)
                    .unwrap_or_else(ItemOutcome::missing);
                PartialRecord::new(item, outcome)
            })
            .collect()
    }
}

/// Turns one raw response into per-item outcomes.
pub trait ResponseParser: Send + Sync {
    fn parse(&self, batch: &[InputItem], raw: &str) -> ParsedBatch;
}

/// Build the parser selected in the configuration.
pub fn from_config(config: &ResponseConfig) -> Box<dyn ResponseParser> {
    match config.format {
        ResponseFormat::Label => Box::new(LabelParser::new(&config.label_field)),
        ResponseFormat::Assessment => Box::new(AssessmentParser::new(config.fields.clone())),
    }
}

/// Parses `key:label` pairs separated by commas.
#[derive(Debug, Clone)]
pub struct LabelParser {
    field: String,
}

impl LabelParser {
    pub fn new(field: &str) -> Self {
        Self {
            field: field.to_string(),
        }
    }
}

impl Default for LabelParser {
    fn default() -> Self {
        Self::new("label")
    }
}

impl ResponseParser for LabelParser {
    fn parse(&self, batch: &[InputItem], raw: &str) -> ParsedBatch {
        parse_segments(batch, raw, ',', |value| {
            let label = unquote(value);
            if label.is_empty() {
                return None;
            }
            let mut fields = Map::new();
            fields.insert(self.field.clone(), Value::String(label.to_string()));
            Some(fields)
        })
    }
}

/// Parses `key:n1,n2,...` segments separated by semicolons.
#[derive(Debug, Clone)]
pub struct AssessmentParser {
    fields: Vec<AssessmentField>,
}

impl AssessmentParser {
    pub fn new(fields: Vec<AssessmentField>) -> Self {
        Self { fields }
    }
}

impl Default for AssessmentParser {
    fn default() -> Self {
        Self::new(AssessmentField::defaults())
    }
}

impl ResponseParser for AssessmentParser {
    fn parse(&self, batch: &[InputItem], raw: &str) -> ParsedBatch {
        parse_segments(batch, raw, ';', |value| {
            let scores: Vec<&str> = value.split(',').map(str::trim).collect();
            if scores.len() != self.fields.len() {
                return None;
            }
            let mut fields = Map::new();
            for (field, score) in self.fields.iter().zip(scores) {
                let score: i64 = score.parse().ok()?;
                if !(field.min..=field.max).contains(&score) {
                    return None;
                }
                fields.insert(field.name.clone(), Value::from(score));
            }
            Some(fields)
        })
    }
}

/// Shared matching logic. `value_parser` returns `None` for a malformed value.
fn parse_segments<F>(batch: &[InputItem], raw: &str, separator: char, value_parser: F) -> ParsedBatch
where
    F: Fn(&str) -> Option<Map<String, Value>>,
{
    // Lowercased key -> batch positions. Several positions only when keys
    // differ by case alone.
    let mut by_key: HashMap<String, Vec<usize>> = HashMap::new();
    for (index, item) in batch.iter().enumerate() {
        by_key
            .entry(item.key.trim().to_lowercase())
            .or_default()
            .push(index);
    }

    let mut slots: Vec<Option<ItemOutcome>> = vec![None; batch.len()];
    let mut unmatched = Vec::new();

    for segment in raw.split(separator) {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }

        let Some((key, value)) = segment.rsplit_once(':') else {
            // No separator: still malformed for the item it names, if any.
            let Some(positions) = unseparated_key(segment, &by_key) else {
                unmatched.push(segment.to_string());
                continue;
            };
            match positions.iter().copied().find(|&p| slots[p].is_none()) {
                Some(slot) => slots[slot] = Some(ItemOutcome::malformed(segment)),
                None => debug!(segment = %segment, "Ignoring repeated entry in response"),
            }
            continue;
        };
        let key = unquote(key).to_lowercase();
        let Some(positions) = by_key.get(&key) else {
            unmatched.push(segment.to_string());
            continue;
        };
        let Some(&slot) = positions.iter().find(|&&p| slots[p].is_none()) else {
            debug!(key = %key, "Ignoring repeated entry in response");
            continue;
        };

        slots[slot] = Some(match value_parser(value.trim()) {
            Some(fields) => ItemOutcome::Classified { fields },
            None => ItemOutcome::malformed(segment),
        });
    }

    let outcomes = batch
        .iter()
        .zip(slots)
        .map(|(item, slot)| (item.key.clone(), slot.unwrap_or_else(ItemOutcome::missing)))
        .collect();

    ParsedBatch {
        outcomes,
        unmatched,
    }
}

/// Batch positions for a segment without a `:`, matched on the whole segment
/// or else on the longest batch key it starts with, followed by whitespace.
fn unseparated_key<'a>(
    segment: &str,
    by_key: &'a HashMap<String, Vec<usize>>,
) -> Option<&'a Vec<usize>> {
    let text = unquote(segment).to_lowercase();
    if let Some(positions) = by_key.get(&text) {
        return Some(positions);
    }
    by_key
        .iter()
        .filter(|(key, _)| {
            !key.is_empty()
                && text
                    .strip_prefix(key.as_str())
                    .is_some_and(|rest| rest.starts_with(char::is_whitespace))
        })
        .max_by_key(|(key, _)| key.len())
        .map(|(_, positions)| positions)
}

fn unquote(s: &str) -> &str {
    s.trim().trim_matches(|c| c == '"' || c == '\'').trim()
}

fn segment_key(segment: &str) -> &str {
    segment
        .rsplit_once(':')
        .map_or(segment, |(key, _)| unquote(key))
}
