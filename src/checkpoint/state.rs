//! Checkpoint state serialization.
//!
//! Defines the checkpoint record that captures everything needed to resume
//! a run, plus the cumulative statistics carried across resumed runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::source::InputFingerprint;

/// Current on-disk layout version.
pub const SCHEMA_VERSION: u32 = 1;

/// Cumulative rate-limit and retry statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitStats {
    /// Rate-limited responses received, retried or not.
    pub rate_limit_hits: u64,
    /// Retries caused by transient failures.
    pub transient_retries: u64,
    /// Calls that ran out of attempts.
    pub exhausted_calls: u64,
    /// Total time spent in backoff sleeps.
    pub total_wait_ms: u64,
}

impl RateLimitStats {
    /// Sum of two snapshots.
    pub fn merged(&self, other: &RateLimitStats) -> RateLimitStats {
        RateLimitStats {
            rate_limit_hits: self.rate_limit_hits + other.rate_limit_hits,
            transient_retries: self.transient_retries + other.transient_retries,
            exhausted_calls: self.exhausted_calls + other.exhausted_calls,
            total_wait_ms: self.total_wait_ms + other.total_wait_ms,
        }
    }
}

/// Error counts by category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorCounts {
    pub rate_limit: u64,
    pub transient: u64,
    pub fatal: u64,
    pub parse: u64,
    pub file_system: u64,
}

impl ErrorCounts {
    pub fn total(&self) -> u64 {
        self.rate_limit + self.transient + self.fatal + self.parse + self.file_system
    }
}

/// Progress statistics, restored on resume.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunStats {
    pub errors: ErrorCounts,
    /// Batches completed across all runs.
    pub batches_processed: u64,
    /// Rolling items per minute at the last save.
    pub items_per_minute: f64,
    /// Estimated seconds to completion at the last save.
    pub eta_secs: Option<u64>,
}

/// Complete checkpoint state for recovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    /// Stage name the checkpoint belongs to.
    pub stage: String,
    pub fingerprint: InputFingerprint,
    pub batch_size: usize,
    pub last_completed_batch_index: usize,
    pub items_processed: usize,
    pub total_batches: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub rate_limit_stats: RateLimitStats,
    #[serde(default)]
    pub run_stats: RunStats,
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

impl Checkpoint {
    /// Checkpoint after the first batch of a fresh run.
    pub fn first(
        stage: &str,
        fingerprint: InputFingerprint,
        batch_size: usize,
        total_batches: usize,
        items_in_batch: usize,
    ) -> Self {
        let now = Utc::now();
        Self {
            schema_version: SCHEMA_VERSION,
            stage: stage.to_string(),
            fingerprint,
            batch_size,
            last_completed_batch_index: 0,
            items_processed: items_in_batch,
            total_batches,
            created_at: now,
            updated_at: now,
            rate_limit_stats: RateLimitStats::default(),
            run_stats: RunStats::default(),
        }
    }

    /// Record completion of batch `index`.
    pub fn advance(&mut self, index: usize, items_in_batch: usize) {
        self.last_completed_batch_index = index;
        self.items_processed += items_in_batch;
        self.updated_at = Utc::now();
    }

    /// Index of the next batch to run.
    pub fn next_batch_index(&self) -> usize {
        self.last_completed_batch_index + 1
    }

    /// Whether every batch has been committed.
    pub fn is_complete(&self) -> bool {
        self.next_batch_index() >= self.total_batches
    }

    /// Items the checkpoint should cover given the dataset size.
    pub fn expected_items(&self) -> usize {
        self.next_batch_index()
            .saturating_mul(self.batch_size)
            .min(self.fingerprint.item_count)
    }

    /// Percentage of items processed.
    pub fn completion_percent(&self) -> f64 {
        if self.fingerprint.item_count == 0 {
            return 100.0;
        }
        self.items_processed as f64 * 100.0 / self.fingerprint.item_count as f64
    }
}
