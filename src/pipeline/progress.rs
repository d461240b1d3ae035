//! Throughput and ETA tracking.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use crate::checkpoint::RateLimitStats;

/// Number of recent batches the speed estimate is averaged over.
pub const SPEED_WINDOW: usize = 10;

/// Tracks per-batch speed for the current run.
#[derive(Debug, Clone, Default)]
pub struct ProgressTracker {
    recent: VecDeque<f64>,
    batches: usize,
    items: usize,
    busy: Duration,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a committed batch.
    pub fn record(&mut self, items: usize, elapsed: Duration) {
        let minutes = elapsed.as_secs_f64() / 60.0;
        if minutes > 0.0 {
            if self.recent.len() == SPEED_WINDOW {
                self.recent.pop_front();
            }
            self.recent.push_back(items as f64 / minutes);
        }
        self.batches += 1;
        self.items += items;
        self.busy += elapsed;
    }

    /// Mean items per minute over the last [`SPEED_WINDOW`] batches.
    pub fn items_per_minute(&self) -> f64 {
        if self.recent.is_empty() {
            return 0.0;
        }
        self.recent.iter().sum::<f64>() / self.recent.len() as f64
    }

    /// Estimated time to process `remaining` items, if a speed is known.
    pub fn eta(&self, remaining: usize) -> Option<Duration> {
        let speed = self.items_per_minute();
        if speed <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining as f64 / speed * 60.0))
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    /// Summary for the end of a run.
    pub fn report(&self, rate_limits: RateLimitStats) -> PerformanceReport {
        let average_batch = if self.batches == 0 {
            Duration::ZERO
        } else {
            self.busy / self.batches as u32
        };
        PerformanceReport {
            batches: self.batches,
            items: self.items,
            average_batch,
            items_per_minute: self.items_per_minute(),
            rate_limits,
        }
    }
}

/// Performance of one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PerformanceReport {
    /// Batches committed during this run.
    pub batches: usize,
    pub items: usize,
    pub average_batch: Duration,
    pub items_per_minute: f64,
    /// Cumulative across resumed runs.
    pub rate_limits: RateLimitStats,
}

impl fmt::Display for PerformanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "batches={} items={} avg_batch={:.1}s speed={:.1}/min rate_limits={} waited={:.1}s",
            self.batches,
            self.items,
            self.average_batch.as_secs_f64(),
            self.items_per_minute,
            self.rate_limits.rate_limit_hits,
            self.rate_limits.total_wait_ms as f64 / 1000.0
        )
    }
}

/// Human-readable ETA, in minutes below an hour and hours above.
pub fn format_eta(eta: Option<Duration>) -> String {
    let Some(eta) = eta else {
        return "unknown".to_string();
    };
    let minutes = eta.as_secs_f64() / 60.0;
    if minutes < 60.0 {
        format!("{minutes:.1} minutes")
    } else {
        format!("{:.1} hours", minutes / 60.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speed_and_eta() {
        let mut tracker = ProgressTracker::new();
        assert_eq!(tracker.eta(100), None);

        tracker.record(20, Duration::from_secs(30));
        assert_eq!(tracker.items_per_minute(), 40.0);
        assert_eq!(tracker.eta(80), Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_window_keeps_recent_batches() {
        let mut tracker = ProgressTracker::new();
        for _ in 0..SPEED_WINDOW {
            tracker.record(10, Duration::from_secs(60));
        }
        assert_eq!(tracker.items_per_minute(), 10.0);

        for _ in 0..SPEED_WINDOW {
            tracker.record(30, Duration::from_secs(60));
        }
        assert_eq!(tracker.items_per_minute(), 30.0);
        assert_eq!(tracker.batches(), 2 * SPEED_WINDOW);
    }

    #[test]
    fn test_report() {
        let mut tracker = ProgressTracker::new();
        tracker.record(20, Duration::from_secs(2));
        tracker.record(10, Duration::from_secs(4));

        let report = tracker.report(RateLimitStats::default());
        assert_eq!(report.batches, 2);
        assert_eq!(report.items, 30);
        assert_eq!(report.average_batch, Duration::from_secs(3));
        assert!(report.to_string().contains("batches=2"));
    }

    #[test]
    fn test_format_eta() {
        assert_eq!(format_eta(None), "unknown");
        assert_eq!(format_eta(Some(Duration::from_secs(90))), "1.5 minutes");
        assert_eq!(format_eta(Some(Duration::from_secs(5400))), "1.5 hours");
    }
}
