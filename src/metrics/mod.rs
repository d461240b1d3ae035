//! Run observability.
//!
//! Pipeline code reports what happened through [`emit!`] with an event from
//! `events`; each event turns into `flurry_*` counters, gauges and histograms.
//! Nothing is recorded until `server::init` installs the Prometheus
//! recorder, which only happens when `metrics.enabled` is set.

pub mod events;
pub mod server;

pub use server::{Health, init};

/// Record an event from [`events`].
///
/// ```ignore
/// emit!(BatchCompleted { items: batch.len(), duration: elapsed });
/// ```
#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::metrics::events::InternalEvent::emit($event)
    };
}
