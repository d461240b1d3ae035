//! Result persistence.
//!
//! - [`partial`]: durable, append-only per-item results written batch by batch
//! - [`finalize`]: validated merge of the partial results into the final output

pub mod finalize;
pub mod partial;
pub mod record;

pub use finalize::Finalizer;
pub use partial::{PartialHeader, PartialResultSink};
pub use record::{AnomalyKind, ItemOutcome, PartialRecord};
