//! flurry: resumable, rate-limited batch classification.
//!
//! Sends fixed-size batches of input items to a remote classification
//! service, parses the free-form responses into one outcome per item and
//! persists progress after every batch so a stopped run picks up where it
//! left off.
//!
//! # Example
//!
//! ```ignore
//! use flurry::{Config, ResumeMode, run_pipeline, error::PipelineError};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), PipelineError> {
//!     let config = Config::from_file("flurry.yaml").context(ConfigSnafu)?;
//!     let report = run_pipeline(config, ResumeMode::Resume).await?;
//!     println!("{} of {} items", report.items_processed, report.total_items);
//!     Ok(())
//! }
//! ```

pub mod anomaly;
pub mod checkpoint;
pub mod classify;
pub mod config;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod sink;
pub mod source;
pub mod storage;

// Re-export main types
pub use config::Config;
pub use pipeline::{Pipeline, ResumeMode, RunReport, RunStatus, run_pipeline};
