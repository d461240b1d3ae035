//! Classification service boundary.
//!
//! - [`Classifier`]: one service call for a slice of items
//! - [`retry`]: exponential backoff around a single call
//! - [`parser`]: turns a raw response into per-item outcomes
//! - [`http`]: OpenAI-compatible chat-completions client

pub mod http;
pub mod parser;
pub mod retry;

use async_trait::async_trait;

use crate::error::ClassifyError;
use crate::source::InputItem;

pub use http::HttpClassifier;
pub use parser::{AssessmentParser, LabelParser, ParsedBatch, ResponseParser};
pub use retry::{RetryController, RetryPolicy};

/// A classification service.
///
/// Implementations report failures through [`ClassifyError`] so the retry
/// controller can decide whether to wait, retry or give up.
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Classify `items` and return the raw response text.
    async fn classify(&self, items: &[InputItem]) -> Result<String, ClassifyError>;
}
