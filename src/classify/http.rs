//! OpenAI-compatible chat-completions classifier.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::ClassifierConfig;
use crate::emit;
use crate::error::ClassifyError;
use crate::metrics::events::{RequestStatus, ServiceRequestCompleted};
use crate::source::InputItem;

use super::Classifier;

/// Placeholder replaced by the batch keys in the prompt template.
pub const ITEMS_PLACEHOLDER: &str = "{items}";

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// Classifier backed by an HTTP chat-completions endpoint.
pub struct HttpClassifier {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    system_prompt: String,
    prompt_template: String,
    max_tokens: u32,
}

impl HttpClassifier {
    /// Build a client from configuration.
    pub fn from_config(config: &ClassifierConfig) -> Result<Self, ClassifyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ClassifyError::Fatal {
                message: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
            model: config.model.clone(),
            system_prompt: config.system_prompt.clone(),
            prompt_template: config.prompt_template.clone(),
            max_tokens: config.max_tokens,
        })
    }

    /// User prompt for a batch.
    pub fn render_prompt(&self, items: &[InputItem]) -> String {
        render_prompt(&self.prompt_template, items)
    }

    async fn send(&self, items: &[InputItem]) -> Result<String, ClassifyError> {
        let prompt = self.render_prompt(items);
        let mut messages = Vec::with_capacity(2);
        if !self.system_prompt.is_empty() {
            messages.push(ChatMessage {
                role: "system",
                content: &self.system_prompt,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &prompt,
        });

        let body = ChatRequest {
            model: &self.model,
            messages,
            max_tokens: self.max_tokens,
            temperature: 0.0,
        };

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(map_transport_error)?;
        let status = response.status();
        let text = response.text().await.map_err(map_transport_error)?;

        if let Some(err) = error_for_status(status, &text) {
            return Err(err);
        }
        extract_content(&text)
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(&self, items: &[InputItem]) -> Result<String, ClassifyError> {
        let start = Instant::now();
        let result = self.send(items).await;

        let status = match &result {
            Ok(_) => RequestStatus::Success,
            Err(ClassifyError::RateLimited { .. }) => RequestStatus::RateLimited,
            Err(ClassifyError::Transient { .. }) => RequestStatus::Transient,
            Err(ClassifyError::Fatal { .. }) => RequestStatus::Fatal,
        };
        emit!(ServiceRequestCompleted {
            status,
            duration: start.elapsed(),
        });
        debug!(
            items = items.len(),
            status = status.as_str(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Service request finished"
        );
        result
    }
}

/// Replace `{items}` with the comma-separated batch keys.
pub fn render_prompt(template: &str, items: &[InputItem]) -> String {
    let keys: Vec<&str> = items.iter().map(|item| item.key.as_str()).collect();
    template.replace(ITEMS_PLACEHOLDER, &keys.join(", "))
}

/// Map an HTTP status to a failure kind; `None` for success.
pub fn error_for_status(status: StatusCode, body: &str) -> Option<ClassifyError> {
    if status.is_success() {
        return None;
    }
    let message = format!("HTTP {}: {}", status.as_u16(), truncate(body, 200));
    Some(match status {
        StatusCode::TOO_MANY_REQUESTS => ClassifyError::RateLimited { message },
        StatusCode::REQUEST_TIMEOUT => ClassifyError::Transient { message },
        s if s.is_server_error() => ClassifyError::Transient { message },
        _ => ClassifyError::Fatal { message },
    })
}

/// Pull the first choice's message text out of a response body.
pub fn extract_content(body: &str) -> Result<String, ClassifyError> {
    let parsed: ChatResponse =
        serde_json::from_str(body).map_err(|e| ClassifyError::Transient {
            message: format!("malformed response body: {e}"),
        })?;
    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .map(|content| content.trim().to_string())
        .ok_or_else(|| ClassifyError::Transient {
            message: "response has no message content".to_string(),
        })
}

fn map_transport_error(e: reqwest::Error) -> ClassifyError {
    if e.is_builder() {
        ClassifyError::Fatal {
            message: e.to_string(),
        }
    } else {
        ClassifyError::Transient {
            message: e.to_string(),
        }
    }
}

fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
