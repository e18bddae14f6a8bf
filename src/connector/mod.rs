//! Model endpoint capability.
//!
//! A [`Connector`] sends one batch to one model and classifies the outcome.
//! It never retries; retry policy lives in the dispatcher.

pub mod chat;
pub mod error;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::items::Item;

pub use chat::ChatCompletionsConnector;
pub use error::ConnectorError;

/// One attempt at one batch.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub model: String,
    pub prompt_hash: String,
    /// Rendered batch prompt (instructions plus numbered headlines).
    pub prompt_text: String,
    pub items: Vec<Item>,
    /// Compliance reminder appended to this attempt, if any.
    pub reminder: Option<String>,
    /// Zero-based attempt number for this batch.
    pub attempt: u32,
}

impl DispatchRequest {
    /// User message: the batch prompt followed by the reminder, if any.
    pub fn user_content(&self) -> String {
        match &self.reminder {
            Some(reminder) => format!("{}\n\n{}", self.prompt_text, reminder),
            None => self.prompt_text.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplyStatus {
    /// Parsed JSON values, not yet validated against the schema.
    Ok(Vec<Value>),
    /// Network failure, timeout or a retryable HTTP status.
    TransportError(String),
    /// The endpoint answered but the content is not usable JSON.
    SchemaError(String),
    /// Non-retryable endpoint failure, e.g. model not found.
    Fatal(String),
}

impl ReplyStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ok(_) => "ok",
            Self::TransportError(_) => "transport_error",
            Self::SchemaError(_) => "schema_error",
            Self::Fatal(_) => "fatal",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectorReply {
    pub status: ReplyStatus,
    pub elapsed: Duration,
}

impl ConnectorReply {
    pub fn new(status: ReplyStatus, elapsed: Duration) -> Self {
        Self { status, elapsed }
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Model name results are stored under.
    fn model(&self) -> &str;

    async fn send(&self, request: &DispatchRequest) -> ConnectorReply;
}
