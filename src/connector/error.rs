//! Error types for model endpoints.

use std::time::Duration;

use thiserror::Error;

use super::ReplyStatus;

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The endpoint does not serve this model.
    #[error("model {model} not found: {message}")]
    ModelNotFound { model: String, message: String },

    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    /// Response envelope is not a chat-completions body.
    #[error("invalid response body: {0}")]
    InvalidBody(String),

    #[error("response too large: {0} bytes")]
    TooLarge(usize),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ConnectorError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Http(_) => true,
            Self::Status { status, .. } => matches!(status, 408 | 429 | 500..=599),
            Self::InvalidBody(_) => true,
            Self::TooLarge(_) => true,
            Self::ModelNotFound { .. } => false,
            Self::Config(_) => false,
        }
    }

    /// Short error code for logging.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Http(e) if e.is_timeout() => "timeout",
            Self::Http(e) if e.is_connect() => "connect_error",
            Self::Http(_) => "http_error",
            Self::ModelNotFound { .. } => "model_not_found",
            Self::Status { .. } => "http_status",
            Self::InvalidBody(_) => "invalid_body",
            Self::TooLarge(_) => "too_large",
            Self::Config(_) => "config_error",
        }
    }

    /// Dispatcher-facing classification. Oversized output is the model
    /// rambling, so it is treated like malformed content.
    pub fn into_status(self) -> ReplyStatus {
        let message = format!("{}: {self}", self.code());
        match self {
            Self::TooLarge(_) => ReplyStatus::SchemaError(message),
            e if e.is_retryable() => ReplyStatus::TransportError(message),
            _ => ReplyStatus::Fatal(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_statuses() {
        let status = |s| ConnectorError::Status {
            status: s,
            message: String::new(),
        };
        assert!(matches!(status(503).into_status(), ReplyStatus::TransportError(_)));
        assert!(matches!(status(429).into_status(), ReplyStatus::TransportError(_)));
        assert!(matches!(status(400).into_status(), ReplyStatus::Fatal(_)));
        assert!(matches!(
            ConnectorError::ModelNotFound {
                model: "m".into(),
                message: String::new()
            }
            .into_status(),
            ReplyStatus::Fatal(_)
        ));
        assert!(matches!(
            ConnectorError::TooLarge(1).into_status(),
            ReplyStatus::SchemaError(_)
        ));
    }
}
