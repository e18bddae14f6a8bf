//! OpenAI-compatible chat-completions connector (LM Studio, vLLM, OpenRouter).

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::error::ConnectorError;
use super::{Connector, ConnectorReply, DispatchRequest, ReplyStatus};
use crate::prompt::SYSTEM_INSTRUCTION;
use crate::schema::extract_json_values;

/// Maximum allowed response body (1MB).
const MAX_RESPONSE_LEN: usize = 1_024 * 1_024;

const DEFAULT_TEMPERATURE: f32 = 0.7;

#[derive(Debug, Clone)]
pub struct ChatCompletionsConnector {
    client: reqwest::Client,
    model: String,
    url: String,
    timeout: Duration,
    temperature: f32,
}

impl ChatCompletionsConnector {
    pub fn new(
        model: impl Into<String>,
        url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ConnectorError> {
        Self::with_api_key(model, url, timeout, None)
    }

    /// `api_key` is sent as a bearer token (needed for hosted endpoints).
    pub fn with_api_key(
        model: impl Into<String>,
        url: impl Into<String>,
        timeout: Duration,
        api_key: Option<&str>,
    ) -> Result<Self, ConnectorError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = api_key {
            let auth = HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|_| ConnectorError::config("Invalid API key format"))?;
            headers.insert(AUTHORIZATION, auth);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .gzip(true)
            .build()
            .map_err(|e| ConnectorError::config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            model: model.into(),
            url: url.into(),
            timeout,
            temperature: DEFAULT_TEMPERATURE,
        })
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn mentions_missing_model(body: &str) -> bool {
        let l = body.to_lowercase();
        l.contains("model not found")
            || l.contains("model_not_found")
            || l.contains("no models loaded")
            || (l.contains("model") && l.contains("does not exist"))
    }

    /// POST the request and return the assistant message content.
    async fn complete(&self, req: &DispatchRequest) -> Result<String, ConnectorError> {
        let messages = [
            ApiMessage {
                role: "system",
                content: SYSTEM_INSTRUCTION.to_string(),
            },
            ApiMessage {
                role: "user",
                content: req.user_content(),
            },
        ];
        let api_req = ChatApiRequest {
            model: &self.model,
            messages: &messages,
            temperature: self.temperature,
            stream: false,
        };

        let mut response = self
            .client
            .post(&self.url)
            .json(&api_req)
            .send()
            .await
            .map_err(|e| self.classify_transport(e))?;
        let status = response.status();

        // Stream response to enforce size limit
        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| self.classify_transport(e))? {
            let new_len = bytes.len() + chunk.len();
            if new_len > MAX_RESPONSE_LEN {
                return Err(ConnectorError::TooLarge(new_len));
            }
            bytes.extend_from_slice(&chunk);
        }
        let body = String::from_utf8_lossy(&bytes).to_string();

        if !status.is_success() {
            let message = serde_json::from_str::<ChatApiResponse>(&body)
                .ok()
                .and_then(|p| p.error)
                .and_then(|e| e.message)
                .unwrap_or_else(|| truncate(&body, 200));
            if status.as_u16() == 404
                || (status.is_client_error() && Self::mentions_missing_model(&message))
            {
                return Err(ConnectorError::ModelNotFound {
                    model: self.model.clone(),
                    message,
                });
            }
            return Err(ConnectorError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: ChatApiResponse = serde_json::from_str(&body)
            .map_err(|e| ConnectorError::InvalidBody(format!("Invalid JSON: {e}")))?;

        if let Some(error) = parsed.error {
            let message = error.message.unwrap_or_default();
            if Self::mentions_missing_model(&message) {
                return Err(ConnectorError::ModelNotFound {
                    model: self.model.clone(),
                    message,
                });
            }
            return Err(ConnectorError::InvalidBody(message));
        }

        parsed
            .choices
            .and_then(|c| c.into_iter().next())
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .ok_or_else(|| ConnectorError::InvalidBody("No choices in response".into()))
    }

    fn classify_transport(&self, e: reqwest::Error) -> ConnectorError {
        if e.is_timeout() {
            ConnectorError::Timeout(self.timeout)
        } else {
            ConnectorError::Http(e)
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((i, _)) => format!("{}...", &s[..i]),
        None => s.to_string(),
    }
}

// =============================================================================
// API TYPES
// =============================================================================

#[derive(Serialize)]
struct ChatApiRequest<'a> {
    model: &'a str,
    messages: &'a [ApiMessage],
    temperature: f32,
    stream: bool,
}

#[derive(Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct ChatApiResponse {
    choices: Option<Vec<Choice>>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    message: Option<String>,
}

// =============================================================================
// CONNECTOR IMPL
// =============================================================================

#[async_trait]
impl Connector for ChatCompletionsConnector {
    fn model(&self) -> &str {
        &self.model
    }

    async fn send(&self, request: &DispatchRequest) -> ConnectorReply {
        let start = Instant::now();
        let status = match self.complete(request).await {
            Ok(content) => match extract_json_values(&content) {
                Ok(values) => ReplyStatus::Ok(values),
                Err(violation) => ReplyStatus::SchemaError(violation.to_string()),
            },
            Err(e) => {
                tracing::debug!(model = %self.model, code = e.code(), error = %e, "endpoint call failed");
                e.into_status()
            }
        };
        ConnectorReply::new(status, start.elapsed())
    }
}
