//! Resolving which models to run against and where they live.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::config::RunConfig;
use crate::connector::{ChatCompletionsConnector, Connector, ConnectorError};

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

/// `http://host:1234/`, `http://host:1234/v1` -> `http://host:1234`.
fn api_root(base_url: &str) -> &str {
    let trimmed = base_url.trim().trim_end_matches('/');
    trimmed.strip_suffix("/v1").unwrap_or(trimmed)
}

pub fn chat_url(base_url: &str) -> String {
    format!("{}/v1/chat/completions", api_root(base_url))
}

/// Model name -> chat-completions URL.
///
/// Precedence: `LLM_ENDPOINTS`, then `LLM_MODELS` on `LLM_BASE_URL`, then
/// models discovered from `GET <LLM_BASE_URL>/v1/models`. Blocklisted names
/// are dropped on every path. Discovery failures yield an empty map.
pub async fn resolve_endpoints(config: &RunConfig) -> BTreeMap<String, String> {
    let resolved: BTreeMap<String, String> = if !config.llm_endpoints.is_empty() {
        config
            .llm_endpoints
            .iter()
            .map(|(model, url)| (model.trim().to_string(), url.trim().to_string()))
            .collect()
    } else if !config.llm_models.is_empty() {
        let url = chat_url(&config.llm_base_url);
        config
            .llm_models
            .iter()
            .map(|model| (model.trim().to_string(), url.clone()))
            .collect()
    } else {
        match discover_models(&config.llm_base_url).await {
            Ok(models) => {
                let url = chat_url(&config.llm_base_url);
                models.into_iter().map(|m| (m, url.clone())).collect()
            }
            Err(e) => {
                tracing::error!(
                    base_url = %config.llm_base_url,
                    error = %e,
                    "model discovery failed"
                );
                BTreeMap::new()
            }
        }
    };

    resolved
        .into_iter()
        .filter(|(model, url)| {
            if model.is_empty() || url.is_empty() {
                return false;
            }
            if config.is_blocked(model) {
                tracing::info!(model = %model, "model blocklisted; skipping");
                return false;
            }
            true
        })
        .collect()
}

/// List the model ids an OpenAI-compatible server reports.
pub async fn discover_models(base_url: &str) -> Result<Vec<String>, ConnectorError> {
    let client = reqwest::Client::builder()
        .timeout(DISCOVERY_TIMEOUT)
        .build()
        .map_err(|e| ConnectorError::config(format!("Failed to create HTTP client: {e}")))?;
    let url = format!("{}/v1/models", api_root(base_url));
    let response = client.get(&url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(ConnectorError::Status {
            status: status.as_u16(),
            message: format!("model listing at {url} failed"),
        });
    }
    let list: ModelList = response
        .json()
        .await
        .map_err(|e| ConnectorError::InvalidBody(e.to_string()))?;
    let models: Vec<String> = list
        .data
        .into_iter()
        .map(|m| m.id.trim().to_string())
        .filter(|id| !id.is_empty())
        .collect();
    tracing::info!(count = models.len(), "discovered models");
    Ok(models)
}

/// One chat-completions connector per resolved endpoint.
pub fn build_connectors(
    endpoints: &BTreeMap<String, String>,
    timeout: Duration,
) -> Result<Vec<Arc<dyn Connector>>, ConnectorError> {
    let api_key = std::env::var("LLM_API_KEY").ok().filter(|k| !k.trim().is_empty());
    endpoints
        .iter()
        .map(|(model, url)| {
            let connector =
                ChatCompletionsConnector::with_api_key(model, url, timeout, api_key.as_deref())?;
            Ok(Arc::new(connector) as Arc<dyn Connector>)
        })
        .collect()
}
