//! Run configuration.
//!
//! Keys are upper-case JSON (`WRITE_STRATEGY`, `FILE_LOCK_TIMEOUT`, ...) and
//! every one has a default. Files are layered: later files deep-merge over
//! earlier ones, objects key by key, everything else replaced wholesale.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::dispatch::DispatchConfig;
use crate::lock::LockConfig;
use crate::schema::ResponseSchema;
use crate::writer::{WriteConfig, WriteStrategy};

/// Names a config file layered on top of the search list.
pub const CONFIG_ENV_VAR: &str = "PLOTBOT_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error reading config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {message}")]
    Parse { path: String, message: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct RunConfig {
    pub generated_dir: PathBuf,
    pub titles_index: PathBuf,
    pub prompt_file: Option<PathBuf>,

    pub llm_base_url: String,
    #[serde(deserialize_with = "name_list")]
    pub llm_models: Vec<String>,
    /// Model name -> chat-completions URL. Takes precedence over `LLM_MODELS`.
    pub llm_endpoints: BTreeMap<String, String>,
    #[serde(deserialize_with = "name_list")]
    pub llm_blocklist: Vec<String>,
    /// Seconds.
    pub request_timeout: f64,

    pub task_batch_size: usize,
    pub test_mode: bool,
    pub test_limit_per_model: usize,
    pub retry_limit: u32,
    /// Seconds; doubled per retry.
    pub retry_base_delay: f64,
    pub compliance_reminder_interval: usize,
    pub required_fields: Vec<String>,
    pub allow_extra_fields: bool,

    pub file_lock_timeout: f64,
    pub file_lock_poll_interval: f64,
    pub file_lock_stale_seconds: f64,

    pub write_strategy: WriteStrategy,
    pub write_batch_size: usize,
    pub write_batch_seconds: f64,
    pub write_batch_retry_limit: u32,
    pub write_retry_limit: u32,

    pub log_level: String,
}

/// A JSON array of names, or one comma-separated string (`"a, b"`).
fn name_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Names {
        List(Vec<String>),
        Joined(String),
    }

    let names = match Names::deserialize(deserializer)? {
        Names::List(list) => list,
        Names::Joined(joined) => joined.split(',').map(str::to_string).collect(),
    };
    Ok(names
        .into_iter()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect())
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            generated_dir: PathBuf::from("data/generated_data"),
            titles_index: PathBuf::from("data/titles_index.json"),
            prompt_file: Some(PathBuf::from("data/prompt.txt")),
            llm_base_url: "http://localhost:1234".to_string(),
            llm_models: Vec::new(),
            llm_endpoints: BTreeMap::new(),
            llm_blocklist: Vec::new(),
            request_timeout: 90.0,
            task_batch_size: 1,
            test_mode: false,
            test_limit_per_model: 10,
            retry_limit: 3,
            retry_base_delay: 1.0,
            compliance_reminder_interval: 0,
            required_fields: Vec::new(),
            allow_extra_fields: true,
            file_lock_timeout: 10.0,
            file_lock_poll_interval: 0.1,
            file_lock_stale_seconds: 300.0,
            write_strategy: WriteStrategy::Immediate,
            write_batch_size: 25,
            write_batch_seconds: 5.0,
            write_batch_retry_limit: 3,
            write_retry_limit: 3,
            log_level: "info".to_string(),
        }
    }
}

/// Seconds to `Duration`; negative or non-finite values become zero and are
/// caught by [`RunConfig::validate`].
fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

fn positive(name: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!("{name} must be a positive number of seconds, got {value}")))
    }
}

impl RunConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.generated_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("GENERATED_DIR must not be empty".into()));
        }
        for (name, value) in [
            ("TASK_BATCH_SIZE", self.task_batch_size),
            ("WRITE_BATCH_SIZE", self.write_batch_size),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
            }
        }
        positive("FILE_LOCK_TIMEOUT", self.file_lock_timeout)?;
        positive("FILE_LOCK_POLL_INTERVAL", self.file_lock_poll_interval)?;
        positive("FILE_LOCK_STALE_SECONDS", self.file_lock_stale_seconds)?;
        positive("WRITE_BATCH_SECONDS", self.write_batch_seconds)?;
        positive("REQUEST_TIMEOUT", self.request_timeout)?;
        if !(self.retry_base_delay.is_finite() && self.retry_base_delay >= 0.0) {
            return Err(ConfigError::Invalid("RETRY_BASE_DELAY must be zero or positive".into()));
        }
        if self.test_mode && self.test_limit_per_model == 0 {
            return Err(ConfigError::Invalid("TEST_LIMIT_PER_MODEL must be greater than zero".into()));
        }
        Ok(())
    }

    pub fn lock_config(&self) -> LockConfig {
        LockConfig {
            timeout: secs(self.file_lock_timeout),
            poll_interval: secs(self.file_lock_poll_interval),
            stale_after: secs(self.file_lock_stale_seconds),
        }
    }

    pub fn write_config(&self) -> WriteConfig {
        WriteConfig {
            strategy: self.write_strategy,
            batch_size: self.write_batch_size,
            batch_interval: secs(self.write_batch_seconds),
            batch_retry_limit: self.write_batch_retry_limit,
            retry_limit: self.write_retry_limit,
        }
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            retry_limit: self.retry_limit,
            retry_base_delay: secs(self.retry_base_delay),
            reminder_interval: self.compliance_reminder_interval,
            schema: ResponseSchema::new(self.required_fields.iter().cloned())
                .allow_extra_fields(self.allow_extra_fields),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        secs(self.request_timeout)
    }

    /// Case-insensitive blocklist check.
    pub fn is_blocked(&self, model: &str) -> bool {
        self.llm_blocklist
            .iter()
            .any(|b| b.trim().eq_ignore_ascii_case(model.trim()))
    }

    /// Parse a single JSON document layered over the defaults.
    pub fn from_json(value: Value) -> Result<Self, ConfigError> {
        let mut merged = default_value()?;
        deep_merge(&mut merged, value);
        serde_json::from_value(merged).map_err(|e| ConfigError::Parse {
            path: "<inline>".into(),
            message: e.to_string(),
        })
    }
}

/// Merged configuration plus the files that contributed to it.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: RunConfig,
    pub sources: Vec<PathBuf>,
}

/// Search list under `root`: `config/config.json`, `config/config.local.json`,
/// `config.local.json`, then `$PLOTBOT_CONFIG` if set.
pub fn default_search_paths(root: &Path) -> Vec<PathBuf> {
    let mut paths = vec![
        root.join("config").join("config.json"),
        root.join("config").join("config.local.json"),
        root.join("config.local.json"),
    ];
    if let Ok(extra) = std::env::var(CONFIG_ENV_VAR) {
        if !extra.trim().is_empty() {
            paths.push(PathBuf::from(extra));
        }
    }
    paths
}

/// Layer every existing file of the search list under `root`.
pub fn discover(root: &Path) -> Result<LoadedConfig, ConfigError> {
    layer(&default_search_paths(root), false)
}

/// Layer explicit files; each must exist.
pub fn load(paths: &[PathBuf]) -> Result<LoadedConfig, ConfigError> {
    layer(paths, true)
}

fn layer(paths: &[PathBuf], required: bool) -> Result<LoadedConfig, ConfigError> {
    let mut merged = default_value()?;
    let mut sources = Vec::new();
    for path in paths {
        if !required && !path.exists() {
            continue;
        }
        let overlay = read_object(path)?;
        deep_merge(&mut merged, Value::Object(overlay));
        sources.push(path.clone());
    }
    let config: RunConfig = serde_json::from_value(merged).map_err(|e| ConfigError::Parse {
        path: sources
            .last()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<defaults>".into()),
        message: e.to_string(),
    })?;
    config.validate()?;
    tracing::debug!(sources = ?sources, "configuration loaded");
    Ok(LoadedConfig { config, sources })
}

fn default_value() -> Result<Value, ConfigError> {
    serde_json::to_value(RunConfig::default()).map_err(|e| ConfigError::Invalid(e.to_string()))
}

fn read_object(path: &Path) -> Result<Map<String, Value>, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    match serde_json::from_str::<Value>(&raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ConfigError::Parse {
            path: path.display().to_string(),
            message: "config file must contain a JSON object".into(),
        }),
        Err(e) => Err(ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        }),
    }
}

/// Merge `overlay` into `base`: objects recursively, anything else replaces.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        deep_merge(existing, value)
                    }
                    _ => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}
