//! Per-item result files.
//!
//! Each item owns exactly one JSON file, `<dir>/<item_id>.json`:
//!
//! ```json
//! {"item_id": "...", "llm_models": {"<model>": {"<prompt_hash>": {...payload, "generated_at": "...", "response_time_seconds": 1.2}}}}
//! ```
//!
//! Writers never replace the file wholesale. Every commit takes the item's
//! [`FileLock`], re-reads the current file, merges new entries by
//! `(model, prompt_hash)` and atomically renames a fully written temp file
//! over the target, so readers see either the previous or the next version.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::items::{validate_item_id, ItemsError};
use crate::lock::{sidecar_path, FileLock, LockConfig, LockError};
use crate::metrics::MetricsAggregator;

pub const RESULT_EXTENSION: &str = "json";

/// Payload keys owned by the record itself; stripped from model payloads.
const RESERVED_KEYS: &[&str] = &["generated_at", "response_time_seconds"];

/// One model's answer for one item under one prompt hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResult {
    #[serde(flatten)]
    pub payload: Map<String, Value>,
    #[serde(
        default,
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub generated_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        deserialize_with = "lenient_seconds",
        skip_serializing_if = "Option::is_none"
    )]
    pub response_time_seconds: Option<f64>,
}

fn lenient_seconds<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(raw.as_ref().and_then(Value::as_f64))
}

/// Accept RFC 3339 or a naive ISO timestamp (taken as UTC); anything else
/// reads as unknown rather than failing the whole file.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(raw.as_ref().and_then(Value::as_str).and_then(parse_timestamp))
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|naive| naive.and_utc())
        })
}

/// On-disk record for one item.
///
/// Deserialization is slot by slot (see [`ResultFile::from_object`]): a
/// malformed entry costs that entry, never its neighbours.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ResultFile {
    pub item_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub llm_models: BTreeMap<String, BTreeMap<String, ModelResult>>,
    /// Fields written by other tools; preserved across merges.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl<'de> Deserialize<'de> for ResultFile {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let root = Map::<String, Value>::deserialize(deserializer)?;
        Ok(Self::from_object(root).0)
    }
}

fn id_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// What a merge did to one `(model, prompt_hash)` slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeEffect {
    Inserted,
    Replaced,
    /// Identical entry already present.
    Unchanged,
    /// Stored entry is newer than the incoming one.
    KeptNewer,
}

impl ResultFile {
    pub fn new(item_id: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            ..Default::default()
        }
    }

    /// Build a record from a JSON object, keeping every well-formed part.
    ///
    /// `item_id` falls back to a legacy `id` key. A non-string title, a
    /// non-object `llm_models` or model map, and slots that are not result
    /// objects are dropped; their paths come back in the second element.
    /// Unknown top-level keys are kept in `extra`.
    pub fn from_object(mut root: Map<String, Value>) -> (Self, Vec<String>) {
        let mut dropped = Vec::new();

        let item_id = match root.remove("item_id") {
            Some(value) => id_text(&value).unwrap_or_else(|| {
                dropped.push("item_id".to_string());
                String::new()
            }),
            None => match root.get("id").and_then(id_text) {
                Some(id) => {
                    root.remove("id");
                    id
                }
                None => String::new(),
            },
        };

        let title = match root.remove("title") {
            None | Some(Value::Null) => None,
            Some(Value::String(title)) => Some(title),
            Some(_) => {
                dropped.push("title".to_string());
                None
            }
        };

        let mut llm_models = BTreeMap::new();
        match root.remove("llm_models") {
            None | Some(Value::Null) => {}
            Some(Value::Object(models)) => {
                for (model, slots) in models {
                    let Value::Object(slots) = slots else {
                        dropped.push(format!("llm_models.{model}"));
                        continue;
                    };
                    let mut parsed = BTreeMap::new();
                    for (hash, entry) in slots {
                        match serde_json::from_value::<ModelResult>(entry) {
                            Ok(result) => {
                                parsed.insert(hash, result);
                            }
                            Err(_) => dropped.push(format!("llm_models.{model}.{hash}")),
                        }
                    }
                    llm_models.insert(model, parsed);
                }
            }
            Some(_) => dropped.push("llm_models".to_string()),
        }

        let record = Self {
            item_id,
            title,
            llm_models,
            extra: root,
        };
        (record, dropped)
    }

    pub fn get(&self, model: &str, prompt_hash: &str) -> Option<&ModelResult> {
        self.llm_models.get(model)?.get(prompt_hash)
    }

    /// Merge one entry. Same slot: last writer wins by `generated_at`, and an
    /// identical payload is a no-op.
    pub fn merge(&mut self, model: &str, prompt_hash: &str, incoming: ModelResult) -> MergeEffect {
        let slot = self.llm_models.entry(model.to_string()).or_default();
        match slot.get(prompt_hash) {
            None => {
                slot.insert(prompt_hash.to_string(), incoming);
                MergeEffect::Inserted
            }
            Some(existing)
                if existing.payload == incoming.payload
                    && existing.response_time_seconds == incoming.response_time_seconds =>
            {
                MergeEffect::Unchanged
            }
            Some(existing) if existing.generated_at > incoming.generated_at => {
                MergeEffect::KeptNewer
            }
            Some(_) => {
                slot.insert(prompt_hash.to_string(), incoming);
                MergeEffect::Replaced
            }
        }
    }
}

/// A pending write: one model answer for one item.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteTask {
    pub item_id: String,
    pub title: Option<String>,
    pub model_name: String,
    pub prompt_hash: String,
    pub payload: Map<String, Value>,
    pub response_time: Duration,
    pub generated_at: DateTime<Utc>,
}

impl WriteTask {
    pub fn new(
        item_id: impl Into<String>,
        model_name: impl Into<String>,
        prompt_hash: impl Into<String>,
        payload: Map<String, Value>,
        response_time: Duration,
    ) -> Self {
        Self {
            item_id: item_id.into(),
            title: None,
            model_name: model_name.into(),
            prompt_hash: prompt_hash.into(),
            payload,
            response_time,
            generated_at: Utc::now(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn generated_at(mut self, at: DateTime<Utc>) -> Self {
        self.generated_at = at;
        self
    }

    fn to_result(&self) -> ModelResult {
        let mut payload = self.payload.clone();
        for key in RESERVED_KEYS {
            payload.remove(*key);
        }
        // Millisecond precision keeps files readable and comparisons stable.
        let secs = (self.response_time.as_secs_f64() * 1000.0).round() / 1000.0;
        ModelResult {
            payload,
            generated_at: Some(self.generated_at),
            response_time_seconds: Some(secs),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error(transparent)]
    InvalidItemId(#[from] ItemsError),
    #[error("commit task failed: {0}")]
    Join(String),
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Lock contention and io hiccups are worth another attempt; bad ids and
    /// serialization bugs are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Lock(e) => !matches!(e, LockError::InvalidConfig(_)),
            Self::Io { .. } => true,
            Self::Serialize(_) | Self::InvalidItemId(_) | Self::Join(_) => false,
        }
    }
}

/// Counts from one locked commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitReport {
    pub inserted: usize,
    pub replaced: usize,
    pub unchanged: usize,
    pub kept_newer: usize,
    /// Whether a new file version was renamed into place.
    pub wrote_file: bool,
    /// Whether an unreadable existing file was replaced.
    pub recovered_corrupt: bool,
    /// Paths of malformed entries (`llm_models.<model>.<hash>`, ...) left
    /// out of the merged record.
    pub dropped: Vec<String>,
}

impl CommitReport {
    fn record(&mut self, effect: MergeEffect) {
        match effect {
            MergeEffect::Inserted => self.inserted += 1,
            MergeEffect::Replaced => self.replaced += 1,
            MergeEffect::Unchanged => self.unchanged += 1,
            MergeEffect::KeptNewer => self.kept_newer += 1,
        }
    }

    fn changed(&self) -> bool {
        self.inserted + self.replaced > 0
    }
}

enum ExistingRecord {
    Missing,
    Corrupt(String),
    Present {
        record: ResultFile,
        dropped: Vec<String>,
    },
}

fn read_existing(path: &Path) -> Result<ExistingRecord, StoreError> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(ExistingRecord::Missing),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    match serde_json::from_slice::<Value>(&raw) {
        Ok(Value::Object(root)) => {
            let (record, dropped) = ResultFile::from_object(root);
            Ok(ExistingRecord::Present { record, dropped })
        }
        Ok(_) => Ok(ExistingRecord::Corrupt("root is not a JSON object".to_string())),
        Err(e) => Ok(ExistingRecord::Corrupt(e.to_string())),
    }
}

/// Serialized bytes staged in a temp file next to their target.
///
/// [`StagedFile::commit`] renames the temp file over the target. Dropping an
/// uncommitted stage removes the temp file; the target is never touched.
#[derive(Debug)]
pub struct StagedFile {
    tmp: PathBuf,
    target: PathBuf,
    committed: bool,
}

impl StagedFile {
    pub fn write(target: &Path, bytes: &[u8]) -> io::Result<Self> {
        let file_name = target
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "target has no file name"))?;
        let tmp = target.with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4().simple()));
        let staged = Self {
            tmp,
            target: target.to_path_buf(),
            committed: false,
        };
        let mut file = File::create(&staged.tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        Ok(staged)
    }

    pub fn tmp_path(&self) -> &Path {
        &self.tmp
    }

    pub fn commit(mut self) -> io::Result<()> {
        fs::rename(&self.tmp, &self.target)?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.tmp);
        }
    }
}

pub fn write_atomic(target: &Path, bytes: &[u8]) -> io::Result<()> {
    StagedFile::write(target, bytes)?.commit()
}

/// Directory of per-item result files.
#[derive(Debug, Clone)]
pub struct ResultStore {
    dir: PathBuf,
    lock: LockConfig,
    metrics: Arc<MetricsAggregator>,
}

impl ResultStore {
    pub fn new(
        dir: impl Into<PathBuf>,
        lock: LockConfig,
        metrics: Arc<MetricsAggregator>,
    ) -> Result<Self, StoreError> {
        let dir = dir.into();
        lock.validate()?;
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        Ok(Self { dir, lock, metrics })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn lock_config(&self) -> LockConfig {
        self.lock
    }

    pub fn metrics(&self) -> &Arc<MetricsAggregator> {
        &self.metrics
    }

    pub fn record_path(&self, item_id: &str) -> Result<PathBuf, StoreError> {
        validate_item_id(item_id)?;
        Ok(self.dir.join(format!("{item_id}.{RESULT_EXTENSION}")))
    }

    pub fn lock_path(&self, item_id: &str) -> Result<PathBuf, StoreError> {
        Ok(sidecar_path(&self.record_path(item_id)?))
    }

    /// Read an item's record without locking. Missing or unreadable files
    /// both come back as `None`.
    pub fn load(&self, item_id: &str) -> Result<Option<ResultFile>, StoreError> {
        let path = self.record_path(item_id)?;
        match read_existing(&path)? {
            ExistingRecord::Present { record, .. } => Ok(Some(record)),
            ExistingRecord::Missing => Ok(None),
            ExistingRecord::Corrupt(reason) => {
                tracing::debug!(item_id, %reason, "unreadable result file");
                Ok(None)
            }
        }
    }

    /// Whether the exact `(model, prompt_hash)` pair is already stored.
    pub fn has_result(&self, item_id: &str, model: &str, prompt_hash: &str) -> bool {
        matches!(
            self.load(item_id),
            Ok(Some(record)) if record.get(model, prompt_hash).is_some()
        )
    }

    /// Merge `tasks` (all for `item_id`) into the item's file inside a
    /// single locked section.
    pub async fn commit(
        &self,
        item_id: &str,
        tasks: Vec<WriteTask>,
    ) -> Result<CommitReport, StoreError> {
        let path = self.record_path(item_id)?;
        let guard = FileLock::for_target(&path, self.lock).acquire().await?;
        let item_id = item_id.to_string();
        let metrics = Arc::clone(&self.metrics);

        tokio::task::spawn_blocking(move || {
            let report = merge_into_file(&path, &item_id, &tasks, &metrics);
            drop(guard);
            report
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    /// [`commit`](Self::commit) with up to `retry_limit` extra attempts on
    /// retryable errors.
    pub async fn commit_with_retry(
        &self,
        item_id: &str,
        tasks: Vec<WriteTask>,
        retry_limit: u32,
    ) -> Result<CommitReport, StoreError> {
        let mut attempt = 0;
        loop {
            match self.commit(item_id, tasks.clone()).await {
                Ok(report) => return Ok(report),
                Err(e) => {
                    if matches!(&e, StoreError::Lock(l) if l.is_timeout()) {
                        self.metrics.record_lock_timeout();
                    }
                    if !e.is_retryable() || attempt >= retry_limit {
                        return Err(e);
                    }
                    attempt += 1;
                    tracing::warn!(
                        item_id,
                        attempt,
                        retry_limit,
                        error = %e,
                        "result commit failed; retrying"
                    );
                    tokio::time::sleep(self.retry_delay()).await;
                }
            }
        }
    }

    fn retry_delay(&self) -> Duration {
        (self.lock.poll_interval * 5).min(Duration::from_secs(2))
    }
}

fn merge_into_file(
    path: &Path,
    item_id: &str,
    tasks: &[WriteTask],
    metrics: &MetricsAggregator,
) -> Result<CommitReport, StoreError> {
    let mut report = CommitReport::default();
    let mut record = match read_existing(path)? {
        ExistingRecord::Present { record, dropped } => {
            if !dropped.is_empty() {
                tracing::warn!(
                    item_id,
                    path = %path.display(),
                    dropped = ?dropped,
                    "malformed entries in result file; keeping the rest"
                );
            }
            report.dropped = dropped;
            record
        }
        ExistingRecord::Missing => ResultFile::new(item_id),
        ExistingRecord::Corrupt(reason) => {
            tracing::warn!(
                item_id,
                path = %path.display(),
                %reason,
                "corrupt result file; merging into an empty record"
            );
            metrics.record_corrupt_file();
            report.recovered_corrupt = true;
            ResultFile::new(item_id)
        }
    };
    if record.item_id.is_empty() {
        record.item_id = item_id.to_string();
    }

    for task in tasks {
        if record.title.is_none() {
            record.title = task.title.clone();
        }
        let effect = record.merge(&task.model_name, &task.prompt_hash, task.to_result());
        report.record(effect);
    }

    if report.changed() || report.recovered_corrupt {
        let mut bytes = serde_json::to_vec_pretty(&record)?;
        bytes.push(b'\n');
        write_atomic(path, &bytes).map_err(|e| StoreError::io(path, e))?;
        report.wrote_file = true;
        tracing::debug!(
            item_id,
            inserted = report.inserted,
            replaced = report.replaced,
            "committed result file"
        );
    }
    Ok(report)
}
