#![forbid(unsafe_code)]

//! # plotbot-harness
//!
//! Send batches of headlines to one or more language-model endpoints and keep
//! their structured answers in per-item JSON files that any number of
//! concurrent workers can update safely.
//!
//! Each item owns one file, `<generated_dir>/<item_id>.json`, keyed inside by
//! model and prompt hash. Writers serialize on a lock sidecar created with
//! create-if-absent semantics, merge into what is already on disk and replace
//! the file by atomic rename. A rerun skips every `(item, model, prompt)`
//! already answered, so an interrupted run resumes where it stopped.

pub mod buffer;
pub mod config;
pub mod connector;
pub mod dispatch;
pub mod endpoints;
pub mod items;
pub mod lock;
pub mod metrics;
pub mod pipeline;
pub mod plan;
pub mod prompt;
pub mod schema;
pub mod store;
pub mod writer;

pub use buffer::{FailedWrite, FlushReport, WriteBuffer};
pub use config::{ConfigError, RunConfig};
pub use connector::{
    ChatCompletionsConnector, Connector, ConnectorError, ConnectorReply, DispatchRequest,
    ReplyStatus,
};
pub use dispatch::{BatchReport, BatchState, DispatchConfig, DispatchReport, Dispatcher};
pub use items::{derive_item_id, load_items, Item};
pub use lock::{FileLock, LockConfig, LockError, LockGuard, LockRecord};
pub use metrics::{MetricsAggregator, ModelSummary, RunSummary};
pub use pipeline::{
    run_pipeline, run_pipeline_with_connectors, PipelineError, PipelineOutcome, RunContext,
};
pub use plan::{TaskBatch, TaskPlan, TaskPlanner};
pub use prompt::PromptBundle;
pub use schema::{extract_json_values, ResponseSchema, SchemaViolation};
pub use store::{ModelResult, ResultFile, ResultStore, StoreError, WriteTask};
pub use writer::{ResultWriter, WriteConfig, WriteOutcome, WriteStrategy};
