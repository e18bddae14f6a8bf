//! End-to-end run: endpoints → plan → dispatch → persist → summary.
//!
//! Usage:
//! ```bash
//! plotbot run --config config/config.json --summary-out summary.json
//! ```
//!
//! Only configuration problems abort a run, and only before anything is
//! dispatched. Once dispatch starts every failure is recovered and reported;
//! the writer is always shut down so buffered answers reach disk.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::buffer::FlushReport;
use crate::config::{ConfigError, RunConfig};
use crate::connector::{Connector, ConnectorError};
use crate::dispatch::{DispatchReport, Dispatcher};
use crate::endpoints::{build_connectors, resolve_endpoints};
use crate::items::{load_items, ItemsError};
use crate::metrics::{MetricsAggregator, RunSummary};
use crate::plan::TaskPlanner;
use crate::prompt::{PromptBundle, PromptError};
use crate::store::{ResultStore, StoreError};
use crate::writer::ResultWriter;

// =============================================================================
// Context
// =============================================================================

/// Everything a run shares: configuration, metrics and the cancel flag.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub config: Arc<RunConfig>,
    pub metrics: Arc<MetricsAggregator>,
    pub cancel: Arc<AtomicBool>,
}

impl RunContext {
    pub fn new(config: RunConfig) -> Self {
        Self {
            config: Arc::new(config),
            metrics: Arc::new(MetricsAggregator::new()),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Stop dispatching new batches. In-flight calls finish and queued
    /// writes are still flushed.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    pub fn store(&self) -> Result<ResultStore, StoreError> {
        ResultStore::new(
            &self.config.generated_dir,
            self.config.lock_config(),
            Arc::clone(&self.metrics),
        )
    }
}

// =============================================================================
// Errors and outcome
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("no model endpoints could be resolved")]
    NoEndpoints,
    #[error("no items to process in {}", .0.display())]
    NoItems(PathBuf),
    #[error(transparent)]
    Items(#[from] ItemsError),
    #[error(transparent)]
    Prompt(#[from] PromptError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Connector(#[from] ConnectorError),
}

#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub summary: RunSummary,
    pub dispatch: DispatchReport,
    pub flush: FlushReport,
    /// Items skipped per model because their answer was already stored.
    pub skipped: BTreeMap<String, usize>,
}

// =============================================================================
// Entry points
// =============================================================================

/// Resolve endpoints from the configuration and run.
pub async fn run_pipeline(ctx: &RunContext) -> Result<PipelineOutcome, PipelineError> {
    ctx.config.validate()?;
    let endpoints = resolve_endpoints(&ctx.config).await;
    if endpoints.is_empty() {
        return Err(PipelineError::NoEndpoints);
    }
    tracing::info!(models = ?endpoints.keys().collect::<Vec<_>>(), "resolved endpoints");
    let connectors = build_connectors(&endpoints, ctx.config.request_timeout())?;
    run_pipeline_with_connectors(ctx, connectors).await
}

/// Run with caller-supplied connectors (blocklisted ones are dropped).
pub async fn run_pipeline_with_connectors(
    ctx: &RunContext,
    connectors: Vec<Arc<dyn Connector>>,
) -> Result<PipelineOutcome, PipelineError> {
    let config = &ctx.config;
    config.validate()?;

    let connectors: Vec<Arc<dyn Connector>> = connectors
        .into_iter()
        .filter(|c| !config.is_blocked(c.model()))
        .collect();
    if connectors.is_empty() {
        return Err(PipelineError::NoEndpoints);
    }
    let models: Vec<String> = connectors.iter().map(|c| c.model().to_string()).collect();

    let prompt = PromptBundle::load_or_default(config.prompt_file.as_deref())?;
    let items = load_items(&config.titles_index)?;
    if items.is_empty() {
        return Err(PipelineError::NoItems(config.titles_index.clone()));
    }
    let store = ctx.store()?;

    let plan = TaskPlanner::from_config(config).build(&items, &models, &prompt.hash, &store);
    tracing::info!(
        items = items.len(),
        models = models.len(),
        batches = plan.batches.len(),
        planned_items = plan.item_count(),
        prompt_hash = %prompt.hash,
        strategy = %config.write_strategy,
        "run planned"
    );

    let writer = Arc::new(ResultWriter::new(store, &config.write_config()));
    let dispatcher = Dispatcher::new(ctx, prompt, connectors, Arc::clone(&writer));
    let dispatch = dispatcher.run(&plan).await;
    if dispatch.cancelled {
        tracing::warn!("run cancelled; flushing queued writes");
    }

    let flush = writer.shutdown().await;
    if !flush.failed.is_empty() {
        tracing::error!(failed = flush.failed.len(), "buffered writes could not be stored");
    }

    let summary = ctx.metrics.finalize();
    summary.log();
    Ok(PipelineOutcome {
        summary,
        dispatch,
        flush,
        skipped: plan.skipped_by_model,
    })
}
