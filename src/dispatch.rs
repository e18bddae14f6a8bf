//! Batch dispatch and retry.
//!
//! Every (batch, model) pair runs through a small state machine:
//!
//! ```text
//! PENDING -> SENT -> SUCCEEDED
//!                 -> RETRYABLE_FAILURE -> SENT ...
//!                 -> FATAL_FAILURE
//! ```
//!
//! Transport errors and malformed answers are retried up to `retry_limit`
//! times; a malformed answer also puts the compliance reminder on the next
//! attempt. A fatal endpoint error (model not found and similar) abandons the
//! rest of that model's batches; exhausting the retry ceiling abandons only
//! the batch. Nothing here returns an error: every outcome ends up in the
//! [`DispatchReport`], the metrics and the log.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::time::sleep;

use crate::connector::{Connector, ConnectorReply, DispatchRequest, ReplyStatus};
use crate::items::Item;
use crate::metrics::MetricsAggregator;
use crate::pipeline::RunContext;
use crate::plan::{TaskBatch, TaskPlan};
use crate::prompt::{PromptBundle, COMPLIANCE_REMINDER};
use crate::schema::{MatchedBatch, ResponseSchema};
use crate::store::WriteTask;
use crate::writer::{ResultWriter, WriteOutcome};

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchConfig {
    /// Extra attempts per batch after the first.
    pub retry_limit: u32,
    pub retry_base_delay: Duration,
    /// Re-send the compliance reminder after every N items per model; 0
    /// disables proactive reminders.
    pub reminder_interval: usize,
    pub schema: ResponseSchema,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            retry_limit: 3,
            retry_base_delay: Duration::from_secs(1),
            reminder_interval: 0,
            schema: ResponseSchema::default(),
        }
    }
}

// =============================================================================
// State machine
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchState {
    Pending,
    Sent,
    Succeeded,
    RetryableFailure,
    FatalFailure,
}

impl BatchState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::FatalFailure)
    }
}

/// A connector reply checked against the schema.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Valid(MatchedBatch),
    Transport(String),
    Schema(String),
    Fatal(String),
}

impl AttemptOutcome {
    pub fn evaluate(status: ReplyStatus, schema: &ResponseSchema, items: &[Item]) -> Self {
        match status {
            ReplyStatus::Ok(values) => match schema.match_batch(values, items) {
                Ok(matched) => Self::Valid(matched),
                Err(violation) => Self::Schema(violation.to_string()),
            },
            ReplyStatus::TransportError(e) => Self::Transport(e),
            ReplyStatus::SchemaError(e) => Self::Schema(e),
            ReplyStatus::Fatal(e) => Self::Fatal(e),
        }
    }

    fn error(&self) -> Option<&str> {
        match self {
            Self::Valid(_) => None,
            Self::Transport(e) | Self::Schema(e) | Self::Fatal(e) => Some(e),
        }
    }
}

/// State after `SENT` given the outcome of zero-based `attempt`.
pub fn next_state(outcome: &AttemptOutcome, attempt: u32, retry_limit: u32) -> BatchState {
    match outcome {
        AttemptOutcome::Valid(_) => BatchState::Succeeded,
        AttemptOutcome::Fatal(_) => BatchState::FatalFailure,
        AttemptOutcome::Transport(_) | AttemptOutcome::Schema(_) if attempt >= retry_limit => {
            BatchState::FatalFailure
        }
        AttemptOutcome::Transport(_) | AttemptOutcome::Schema(_) => BatchState::RetryableFailure,
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let multiplier = 2u32.pow(attempt.min(5));
    base.checked_mul(multiplier).unwrap_or(Duration::MAX)
}

/// Proactive reminder cadence for one model.
#[derive(Debug, Clone)]
pub struct ReminderSchedule {
    interval: usize,
    processed: usize,
    next_at: usize,
}

impl ReminderSchedule {
    pub fn new(interval: usize) -> Self {
        Self {
            interval,
            processed: 0,
            next_at: interval,
        }
    }

    /// Whether the next batch should carry the reminder.
    pub fn due(&mut self) -> bool {
        if self.interval == 0 || self.processed < self.next_at {
            return false;
        }
        while self.next_at <= self.processed {
            self.next_at += self.interval;
        }
        true
    }

    pub fn advance(&mut self, items: usize) {
        self.processed += items;
    }
}

// =============================================================================
// Reports
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub model: String,
    pub item_ids: Vec<String>,
    pub state: BatchState,
    pub attempts: u32,
    pub error: Option<String>,
    /// Answers handed to the writer (committed or queued).
    pub written: usize,
    pub write_failures: usize,
    pub missing: Vec<String>,
    /// The endpoint itself failed; the model's later batches were abandoned.
    pub endpoint_fatal: bool,
}

impl BatchReport {
    fn new(batch: &TaskBatch) -> Self {
        Self {
            model: batch.model.clone(),
            item_ids: batch.items.iter().map(|i| i.item_id.clone()).collect(),
            state: BatchState::Pending,
            attempts: 0,
            error: None,
            written: 0,
            write_failures: 0,
            missing: Vec::new(),
            endpoint_fatal: false,
        }
    }

    fn not_started(batch: &TaskBatch, reason: &str) -> Self {
        let mut report = Self::new(batch);
        report.error = Some(reason.to_string());
        report
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchReport {
    pub batches: Vec<BatchReport>,
    pub cancelled: bool,
}

impl DispatchReport {
    fn count(&self, state: BatchState) -> usize {
        self.batches.iter().filter(|b| b.state == state).count()
    }

    pub fn succeeded(&self) -> usize {
        self.count(BatchState::Succeeded)
    }

    pub fn failed(&self) -> usize {
        self.count(BatchState::FatalFailure)
    }

    /// Batches never sent (abandoned model, cancellation, no connector).
    pub fn not_sent(&self) -> usize {
        self.batches.iter().filter(|b| b.attempts == 0).count()
    }

    pub fn for_model<'a>(&'a self, model: &'a str) -> impl Iterator<Item = &'a BatchReport> + 'a {
        self.batches.iter().filter(move |b| b.model == model)
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

pub struct Dispatcher {
    connectors: BTreeMap<String, Arc<dyn Connector>>,
    writer: Arc<ResultWriter>,
    metrics: Arc<MetricsAggregator>,
    cancel: Arc<AtomicBool>,
    prompt: PromptBundle,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        ctx: &RunContext,
        prompt: PromptBundle,
        connectors: Vec<Arc<dyn Connector>>,
        writer: Arc<ResultWriter>,
    ) -> Self {
        Self {
            connectors: connectors
                .into_iter()
                .map(|c| (c.model().to_string(), c))
                .collect(),
            writer,
            metrics: Arc::clone(&ctx.metrics),
            cancel: Arc::clone(&ctx.cancel),
            prompt,
            config: ctx.config.dispatch_config(),
        }
    }

    pub fn with_config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Run every batch of `plan`. Models run concurrently; each model's
    /// batches run in plan order.
    pub async fn run(&self, plan: &TaskPlan) -> DispatchReport {
        let mut by_model: BTreeMap<&str, Vec<&TaskBatch>> = BTreeMap::new();
        for batch in &plan.batches {
            by_model.entry(batch.model.as_str()).or_default().push(batch);
        }

        let mut orphaned = Vec::new();
        let mut runs = Vec::new();
        for (model, batches) in by_model {
            match self.connectors.get(model) {
                Some(connector) => runs.push(self.run_model(connector.as_ref(), batches)),
                None => {
                    tracing::warn!(model, "no connector for planned model; skipping");
                    for batch in batches {
                        self.metrics.record_not_sent(model);
                        orphaned.push(BatchReport::not_started(batch, "no connector for model"));
                    }
                }
            }
        }

        let mut report = DispatchReport::default();
        for model_reports in join_all(runs).await {
            report.batches.extend(model_reports);
        }
        report.batches.extend(orphaned);
        report.cancelled = self.cancelled();
        report
    }

    async fn run_model(&self, connector: &dyn Connector, batches: Vec<&TaskBatch>) -> Vec<BatchReport> {
        let mut reports = Vec::with_capacity(batches.len());
        let mut reminders = ReminderSchedule::new(self.config.reminder_interval);
        let mut abandoned: Option<String> = None;

        for batch in batches {
            if let Some(reason) = &abandoned {
                self.metrics.record_not_sent(&batch.model);
                reports.push(BatchReport::not_started(batch, reason));
                continue;
            }
            if self.cancelled() {
                self.metrics.record_not_sent(&batch.model);
                reports.push(BatchReport::not_started(batch, "cancelled"));
                continue;
            }
            let proactive = reminders.due();
            let report = self.dispatch_batch(connector, batch, proactive).await;
            reminders.advance(batch.items.len());
            if report.endpoint_fatal {
                tracing::error!(
                    model = %batch.model,
                    error = report.error.as_deref().unwrap_or(""),
                    "endpoint failed; abandoning remaining batches for model"
                );
                abandoned = Some(format!(
                    "abandoned after endpoint failure: {}",
                    report.error.as_deref().unwrap_or("unknown")
                ));
            }
            reports.push(report);
        }
        reports
    }

    /// Drive one batch to a terminal state (or to cancellation).
    pub async fn dispatch_batch(
        &self,
        connector: &dyn Connector,
        batch: &TaskBatch,
        proactive_reminder: bool,
    ) -> BatchReport {
        let model = batch.model.as_str();
        let mut report = BatchReport::new(batch);
        self.metrics.record_batch(model);

        let mut request = DispatchRequest {
            model: model.to_string(),
            prompt_hash: self.prompt.hash.clone(),
            prompt_text: self.prompt.compose(&batch.items),
            items: batch.items.clone(),
            reminder: None,
            attempt: 0,
        };
        if proactive_reminder {
            request.reminder = Some(COMPLIANCE_REMINDER.to_string());
            self.metrics.record_reminder(model);
            tracing::debug!(model, "proactive compliance reminder");
        }

        loop {
            report.state = BatchState::Sent;
            report.attempts += 1;
            self.metrics.record_attempt(model);

            let ConnectorReply { status, elapsed } = connector.send(&request).await;
            let outcome = AttemptOutcome::evaluate(status, &self.config.schema, &batch.items);
            report.state = next_state(&outcome, request.attempt, self.config.retry_limit);
            report.error = outcome.error().map(str::to_string);

            match report.state {
                BatchState::Succeeded => {
                    self.metrics.record_success(model, elapsed);
                    if let AttemptOutcome::Valid(matched) = outcome {
                        self.persist(&mut report, matched, elapsed).await;
                    }
                    tracing::info!(
                        model,
                        attempts = report.attempts,
                        written = report.written,
                        missing = report.missing.len(),
                        elapsed_secs = elapsed.as_secs_f64(),
                        "batch succeeded"
                    );
                    return report;
                }
                BatchState::FatalFailure => {
                    self.metrics.record_failure(model);
                    report.endpoint_fatal = matches!(outcome, AttemptOutcome::Fatal(_));
                    tracing::error!(
                        model,
                        attempts = report.attempts,
                        items = ?report.item_ids,
                        error = report.error.as_deref().unwrap_or(""),
                        "batch failed"
                    );
                    return report;
                }
                _ => {}
            }

            // RETRYABLE_FAILURE
            if self.cancelled() {
                self.metrics.record_failure(model);
                report.state = BatchState::FatalFailure;
                report.error = Some(format!(
                    "cancelled before retry: {}",
                    report.error.as_deref().unwrap_or("")
                ));
                tracing::warn!(model, "run cancelled; not retrying batch");
                return report;
            }
            self.metrics.record_retry(model);
            if matches!(outcome, AttemptOutcome::Schema(_)) {
                request.reminder = Some(COMPLIANCE_REMINDER.to_string());
                self.metrics.record_reminder(model);
            }
            tracing::warn!(
                model,
                attempt = request.attempt + 1,
                retry_limit = self.config.retry_limit,
                error = report.error.as_deref().unwrap_or(""),
                "batch attempt failed; retrying"
            );
            sleep(backoff_delay(self.config.retry_base_delay, request.attempt)).await;
            request.attempt += 1;
        }
    }

    async fn persist(&self, report: &mut BatchReport, matched: MatchedBatch, elapsed: Duration) {
        let model = report.model.clone();
        if !matched.missing.is_empty() {
            self.metrics.record_items_missing(&model, matched.missing.len());
            tracing::warn!(model = %model, missing = ?matched.missing, "response left items unanswered");
        }
        report.missing = matched.missing;

        for (item, payload) in matched.matched {
            let task = WriteTask::new(&item.item_id, &model, &self.prompt.hash, payload, elapsed)
                .with_title(item.title);
            match self.writer.write(task).await {
                WriteOutcome::Committed | WriteOutcome::Queued => report.written += 1,
                WriteOutcome::Failed(reason) => {
                    report.write_failures += 1;
                    tracing::error!(model = %model, item_id = %item.item_id, %reason, "failed to store result");
                }
            }
        }
    }
}
