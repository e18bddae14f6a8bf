//! Run metrics, keyed by model.
//!
//! Counters are append-only and purely observational: nothing in the
//! dispatch or write path reads them back. [`MetricsAggregator::finalize`]
//! seals the aggregator so the emitted summary can never drift from the
//! state it describes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default)]
struct ModelCounters {
    batches: u64,
    attempts: u64,
    succeeded: u64,
    failed: u64,
    not_sent: u64,
    retries: u64,
    reminders: u64,
    items_written: u64,
    items_missing: u64,
    write_failures: u64,
    response_time_samples: Vec<f64>,
}

#[derive(Debug, Default)]
struct MetricsState {
    models: BTreeMap<String, ModelCounters>,
    corrupt_files: u64,
    lock_timeouts: u64,
}

/// Per-model summary line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelSummary {
    /// Distinct batches handed to the dispatcher.
    pub batches: u64,
    /// Connector calls, retries included.
    pub attempts: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Planned batches never sent: abandoned after an endpoint failure,
    /// skipped by cancellation or without a connector.
    pub not_sent: u64,
    pub retries: u64,
    pub reminders: u64,
    pub items_written: u64,
    pub items_missing: u64,
    pub write_failures: u64,
    pub avg_response_time_seconds: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub models: BTreeMap<String, ModelSummary>,
    pub totals: ModelSummary,
    pub corrupt_files: u64,
    pub lock_timeouts: u64,
}

impl RunSummary {
    /// Emit the summary as log lines.
    pub fn log(&self) {
        tracing::info!("=== run summary ===");
        for (model, s) in &self.models {
            tracing::info!(
                model = %model,
                batches = s.batches,
                attempts = s.attempts,
                succeeded = s.succeeded,
                failed = s.failed,
                not_sent = s.not_sent,
                retries = s.retries,
                reminders = s.reminders,
                items_written = s.items_written,
                items_missing = s.items_missing,
                write_failures = s.write_failures,
                avg_response_time_seconds = %format!("{:.2}", s.avg_response_time_seconds),
                "model summary"
            );
        }
        tracing::info!(
            batches = self.totals.batches,
            succeeded = self.totals.succeeded,
            failed = self.totals.failed,
            not_sent = self.totals.not_sent,
            retries = self.totals.retries,
            items_written = self.totals.items_written,
            write_failures = self.totals.write_failures,
            corrupt_files = self.corrupt_files,
            lock_timeouts = self.lock_timeouts,
            "totals"
        );
    }
}

#[derive(Debug, Default)]
pub struct MetricsAggregator {
    state: Mutex<MetricsState>,
    sealed: AtomicBool,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MetricsState> {
        // Counters stay meaningful even if a recording thread panicked.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut MetricsState),
    {
        let mut state = self.state();
        if self.sealed.load(Ordering::Acquire) {
            tracing::debug!("metrics already finalized; dropping late record");
            return;
        }
        f(&mut state);
    }

    fn update_model<F>(&self, model: &str, f: F)
    where
        F: FnOnce(&mut ModelCounters),
    {
        self.update(|state| f(state.models.entry(model.to_string()).or_default()));
    }

    pub fn record_batch(&self, model: &str) {
        self.update_model(model, |c| c.batches += 1);
    }

    pub fn record_attempt(&self, model: &str) {
        self.update_model(model, |c| c.attempts += 1);
    }

    pub fn record_success(&self, model: &str, elapsed: Duration) {
        self.update_model(model, |c| {
            c.succeeded += 1;
            c.response_time_samples.push(elapsed.as_secs_f64());
        });
    }

    pub fn record_failure(&self, model: &str) {
        self.update_model(model, |c| c.failed += 1);
    }

    pub fn record_not_sent(&self, model: &str) {
        self.update_model(model, |c| c.not_sent += 1);
    }

    pub fn record_retry(&self, model: &str) {
        self.update_model(model, |c| c.retries += 1);
    }

    pub fn record_reminder(&self, model: &str) {
        self.update_model(model, |c| c.reminders += 1);
    }

    pub fn record_items_written(&self, model: &str, count: usize) {
        self.update_model(model, |c| c.items_written += count as u64);
    }

    pub fn record_items_missing(&self, model: &str, count: usize) {
        self.update_model(model, |c| c.items_missing += count as u64);
    }

    pub fn record_write_failures(&self, model: &str, count: usize) {
        self.update_model(model, |c| c.write_failures += count as u64);
    }

    pub fn record_corrupt_file(&self) {
        self.update(|s| s.corrupt_files += 1);
    }

    pub fn record_lock_timeout(&self) {
        self.update(|s| s.lock_timeouts += 1);
    }

    pub fn is_finalized(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Current summary without sealing.
    pub fn snapshot(&self) -> RunSummary {
        summarize(&self.state())
    }

    /// Seal the aggregator and return the final summary. Records arriving
    /// afterwards are ignored.
    pub fn finalize(&self) -> RunSummary {
        let state = self.state();
        self.sealed.store(true, Ordering::Release);
        summarize(&state)
    }
}

fn summarize(state: &MetricsState) -> RunSummary {
    let mut totals = ModelSummary::default();
    let mut all_samples: Vec<f64> = Vec::new();
    let mut models = BTreeMap::new();

    for (model, c) in &state.models {
        let summary = ModelSummary {
            batches: c.batches,
            attempts: c.attempts,
            succeeded: c.succeeded,
            failed: c.failed,
            not_sent: c.not_sent,
            retries: c.retries,
            reminders: c.reminders,
            items_written: c.items_written,
            items_missing: c.items_missing,
            write_failures: c.write_failures,
            avg_response_time_seconds: mean(&c.response_time_samples),
        };
        totals.batches += c.batches;
        totals.attempts += c.attempts;
        totals.succeeded += c.succeeded;
        totals.failed += c.failed;
        totals.not_sent += c.not_sent;
        totals.retries += c.retries;
        totals.reminders += c.reminders;
        totals.items_written += c.items_written;
        totals.items_missing += c.items_missing;
        totals.write_failures += c.write_failures;
        all_samples.extend_from_slice(&c.response_time_samples);
        models.insert(model.clone(), summary);
    }
    totals.avg_response_time_seconds = mean(&all_samples);

    RunSummary {
        models,
        totals,
        corrupt_files: state.corrupt_files,
        lock_timeouts: state.lock_timeouts,
    }
}

fn mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        0.0
    } else {
        samples.iter().sum::<f64>() / samples.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_response_time_per_model_and_overall() {
        let m = MetricsAggregator::new();
        m.record_success("m1", Duration::from_secs(1));
        m.record_success("m1", Duration::from_secs(3));
        m.record_success("m2", Duration::from_secs(5));
        m.record_failure("m2");

        let s = m.snapshot();
        assert_eq!(s.models["m1"].avg_response_time_seconds, 2.0);
        assert_eq!(s.models["m2"].failed, 1);
        assert_eq!(s.totals.succeeded, 3);
        assert_eq!(s.totals.avg_response_time_seconds, 3.0);
    }

    #[test]
    fn finalize_seals_counters() {
        let m = MetricsAggregator::new();
        m.record_attempt("m1");
        let summary = m.finalize();
        m.record_attempt("m1");
        m.record_corrupt_file();

        assert!(m.is_finalized());
        assert_eq!(summary, m.snapshot());
        assert_eq!(m.snapshot().models["m1"].attempts, 1);
        assert_eq!(m.snapshot().corrupt_files, 0);
    }

    #[test]
    fn unsent_batches_reach_model_and_totals() {
        let m = MetricsAggregator::new();
        m.record_not_sent("m1");
        m.record_not_sent("m2");
        m.record_not_sent("m2");
        let s = m.snapshot();
        assert_eq!(s.models["m2"].not_sent, 2);
        assert_eq!(s.models["m2"].batches, 0);
        assert_eq!(s.totals.not_sent, 3);
    }

    #[test]
    fn empty_model_has_zero_average() {
        let m = MetricsAggregator::new();
        m.record_batch("m1");
        assert_eq!(m.snapshot().models["m1"].avg_response_time_seconds, 0.0);
    }
}
