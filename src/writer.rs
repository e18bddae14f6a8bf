//! Write strategies on top of [`ResultStore`].
//!
//! `immediate` commits every answer through its own locked section before
//! returning. `batch` hands answers to a [`WriteBuffer`] that flushes by size
//! or age; callers must [`ResultWriter::shutdown`] to force the final flush.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::buffer::{FlushReport, WriteBuffer};
use crate::metrics::MetricsAggregator;
use crate::store::{ResultStore, WriteTask};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteStrategy {
    #[default]
    Immediate,
    Batch,
}

impl std::fmt::Display for WriteStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Immediate => "immediate",
            Self::Batch => "batch",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Committed,
    Queued,
    Failed(String),
}

impl WriteOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteConfig {
    pub strategy: WriteStrategy,
    /// Pending tasks that trigger a size flush.
    pub batch_size: usize,
    /// Age of the oldest pending task that triggers a timed flush.
    pub batch_interval: Duration,
    /// Extra attempts per item group during a buffered flush.
    pub batch_retry_limit: u32,
    /// Extra attempts for an immediate write.
    pub retry_limit: u32,
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            strategy: WriteStrategy::Immediate,
            batch_size: 25,
            batch_interval: Duration::from_secs(5),
            batch_retry_limit: 3,
            retry_limit: 3,
        }
    }
}

pub struct ResultWriter {
    store: ResultStore,
    retry_limit: u32,
    buffer: Option<WriteBuffer>,
}

impl ResultWriter {
    /// Build a writer for `config.strategy`. The batch strategy spawns its
    /// flush timer, so this must run inside a tokio runtime.
    pub fn new(store: ResultStore, config: &WriteConfig) -> Self {
        let buffer = match config.strategy {
            WriteStrategy::Immediate => None,
            WriteStrategy::Batch => Some(WriteBuffer::spawn(store.clone(), config)),
        };
        Self {
            store,
            retry_limit: config.retry_limit,
            buffer,
        }
    }

    pub fn strategy(&self) -> WriteStrategy {
        if self.buffer.is_some() {
            WriteStrategy::Batch
        } else {
            WriteStrategy::Immediate
        }
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    pub fn buffer(&self) -> Option<&WriteBuffer> {
        self.buffer.as_ref()
    }

    pub async fn write(&self, task: WriteTask) -> WriteOutcome {
        if let Some(buffer) = &self.buffer {
            return match buffer.enqueue(task).await {
                Ok(()) => WriteOutcome::Queued,
                Err(closed) => {
                    let reason = closed.to_string();
                    record_failed(self.store.metrics(), std::slice::from_ref(&closed.0));
                    WriteOutcome::Failed(reason)
                }
            };
        }

        let item_id = task.item_id.clone();
        let tasks = vec![task];
        match self
            .store
            .commit_with_retry(&item_id, tasks.clone(), self.retry_limit)
            .await
        {
            Ok(_) => {
                record_committed(self.store.metrics(), &tasks);
                WriteOutcome::Committed
            }
            Err(e) => {
                tracing::error!(item_id = %item_id, error = %e, "result write failed");
                record_failed(self.store.metrics(), &tasks);
                WriteOutcome::Failed(e.to_string())
            }
        }
    }

    /// Flush pending buffered writes now. A no-op for `immediate`.
    pub async fn flush(&self) -> FlushReport {
        match &self.buffer {
            Some(buffer) => buffer.flush().await,
            None => FlushReport::default(),
        }
    }

    /// Stop the flush timer and write out everything still queued. Returns
    /// the cumulative flush report for the batch strategy.
    pub async fn shutdown(&self) -> FlushReport {
        match &self.buffer {
            Some(buffer) => buffer.shutdown().await,
            None => FlushReport::default(),
        }
    }
}

pub(crate) fn record_committed(metrics: &MetricsAggregator, tasks: &[WriteTask]) {
    for task in tasks {
        metrics.record_items_written(&task.model_name, 1);
    }
}

pub(crate) fn record_failed(metrics: &MetricsAggregator, tasks: &[WriteTask]) {
    for task in tasks {
        metrics.record_write_failures(&task.model_name, 1);
    }
}
