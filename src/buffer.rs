//! In-memory queue of pending writes for the batch strategy.
//!
//! A flush is triggered by whichever comes first: the queue reaching
//! `batch_size` (flushed inline by the enqueuing task) or the oldest pending
//! task reaching `batch_interval` (flushed by a background timer). Flushes
//! are serialized and take the whole queue, so one flush covers every task
//! pending at that moment.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::store::{ResultStore, WriteTask};
use crate::writer::{record_committed, record_failed, WriteConfig};

/// A task that could not be persisted after exhausting its retries.
#[derive(Debug, Clone)]
pub struct FailedWrite {
    pub task: WriteTask,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct FlushReport {
    /// Non-empty flushes performed.
    pub flushes: usize,
    pub committed: usize,
    pub failed: Vec<FailedWrite>,
}

impl FlushReport {
    fn absorb(&mut self, other: &FlushReport) {
        self.flushes += other.flushes;
        self.committed += other.committed;
        self.failed.extend(other.failed.iter().cloned());
    }
}

/// Returned by [`WriteBuffer::enqueue`] after shutdown; carries the rejected
/// task back to the caller.
#[derive(Debug, thiserror::Error)]
#[error("write buffer is shut down")]
pub struct BufferClosed(pub WriteTask);

#[derive(Default)]
struct PendingQueue {
    tasks: Vec<WriteTask>,
    oldest: Option<Instant>,
}

struct Shared {
    store: ResultStore,
    batch_size: usize,
    batch_interval: Duration,
    retry_limit: u32,
    pending: Mutex<PendingQueue>,
    flush_gate: tokio::sync::Mutex<()>,
    wake: Notify,
    closed: AtomicBool,
    flushes: AtomicUsize,
    totals: Mutex<FlushReport>,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, PendingQueue> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn deadline(&self) -> Option<Instant> {
        self.pending().oldest.map(|t| t + self.batch_interval)
    }

    async fn flush(&self) -> FlushReport {
        let _gate = self.flush_gate.lock().await;
        let tasks = {
            let mut queue = self.pending();
            queue.oldest = None;
            std::mem::take(&mut queue.tasks)
        };
        if tasks.is_empty() {
            return FlushReport::default();
        }
        self.flushes.fetch_add(1, Ordering::SeqCst);

        let mut report = FlushReport {
            flushes: 1,
            ..FlushReport::default()
        };
        let metrics = self.store.metrics();
        for (item_id, group) in group_by_item(tasks) {
            match self
                .store
                .commit_with_retry(&item_id, group.clone(), self.retry_limit)
                .await
            {
                Ok(_) => {
                    record_committed(metrics, &group);
                    report.committed += group.len();
                }
                Err(e) => {
                    tracing::error!(
                        item_id = %item_id,
                        tasks = group.len(),
                        error = %e,
                        "buffered write exhausted retries"
                    );
                    record_failed(metrics, &group);
                    let reason = e.to_string();
                    report
                        .failed
                        .extend(group.into_iter().map(|task| FailedWrite {
                            task,
                            reason: reason.clone(),
                        }));
                }
            }
        }
        tracing::debug!(
            committed = report.committed,
            failed = report.failed.len(),
            "write buffer flushed"
        );
        self.totals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .absorb(&report);
        report
    }
}

/// Group tasks by item id, keeping first-seen order of items and of tasks
/// within an item.
fn group_by_item(tasks: Vec<WriteTask>) -> Vec<(String, Vec<WriteTask>)> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<(String, Vec<WriteTask>)> = Vec::new();
    for task in tasks {
        match index.get(&task.item_id) {
            Some(&i) => groups[i].1.push(task),
            None => {
                index.insert(task.item_id.clone(), groups.len());
                groups.push((task.item_id.clone(), vec![task]));
            }
        }
    }
    groups
}

async fn run_timer(shared: Arc<Shared>) {
    loop {
        if shared.closed.load(Ordering::Acquire) {
            break;
        }
        match shared.deadline() {
            Some(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {
                        // A size flush may have emptied the queue meanwhile.
                        if shared.deadline().is_some_and(|d| d <= Instant::now()) {
                            shared.flush().await;
                        }
                    }
                    _ = shared.wake.notified() => {}
                }
            }
            None => shared.wake.notified().await,
        }
    }
}

pub struct WriteBuffer {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl WriteBuffer {
    /// Create the buffer and spawn its flush timer on the current runtime.
    pub fn spawn(store: ResultStore, config: &WriteConfig) -> Self {
        let shared = Arc::new(Shared {
            store,
            batch_size: config.batch_size.max(1),
            batch_interval: config.batch_interval,
            retry_limit: config.batch_retry_limit,
            pending: Mutex::new(PendingQueue::default()),
            flush_gate: tokio::sync::Mutex::new(()),
            wake: Notify::new(),
            closed: AtomicBool::new(false),
            flushes: AtomicUsize::new(0),
            totals: Mutex::new(FlushReport::default()),
        });
        let worker = tokio::spawn(run_timer(Arc::clone(&shared)));
        Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub async fn enqueue(&self, task: WriteTask) -> Result<(), BufferClosed> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(BufferClosed(task));
        }
        let full = {
            let mut queue = self.shared.pending();
            if queue.oldest.is_none() {
                queue.oldest = Some(Instant::now());
            }
            queue.tasks.push(task);
            queue.tasks.len() >= self.shared.batch_size
        };
        if full {
            self.shared.flush().await;
        } else {
            self.shared.wake.notify_one();
        }
        Ok(())
    }

    pub fn pending_len(&self) -> usize {
        self.shared.pending().tasks.len()
    }

    /// Number of non-empty flushes so far.
    pub fn flush_count(&self) -> usize {
        self.shared.flushes.load(Ordering::SeqCst)
    }

    pub async fn flush(&self) -> FlushReport {
        self.shared.flush().await
    }

    /// Stop the timer, flush whatever is still queued and return the
    /// cumulative report. Later enqueues are rejected.
    pub async fn shutdown(&self) -> FlushReport {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.wake.notify_one();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "write buffer timer ended abnormally");
            }
        }
        self.shared.flush().await;
        self.shared
            .totals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Drop for WriteBuffer {
    fn drop(&mut self) {
        if let Some(worker) = self
            .worker
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            worker.abort();
        }
        let pending = self.pending_len();
        if pending > 0 {
            tracing::warn!(pending, "write buffer dropped without shutdown; tasks lost");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn task(item: &str, model: &str) -> WriteTask {
        WriteTask::new(item, model, "h", Map::new(), Duration::from_millis(10))
    }

    #[test]
    fn groups_keep_first_seen_order() {
        let groups = group_by_item(vec![
            task("b", "m1"),
            task("a", "m1"),
            task("b", "m2"),
        ]);
        let ids: Vec<_> = groups.iter().map(|(id, g)| (id.as_str(), g.len())).collect();
        assert_eq!(ids, vec![("b", 2), ("a", 1)]);
        assert_eq!(groups[0].1[1].model_name, "m2");
    }
}
