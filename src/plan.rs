//! Turning items x models into dispatchable batches.

use std::collections::BTreeMap;

use crate::config::RunConfig;
use crate::items::Item;
use crate::store::ResultStore;

#[derive(Debug, Clone, PartialEq)]
pub struct TaskBatch {
    pub model: String,
    pub items: Vec<Item>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPlan {
    /// Batches grouped by model, models in sorted order.
    pub batches: Vec<TaskBatch>,
    /// Items already satisfied on disk, per model.
    pub skipped_by_model: BTreeMap<String, usize>,
}

impl TaskPlan {
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn item_count(&self) -> usize {
        self.batches.iter().map(|b| b.items.len()).sum()
    }

    pub fn batches_for<'a>(&'a self, model: &'a str) -> impl Iterator<Item = &'a TaskBatch> + 'a {
        self.batches.iter().filter(move |b| b.model == model)
    }
}

#[derive(Debug, Clone)]
pub struct TaskPlanner {
    pub batch_size: usize,
    /// Per-model item cap; `None` plans everything.
    pub limit_per_model: Option<usize>,
    pub blocklist: Vec<String>,
}

impl TaskPlanner {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            limit_per_model: None,
            blocklist: Vec::new(),
        }
    }

    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            batch_size: config.task_batch_size.max(1),
            limit_per_model: config.test_mode.then_some(config.test_limit_per_model),
            blocklist: config.llm_blocklist.clone(),
        }
    }

    fn is_blocked(&self, model: &str) -> bool {
        self.blocklist.iter().any(|b| b.trim().eq_ignore_ascii_case(model.trim()))
    }

    /// Plan `items` for every model, skipping `(item, model, prompt_hash)`
    /// triples the store already holds.
    pub fn build(
        &self,
        items: &[Item],
        models: &[String],
        prompt_hash: &str,
        store: &ResultStore,
    ) -> TaskPlan {
        let mut models: Vec<&String> = models.iter().filter(|m| !self.is_blocked(m)).collect();
        models.sort();
        models.dedup();

        let mut plan = TaskPlan::default();
        for model in models {
            let mut pending = Vec::new();
            let mut skipped = 0;
            for item in items {
                if store.has_result(&item.item_id, model, prompt_hash) {
                    skipped += 1;
                    continue;
                }
                if self.limit_per_model.is_some_and(|limit| pending.len() >= limit) {
                    break;
                }
                pending.push(item.clone());
            }
            if skipped > 0 {
                tracing::info!(model = %model, skipped, "items already satisfied; skipping");
            }
            plan.skipped_by_model.insert(model.clone(), skipped);
            plan.batches.extend(pending.chunks(self.batch_size).map(|chunk| TaskBatch {
                model: model.clone(),
                items: chunk.to_vec(),
            }));
        }
        plan
    }
}
