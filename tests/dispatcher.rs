use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use plotbot_harness::connector::{Connector, ConnectorReply, DispatchRequest, ReplyStatus};
use plotbot_harness::dispatch::{BatchState, DispatchConfig, Dispatcher};
use plotbot_harness::plan::{TaskBatch, TaskPlan};
use plotbot_harness::prompt::{PromptBundle, COMPLIANCE_REMINDER};
use plotbot_harness::schema::ResponseSchema;
use plotbot_harness::writer::{ResultWriter, WriteConfig};
use plotbot_harness::{Item, RunConfig, RunContext};
use serde_json::{json, Value};
use tempfile::{tempdir, TempDir};

/// Replays canned replies in order, then repeats `fallback`.
struct ScriptedConnector {
    model: String,
    replies: Mutex<VecDeque<ReplyStatus>>,
    fallback: ReplyStatus,
    requests: Mutex<Vec<DispatchRequest>>,
}

impl ScriptedConnector {
    fn new(model: &str, replies: Vec<ReplyStatus>, fallback: ReplyStatus) -> Arc<Self> {
        Arc::new(Self {
            model: model.to_string(),
            replies: Mutex::new(replies.into()),
            fallback,
            requests: Mutex::new(Vec::new()),
        })
    }

    fn always(model: &str, status: ReplyStatus) -> Arc<Self> {
        Self::new(model, Vec::new(), status)
    }

    fn requests(&self) -> Vec<DispatchRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    fn model(&self) -> &str {
        &self.model
    }

    async fn send(&self, request: &DispatchRequest) -> ConnectorReply {
        self.requests.lock().unwrap().push(request.clone());
        let status = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        ConnectorReply::new(status, Duration::from_millis(250))
    }
}

struct Harness {
    _dir: TempDir,
    ctx: RunContext,
    writer: Arc<ResultWriter>,
    prompt: PromptBundle,
}

impl Harness {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        let config = RunConfig::from_json(json!({
            "GENERATED_DIR": dir.path().join("generated"),
        }))
        .unwrap();
        let ctx = RunContext::new(config);
        let writer = Arc::new(ResultWriter::new(ctx.store().unwrap(), &WriteConfig::default()));
        Self {
            _dir: dir,
            ctx,
            writer,
            prompt: PromptBundle::new("Summarise each headline."),
        }
    }

    fn dispatcher(&self, connectors: Vec<Arc<dyn Connector>>, config: DispatchConfig) -> Dispatcher {
        Dispatcher::new(&self.ctx, self.prompt.clone(), connectors, Arc::clone(&self.writer))
            .with_config(config)
    }
}

fn config(retry_limit: u32) -> DispatchConfig {
    DispatchConfig {
        retry_limit,
        retry_base_delay: Duration::ZERO,
        reminder_interval: 0,
        schema: ResponseSchema::new(["summary"]),
    }
}

fn batches(model: &str, ids: &[&str], batch_size: usize) -> TaskPlan {
    let items: Vec<Item> = ids.iter().map(|id| Item::new(*id, format!("Headline {id}"))).collect();
    TaskPlan {
        batches: items
            .chunks(batch_size)
            .map(|chunk| TaskBatch {
                model: model.to_string(),
                items: chunk.to_vec(),
            })
            .collect(),
        skipped_by_model: Default::default(),
    }
}

fn answers(ids: &[&str]) -> ReplyStatus {
    ReplyStatus::Ok(
        ids.iter()
            .map(|id| json!({"id": id, "summary": format!("about {id}")}))
            .collect::<Vec<Value>>(),
    )
}

#[tokio::test]
async fn two_items_one_batch_produce_two_result_files() {
    let h = Harness::new();
    let connector = ScriptedConnector::always("m1", answers(&["a", "b"]));
    let dispatcher = h.dispatcher(vec![connector.clone() as Arc<dyn Connector>], config(3));

    let report = dispatcher.run(&batches("m1", &["a", "b"], 2)).await;
    assert_eq!(report.batches.len(), 1);
    assert_eq!(report.batches[0].state, BatchState::Succeeded);
    assert_eq!(report.batches[0].written, 2);

    let request = &connector.requests()[0];
    assert!(request.prompt_text.contains("1. [a] Headline a"));
    assert!(request.prompt_text.contains("2. [b] Headline b"));

    let store = h.writer.store();
    for id in ["a", "b"] {
        let record = store.load(id).unwrap().unwrap();
        let entry = record.get("m1", &h.prompt.hash).unwrap();
        assert_eq!(entry.payload["summary"], json!(format!("about {id}")));
        assert!(entry.generated_at.is_some());
        assert!(!entry.payload.contains_key("id"));
        assert_eq!(record.title.as_deref(), Some(format!("Headline {id}").as_str()));
    }

    let summary = h.ctx.metrics.snapshot();
    assert_eq!(summary.models["m1"].succeeded, 1);
    assert_eq!(summary.models["m1"].items_written, 2);
    assert_eq!(summary.models["m1"].avg_response_time_seconds, 0.25);
}

#[tokio::test]
async fn schema_errors_hit_the_retry_ceiling_with_reminders() {
    let h = Harness::new();
    let connector = ScriptedConnector::always("m1", ReplyStatus::SchemaError("prose".into()));
    let dispatcher = h.dispatcher(vec![connector.clone() as Arc<dyn Connector>], config(2));

    let report = dispatcher.run(&batches("m1", &["a"], 1)).await;
    let batch = &report.batches[0];
    assert_eq!(batch.state, BatchState::FatalFailure);
    assert_eq!(batch.attempts, 3);
    assert!(!batch.endpoint_fatal);

    let requests = connector.requests();
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[0].reminder, None);
    assert_eq!(requests[1].reminder.as_deref(), Some(COMPLIANCE_REMINDER));
    assert!(requests[2].user_content().ends_with(COMPLIANCE_REMINDER));

    let summary = h.ctx.metrics.snapshot();
    let m = &summary.models["m1"];
    assert_eq!(m.attempts, 3);
    assert_eq!(m.retries, 2);
    assert_eq!(m.reminders, 2);
    assert_eq!(m.failed, 1);
    assert_eq!(m.succeeded, 0);
    assert!(!h.writer.store().has_result("a", "m1", &h.prompt.hash));
}

#[tokio::test]
async fn response_missing_required_field_counts_as_schema_error() {
    let h = Harness::new();
    let connector = ScriptedConnector::new(
        "m1",
        vec![ReplyStatus::Ok(vec![json!({"id": "a", "tone": "dry"})])],
        answers(&["a"]),
    );
    let dispatcher = h.dispatcher(vec![connector.clone() as Arc<dyn Connector>], config(2));

    let report = dispatcher.run(&batches("m1", &["a"], 1)).await;
    assert_eq!(report.batches[0].state, BatchState::Succeeded);
    assert_eq!(report.batches[0].attempts, 2);
    assert!(connector.requests()[1].reminder.is_some());
    assert_eq!(h.ctx.metrics.snapshot().models["m1"].reminders, 1);
}

#[tokio::test]
async fn transport_error_retries_without_reminder() {
    let h = Harness::new();
    let connector = ScriptedConnector::new(
        "m1",
        vec![ReplyStatus::TransportError("connection reset".into())],
        answers(&["a"]),
    );
    let dispatcher = h.dispatcher(vec![connector.clone() as Arc<dyn Connector>], config(3));

    let report = dispatcher.run(&batches("m1", &["a"], 1)).await;
    assert_eq!(report.batches[0].state, BatchState::Succeeded);
    let requests = connector.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].attempt, 1);
    assert_eq!(requests[1].reminder, None);
    assert_eq!(h.ctx.metrics.snapshot().models["m1"].retries, 1);
}

#[tokio::test]
async fn fatal_endpoint_error_abandons_the_rest_of_the_model() {
    let h = Harness::new();
    let broken = ScriptedConnector::always("broken", ReplyStatus::Fatal("model not found".into()));
    let healthy = ScriptedConnector::always("healthy", answers(&["a"]));
    let dispatcher = h.dispatcher(vec![broken.clone() as Arc<dyn Connector>, healthy.clone()], config(3));

    let mut plan = batches("broken", &["a", "b", "c"], 1);
    plan.batches.extend(batches("healthy", &["a"], 1).batches);
    let report = dispatcher.run(&plan).await;

    assert_eq!(broken.requests().len(), 1);
    let broken_reports: Vec<_> = report.for_model("broken").collect();
    assert_eq!(broken_reports[0].state, BatchState::FatalFailure);
    assert!(broken_reports[0].endpoint_fatal);
    for later in &broken_reports[1..] {
        assert_eq!(later.state, BatchState::Pending);
        assert_eq!(later.attempts, 0);
        assert!(later.error.as_deref().unwrap().contains("abandoned"));
    }
    assert_eq!(report.succeeded(), 1);
    assert_eq!(report.failed(), 1);
    assert_eq!(report.not_sent(), 2);
    assert!(h.writer.store().has_result("a", "healthy", &h.prompt.hash));

    let summary = h.ctx.metrics.snapshot();
    assert_eq!(summary.models["broken"].batches, 1);
    assert_eq!(summary.models["broken"].failed, 1);
    assert_eq!(summary.models["broken"].not_sent, 2);
    assert_eq!(summary.totals.not_sent, 2);
    assert_eq!(summary.totals.succeeded, 1);
}

#[tokio::test]
async fn retry_exhaustion_only_abandons_that_batch() {
    let h = Harness::new();
    let connector = ScriptedConnector::new(
        "m1",
        vec![
            ReplyStatus::TransportError("down".into()),
            ReplyStatus::TransportError("down".into()),
        ],
        answers(&["b"]),
    );
    let dispatcher = h.dispatcher(vec![connector.clone() as Arc<dyn Connector>], config(1));

    let report = dispatcher.run(&batches("m1", &["a", "b"], 1)).await;
    assert_eq!(report.batches[0].state, BatchState::FatalFailure);
    assert_eq!(report.batches[1].state, BatchState::Succeeded);
}

#[tokio::test]
async fn partial_reply_succeeds_and_reports_missing_items() {
    let h = Harness::new();
    let connector = ScriptedConnector::always("m1", answers(&["b"]));
    let dispatcher = h.dispatcher(vec![connector as Arc<dyn Connector>], config(0));

    let report = dispatcher.run(&batches("m1", &["a", "b"], 2)).await;
    let batch = &report.batches[0];
    assert_eq!(batch.state, BatchState::Succeeded);
    assert_eq!(batch.missing, vec!["a".to_string()]);
    assert_eq!(batch.written, 1);
    assert_eq!(h.ctx.metrics.snapshot().models["m1"].items_missing, 1);
    assert!(!h.writer.store().has_result("a", "m1", &h.prompt.hash));
}

#[tokio::test]
async fn proactive_reminder_every_n_items() {
    let h = Harness::new();
    let connector = ScriptedConnector::new(
        "m1",
        vec![answers(&["a"]), answers(&["b"]), answers(&["c"])],
        answers(&[]),
    );
    let mut cfg = config(0);
    cfg.reminder_interval = 1;
    let dispatcher = h.dispatcher(vec![connector.clone() as Arc<dyn Connector>], cfg);

    dispatcher.run(&batches("m1", &["a", "b", "c"], 1)).await;
    let reminders: Vec<bool> = connector
        .requests()
        .iter()
        .map(|r| r.reminder.is_some())
        .collect();
    assert_eq!(reminders, vec![false, true, true]);
    assert_eq!(h.ctx.metrics.snapshot().models["m1"].reminders, 2);
}

#[tokio::test]
async fn cancelled_run_sends_nothing() {
    let h = Harness::new();
    let connector = ScriptedConnector::always("m1", answers(&["a"]));
    let dispatcher = h.dispatcher(vec![connector.clone() as Arc<dyn Connector>], config(0));
    h.ctx.cancel();

    let report = dispatcher.run(&batches("m1", &["a", "b"], 1)).await;
    assert!(report.cancelled);
    assert!(connector.requests().is_empty());
    assert!(report.batches.iter().all(|b| b.state == BatchState::Pending));
    assert_eq!(h.ctx.metrics.snapshot().models["m1"].not_sent, 2);
}

/// Fails with a transport error after cancelling the run, so the cancel
/// lands while the batch is waiting to retry.
struct CancelOnSend {
    ctx: RunContext,
    calls: Mutex<usize>,
}

#[async_trait]
impl Connector for CancelOnSend {
    fn model(&self) -> &str {
        "m1"
    }

    async fn send(&self, _request: &DispatchRequest) -> ConnectorReply {
        *self.calls.lock().unwrap() += 1;
        self.ctx.cancel();
        ConnectorReply::new(
            ReplyStatus::TransportError("connection reset".into()),
            Duration::from_millis(5),
        )
    }
}

#[tokio::test]
async fn cancel_between_attempts_ends_the_batch_as_failed() {
    let h = Harness::new();
    let connector = Arc::new(CancelOnSend {
        ctx: h.ctx.clone(),
        calls: Mutex::new(0),
    });
    let dispatcher = h.dispatcher(vec![connector.clone() as Arc<dyn Connector>], config(3));

    let report = dispatcher.run(&batches("m1", &["a", "b"], 1)).await;
    assert!(report.cancelled);
    assert_eq!(*connector.calls.lock().unwrap(), 1);

    let first = &report.batches[0];
    assert_eq!(first.state, BatchState::FatalFailure);
    assert!(first.state.is_terminal());
    assert_eq!(first.attempts, 1);
    assert!(first.error.as_deref().unwrap().contains("cancelled before retry"));
    assert_eq!(report.batches[1].attempts, 0);

    let summary = h.ctx.metrics.snapshot();
    assert_eq!(report.failed(), 1);
    assert_eq!(summary.models["m1"].failed, report.failed() as u64);
    assert_eq!(summary.models["m1"].not_sent, report.not_sent() as u64);
    assert_eq!(summary.models["m1"].retries, 0);
}

#[tokio::test]
async fn planned_model_without_connector_is_reported_not_sent() {
    let h = Harness::new();
    let dispatcher = h.dispatcher(Vec::new(), config(0));
    let report = dispatcher.run(&batches("ghost", &["a"], 1)).await;
    assert_eq!(report.not_sent(), 1);
    assert_eq!(report.batches[0].state, BatchState::Pending);
    assert_eq!(h.ctx.metrics.snapshot().models["ghost"].not_sent, 1);
}
