use std::time::Duration;

use plotbot_harness::connector::{ChatCompletionsConnector, Connector, DispatchRequest, ReplyStatus};
use plotbot_harness::endpoints::{chat_url, discover_models, resolve_endpoints};
use plotbot_harness::{Item, RunConfig};
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn request(model: &str) -> DispatchRequest {
    let items = vec![Item::new("a", "Alpha"), Item::new("b", "Beta")];
    DispatchRequest {
        model: model.to_string(),
        prompt_hash: "h".into(),
        prompt_text: "### HEADLINES\n1. [a] Alpha\n2. [b] Beta".into(),
        items,
        reminder: None,
        attempt: 0,
    }
}

fn completion(content: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "choices": [{ "message": { "role": "assistant", "content": content } }]
    }))
}

async fn connector_for(server: &MockServer, model: &str) -> ChatCompletionsConnector {
    ChatCompletionsConnector::new(model, chat_url(&server.uri()), Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn fenced_array_is_parsed_into_objects() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({
            "model": "qwen-7b",
            "stream": false,
            "messages": [{ "role": "system" }, { "role": "user" }]
        })))
        .respond_with(completion(
            "Sure!\n```json\n[{\"id\": \"a\", \"summary\": \"x\"}, {\"id\": \"b\", \"summary\": \"y\",}]\n```",
        ))
        .expect(1)
        .mount(&server)
        .await;

    let connector = connector_for(&server, "qwen-7b").await;
    assert_eq!(connector.model(), "qwen-7b");
    let reply = connector.send(&request("qwen-7b")).await;
    match reply.status {
        ReplyStatus::Ok(values) => {
            assert_eq!(values.len(), 2);
            assert_eq!(values[1]["summary"], json!("y"));
        }
        other => panic!("expected Ok, got {other:?}"),
    }
}

#[tokio::test]
async fn missing_model_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": { "message": "model not found: ghost" }
        })))
        .mount(&server)
        .await;

    let reply = connector_for(&server, "ghost").await.send(&request("ghost")).await;
    assert!(matches!(reply.status, ReplyStatus::Fatal(ref m) if m.contains("ghost")));
}

#[tokio::test]
async fn bad_request_mentioning_model_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": { "message": "The model `ghost` does not exist" }
        })))
        .mount(&server)
        .await;

    let reply = connector_for(&server, "ghost").await.send(&request("ghost")).await;
    assert!(matches!(reply.status, ReplyStatus::Fatal(_)));
}

#[tokio::test]
async fn server_error_is_a_transport_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&server)
        .await;

    let reply = connector_for(&server, "m").await.send(&request("m")).await;
    assert!(matches!(reply.status, ReplyStatus::TransportError(ref m) if m.contains("503")));
}

#[tokio::test]
async fn prose_answer_is_a_schema_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(completion("I'm sorry, I can't summarise these headlines."))
        .mount(&server)
        .await;

    let reply = connector_for(&server, "m").await.send(&request("m")).await;
    assert!(matches!(reply.status, ReplyStatus::SchemaError(_)));
}

#[tokio::test]
async fn oversized_body_is_a_schema_error() {
    let server = MockServer::start().await;
    let huge = "x".repeat(1_100_000);
    Mock::given(method("POST"))
        .respond_with(completion(&huge))
        .mount(&server)
        .await;

    let reply = connector_for(&server, "m").await.send(&request("m")).await;
    assert!(matches!(reply.status, ReplyStatus::SchemaError(ref m) if m.contains("too")));
}

#[tokio::test]
async fn envelope_without_choices_is_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "choices": [] })))
        .mount(&server)
        .await;

    let reply = connector_for(&server, "m").await.send(&request("m")).await;
    assert!(matches!(reply.status, ReplyStatus::TransportError(_)));
}

#[tokio::test]
async fn slow_endpoint_times_out_as_transport_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(completion("[]").set_delay(Duration::from_secs(3)))
        .mount(&server)
        .await;

    let connector =
        ChatCompletionsConnector::new("m", chat_url(&server.uri()), Duration::from_millis(200))
            .unwrap();
    let reply = connector.send(&request("m")).await;
    assert!(matches!(reply.status, ReplyStatus::TransportError(_)));
    assert!(reply.elapsed < Duration::from_secs(3));
}

#[tokio::test]
async fn reminder_is_appended_to_user_message() {
    let server = MockServer::start().await;
    let mut req = request("m");
    req.reminder = Some("JSON only.".into());
    Mock::given(method("POST"))
        .and(body_partial_json(json!({
            "messages": [{}, { "role": "user", "content": req.user_content() }]
        })))
        .respond_with(completion("[{\"id\": \"a\"}]"))
        .expect(1)
        .mount(&server)
        .await;

    let reply = connector_for(&server, "m").await.send(&req).await;
    assert!(matches!(reply.status, ReplyStatus::Ok(_)));
    assert!(req.user_content().ends_with("JSON only."));
}

#[tokio::test]
async fn models_are_discovered_and_blocklist_applied() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                { "id": "qwen-7b" },
                { "id": "text-embedding-nomic" },
                { "id": "llama-3-8b" }
            ]
        })))
        .mount(&server)
        .await;

    let discovered = discover_models(&format!("{}/v1/", server.uri())).await.unwrap();
    assert_eq!(discovered.len(), 3);

    let config = RunConfig::from_json(json!({
        "GENERATED_DIR": "generated",
        "LLM_BASE_URL": server.uri(),
        "LLM_BLOCKLIST": ["TEXT-EMBEDDING-NOMIC"],
    }))
    .unwrap();
    let endpoints = resolve_endpoints(&config).await;
    let models: Vec<&str> = endpoints.keys().map(String::as_str).collect();
    assert_eq!(models, vec!["llama-3-8b", "qwen-7b"]);
    assert_eq!(endpoints["qwen-7b"], chat_url(&server.uri()));
}

#[tokio::test]
async fn explicit_endpoints_skip_discovery() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let config = RunConfig::from_json(json!({
        "LLM_BASE_URL": server.uri(),
        "LLM_ENDPOINTS": { "remote": "http://example.invalid/v1/chat/completions" },
        "LLM_MODELS": ["ignored"],
    }))
    .unwrap();
    let endpoints = resolve_endpoints(&config).await;
    assert_eq!(endpoints.len(), 1);
    assert!(endpoints.contains_key("remote"));
}

#[tokio::test]
async fn failed_discovery_resolves_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let config = RunConfig::from_json(json!({ "LLM_BASE_URL": server.uri() })).unwrap();
    assert!(resolve_endpoints(&config).await.is_empty());
}
