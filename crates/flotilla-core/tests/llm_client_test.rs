//! LLM client integration tests against mock OpenAI-compatible servers.

use std::time::Duration;

use flotilla_core::llm::{
    ChatMessage, CompletionOverrides, EndpointConfig, LlmClient, LlmError, LlmParams,
};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn endpoint(name: &str, uri: &str, weight: f64) -> EndpointConfig {
    EndpointConfig {
        name: name.to_string(),
        endpoint: uri.to_string(),
        api_key: None,
        weight,
    }
}

fn params() -> LlmParams {
    LlmParams {
        model: "test-model".to_string(),
        max_tokens: 256,
        temperature: 0.1,
        request_timeout: Duration::from_secs(5),
        probe_interval: Duration::from_secs(30),
    }
}

fn completion_body(content: &str) -> serde_json::Value {
    json!({
        "choices": [{
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 12, "completion_tokens": 34, "total_tokens": 46}
    })
}

async fn mock_completions(server: &MockServer, status: u16, body: Option<serde_json::Value>) {
    let template = match body {
        Some(body) => ResponseTemplate::new(status).set_body_json(body),
        None => ResponseTemplate::new(status),
    };
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(template)
        .mount(server)
        .await;
}

fn messages() -> Vec<ChatMessage> {
    vec![
        ChatMessage::system("you are terse"),
        ChatMessage::user("say hi"),
    ]
}

#[tokio::test]
async fn completion_parses_content_and_usage() {
    let server = MockServer::start().await;
    mock_completions(&server, 200, Some(completion_body("hi there"))).await;

    let client = LlmClient::new(vec![endpoint("only", &server.uri(), 1.0)], params()).unwrap();
    let completion = client
        .complete(&messages(), CompletionOverrides::default())
        .await
        .unwrap();

    assert_eq!(completion.content, "hi there");
    assert_eq!(completion.finish_reason, "stop");
    assert_eq!(completion.usage.total_tokens, 46);
    assert_eq!(completion.endpoint, "only");
}

#[tokio::test]
async fn failover_uses_backup_when_primary_errors() {
    let primary = MockServer::start().await;
    let backup = MockServer::start().await;
    mock_completions(&primary, 503, None).await;
    mock_completions(&backup, 200, Some(completion_body("from backup"))).await;

    // The weight skew makes the healthy primary the first pick.
    let client = LlmClient::new(
        vec![
            endpoint("primary", &primary.uri(), 1_000_000.0),
            endpoint("backup", &backup.uri(), 1.0),
        ],
        params(),
    )
    .unwrap();

    // Every call fails over to the backup; the primary accrues failures.
    for _ in 0..3 {
        let completion = client
            .complete(&messages(), CompletionOverrides::default())
            .await
            .unwrap();
        assert_eq!(completion.endpoint, "backup");
        assert_eq!(completion.content, "from backup");
    }

    // Three consecutive failures mark the primary unhealthy.
    let health = client.endpoint_health();
    let primary_health = health.iter().find(|(name, _, _)| name == "primary").unwrap();
    assert!(!primary_health.1, "primary should be unhealthy");

    // Subsequent calls skip the primary entirely.
    let requests_before = primary.received_requests().await.unwrap().len();
    client
        .complete(&messages(), CompletionOverrides::default())
        .await
        .unwrap();
    let requests_after = primary.received_requests().await.unwrap().len();
    assert_eq!(requests_before, requests_after);
}

#[tokio::test]
async fn unhealthy_endpoint_gets_probed_after_interval() {
    let primary = MockServer::start().await;
    let backup = MockServer::start().await;
    mock_completions(&primary, 503, None).await;
    mock_completions(&backup, 200, Some(completion_body("ok"))).await;

    // Zero probe interval: the parked endpoint revives on the next call.
    let test_params = LlmParams {
        probe_interval: Duration::ZERO,
        ..params()
    };
    let client = LlmClient::new(
        vec![
            endpoint("primary", &primary.uri(), 1_000_000.0),
            endpoint("backup", &backup.uri(), 1.0),
        ],
        test_params,
    )
    .unwrap();

    for _ in 0..3 {
        client
            .complete(&messages(), CompletionOverrides::default())
            .await
            .unwrap();
    }
    let requests_before = primary.received_requests().await.unwrap().len();
    assert_eq!(requests_before, 3);

    // The probe gives the primary one more trial request.
    client
        .complete(&messages(), CompletionOverrides::default())
        .await
        .unwrap();
    let requests_after = primary.received_requests().await.unwrap().len();
    assert_eq!(requests_after, 4);
}

#[tokio::test]
async fn all_endpoints_failing_aggregates_errors() {
    let a = MockServer::start().await;
    let b = MockServer::start().await;
    mock_completions(&a, 500, None).await;
    mock_completions(&b, 503, None).await;

    let client = LlmClient::new(
        vec![endpoint("a", &a.uri(), 1.0), endpoint("b", &b.uri(), 1.0)],
        params(),
    )
    .unwrap();

    let err = client
        .complete(&messages(), CompletionOverrides::default())
        .await
        .unwrap_err();

    match err {
        LlmError::AllEndpointsFailed { count, details } => {
            assert_eq!(count, 2);
            assert!(details.contains("a:"), "details: {details}");
            assert!(details.contains("b:"), "details: {details}");
        }
        other => panic!("expected AllEndpointsFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn readiness_probe_finds_responding_endpoint() {
    let dead = MockServer::start().await;
    let live = MockServer::start().await;
    // The dead endpoint 404s everything (no mock mounted); the live one
    // serves the models listing.
    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
        .mount(&live)
        .await;

    let client = LlmClient::new(
        vec![
            endpoint("dead", &dead.uri(), 1.0),
            endpoint("live", &live.uri(), 1.0),
        ],
        params(),
    )
    .unwrap();

    let ready = client.wait_ready(Duration::from_secs(10)).await.unwrap();
    assert_eq!(ready, "live");
}

#[tokio::test]
async fn readiness_probe_times_out_when_nothing_answers() {
    let dead = MockServer::start().await;
    let client =
        LlmClient::new(vec![endpoint("dead", &dead.uri(), 1.0)], params()).unwrap();

    let err = client.wait_ready(Duration::from_millis(100)).await.unwrap_err();
    assert!(matches!(err, LlmError::ProbeTimeout(_)));
}

#[tokio::test]
async fn missing_usage_defaults_to_zero() {
    let server = MockServer::start().await;
    mock_completions(
        &server,
        200,
        Some(json!({
            "choices": [{"message": {"content": "bare"}, "finish_reason": "length"}]
        })),
    )
    .await;

    let client = LlmClient::new(vec![endpoint("only", &server.uri(), 1.0)], params()).unwrap();
    let completion = client
        .complete(&messages(), CompletionOverrides::default())
        .await
        .unwrap();

    assert_eq!(completion.content, "bare");
    assert_eq!(completion.finish_reason, "length");
    assert_eq!(completion.usage.prompt_tokens, 0);
    assert_eq!(completion.usage.total_tokens, 0);
}
