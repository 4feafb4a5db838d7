//! End-to-end runs through the process sandbox, using the native fixture
//! script host built alongside the crate.

use serde_json::{Value, json};
use std::collections::HashMap;
use std::time::Duration;
use w3f_runtime::sandbox::default_factory;
use w3f_runtime::types::{ChainArgs, RunnerOptions, StorageMap};
use w3f_runtime::{
    Payload, Runner, RunnerResult, RuntimeConfig, StorageState, Web3FunctionContextData,
    Web3FunctionResult,
};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

const FIXTURE: &str = env!("CARGO_BIN_EXE_w3f-fixture-script");

fn config() -> RuntimeConfig {
    RuntimeConfig {
        connect_timeout: Duration::from_secs(10),
        ..RuntimeConfig::default()
    }
}

fn payload(scenario: &str) -> Payload {
    let mut user_args = serde_json::Map::new();
    user_args.insert("scenario".into(), json!(scenario));
    Payload {
        script: FIXTURE.into(),
        version: "2.0.0".into(),
        context: Web3FunctionContextData {
            chain_args: ChainArgs {
                chain_id: 5,
                ..Default::default()
            },
            user_args,
            ..Default::default()
        },
        options: RunnerOptions {
            timeout: 10_000,
            ..RunnerOptions::default()
        },
        multi_chain_provider_config: HashMap::new(),
    }
}

async fn run(payload: Payload) -> RunnerResult {
    let config = config();
    Runner::new(config.clone(), default_factory(config))
        .run(payload)
        .await
}

fn message(result: &RunnerResult) -> String {
    match &result.result {
        Some(Web3FunctionResult::CannotExec { message }) => message.clone().unwrap_or_default(),
        other => panic!("expected canExec=false, got {other:?} / {:?}", result.error),
    }
}

fn error(result: &RunnerResult) -> (String, String) {
    assert!(!result.success, "expected failure, got {:?}", result.result);
    let error = result.error.clone().expect("failure carries an error");
    (error.name, error.message)
}

async fn rpc_upstream() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0", "id": 1, "result": "0x10"
        })))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn simple_scenario_succeeds() {
    let result = run(payload("simple")).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(message(&result), "Simple");
    assert!(result.logs.iter().any(|l| l.contains("running scenario simple")));
    assert!(result.duration > 0.0);
    assert!(!result.throttled.any());

    let json: Value = serde_json::to_value(&result).unwrap();
    assert_eq!(json["result"]["canExec"], false);
    assert_eq!(json["storage"]["state"], "last");
    assert!(json["storage"]["data"].is_object());
    assert!(json["storage"].get("storage").is_none());
}

#[tokio::test]
async fn invalid_address_fails_validation() {
    let (name, message) = error(&run(payload("invalid-address")).await);
    assert_eq!(name, "ResultShapeError");
    assert!(message.contains("invalid to address"), "{message}");
}

#[tokio::test]
async fn early_exit_without_result() {
    let (_, message) = error(&run(payload("exit-early")).await);
    assert!(message.contains("exited without returning result"), "{message}");
}

#[tokio::test]
async fn abnormal_exit_reports_code() {
    let (name, message) = error(&run(payload("crash")).await);
    assert_eq!(name, "CrashError");
    assert!(message.contains("code=3"), "{message}");
}

#[tokio::test]
async fn script_error_is_reported() {
    let (name, message) = error(&run(payload("error")).await);
    assert_eq!(name, "Web3FunctionError");
    assert_eq!(message, "Fixture script failed");
}

#[tokio::test]
async fn timeout_names_configured_duration() {
    let mut payload = payload("timeout");
    payload.options.timeout = 1_000;
    let result = run(payload).await;
    let (_, message) = error(&result);
    assert!(message.contains("execution timeout (1s)"), "{message}");
    assert!(result.throttled.duration);
}

#[tokio::test]
async fn storage_is_round_tripped() {
    let mut payload = payload("storage");
    payload.context.storage = StorageMap::from([("count".to_string(), Some("41".to_string()))]);
    let result = run(payload).await;

    assert_eq!(message(&result), "count=42");
    let storage = result.storage.unwrap();
    assert_eq!(storage.state, StorageState::Updated);
    assert_eq!(storage.data["count"].as_deref(), Some("42"));
}

#[tokio::test]
async fn rpc_calls_go_through_provider() {
    let upstream = rpc_upstream().await;
    let mut payload = payload("rpc");
    payload.multi_chain_provider_config.insert(5, upstream.uri());
    let result = run(payload).await;

    assert_eq!(message(&result), "block=16");
    assert_eq!(result.rpc_calls.total, 1);
    assert_eq!(result.rpc_calls.throttled, 0);
}

#[tokio::test]
async fn rpc_limit_stops_the_script() {
    let upstream = rpc_upstream().await;
    let mut payload = payload("rpc-limit");
    payload.options.rpc_limit = 2;
    payload.multi_chain_provider_config.insert(5, upstream.uri());
    let result = run(payload).await;

    let (name, message) = error(&result);
    assert_eq!(name, "QuotaError");
    assert!(message.contains("RPC requests limit exceeded"), "{message}");
    assert_eq!(result.rpc_calls.total, 3);
    assert_eq!(result.rpc_calls.throttled, 1);
    assert!(result.throttled.rpc_request);
}

#[tokio::test]
async fn http_requests_are_metered() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
        .mount(&upstream)
        .await;

    let mut payload = payload("http");
    payload
        .context
        .user_args
        .insert("url".into(), json!(upstream.uri()));
    let result = run(payload).await;

    assert_eq!(message(&result), "hello");
    assert_eq!(result.network.nb_requests, 1);
    assert_eq!(result.network.nb_throttled, 0);
    assert!(result.network.download > 0.0);
}

#[tokio::test]
async fn blacklisted_hosts_are_refused() {
    let upstream = MockServer::start().await;
    let mut payload = payload("http");
    payload
        .context
        .user_args
        .insert("url".into(), json!(upstream.uri()));
    payload.options.blacklisted_hosts = vec!["127.0.0.1".into()];
    let result = run(payload).await;

    assert!(message(&result).contains("blacklisted"));
    assert_eq!(result.network.nb_requests, 0);
}

#[tokio::test]
async fn memory_ceiling_is_enforced() {
    let mut payload = payload("memory");
    payload.options.memory = 64;
    payload.options.timeout = 30_000;
    let result = run(payload).await;

    let (name, message) = error(&result);
    assert_eq!(name, "QuotaError");
    assert!(message.contains("Memory limit exceeded (64 MB)"), "{message}");
    assert!(result.throttled.memory);
    assert!(result.memory > 64.0);
}
