use once_cell::sync::OnceCell;
use reqwest::{Client, StatusCode, Url};
use serde_json::{Value, json};
use std::time::Duration;

use crate::error::{Result, RuntimeError};

pub const JSONRPC_PARSE_ERROR: i64 = -32700;
pub const JSONRPC_INVALID_REQUEST: i64 = -32600;
pub const JSONRPC_INTERNAL_ERROR: i64 = -32603;
pub const JSONRPC_LIMIT_EXCEEDED: i64 = -32005;

static LOOPBACK_CLIENT: OnceCell<Client> = OnceCell::new();
static UPSTREAM_CLIENT: OnceCell<Client> = OnceCell::new();

/// Client for talking to sandboxes on loopback. Ignores proxy environment
/// variables so bridge traffic is never routed through a script's proxy.
pub fn loopback_client() -> Result<&'static Client> {
    LOOPBACK_CLIENT.get_or_try_init(|| {
        Client::builder()
            .no_proxy()
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|err| RuntimeError::Http(format!("Failed to build HTTP client: {err}")))
    })
}

/// Client used by the RPC provider and HTTP proxy to reach upstreams.
pub fn upstream_client() -> Result<&'static Client> {
    UPSTREAM_CLIENT.get_or_try_init(|| {
        Client::builder()
            .no_proxy()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| RuntimeError::Http(format!("Failed to build HTTP client: {err}")))
    })
}

pub fn build_url(base: &str, path: &str) -> Result<Url> {
    let base_url =
        Url::parse(base).map_err(|err| RuntimeError::Http(format!("Invalid base URL: {err}")))?;
    base_url
        .join(path)
        .map_err(|err| RuntimeError::Http(format!("Invalid path '{path}': {err}")))
}

/// POST a JSON body and parse the JSON reply, regardless of HTTP status.
pub async fn post_json(client: &Client, url: &str, body: &Value) -> Result<(StatusCode, Value)> {
    let response = client
        .post(url)
        .json(body)
        .send()
        .await
        .map_err(|err| RuntimeError::Http(format!("HTTP request failed: {err}")))?;
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|err| RuntimeError::Http(format!("Failed to read response body: {err}")))?;
    let value = serde_json::from_str(&text).map_err(|err| {
        RuntimeError::Http(format!("HTTP {status}: invalid JSON response ({err}): {text}"))
    })?;
    Ok((status, value))
}

/// JSON-RPC 2.0 error envelope.
pub fn rpc_error(id: Value, code: i64, message: impl Into<String>) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message.into() },
    })
}

/// JSON-RPC 2.0 success envelope.
pub fn rpc_result(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}
