//! Script-side entrypoint.
//!
//! A script host wraps its handler in a [`Web3FunctionHost`] and calls
//! [`Web3FunctionHost::serve_from_env`]. The host answers exactly one
//! `start` event on the bridge and the process exits right after.
//!
//! ```no_run
//! use w3f_runtime::sdk::Web3FunctionHost;
//! use serde_json::json;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     Web3FunctionHost::new(|ctx| async move {
//!         let last = ctx.storage().get("lastRun");
//!         ctx.storage().set("lastRun", "1");
//!         Ok(json!({ "canExec": false, "message": format!("last={last:?}") }))
//!     })
//!     .serve_from_env()
//!     .await;
//! }
//! ```

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::{Map, Value, json};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::bridge::{BridgeServer, EventHandler};
use crate::error::{Result, RuntimeError};
use crate::events::{Event, StorageReply, StorageState, storage_size_kb};
use crate::http::JSONRPC_LIMIT_EXCEEDED;
use crate::types::{ChainArgs, ErrorPayload, StorageMap, Web3FunctionContextData};
use crate::{ENV_MOUNT_PATH, ENV_SERVER_HOST, ENV_SERVER_PORT, RPC_LIMIT_EXIT_CODE};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

pub type HandlerResult = std::result::Result<Value, String>;
pub type Handler =
    Arc<dyn Fn(Web3FunctionContext) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Read-only secrets.
#[derive(Clone, Debug, Default)]
pub struct Secrets {
    values: Arc<StorageMap>,
}

impl Secrets {
    pub fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned().flatten()
    }
}

/// Read/write string storage persisted between invocations by the caller.
#[derive(Clone, Debug, Default)]
pub struct Storage {
    values: Arc<Mutex<StorageMap>>,
}

impl Storage {
    fn new(values: StorageMap) -> Self {
        Self {
            values: Arc::new(Mutex::new(values)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StorageMap> {
        self.values
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.lock().get(key).cloned().flatten()
    }

    pub fn set(&self, key: &str, value: impl Into<String>) {
        self.lock().insert(key.to_string(), Some(value.into()));
    }

    /// Marks the key as unset. The key stays in the map with no value so the
    /// caller learns about the deletion.
    pub fn delete(&self, key: &str) {
        if let Some(value) = self.lock().get_mut(key) {
            *value = None;
        }
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .lock()
            .iter()
            .filter(|(_, v)| v.is_some())
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn size_kb(&self) -> f64 {
        storage_size_kb(&self.lock())
    }

    pub fn snapshot(&self) -> StorageMap {
        self.lock().clone()
    }
}

/// JSON-RPC error returned by the provider.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rpc error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

impl From<RpcError> for String {
    fn from(err: RpcError) -> Self {
        err.to_string()
    }
}

/// JSON-RPC client bound to the invocation's provider proxy.
#[derive(Clone)]
pub struct RpcProvider {
    url: String,
    client: reqwest::Client,
    next_id: Arc<AtomicU64>,
    limit_hit: Arc<AtomicBool>,
}

impl RpcProvider {
    fn new(url: String, limit_hit: Arc<AtomicBool>) -> std::result::Result<Self, String> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .map_err(|err| format!("Failed to build HTTP client: {err}"))?;
        Ok(Self {
            url,
            client,
            next_id: Arc::new(AtomicU64::new(1)),
            limit_hit,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Provider for another chain configured for this invocation.
    pub fn for_chain(&self, chain_id: u64) -> RpcProvider {
        Self {
            url: format!("{}/{chain_id}", self.url.trim_end_matches('/')),
            client: self.client.clone(),
            next_id: self.next_id.clone(),
            limit_hit: self.limit_hit.clone(),
        }
    }

    pub async fn request(
        &self,
        method: &str,
        params: Value,
    ) -> std::result::Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|err| RpcError {
                code: crate::http::JSONRPC_INTERNAL_ERROR,
                message: format!("provider unreachable: {err}"),
            })?;
        let mut reply: Value = response.json().await.map_err(|err| RpcError {
            code: crate::http::JSONRPC_PARSE_ERROR,
            message: format!("invalid provider reply: {err}"),
        })?;

        if let Some(error) = reply.get("error") {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(-32603);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            if code == JSONRPC_LIMIT_EXCEEDED {
                self.limit_hit.store(true, Ordering::SeqCst);
            }
            return Err(RpcError { code, message });
        }
        Ok(reply.get_mut("result").map(Value::take).unwrap_or(Value::Null))
    }

    pub async fn chain_id(&self) -> std::result::Result<u64, RpcError> {
        let value = self.request("eth_chainId", json!([])).await?;
        parse_quantity(&value)
    }

    pub async fn block_number(&self) -> std::result::Result<u64, RpcError> {
        let value = self.request("eth_blockNumber", json!([])).await?;
        parse_quantity(&value)
    }
}

fn parse_quantity(value: &Value) -> std::result::Result<u64, RpcError> {
    value
        .as_str()
        .and_then(|s| u64::from_str_radix(s.trim_start_matches("0x"), 16).ok())
        .ok_or_else(|| RpcError {
            code: crate::http::JSONRPC_INTERNAL_ERROR,
            message: format!("invalid quantity: {value}"),
        })
}

struct ContextInner {
    chain_args: ChainArgs,
    user_args: Map<String, Value>,
    secrets: Secrets,
    storage: Storage,
    provider: Option<RpcProvider>,
    http_client: reqwest::Client,
}

/// What a handler sees during one invocation.
#[derive(Clone)]
pub struct Web3FunctionContext {
    inner: Arc<ContextInner>,
}

impl Web3FunctionContext {
    fn new(
        data: Web3FunctionContextData,
        proxy_url: Option<&str>,
        limit_hit: Arc<AtomicBool>,
    ) -> std::result::Result<Self, String> {
        let provider = match data.rpc_provider_url {
            Some(url) => Some(RpcProvider::new(url, limit_hit)?),
            None => None,
        };

        let mut builder = reqwest::Client::builder().no_proxy();
        if let Some(proxy_url) = proxy_url {
            let proxy = reqwest::Proxy::all(proxy_url)
                .map_err(|err| format!("invalid proxy url {proxy_url}: {err}"))?;
            builder = builder.proxy(proxy);
        }
        let http_client = builder
            .build()
            .map_err(|err| format!("Failed to build HTTP client: {err}"))?;

        Ok(Self {
            inner: Arc::new(ContextInner {
                chain_args: data.chain_args,
                user_args: data.user_args,
                secrets: Secrets {
                    values: Arc::new(data.secrets),
                },
                storage: Storage::new(data.storage),
                provider,
                http_client,
            }),
        })
    }

    pub fn chain_args(&self) -> &ChainArgs {
        &self.inner.chain_args
    }

    pub fn user_args(&self) -> &Map<String, Value> {
        &self.inner.user_args
    }

    pub fn secrets(&self) -> &Secrets {
        &self.inner.secrets
    }

    pub fn storage(&self) -> &Storage {
        &self.inner.storage
    }

    pub fn provider(&self) -> std::result::Result<&RpcProvider, String> {
        self.inner
            .provider
            .as_ref()
            .ok_or_else(|| "no rpc provider configured".to_string())
    }

    /// HTTP client routed through the invocation's metered proxy.
    pub fn http_client(&self) -> &reqwest::Client {
        &self.inner.http_client
    }
}

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

/// Where and how to serve the bridge.
#[derive(Clone, Debug)]
pub struct ServeOptions {
    pub host: String,
    pub port: u16,
    pub mount_path: String,
    pub proxy_url: Option<String>,
}

impl ServeOptions {
    pub fn from_env() -> Result<Self> {
        let port = std::env::var(ENV_SERVER_PORT)
            .map_err(|_| RuntimeError::Validation(format!("{ENV_SERVER_PORT} is not set")))?
            .parse::<u16>()
            .map_err(|err| RuntimeError::Validation(format!("invalid {ENV_SERVER_PORT}: {err}")))?;
        let mount_path = std::env::var(ENV_MOUNT_PATH)
            .map_err(|_| RuntimeError::Validation(format!("{ENV_MOUNT_PATH} is not set")))?;
        let host = std::env::var(ENV_SERVER_HOST).unwrap_or_else(|_| "127.0.0.1".to_string());
        let proxy_url = std::env::var("HTTP_PROXY")
            .or_else(|_| std::env::var("http_proxy"))
            .ok()
            .filter(|v| !v.is_empty());
        Ok(Self {
            host,
            port,
            mount_path,
            proxy_url,
        })
    }
}

/// How a served exchange ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServeOutcome {
    pub rpc_limit_hit: bool,
}

impl ServeOutcome {
    pub fn exit_code(&self) -> i32 {
        if self.rpc_limit_hit {
            RPC_LIMIT_EXIT_CODE
        } else {
            0
        }
    }
}

/// A script handler ready to be served over the bridge.
#[derive(Clone)]
pub struct Web3FunctionHost {
    handler: Handler,
}

impl Web3FunctionHost {
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(Web3FunctionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Self {
            handler: Arc::new(move |ctx: Web3FunctionContext| -> BoxFuture<'static, HandlerResult> {
                Box::pin(handler(ctx))
            }),
        }
    }

    /// Wrap the handler as a bridge event handler. The returned flag flips
    /// once the provider reports the RPC limit; from then on the host declines
    /// to reply.
    pub fn event_handler(&self, proxy_url: Option<String>) -> (EventHandler, Arc<AtomicBool>) {
        let limit_hit = Arc::new(AtomicBool::new(false));
        let handler = self.handler.clone();
        let flag = limit_hit.clone();
        let event_handler: EventHandler =
            Arc::new(move |event: Event| -> BoxFuture<'static, Option<Event>> {
                Box::pin(handle_event(handler.clone(), proxy_url.clone(), flag.clone(), event))
            });
        (event_handler, limit_hit)
    }

    /// Serve one exchange and shut the server down.
    pub async fn serve(&self, options: ServeOptions) -> Result<ServeOutcome> {
        let (handler, limit_hit) = self.event_handler(options.proxy_url.clone());
        let server =
            BridgeServer::bind(&options.host, options.port, &options.mount_path, handler).await?;
        server.wait_for_exchange().await;

        let outcome = ServeOutcome {
            rpc_limit_hit: limit_hit.load(Ordering::SeqCst),
        };
        if outcome.rpc_limit_hit {
            drop(server);
        } else {
            server.shutdown(SHUTDOWN_GRACE).await;
        }
        Ok(outcome)
    }

    /// Serve using the sandbox-provided environment, then exit the process:
    /// 0 after replying, 250 when the RPC limit was hit.
    pub async fn serve_from_env(self) {
        let code = match ServeOptions::from_env() {
            Ok(options) => match self.serve(options).await {
                Ok(outcome) => outcome.exit_code(),
                Err(err) => {
                    eprintln!("web3 function host failed: {err}");
                    1
                }
            },
            Err(err) => {
                eprintln!("web3 function host misconfigured: {err}");
                1
            }
        };
        std::process::exit(code)
    }
}


/// Run the handler for one `start` event. `None` means the RPC limit was hit
/// and no reply must be sent.
async fn handle_event(
    handler: Handler,
    proxy_url: Option<String>,
    limit_hit: Arc<AtomicBool>,
    event: Event,
) -> Option<Event> {
    let Event::Start { context } = event else {
        return Some(error_event(
            "ProtocolError",
            "expected start event".into(),
            StorageReply {
                state: StorageState::Last,
                storage: StorageMap::new(),
            },
        ));
    };
    let before = context.storage.clone();
    let ctx = match Web3FunctionContext::new(context, proxy_url.as_deref(), limit_hit.clone()) {
        Ok(ctx) => ctx,
        Err(message) => {
            return Some(error_event(
                "Web3FunctionError",
                message,
                StorageReply::diff(&before, before.clone()),
            ));
        }
    };

    let outcome = AssertUnwindSafe(handler(ctx.clone())).catch_unwind().await;
    if limit_hit.load(Ordering::SeqCst) {
        return None;
    }
    let storage = StorageReply::diff(&before, ctx.storage().snapshot());
    Some(match outcome {
        Ok(Ok(result)) => Event::Result { result, storage },
        Ok(Err(message)) => error_event("Web3FunctionError", message, storage),
        Err(panic) => error_event("Web3FunctionError", panic_message(&panic), storage),
    })
}

fn error_event(name: &str, message: String, storage: StorageReply) -> Event {
    Event::Error {
        error: ErrorPayload {
            name: name.to_string(),
            message,
        },
        storage,
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "handler panicked".to_string()
    }
}
