//! Per-invocation JSON-RPC reverse proxy.
//!
//! Scripts talk to chain nodes only through this proxy. It counts every
//! non-whitelisted call against the invocation's RPC ceiling, routes by chain
//! id, and normalizes upstream errors into plain `{code, message}` objects.

use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::routing::post;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use crate::error::{Result, RuntimeError};
use crate::http::{
    JSONRPC_INTERNAL_ERROR, JSONRPC_INVALID_REQUEST, JSONRPC_LIMIT_EXCEEDED, JSONRPC_PARSE_ERROR,
    post_json, rpc_error, rpc_result, upstream_client,
};
use crate::types::RpcCallStats;

/// Methods that never count against the ceiling.
const WHITELISTED_METHODS: [&str; 2] = ["eth_chainId", "net_version"];

#[derive(Clone, Debug)]
pub struct ProviderConfig {
    pub main_chain_id: u64,
    pub rpc_limit: u64,
    /// Upstream node URL per chain id.
    pub upstreams: HashMap<u64, String>,
    pub bind_ip: IpAddr,
    /// Host the sandbox uses to reach this proxy.
    pub public_host: String,
}

struct ProviderState {
    main_chain_id: u64,
    rpc_limit: u64,
    upstreams: HashMap<u64, String>,
    calls: AtomicU64,
}

pub struct ProxyProvider {
    state: Arc<ProviderState>,
    bind_ip: IpAddr,
    public_host: String,
    mount_path: String,
    addr: Mutex<Option<SocketAddr>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ProxyProvider {
    pub fn new(config: ProviderConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            state: Arc::new(ProviderState {
                main_chain_id: config.main_chain_id,
                rpc_limit: config.rpc_limit,
                upstreams: config.upstreams,
                calls: AtomicU64::new(0),
            }),
            bind_ip: config.bind_ip,
            public_host: config.public_host,
            mount_path: uuid::Uuid::new_v4().simple().to_string(),
            addr: Mutex::new(None),
            shutdown,
            task: Mutex::new(None),
        }
    }

    pub fn mount_path(&self) -> &str {
        &self.mount_path
    }

    fn router(&self) -> Router {
        Router::new()
            .route(&format!("/{}", self.mount_path), post(main_chain))
            .route(&format!("/{}/{{chain_id}}", self.mount_path), post(other_chain))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    pub async fn start(&self, port: u16) -> Result<SocketAddr> {
        let listener = TcpListener::bind((self.bind_ip, port)).await.map_err(|err| {
            RuntimeError::Startup(format!("rpc provider failed to bind port {port}: {err}"))
        })?;
        let addr = listener.local_addr()?;
        let router = self.router();
        let mut shutdown = self.shutdown.subscribe();

        let task = tokio::spawn(async move {
            let signal = async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            };
            if let Err(err) = axum::serve(listener, router)
                .with_graceful_shutdown(signal)
                .await
            {
                tracing::error!("RPC provider error: {err}");
            }
        });

        *lock(&self.addr) = Some(addr);
        *lock(&self.task) = Some(task);
        tracing::debug!(%addr, "RPC provider listening");
        Ok(addr)
    }

    /// URL the sandboxed script uses for the main chain. Append `/{chainId}`
    /// for the others.
    pub fn proxy_url(&self) -> Option<String> {
        lock(&self.addr).map(|addr| {
            format!("http://{}:{}/{}", self.public_host, addr.port(), self.mount_path)
        })
    }

    pub fn nb_rpc_calls(&self) -> RpcCallStats {
        let total = self.state.calls.load(Ordering::SeqCst);
        RpcCallStats {
            total,
            throttled: total.saturating_sub(self.state.rpc_limit),
        }
    }

    /// Idempotent.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }
}

impl Drop for ProxyProvider {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn main_chain(State(state): State<Arc<ProviderState>>, body: Bytes) -> Json<Value> {
    let chain_id = state.main_chain_id;
    Json(state.handle_body(Some(chain_id), &chain_id.to_string(), &body).await)
}

async fn other_chain(
    State(state): State<Arc<ProviderState>>,
    Path(chain_id): Path<String>,
    body: Bytes,
) -> Json<Value> {
    let id = chain_id.parse::<u64>().ok();
    Json(state.handle_body(id, &chain_id, &body).await)
}

impl ProviderState {
    /// `chain` is the chain as the caller named it; `chain_id` is `None` when
    /// that name is not a number.
    async fn handle_body(&self, chain_id: Option<u64>, chain: &str, body: &[u8]) -> Value {
        let request: Value = match serde_json::from_slice(body) {
            Ok(request) => request,
            Err(_) => return rpc_error(Value::Null, JSONRPC_PARSE_ERROR, "Parse error"),
        };
        match request {
            Value::Array(batch) if batch.is_empty() => {
                rpc_error(Value::Null, JSONRPC_INVALID_REQUEST, "Invalid Request")
            }
            Value::Array(batch) => {
                let mut replies = Vec::with_capacity(batch.len());
                for call in &batch {
                    replies.push(self.handle_call(chain_id, chain, call).await);
                }
                Value::Array(replies)
            }
            call => self.handle_call(chain_id, chain, &call).await,
        }
    }

    async fn handle_call(&self, chain_id: Option<u64>, chain: &str, call: &Value) -> Value {
        let id = call.get("id").cloned().unwrap_or(Value::Null);
        let (Some(method), Some(params)) = (
            call.get("method").and_then(Value::as_str),
            call.get("params").filter(|p| p.is_array() || p.is_object()),
        ) else {
            return rpc_error(id, JSONRPC_INVALID_REQUEST, "Invalid Request");
        };

        if !WHITELISTED_METHODS.contains(&method) {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n > self.rpc_limit {
                tracing::debug!(method, n, limit = self.rpc_limit, "RPC call throttled");
                return rpc_error(id, JSONRPC_LIMIT_EXCEEDED, "Request limit exceeded");
            }
        }

        let Some(upstream) = chain_id.and_then(|id| self.upstreams.get(&id)) else {
            return rpc_error(
                id,
                JSONRPC_INTERNAL_ERROR,
                format!("Chain {chain} is disconnected"),
            );
        };

        let client = match upstream_client() {
            Ok(client) => client,
            Err(err) => return rpc_error(id, JSONRPC_INTERNAL_ERROR, err.message()),
        };
        let forwarded = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        match post_json(client, upstream, &forwarded).await {
            Ok((_, reply)) => match reply.get("error") {
                Some(error) => {
                    let (code, message) = normalize_error(error);
                    rpc_error(id, code, message)
                }
                None => rpc_result(id, reply.get("result").cloned().unwrap_or(Value::Null)),
            },
            Err(err) => {
                tracing::debug!(method, "Upstream RPC failed: {err}");
                rpc_error(id, JSONRPC_INTERNAL_ERROR, err.message())
            }
        }
    }
}

/// Dig the innermost `{code, message}` out of the envelopes node providers
/// wrap errors in: nested `error` objects and `body` strings holding JSON.
fn normalize_error(error: &Value) -> (i64, String) {
    if let Some(body) = error.get("body").and_then(Value::as_str) {
        if let Ok(parsed) = serde_json::from_str::<Value>(body) {
            let inner = parsed.get("error").unwrap_or(&parsed);
            return normalize_error(inner);
        }
    }
    if let Some(inner) = error.get("error").filter(|e| e.is_object()) {
        return normalize_error(inner);
    }
    let code = error
        .get("code")
        .and_then(Value::as_i64)
        .unwrap_or(JSONRPC_INTERNAL_ERROR);
    let message = match error.get("message").and_then(Value::as_str) {
        Some(message) => message.to_string(),
        None => error.to_string(),
    };
    (code, message)
}
