use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures_util::future::BoxFuture;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{Result, RuntimeError};
use crate::events::Event;

/// Turns the `start` event into the reply. `None` means the script host is
/// going down without replying.
pub type EventHandler = Arc<dyn Fn(Event) -> BoxFuture<'static, Option<Event>> + Send + Sync>;

#[derive(Clone)]
struct BridgeState {
    handler: EventHandler,
    consumed: Arc<AtomicBool>,
    done: Arc<watch::Sender<bool>>,
}

/// In-sandbox server answering one exchange.
pub struct BridgeServer {
    addr: SocketAddr,
    done: watch::Receiver<bool>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

/// Routes for one mount path: `GET` is the liveness probe, `POST` carries the
/// single event exchange. Anything else falls through to 404/405.
pub fn router(mount_path: &str, handler: EventHandler) -> (Router, watch::Receiver<bool>) {
    let (done_tx, done_rx) = watch::channel(false);
    let state = BridgeState {
        handler,
        consumed: Arc::new(AtomicBool::new(false)),
        done: Arc::new(done_tx),
    };
    let path = format!("/{}", mount_path.trim_matches('/'));
    let router = Router::new()
        .route(&path, get(liveness).post(handle_event))
        .with_state(state);
    (router, done_rx)
}

async fn liveness() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn handle_event(State(state): State<BridgeState>, body: Bytes) -> Response {
    let event: Event = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("invalid event: {err}") })),
            )
                .into_response();
        }
    };
    if !matches!(event, Event::Start { .. }) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("unexpected event '{}'", event.action()) })),
        )
            .into_response();
    }
    if state.consumed.swap(true, Ordering::SeqCst) {
        return (
            StatusCode::CONFLICT,
            Json(json!({ "error": "event already handled" })),
        )
            .into_response();
    }

    let reply = (state.handler)(event).await;
    state.done.send_replace(true);
    match reply {
        Some(reply) => Json(reply).into_response(),
        None => std::future::pending::<Response>().await,
    }
}

impl BridgeServer {
    /// Bind `host:port` and start serving in the background.
    pub async fn bind(
        host: &str,
        port: u16,
        mount_path: &str,
        handler: EventHandler,
    ) -> Result<Self> {
        let listener = TcpListener::bind((host, port)).await.map_err(|err| {
            RuntimeError::Startup(format!("bridge server failed to bind {host}:{port}: {err}"))
        })?;
        let addr = listener.local_addr()?;
        let (router, done) = router(mount_path, handler);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.wait_for(|stop| *stop).await;
            };
            if let Err(err) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                tracing::error!("Bridge server error: {err}");
            }
        });

        tracing::debug!(%addr, "Bridge server listening");
        Ok(Self {
            addr,
            done,
            shutdown: shutdown_tx,
            task: Some(task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Resolves once the handler has produced (or declined) its reply.
    pub async fn wait_for_exchange(&self) {
        let mut done = self.done.clone();
        let _ = done.wait_for(|done| *done).await;
    }

    /// Stop accepting connections and let the in-flight response finish,
    /// for at most `grace`.
    pub async fn shutdown(mut self, grace: Duration) {
        self.shutdown.send_replace(true);
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                task.abort();
            }
        }
    }
}

impl Drop for BridgeServer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
