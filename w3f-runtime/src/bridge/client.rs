use reqwest::Client;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::{Result, RuntimeError};
use crate::events::Event;
use crate::http::loopback_client;

const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const PING_TIMEOUT: Duration = Duration::from_secs(1);

/// What the orchestrator observes after sending an event.
#[derive(Clone, Debug, PartialEq)]
pub enum BridgeMessage {
    /// Parsed reply event.
    Output(Event),
    /// Transport failure: connection lost, bad status or non-JSON reply.
    Error(String),
    /// `end()` was called; nothing further will arrive.
    Closed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BridgeError {
    /// The server never answered the liveness probe in time.
    UnableToConnect(String),
    /// `end()` was called while still connecting.
    Disconnected,
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::UnableToConnect(msg) => write!(f, "unable to connect: {msg}"),
            BridgeError::Disconnected => write!(f, "disconnected"),
        }
    }
}

impl std::error::Error for BridgeError {}

impl From<BridgeError> for RuntimeError {
    fn from(err: BridgeError) -> Self {
        RuntimeError::Startup(err.to_string())
    }
}

/// Receiving half of a [`BridgeClient`].
pub struct BridgeEvents {
    rx: mpsc::UnboundedReceiver<BridgeMessage>,
}

impl BridgeEvents {
    pub async fn recv(&mut self) -> Option<BridgeMessage> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<BridgeMessage> {
        self.rx.try_recv().ok()
    }
}

/// Orchestrator side of the bridge.
pub struct BridgeClient {
    url: String,
    client: &'static Client,
    tx: mpsc::UnboundedSender<BridgeMessage>,
    closed: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BridgeClient {
    pub fn new(host: &str, port: u16, mount_path: &str) -> Result<(Self, BridgeEvents)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let client = Self {
            url: format!("http://{host}:{port}/{}", mount_path.trim_matches('/')),
            client: loopback_client()?,
            tx,
            closed,
            tasks: Mutex::new(Vec::new()),
        };
        Ok((client, BridgeEvents { rx }))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Poll the liveness endpoint until it answers, `timeout` elapses or
    /// `end()` is called.
    pub async fn connect(&self, timeout: Duration) -> std::result::Result<(), BridgeError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(BridgeError::Disconnected);
        }

        let poll = async {
            loop {
                if self.ping().await {
                    return;
                }
                tokio::time::sleep(CONNECT_POLL_INTERVAL).await;
            }
        };

        tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => Err(BridgeError::Disconnected),
            _ = poll => Ok(()),
            _ = tokio::time::sleep(timeout) => Err(BridgeError::UnableToConnect(format!(
                "{} did not respond within {}ms",
                self.url,
                timeout.as_millis()
            ))),
        }
    }

    async fn ping(&self) -> bool {
        match self
            .client
            .get(&self.url)
            .timeout(PING_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    /// POST `event` in the background. The outcome arrives on [`BridgeEvents`].
    pub fn send(&self, event: Event) {
        if self.is_closed() {
            return;
        }
        let client = self.client;
        let url = self.url.clone();
        let tx = self.tx.clone();
        let mut closed = self.closed.subscribe();

        let task = tokio::spawn(async move {
            let exchange = post_event(client, &url, &event);
            tokio::select! {
                _ = closed.wait_for(|closed| *closed) => {}
                outcome = exchange => {
                    let message = match outcome {
                        Ok(reply) => BridgeMessage::Output(reply),
                        Err(err) => BridgeMessage::Error(err),
                    };
                    let _ = tx.send(message);
                }
            }
        });
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(task);
    }

    /// Cancel in-flight work and emit [`BridgeMessage::Closed`]. Idempotent.
    pub fn end(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        let tasks = std::mem::take(
            &mut *self
                .tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for task in tasks {
            task.abort();
        }
        let _ = self.tx.send(BridgeMessage::Closed);
    }
}

impl Drop for BridgeClient {
    fn drop(&mut self) {
        self.end();
    }
}

async fn post_event(
    client: &Client,
    url: &str,
    event: &Event,
) -> std::result::Result<Event, String> {
    let response = client
        .post(url)
        .json(event)
        .send()
        .await
        .map_err(|err| format!("request to sandbox failed: {err}"))?;
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|err| format!("failed to read sandbox reply: {err}"))?;
    if !status.is_success() {
        return Err(format!("sandbox replied with HTTP {status}: {body}"));
    }
    serde_json::from_str(&body).map_err(|err| format!("invalid reply from sandbox: {err}"))
}
