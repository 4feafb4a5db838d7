//! In-process sandbox for tests: serves a [`Web3FunctionHost`] on the
//! requested port instead of launching a real process.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

use super::{ExitSignal, LogBuffer, Sandbox, SandboxFactory, SandboxStartParams};
use crate::error::{Result, RuntimeError};
use crate::sdk::{ServeOptions, Web3FunctionHost};
use crate::types::{RunnerOptions, RuntimeKind};

#[derive(Clone)]
enum Behavior {
    Serve(Web3FunctionHost),
    Exit(i32),
    Hang,
    FailToStart(String),
}

pub struct MockSandbox {
    behavior: Behavior,
    memory_bytes: u64,
    logs: LogBuffer,
    exit: ExitSignal,
    task: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl MockSandbox {
    fn with_behavior(behavior: Behavior) -> Self {
        Self {
            behavior,
            memory_bytes: 0,
            logs: LogBuffer::new(false),
            exit: ExitSignal::new(),
            task: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    /// Serve `host` on the bridge port, then exit like a real script host.
    pub fn serving(host: Web3FunctionHost) -> Self {
        Self::with_behavior(Behavior::Serve(host))
    }

    /// Exit with `code` right after starting, without ever listening.
    pub fn exiting(code: i32) -> Self {
        Self::with_behavior(Behavior::Exit(code))
    }

    /// Start and never listen nor exit.
    pub fn hanging() -> Self {
        Self::with_behavior(Behavior::Hang)
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_behavior(Behavior::FailToStart(message.into()))
    }

    /// Report a fixed memory usage.
    pub fn with_memory(mut self, bytes: u64) -> Self {
        self.memory_bytes = bytes;
        self
    }
}

#[async_trait]
impl Sandbox for MockSandbox {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Thread
    }

    async fn start(&self, params: &SandboxStartParams) -> Result<()> {
        self.logs.push(format!("mock sandbox starting on port {}", params.server_port));
        let exit = self.exit.clone();
        let task = match &self.behavior {
            Behavior::FailToStart(message) => {
                return Err(RuntimeError::Startup(message.clone()));
            }
            Behavior::Exit(code) => {
                exit.resolve(*code);
                return Ok(());
            }
            Behavior::Hang => return Ok(()),
            Behavior::Serve(host) => {
                let host = host.clone();
                let options = ServeOptions {
                    host: "127.0.0.1".to_string(),
                    port: params.server_port,
                    mount_path: params.mount_path.clone(),
                    proxy_url: Some(params.proxy_url()),
                };
                let logs = self.logs.clone();
                tokio::spawn(async move {
                    let code = match host.serve(options).await {
                        Ok(outcome) => outcome.exit_code(),
                        Err(err) => {
                            logs.push(err.to_string());
                            1
                        }
                    };
                    exit.resolve(code);
                })
            }
        };
        *self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(task);
        Ok(())
    }

    async fn memory_usage(&self) -> u64 {
        if self.exit.code().is_some() {
            0
        } else {
            self.memory_bytes
        }
    }

    fn logs(&self) -> Vec<String> {
        self.logs.snapshot()
    }

    async fn wait_for_process_end(&self) -> i32 {
        self.exit.wait().await
    }

    async fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(task) = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            task.abort();
        }
        self.exit.resolve(137);
        Ok(())
    }
}

/// Factory handing out a fresh sandbox per invocation.
pub fn mock_factory<F>(make: F) -> SandboxFactory
where
    F: Fn(&RunnerOptions) -> MockSandbox + Send + Sync + 'static,
{
    Arc::new(move |options: &RunnerOptions| -> Arc<dyn Sandbox> { Arc::new(make(options)) })
}
