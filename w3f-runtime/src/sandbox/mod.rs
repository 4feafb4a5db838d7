//! Isolated execution units for one script invocation.
//!
//! [`Sandbox`] is the capability every backend provides. [`create_sandbox`]
//! picks the backend from the payload's [`RuntimeKind`].

pub mod docker;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
pub mod process;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::types::{RunnerOptions, RuntimeKind};

pub use docker::DockerSandbox;
pub use process::ProcessSandbox;

/// Everything a sandbox needs to launch the script.
#[derive(Clone, Debug)]
pub struct SandboxStartParams {
    pub script: PathBuf,
    pub server_port: u16,
    pub mount_path: String,
    pub proxy_host: String,
    pub proxy_port: u16,
    pub blacklisted_hosts: Vec<String>,
}

impl SandboxStartParams {
    pub fn proxy_url(&self) -> String {
        format!("http://{}:{}", self.proxy_host, self.proxy_port)
    }
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    fn kind(&self) -> RuntimeKind;

    /// Launch the script. Returns once the process or container is running,
    /// not once its bridge server is reachable.
    async fn start(&self, params: &SandboxStartParams) -> Result<()>;

    /// Current memory usage in bytes. Returns 0 when it cannot be sampled.
    async fn memory_usage(&self) -> u64;

    /// Captured stdout/stderr lines in arrival order.
    fn logs(&self) -> Vec<String>;

    /// Resolve with the exit code once the script terminates. Repeat callers
    /// get the same cached code.
    async fn wait_for_process_end(&self) -> i32;

    /// Terminate and clean up. Calling this more than once is a no-op.
    async fn stop(&self) -> Result<()>;
}

/// Build a sandbox for the given backend.
pub fn create_sandbox(
    kind: RuntimeKind,
    memory_mb: u64,
    show_logs: bool,
    config: &RuntimeConfig,
) -> Arc<dyn Sandbox> {
    match kind {
        RuntimeKind::Thread => Arc::new(ProcessSandbox::new(memory_mb, show_logs, config)),
        RuntimeKind::Docker => Arc::new(DockerSandbox::new(memory_mb, show_logs, config)),
    }
}

/// Builds the sandbox for one invocation. Lets embedders and tests swap in
/// their own backends.
pub type SandboxFactory = Arc<dyn Fn(&RunnerOptions) -> Arc<dyn Sandbox> + Send + Sync>;

/// Factory dispatching on [`RunnerOptions::runtime`] through [`create_sandbox`].
pub fn default_factory(config: RuntimeConfig) -> SandboxFactory {
    Arc::new(move |options: &RunnerOptions| {
        create_sandbox(options.runtime, options.memory, options.show_logs, &config)
    })
}

// ---------------------------------------------------------------------------
// Shared building blocks
// ---------------------------------------------------------------------------

/// Ordered, append-only log capture.
#[derive(Clone, Default)]
pub struct LogBuffer {
    lines: Arc<Mutex<Vec<String>>>,
    show_logs: bool,
}

impl LogBuffer {
    pub fn new(show_logs: bool) -> Self {
        Self {
            lines: Arc::new(Mutex::new(Vec::new())),
            show_logs,
        }
    }

    pub fn push(&self, line: impl Into<String>) {
        let line = line.into();
        if self.show_logs {
            tracing::info!(target: "w3f::script", "{line}");
        }
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(line);
    }

    /// Split a raw output chunk into lines, dropping the trailing newline.
    pub fn push_chunk(&self, chunk: &[u8]) {
        let text = String::from_utf8_lossy(chunk);
        for line in text.lines() {
            self.push(line.to_string());
        }
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Exit code resolved exactly once; later resolutions are ignored.
#[derive(Clone)]
pub struct ExitSignal {
    tx: Arc<watch::Sender<Option<i32>>>,
}

impl Default for ExitSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ExitSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Returns `true` if this call set the code.
    pub fn resolve(&self, code: i32) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(code);
                true
            } else {
                false
            }
        })
    }

    pub fn code(&self) -> Option<i32> {
        *self.tx.borrow()
    }

    pub async fn wait(&self) -> i32 {
        let mut rx = self.tx.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(code) => (*code).unwrap_or(-1),
            Err(_) => -1,
        }
    }
}

/// Scripts with these extensions run under Deno; anything else is treated as
/// a native script host and executed directly.
pub fn is_deno_script(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("js" | "mjs" | "cjs" | "ts" | "mts")
    )
}

/// Deno arguments granting network access, the listed env vars and a heap
/// ceiling. Nothing else (no filesystem, no subprocesses).
pub fn deno_args(
    script: &str,
    memory_mb: u64,
    allow_env: &[&str],
    blacklisted_hosts: &[String],
) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "--allow-net".to_string(),
        format!("--allow-env={}", allow_env.join(",")),
        format!("--v8-flags=--max-old-space-size={memory_mb}"),
        "--no-prompt".to_string(),
    ];
    if !blacklisted_hosts.is_empty() {
        args.push(format!("--deny-net={}", blacklisted_hosts.join(",")));
    }
    args.push(script.to_string());
    args
}
