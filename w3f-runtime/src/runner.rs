//! One invocation, start to teardown.
//!
//! A [`Runner`] leases three ports, starts the HTTP proxy, the RPC provider
//! and the sandbox concurrently, connects the bridge, sends exactly one
//! `start` event and then waits for whichever terminating signal comes first:
//! the reply, the execution timeout, the sandbox exiting, a memory breach or
//! an orchestrator shutdown. Teardown always runs, whatever the outcome.

use once_cell::sync::Lazy;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::bridge::{BridgeClient, BridgeMessage};
use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::events::{Event, StorageReply, storage_size_kb};
use crate::http_proxy::{HttpProxy, HttpProxyLimits, HttpProxyStats};
use crate::metrics::metrics;
use crate::net_helper::{is_port_free, net_helper};
use crate::proxy_provider::{ProviderConfig, ProxyProvider};
use crate::sandbox::docker::DOCKER_HOST_ALIAS;
use crate::sandbox::{Sandbox, SandboxFactory, SandboxStartParams};
use crate::types::{
    ErrorPayload, ExecutionThrottled, NetworkStats, Payload, RpcCallStats, RunnerResult,
    RuntimeKind, StorageResult, Web3FunctionResult,
};
use crate::validation::{SchemaVersion, validate_result};
use crate::{PORTS_PER_RUN, RPC_LIMIT_EXIT_CODE};

const LOOPBACK: &str = "127.0.0.1";

static SHUTDOWN: Lazy<watch::Sender<bool>> = Lazy::new(|| watch::channel(false).0);

/// Ask every in-flight runner to give up its invocation. Runners started
/// afterwards fail immediately.
pub fn request_shutdown() {
    tracing::info!("Shutdown requested; cancelling in-flight runs");
    SHUTDOWN.send_replace(true);
}

fn shutdown_signal() -> watch::Receiver<bool> {
    SHUTDOWN.subscribe()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunnerState {
    Idle,
    SandboxStarting,
    Connecting,
    AwaitingResult,
    Success,
    Error,
    Timeout,
    Crashed,
    Stopped,
}

#[derive(Default)]
struct Resources {
    sandbox: Option<Arc<dyn Sandbox>>,
    proxy: Option<Arc<HttpProxy>>,
    provider: Option<Arc<ProxyProvider>>,
    bridge: Option<Arc<BridgeClient>>,
    tasks: Vec<JoinHandle<()>>,
    /// Ports this runner allocated itself and must hand back.
    allocated_ports: Vec<u16>,
}

struct Execution {
    result: Web3FunctionResult,
    storage: StorageResult,
}

enum Outcome {
    Reply(Event),
    Transport(String),
    Timeout,
    Exited(i32),
    Memory(u64),
    Shutdown,
    Stopped,
}

pub struct Runner {
    config: RuntimeConfig,
    factory: SandboxFactory,
    leased_ports: Option<Vec<u16>>,
    state: Mutex<RunnerState>,
    resources: Mutex<Resources>,
    stopped: AtomicBool,
}

impl Runner {
    pub fn new(config: RuntimeConfig, factory: SandboxFactory) -> Self {
        Self {
            config,
            factory,
            leased_ports: None,
            state: Mutex::new(RunnerState::Idle),
            resources: Mutex::new(Resources::default()),
            stopped: AtomicBool::new(false),
        }
    }

    /// Use ports leased by the caller instead of allocating fresh ones.
    /// Leased ports are not released on stop.
    pub fn with_ports(mut self, ports: Vec<u16>) -> Self {
        self.leased_ports = Some(ports);
        self
    }

    pub fn state(&self) -> RunnerState {
        *lock(&self.state)
    }

    fn set_state(&self, next: RunnerState) {
        let mut state = lock(&self.state);
        if *state != next {
            tracing::debug!(from = ?*state, to = ?next, "Runner state transition");
            *state = next;
        }
    }

    fn resources(&self) -> MutexGuard<'_, Resources> {
        lock(&self.resources)
    }

    /// Execute the payload and tear everything down. Never fails: every error
    /// ends up in the failure variant of [`RunnerResult`].
    pub async fn run(&self, payload: Payload) -> RunnerResult {
        let started = Instant::now();
        let peak_memory = Arc::new(AtomicU64::new(0));
        let mut throttled = ExecutionThrottled::default();
        let active = metrics().track_runner();

        let outcome = self.execute(payload, &peak_memory, &mut throttled).await;
        let (logs, rpc_calls, http) = self.usage();
        self.set_state(match &outcome {
            Ok(_) => RunnerState::Success,
            Err(_) if throttled.duration => RunnerState::Timeout,
            Err(RuntimeError::Crash(_)) => RunnerState::Crashed,
            Err(_) => RunnerState::Error,
        });
        self.stop().await;
        drop(active);

        throttled.network_request = http.request_throttled;
        throttled.download = http.download_throttled;
        throttled.upload = http.upload_throttled;
        throttled.rpc_request = rpc_calls.throttled > 0;

        let duration = started.elapsed();
        let mut result = RunnerResult {
            success: outcome.is_ok(),
            result: None,
            storage: None,
            error: None,
            logs,
            duration: duration.as_secs_f64(),
            memory: peak_memory.load(Ordering::SeqCst) as f64 / (1024.0 * 1024.0),
            rpc_calls,
            network: NetworkStats {
                nb_requests: http.nb_requests,
                nb_throttled: http.nb_throttled,
                download: http.download_kb,
                upload: http.upload_kb,
            },
            throttled,
        };
        match outcome {
            Ok(execution) => {
                result.result = Some(execution.result);
                result.storage = Some(execution.storage);
            }
            Err(err) => {
                tracing::warn!(error = %err, "Web3Function run failed");
                result.error = Some(ErrorPayload::from(&err));
            }
        }

        let duration_ms = duration.as_millis() as u64;
        metrics().record_run(result.success, throttled.any(), duration_ms);
        tracing::info!(success = result.success, duration_ms, "Web3Function run finished");
        result
    }

    async fn execute(
        &self,
        payload: Payload,
        peak_memory: &Arc<AtomicU64>,
        throttled: &mut ExecutionThrottled,
    ) -> Result<Execution> {
        let options = payload.options.clone();
        let version = SchemaVersion::from_version(&payload.version)?;
        if *shutdown_signal().borrow() {
            return Err(RuntimeError::Startup("runtime is shutting down".into()));
        }

        self.set_state(RunnerState::SandboxStarting);
        let ports = self.acquire_ports().await?;
        let server_port = options.server_port.unwrap_or(ports[0]);
        let (proxy_port, provider_port) = (ports[1], ports[2]);

        let (bind_ip, public_host) = match options.runtime {
            RuntimeKind::Docker => (IpAddr::V4(Ipv4Addr::UNSPECIFIED), DOCKER_HOST_ALIAS),
            RuntimeKind::Thread => (IpAddr::V4(Ipv4Addr::LOCALHOST), LOOPBACK),
        };

        let proxy = Arc::new(HttpProxy::new(
            HttpProxyLimits {
                request_limit: options.request_limit,
                download_limit: options.download_limit,
                upload_limit: options.upload_limit,
                blacklisted_hosts: options.blacklisted_hosts.clone(),
            },
            bind_ip,
        ));
        let provider = Arc::new(ProxyProvider::new(ProviderConfig {
            main_chain_id: payload.context.chain_args.chain_id,
            rpc_limit: options.rpc_limit,
            upstreams: payload.multi_chain_provider_config.clone(),
            bind_ip,
            public_host: public_host.to_string(),
        }));
        let sandbox = (self.factory)(&options);
        {
            let mut resources = self.resources();
            resources.sandbox = Some(sandbox.clone());
            resources.proxy = Some(proxy.clone());
            resources.provider = Some(provider.clone());
        }

        let params = SandboxStartParams {
            script: payload.script.clone(),
            server_port,
            mount_path: uuid::Uuid::new_v4().simple().to_string(),
            proxy_host: public_host.to_string(),
            proxy_port,
            blacklisted_hosts: options.blacklisted_hosts.clone(),
        };
        tokio::try_join!(
            async { proxy.start(proxy_port).await.map(drop) },
            async { provider.start(provider_port).await.map(drop) },
            sandbox.start(&params),
        )
        .map_err(|err| {
            RuntimeError::Startup(format!("failed to start sandbox: {}", err.message()))
        })?;

        let memory_breach =
            self.spawn_memory_sampler(sandbox.clone(), options.memory, peak_memory.clone());

        self.set_state(RunnerState::Connecting);
        let (bridge, mut events) = BridgeClient::new(LOOPBACK, server_port, &params.mount_path)?;
        let bridge = Arc::new(bridge);
        self.resources().bridge = Some(bridge.clone());
        tokio::select! {
            connected = bridge.connect(self.config.connect_timeout) => connected?,
            code = sandbox.wait_for_process_end() => {
                return Err(RuntimeError::Startup(format!(
                    "Web3Function sandbox exited with code={code} before accepting connections"
                )));
            }
        }

        self.set_state(RunnerState::AwaitingResult);
        let mut context = payload.context.clone();
        context.rpc_provider_url = provider.proxy_url();
        let storage_before = context.storage.clone();
        bridge.send(Event::Start { context });

        let timeout = Duration::from_millis(options.timeout);
        let mut shutdown = shutdown_signal();
        let breach = async {
            match memory_breach.await {
                Ok(used) => used,
                Err(_) => std::future::pending().await,
            }
        };

        let outcome = tokio::select! {
            message = events.recv() => match message {
                Some(BridgeMessage::Output(event)) => Outcome::Reply(event),
                Some(BridgeMessage::Error(message)) => Outcome::Transport(message),
                Some(BridgeMessage::Closed) | None => Outcome::Stopped,
            },
            _ = tokio::time::sleep(timeout) => Outcome::Timeout,
            code = sandbox.wait_for_process_end() => Outcome::Exited(code),
            used = breach => Outcome::Memory(used),
            _ = shutdown.wait_for(|stop| *stop) => Outcome::Shutdown,
        };

        // A reply may still be in flight when the process exits, and a broken
        // transport usually means the process is about to.
        let grace = self.config.exit_grace;
        let outcome = match outcome {
            Outcome::Exited(code) => match tokio::time::timeout(grace, events.recv()).await {
                Ok(Some(BridgeMessage::Output(event))) => Outcome::Reply(event),
                _ => Outcome::Exited(code),
            },
            Outcome::Transport(message) => {
                match tokio::time::timeout(grace, sandbox.wait_for_process_end()).await {
                    Ok(code) => Outcome::Exited(code),
                    Err(_) => Outcome::Transport(message),
                }
            }
            other => other,
        };

        match outcome {
            Outcome::Reply(Event::Result { result, storage }) => {
                let result = validate_result(version, &result)?;
                let storage = self.check_storage(
                    storage,
                    &storage_before,
                    options.storage_limit,
                    throttled,
                )?;
                Ok(Execution { result, storage })
            }
            Outcome::Reply(Event::Error { error, .. }) => Err(RuntimeError::Script(error.message)),
            Outcome::Reply(Event::Start { .. }) => Err(RuntimeError::Protocol(
                "sandbox answered with a start event".into(),
            )),
            Outcome::Transport(message) => Err(RuntimeError::Protocol(message)),
            Outcome::Timeout => {
                throttled.duration = true;
                Err(RuntimeError::Quota(format!(
                    "Web3Function exceeded execution timeout ({})",
                    format_timeout(timeout)
                )))
            }
            Outcome::Exited(0) => Err(RuntimeError::Crash(
                "Web3Function exited without returning result".into(),
            )),
            Outcome::Exited(RPC_LIMIT_EXIT_CODE) => Err(RuntimeError::Quota(
                "Web3Function RPC requests limit exceeded".into(),
            )),
            Outcome::Exited(code) => Err(RuntimeError::Crash(format!(
                "Web3Function sandbox exited with code={code}"
            ))),
            Outcome::Memory(used) => {
                throttled.memory = true;
                peak_memory.fetch_max(used, Ordering::SeqCst);
                Err(RuntimeError::Quota(format!(
                    "Memory limit exceeded ({} MB)",
                    options.memory
                )))
            }
            Outcome::Shutdown => Err(RuntimeError::Crash(
                "Runtime shut down before Web3Function returned".into(),
            )),
            Outcome::Stopped => Err(RuntimeError::Crash(
                "Runner stopped before Web3Function returned".into(),
            )),
        }
    }

    fn check_storage(
        &self,
        reply: StorageReply,
        before: &crate::types::StorageMap,
        storage_limit_kb: u64,
        throttled: &mut ExecutionThrottled,
    ) -> Result<StorageResult> {
        // Recompute the state rather than trusting the script's claim.
        let reply = StorageReply::diff(before, reply.storage);
        let size_kb = storage_size_kb(&reply.storage);
        if size_kb > storage_limit_kb as f64 {
            throttled.storage = true;
            return Err(RuntimeError::Quota(format!(
                "Storage usage exceeds limit ({size_kb:.2} KB > {storage_limit_kb} KB)"
            )));
        }
        Ok(StorageResult {
            state: reply.state,
            data: reply.storage,
            size_kb,
        })
    }

    /// Leased ports that something else grabbed since the lease are swapped
    /// for freshly allocated ones, which this runner releases on stop.
    async fn acquire_ports(&self) -> Result<Vec<u16>> {
        let Some(leased) = self.leased_ports.as_ref().filter(|p| p.len() >= PORTS_PER_RUN) else {
            let ports = net_helper().get_available_ports(PORTS_PER_RUN).await?;
            self.resources().allocated_ports.extend(&ports);
            return Ok(ports);
        };
        let mut ports = leased.clone();
        for port in ports.iter_mut() {
            if is_port_free(*port).await {
                continue;
            }
            let fresh = net_helper().get_available_port().await?;
            tracing::warn!(leased = *port, fresh, "Leased port is in use; allocated a replacement");
            self.resources().allocated_ports.push(fresh);
            *port = fresh;
        }
        Ok(ports)
    }

    /// Sample at a fixed interval, keep the running maximum, fire once the
    /// ceiling is crossed.
    fn spawn_memory_sampler(
        &self,
        sandbox: Arc<dyn Sandbox>,
        memory_mb: u64,
        peak: Arc<AtomicU64>,
    ) -> oneshot::Receiver<u64> {
        let (tx, rx) = oneshot::channel();
        let limit = memory_mb.saturating_mul(1024 * 1024);
        let interval = self.config.memory_sample_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let used = sandbox.memory_usage().await;
                peak.fetch_max(used, Ordering::SeqCst);
                if used > limit {
                    let _ = tx.send(used);
                    break;
                }
            }
        });
        self.resources().tasks.push(task);
        rx
    }

    fn usage(&self) -> (Vec<String>, RpcCallStats, HttpProxyStats) {
        let resources = self.resources();
        (
            resources.sandbox.as_ref().map(|s| s.logs()).unwrap_or_default(),
            resources
                .provider
                .as_ref()
                .map(|p| p.nb_rpc_calls())
                .unwrap_or_default(),
            resources.proxy.as_ref().map(|p| p.stats()).unwrap_or_default(),
        )
    }

    /// Tear down everything this runner started. Only the first call has an
    /// effect.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let resources = std::mem::take(&mut *self.resources());
        for task in &resources.tasks {
            task.abort();
        }
        if let Some(bridge) = &resources.bridge {
            bridge.end();
        }
        if let Some(sandbox) = &resources.sandbox {
            if let Err(err) = sandbox.stop().await {
                tracing::warn!(error = %err, "Failed to stop sandbox");
            }
        }
        if let Some(proxy) = &resources.proxy {
            proxy.stop();
        }
        if let Some(provider) = &resources.provider {
            provider.stop();
        }
        if !resources.allocated_ports.is_empty() {
            net_helper().release_ports(&resources.allocated_ports);
        }
        self.set_state(RunnerState::Stopped);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn format_timeout(timeout: Duration) -> String {
    let ms = timeout.as_millis();
    if ms % 1000 == 0 {
        format!("{}s", ms / 1000)
    } else {
        format!("{ms}ms")
    }
}
