//! Container-backed sandbox (`runtime: "docker"`).
//!
//! One short-lived container per invocation: memory cgroup limit with swap
//! pinned to the same value, the script directory bind-mounted read-only,
//! every capability dropped and the bridge port published on loopback only.

use async_trait::async_trait;
use docktopus::DockerBuilder;
use docktopus::bollard::Docker;
use docktopus::bollard::container::{
    AttachContainerOptions, Config as BollardConfig, CreateContainerOptions,
    KillContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions, StatsOptions,
    WaitContainerOptions,
};
use docktopus::bollard::errors::Error as BollardError;
use docktopus::bollard::models::{HostConfig, PortBinding, PortMap};
use futures_util::StreamExt;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::OnceCell as AsyncOnceCell;

use super::{ExitSignal, LogBuffer, Sandbox, SandboxStartParams, deno_args, is_deno_script};
use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::types::RuntimeKind;
use crate::{ENV_MOUNT_PATH, ENV_SERVER_HOST, ENV_SERVER_PORT};

/// Hostname containers use to reach the orchestrator's proxies.
pub const DOCKER_HOST_ALIAS: &str = "host.docker.internal";
const SCRIPT_MOUNT: &str = "/web3Function";
const PIDS_LIMIT: i64 = 64;
const STOP_WAIT: Duration = Duration::from_secs(5);

static DOCKER_BUILDER: AsyncOnceCell<DockerBuilder> = AsyncOnceCell::const_new();
static READY_IMAGES: AsyncMutex<Option<HashSet<String>>> = AsyncMutex::const_new(None);

pub async fn docker_builder(docker_host: Option<&str>) -> Result<&'static DockerBuilder> {
    DOCKER_BUILDER
        .get_or_try_init(|| async {
            let builder = match docker_host {
                Some(host) => DockerBuilder::with_address(host).await.map_err(|err| {
                    RuntimeError::Docker(format!("Failed to connect to docker at {host}: {err}"))
                })?,
                None => DockerBuilder::new().await.map_err(|err| {
                    RuntimeError::Docker(format!("Failed to connect to docker: {err}"))
                })?,
            };
            Ok(builder)
        })
        .await
}

/// Make sure `image` exists locally, pulling it on first use when allowed.
async fn ensure_image(builder: &DockerBuilder, image: &str, pull: bool) -> Result<()> {
    let mut ready = READY_IMAGES.lock().await;
    let ready = ready.get_or_insert_with(HashSet::new);
    if ready.contains(image) {
        return Ok(());
    }

    if builder.client().inspect_image(image).await.is_err() {
        if !pull {
            return Err(RuntimeError::Docker(format!(
                "Image {image} is not available locally and pulling is disabled"
            )));
        }
        tracing::info!(image, "Pulling sandbox image");
        builder
            .pull_image(image, None)
            .await
            .map_err(|err| RuntimeError::Docker(format!("Failed to pull image {image}: {err}")))?;
    }
    ready.insert(image.to_string());
    Ok(())
}

pub struct DockerSandbox {
    memory_mb: u64,
    image: String,
    docker_host: Option<String>,
    pull_image: bool,
    logs: LogBuffer,
    exit: ExitSignal,
    container_id: Mutex<Option<String>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl DockerSandbox {
    pub fn new(memory_mb: u64, show_logs: bool, config: &RuntimeConfig) -> Self {
        Self {
            memory_mb,
            image: config.docker_image.clone(),
            docker_host: config.docker_host.clone(),
            pull_image: config.pull_image,
            logs: LogBuffer::new(show_logs),
            exit: ExitSignal::new(),
            container_id: Mutex::new(None),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn container_id(&self) -> Option<String> {
        self.container_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    async fn client(&self) -> Result<Arc<Docker>> {
        let builder = docker_builder(self.docker_host.as_deref()).await?;
        Ok(builder.client())
    }

    async fn launch(&self, params: &SandboxStartParams) -> Result<()> {
        let builder = docker_builder(self.docker_host.as_deref()).await?;
        ensure_image(builder, &self.image, self.pull_image).await?;
        let docker = builder.client();

        let name = format!("w3f-{}", uuid::Uuid::new_v4());
        let config = build_container_config(&self.image, self.memory_mb, params)?;
        let created = docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|err| RuntimeError::Docker(format!("Failed to create container: {err}")))?;
        let container_id = created.id;
        *self
            .container_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(container_id.clone());

        // Attach before start so no early output is lost.
        let attached = docker
            .attach_container(
                &container_id,
                Some(AttachContainerOptions::<String> {
                    stdout: Some(true),
                    stderr: Some(true),
                    stream: Some(true),
                    logs: Some(true),
                    ..Default::default()
                }),
            )
            .await
            .map_err(|err| RuntimeError::Docker(format!("Failed to attach container: {err}")))?;
        let logs = self.logs.clone();
        let mut output = attached.output;
        tokio::spawn(async move {
            while let Some(Ok(chunk)) = output.next().await {
                match chunk {
                    LogOutput::StdOut { message }
                    | LogOutput::StdErr { message }
                    | LogOutput::Console { message } => logs.push_chunk(&message),
                    LogOutput::StdIn { .. } => {}
                }
            }
        });

        docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|err| RuntimeError::Docker(format!("Failed to start container: {err}")))?;

        let exit = self.exit.clone();
        let waiter_id = container_id.clone();
        tokio::spawn(async move {
            let mut wait = docker.wait_container(&waiter_id, None::<WaitContainerOptions<String>>);
            let code = match wait.next().await {
                Some(Ok(status)) => status.status_code as i32,
                Some(Err(BollardError::DockerContainerWaitError { code, .. })) => code as i32,
                Some(Err(err)) => {
                    tracing::warn!(container_id = %waiter_id, "Container wait failed: {err}");
                    -1
                }
                None => -1,
            };
            tracing::debug!(container_id = %waiter_id, code, "Sandbox container exited");
            exit.resolve(code);
        });

        tracing::info!(%container_id, port = params.server_port, "Started docker sandbox");
        Ok(())
    }
}

fn build_container_config(
    image: &str,
    memory_mb: u64,
    params: &SandboxStartParams,
) -> Result<BollardConfig<String>> {
    let script_dir = params
        .script
        .parent()
        .filter(|d| !d.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let script_dir = script_dir.canonicalize().map_err(|err| {
        RuntimeError::Startup(format!("invalid script directory {}: {err}", script_dir.display()))
    })?;
    let file_name = params
        .script
        .file_name()
        .and_then(|f| f.to_str())
        .ok_or_else(|| RuntimeError::Startup("script path has no file name".into()))?;
    let script_in_container = format!("{SCRIPT_MOUNT}/{file_name}");

    let (entrypoint, cmd) = if is_deno_script(&params.script) {
        (
            vec!["deno".to_string()],
            deno_args(
                &script_in_container,
                memory_mb,
                &[ENV_SERVER_PORT, ENV_MOUNT_PATH, ENV_SERVER_HOST],
                &params.blacklisted_hosts,
            ),
        )
    } else {
        (vec![script_in_container], Vec::new())
    };

    let proxy_url = params.proxy_url();
    let env = vec![
        format!("{ENV_SERVER_PORT}={}", params.server_port),
        format!("{ENV_MOUNT_PATH}={}", params.mount_path),
        format!("{ENV_SERVER_HOST}=0.0.0.0"),
        format!("HTTP_PROXY={proxy_url}"),
        format!("HTTPS_PROXY={proxy_url}"),
        format!("NO_PROXY={DOCKER_HOST_ALIAS}"),
        "NO_COLOR=1".to_string(),
        "DENO_DIR=/tmp/deno".to_string(),
    ];

    let container_port = format!("{}/tcp", params.server_port);
    let mut port_bindings = PortMap::new();
    port_bindings.insert(
        container_port.clone(),
        Some(vec![PortBinding {
            host_ip: Some("127.0.0.1".to_string()),
            host_port: Some(params.server_port.to_string()),
        }]),
    );
    let mut exposed_ports = HashMap::new();
    exposed_ports.insert(container_port, HashMap::new());

    let memory_bytes = (memory_mb as i64) * 1024 * 1024;
    let host_config = HostConfig {
        memory: Some(memory_bytes),
        memory_swap: Some(memory_bytes),
        binds: Some(vec![format!(
            "{}:{SCRIPT_MOUNT}:ro",
            script_dir.display()
        )]),
        port_bindings: Some(port_bindings),
        extra_hosts: Some(vec![format!("{DOCKER_HOST_ALIAS}:host-gateway")]),
        cap_drop: Some(vec!["ALL".to_string()]),
        security_opt: Some(vec!["no-new-privileges:true".to_string()]),
        pids_limit: Some(PIDS_LIMIT),
        readonly_rootfs: Some(true),
        tmpfs: Some(HashMap::from([(
            "/tmp".to_string(),
            "rw,noexec,nosuid,size=64m".to_string(),
        )])),
        ..Default::default()
    };

    Ok(BollardConfig {
        image: Some(image.to_string()),
        entrypoint: Some(entrypoint),
        cmd: Some(cmd),
        env: Some(env),
        exposed_ports: Some(exposed_ports),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        host_config: Some(host_config),
        labels: Some(HashMap::from([(
            "managed-by".to_string(),
            "w3f-runtime".to_string(),
        )])),
        ..Default::default()
    })
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Docker
    }

    async fn start(&self, params: &SandboxStartParams) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(RuntimeError::Startup("sandbox already started".into()));
        }
        self.launch(params).await.map_err(|err| match err {
            RuntimeError::Startup(_) => err,
            other => RuntimeError::Startup(other.message().to_string()),
        })
    }

    async fn memory_usage(&self) -> u64 {
        let Some(container_id) = self.container_id() else {
            return 0;
        };
        if self.exit.code().is_some() {
            return 0;
        }
        let Ok(docker) = self.client().await else {
            return 0;
        };
        let mut stats = docker.stats(
            &container_id,
            Some(StatsOptions {
                stream: false,
                one_shot: true,
            }),
        );
        match stats.next().await {
            Some(Ok(stats)) => stats.memory_stats.usage.unwrap_or(0),
            _ => 0,
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
        let Some(container_id) = self.container_id() else {
            self.exit.resolve(-1);
            return Ok(());
        };
        let docker = self.client().await?;

        if self.exit.code().is_none() {
            let _ = docker
                .kill_container(&container_id, None::<KillContainerOptions<String>>)
                .await;
            if tokio::time::timeout(STOP_WAIT, self.exit.wait()).await.is_err() {
                tracing::warn!(%container_id, "Container did not report exit after kill");
                self.exit.resolve(-1);
            }
        }

        docker
            .remove_container(
                &container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|err| RuntimeError::Docker(format!("Failed to remove container: {err}")))?;
        tracing::debug!(%container_id, "Removed sandbox container");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn params(script: PathBuf) -> SandboxStartParams {
        SandboxStartParams {
            script,
            server_port: 50123,
            mount_path: "abc".into(),
            proxy_host: DOCKER_HOST_ALIAS.into(),
            proxy_port: 50124,
            blacklisted_hosts: vec!["evil.com".into()],
        }
    }

    #[test]
    fn container_config_is_locked_down() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("index.js");
        std::fs::write(&script, "").unwrap();

        let config = build_container_config("denoland/deno", 256, &params(script)).unwrap();
        let host = config.host_config.unwrap();
        assert_eq!(host.memory, Some(256 * 1024 * 1024));
        assert_eq!(host.memory_swap, host.memory);
        assert_eq!(host.cap_drop, Some(vec!["ALL".to_string()]));
        assert!(host.binds.unwrap()[0].ends_with(":/web3Function:ro"));

        let binding = &host.port_bindings.unwrap()["50123/tcp"];
        let binding = &binding.as_ref().unwrap()[0];
        assert_eq!(binding.host_ip.as_deref(), Some("127.0.0.1"));
        assert_eq!(binding.host_port.as_deref(), Some("50123"));

        let cmd = config.cmd.unwrap();
        assert!(cmd.contains(&"--deny-net=evil.com".to_string()));
        assert_eq!(cmd.last().map(String::as_str), Some("/web3Function/index.js"));
        assert!(
            config
                .env
                .unwrap()
                .contains(&"HTTP_PROXY=http://host.docker.internal:50124".to_string())
        );
    }

    #[tokio::test]
    async fn stop_before_start_is_noop() {
        let sandbox = DockerSandbox::new(128, false, &RuntimeConfig::default());
        sandbox.stop().await.unwrap();
        sandbox.stop().await.unwrap();
        assert_eq!(sandbox.wait_for_process_end().await, -1);
        assert_eq!(sandbox.memory_usage().await, 0);
    }
}
