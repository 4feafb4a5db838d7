//! Process-backed sandbox (`runtime: "thread"`).
//!
//! JavaScript/TypeScript bundles run under Deno with narrowed permissions.
//! Any other file is treated as a native script host and executed directly.
//! Either way the child starts from an empty environment and only sees the
//! bridge and proxy variables.

use async_trait::async_trait;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;

use super::{ExitSignal, LogBuffer, Sandbox, SandboxStartParams, deno_args, is_deno_script};
use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::types::RuntimeKind;
use crate::{ENV_MOUNT_PATH, ENV_SERVER_PORT};

const STOP_WAIT: Duration = Duration::from_secs(5);

pub struct ProcessSandbox {
    memory_mb: u64,
    deno_path: String,
    logs: LogBuffer,
    exit: ExitSignal,
    pid: Mutex<Option<u32>>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
    system: Arc<Mutex<System>>,
}

impl ProcessSandbox {
    pub fn new(memory_mb: u64, show_logs: bool, config: &RuntimeConfig) -> Self {
        Self {
            memory_mb,
            deno_path: config.deno_path.clone(),
            logs: LogBuffer::new(show_logs),
            exit: ExitSignal::new(),
            pid: Mutex::new(None),
            kill_tx: Mutex::new(None),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            system: Arc::new(Mutex::new(System::new())),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        *self.pid.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn build_command(&self, params: &SandboxStartParams) -> Command {
        let mut command = if is_deno_script(&params.script) {
            let mut command = Command::new(&self.deno_path);
            command.args(deno_args(
                &params.script.to_string_lossy(),
                self.memory_mb,
                &[ENV_SERVER_PORT, ENV_MOUNT_PATH],
                &params.blacklisted_hosts,
            ));
            command
        } else {
            Command::new(&params.script)
        };

        let proxy_url = params.proxy_url();
        command
            .env_clear()
            .env(ENV_SERVER_PORT, params.server_port.to_string())
            .env(ENV_MOUNT_PATH, &params.mount_path)
            .env("HTTP_PROXY", &proxy_url)
            .env("HTTPS_PROXY", &proxy_url)
            .env("http_proxy", &proxy_url)
            .env("https_proxy", &proxy_url)
            // The rpc provider and bridge live on loopback and must not be proxied.
            .env("NO_PROXY", "localhost,127.0.0.1")
            .env("NO_COLOR", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Ok(deno_dir) = std::env::var("DENO_DIR") {
            command.env("DENO_DIR", deno_dir);
        }
        if let Some(dir) = params.script.parent().filter(|d| !d.as_os_str().is_empty()) {
            command.current_dir(dir);
        }
        command
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Thread
    }

    async fn start(&self, params: &SandboxStartParams) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(RuntimeError::Startup("sandbox already started".into()));
        }
        if !params.script.is_file() {
            return Err(RuntimeError::Startup(format!(
                "script not found: {}",
                params.script.display()
            )));
        }

        let mut child = self.build_command(params).spawn().map_err(|err| {
            RuntimeError::Startup(format!(
                "failed to spawn {}: {err}",
                params.script.display()
            ))
        })?;

        let pid = child.id();
        *self.pid.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = pid;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_lines(stdout, self.logs.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_lines(stderr, self.logs.clone()));
        }

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        *self
            .kill_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(kill_tx);

        let exit = self.exit.clone();
        tokio::spawn(async move {
            // A dropped sender also kills the child.
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let code = status.map(exit_code).unwrap_or(-1);
            tracing::debug!(?pid, code, "Sandbox process exited");
            exit.resolve(code);
        });

        tracing::info!(
            ?pid,
            script = %params.script.display(),
            port = params.server_port,
            "Started process sandbox"
        );
        Ok(())
    }

    async fn memory_usage(&self) -> u64 {
        let Some(pid) = self.pid() else {
            return 0;
        };
        if self.exit.code().is_some() {
            return 0;
        }
        let system = self.system.clone();
        tokio::task::spawn_blocking(move || {
            let mut system = system.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let pid = Pid::from_u32(pid);
            system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
            system.process(pid).map(|p| p.memory()).unwrap_or(0)
        })
        .await
        .unwrap_or(0)
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
        let kill_tx = self
            .kill_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match kill_tx {
            Some(tx) => {
                let _ = tx.send(());
                if tokio::time::timeout(STOP_WAIT, self.exit.wait()).await.is_err() {
                    tracing::warn!(pid = ?self.pid(), "Sandbox process did not exit after kill");
                }
            }
            None => {
                // Never started; unblock anyone waiting on the exit code.
                self.exit.resolve(-1);
            }
        }
        Ok(())
    }
}

async fn pump_lines<R: AsyncRead + Unpin>(reader: R, logs: LogBuffer) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        logs.push(line);
    }
}

/// Exit code, or `128 + signal` when the process was killed by a signal.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    fn write_script(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("host.sh");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh\n{body}").unwrap();
        drop(file);
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn params(script: PathBuf) -> SandboxStartParams {
        SandboxStartParams {
            script,
            server_port: 45123,
            mount_path: "mount".into(),
            proxy_host: "127.0.0.1".into(),
            proxy_port: 45124,
            blacklisted_hosts: Vec::new(),
        }
    }

    #[tokio::test]
    #[serial]
    async fn captures_logs_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            &dir,
            "echo \"port=$W3F_SERVER_PORT mount=$W3F_MOUNT_PATH\"\necho oops >&2\nexit 3",
        );
        let sandbox = ProcessSandbox::new(64, false, &RuntimeConfig::default());
        sandbox.start(&params(script)).await.unwrap();

        assert_eq!(sandbox.wait_for_process_end().await, 3);
        assert_eq!(sandbox.wait_for_process_end().await, 3);

        // Pipes drain asynchronously after exit.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let logs = sandbox.logs();
        assert!(logs.contains(&"port=45123 mount=mount".to_string()));
        assert!(logs.contains(&"oops".to_string()));
    }

    #[tokio::test]
    #[serial]
    async fn environment_is_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(&dir, "echo \"home=${HOME:-unset}\"");
        let sandbox = ProcessSandbox::new(64, false, &RuntimeConfig::default());
        sandbox.start(&params(script)).await.unwrap();
        sandbox.wait_for_process_end().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(sandbox.logs(), vec!["home=unset".to_string()]);
    }

    #[tokio::test]
    #[serial]
    async fn stop_kills_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(&dir, "sleep 60");
        let sandbox = ProcessSandbox::new(64, false, &RuntimeConfig::default());
        sandbox.start(&params(script)).await.unwrap();
        assert!(sandbox.memory_usage().await > 0);

        sandbox.stop().await.unwrap();
        sandbox.stop().await.unwrap();
        assert_ne!(sandbox.wait_for_process_end().await, 0);
        assert_eq!(sandbox.memory_usage().await, 0);
    }

    #[tokio::test]
    async fn missing_script_is_startup_error() {
        let sandbox = ProcessSandbox::new(64, false, &RuntimeConfig::default());
        let err = sandbox
            .start(&params(PathBuf::from("/nonexistent/host")))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Startup(_)));
        sandbox.stop().await.unwrap();
        assert_eq!(sandbox.wait_for_process_end().await, -1);
    }
}
