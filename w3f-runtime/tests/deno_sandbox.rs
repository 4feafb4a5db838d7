//! Runs a minimal Deno bridge script through the real backends.
//!
//! Run:
//!   REAL_DENO=1 cargo test --test deno_sandbox
//!   REAL_DOCKER=1 cargo test --test deno_sandbox -- --test-threads=1
//!
//! The process test needs `deno` on PATH (or W3F_DENO_PATH). The docker test
//! needs a reachable daemon and pulls the Deno image if missing.

use std::time::Duration;
use w3f_runtime::sandbox::default_factory;
use w3f_runtime::types::RunnerOptions;
use w3f_runtime::{
    Payload, Runner, RuntimeConfig, RuntimeKind, Web3FunctionContextData, Web3FunctionResult,
};

const BRIDGE_SCRIPT: &str = r#"
const port = Number(Deno.env.get("W3F_SERVER_PORT"));
const mount = Deno.env.get("W3F_MOUNT_PATH");
const hostname = Deno.env.get("W3F_SERVER_HOST") ?? "127.0.0.1";
console.log("bridge script up");
Deno.serve({ port, hostname }, async (req) => {
  const url = new URL(req.url);
  if (url.pathname !== `/${mount}`) return new Response("not found", { status: 404 });
  if (req.method === "GET") return Response.json({ status: "ok" });
  const event = await req.json();
  setTimeout(() => Deno.exit(0), 100);
  return Response.json({
    action: "result",
    data: {
      result: { canExec: false, message: "Simple" },
      storage: { state: "last", storage: event.data.context.storage ?? {} },
    },
  });
});
"#;

fn enabled(var: &str) -> bool {
    std::env::var(var).map(|v| v == "1").unwrap_or(false)
}

macro_rules! skip_unless {
    ($var:literal) => {
        if !enabled($var) {
            eprintln!("Skipped (set {}=1 to enable)", $var);
            return;
        }
    };
}

async fn run_bridge_script(runtime: RuntimeKind) {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("index.js");
    std::fs::write(&script, BRIDGE_SCRIPT).unwrap();

    let config = RuntimeConfig {
        connect_timeout: Duration::from_secs(60),
        ..RuntimeConfig::from_env()
    };
    let payload = Payload {
        script,
        version: "2.0.0".into(),
        context: Web3FunctionContextData::default(),
        options: RunnerOptions {
            runtime,
            timeout: 60_000,
            ..RunnerOptions::default()
        },
        multi_chain_provider_config: Default::default(),
    };

    let result = Runner::new(config.clone(), default_factory(config))
        .run(payload)
        .await;
    assert!(result.success, "{:?} / logs: {:?}", result.error, result.logs);
    assert_eq!(
        result.result,
        Some(Web3FunctionResult::CannotExec {
            message: Some("Simple".into())
        })
    );
    assert!(result.logs.iter().any(|l| l.contains("bridge script up")));
}

#[tokio::test]
async fn deno_process_round_trip() {
    skip_unless!("REAL_DENO");
    run_bridge_script(RuntimeKind::Thread).await;
}

#[tokio::test]
async fn docker_container_round_trip() {
    skip_unless!("REAL_DOCKER");
    run_bridge_script(RuntimeKind::Docker).await;
}
