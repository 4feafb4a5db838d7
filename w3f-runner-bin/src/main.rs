//! Command-line runner: executes a Web3 Function payload through a
//! [`RunnerPool`] and prints each result as JSON.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use w3f_runtime::metrics::metrics;
use w3f_runtime::{Payload, RunnerPool, RuntimeConfig, request_shutdown};

#[derive(Debug, Parser)]
#[command(name = "w3f-runner", about = "Run a Web3 Function payload in a sandbox")]
struct Args {
    /// Invocation payload (JSON).
    #[arg(long)]
    payload: PathBuf,

    /// Maximum concurrent runs.
    #[arg(long, default_value_t = 1)]
    pool_size: usize,

    /// How many times to run the payload.
    #[arg(long, default_value_t = 1)]
    runs: usize,

    /// Override the script path from the payload.
    #[arg(long)]
    script: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_log();
    let args = Args::parse();

    let raw = std::fs::read_to_string(&args.payload)
        .with_context(|| format!("reading payload {}", args.payload.display()))?;
    let mut payload: Payload = serde_json::from_str(&raw).context("parsing payload")?;
    if let Some(script) = args.script {
        payload.script = script;
    }

    tokio::spawn(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            request_shutdown();
        }
    });

    let pool = RunnerPool::new(args.pool_size, RuntimeConfig::load().clone());
    pool.init().await.context("allocating runner ports")?;
    info!(
        pool_size = args.pool_size,
        runs = args.runs,
        runtime = %payload.options.runtime,
        "Starting Web3 Function runs"
    );

    let handles: Vec<_> = (0..args.runs)
        .map(|_| {
            let pool = pool.clone();
            let payload = payload.clone();
            tokio::spawn(async move { pool.run(payload).await })
        })
        .collect();

    let mut failures = 0usize;
    for handle in handles {
        match handle.await {
            Ok(result) => {
                if !result.success {
                    failures += 1;
                }
                println!("{}", serde_json::to_string_pretty(&result)?);
            }
            Err(err) => {
                failures += 1;
                error!("Run task failed: {err}");
            }
        }
    }

    for (name, value) in metrics().snapshot() {
        info!("{name}={value}");
    }
    if failures > 0 {
        anyhow::bail!("{failures} of {} runs failed", args.runs);
    }
    Ok(())
}

fn setup_log() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{EnvFilter, fmt};
    if tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .is_err()
    {}
}
