//! Pool behaviour with real process sandboxes.

use serde_json::json;
use std::time::Duration;
use w3f_runtime::types::RunnerOptions;
use w3f_runtime::{Payload, RunnerPool, RuntimeConfig, Web3FunctionContextData};

const FIXTURE: &str = env!("CARGO_BIN_EXE_w3f-fixture-script");

fn payload(scenario: &str) -> Payload {
    let mut context = Web3FunctionContextData::default();
    context.user_args.insert("scenario".into(), json!(scenario));
    Payload {
        script: FIXTURE.into(),
        version: "2.0.0".into(),
        context,
        options: RunnerOptions {
            timeout: 10_000,
            ..RunnerOptions::default()
        },
        multi_chain_provider_config: Default::default(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pool_runs_everything_and_returns_ports() {
    let config = RuntimeConfig {
        connect_timeout: Duration::from_secs(10),
        ..RuntimeConfig::default()
    };
    let pool = RunnerPool::new(2, config);
    pool.init().await.unwrap();
    let ports = pool.free_port_count();
    assert_eq!(ports, (2 + 1) * 3);

    let scenarios = ["simple", "error", "simple", "exit-early", "simple"];
    let runs: Vec<_> = scenarios
        .iter()
        .map(|scenario| {
            let pool = pool.clone();
            let payload = payload(scenario);
            tokio::spawn(async move { pool.run(payload).await })
        })
        .collect();

    let mut successes = 0;
    for run in runs {
        if run.await.unwrap().success {
            successes += 1;
        }
    }
    assert_eq!(successes, 3);
    assert_eq!(pool.free_port_count(), ports);
    assert_eq!(pool.active_count(), 0);
    assert_eq!(pool.queued_count(), 0);
}
