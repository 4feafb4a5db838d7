//! Native script host used by the integration tests. The scenario is picked
//! from `userArgs.scenario`.

use serde_json::{Value, json};
use std::time::Duration;
use w3f_runtime::sdk::{Web3FunctionContext, Web3FunctionHost};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    Web3FunctionHost::new(run_scenario).serve_from_env().await;
}

async fn run_scenario(ctx: Web3FunctionContext) -> Result<Value, String> {
    let scenario = ctx
        .user_args()
        .get("scenario")
        .and_then(Value::as_str)
        .unwrap_or("simple")
        .to_string();
    println!("running scenario {scenario}");

    match scenario.as_str() {
        "simple" => Ok(json!({ "canExec": false, "message": "Simple" })),
        "invalid-address" => Ok(json!({
            "canExec": true,
            "callData": [{ "to": "address", "data": "0x00" }]
        })),
        "exit-early" => std::process::exit(0),
        "crash" => std::process::exit(3),
        "timeout" => {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(json!({ "canExec": false }))
        }
        "storage" => {
            let count: u64 = ctx
                .storage()
                .get("count")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            ctx.storage().set("count", (count + 1).to_string());
            Ok(json!({ "canExec": false, "message": format!("count={}", count + 1) }))
        }
        "rpc" => {
            let block = ctx.provider()?.block_number().await?;
            Ok(json!({ "canExec": false, "message": format!("block={block}") }))
        }
        "rpc-limit" => {
            let provider = ctx.provider()?;
            loop {
                provider.block_number().await?;
            }
        }
        "http" => {
            let url = ctx
                .user_args()
                .get("url")
                .and_then(Value::as_str)
                .ok_or("missing url")?;
            let body = ctx
                .http_client()
                .get(url)
                .send()
                .await
                .map_err(|err| err.to_string())?
                .text()
                .await
                .map_err(|err| err.to_string())?;
            Ok(json!({ "canExec": false, "message": body }))
        }
        "error" => Err("Fixture script failed".to_string()),
        "memory" => {
            let mut hoard: Vec<Vec<u8>> = Vec::new();
            for _ in 0..64 {
                hoard.push(vec![1u8; 16 * 1024 * 1024]);
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(json!({ "canExec": false, "message": hoard.len().to_string() }))
        }
        other => Err(format!("unknown scenario '{other}'")),
    }
}
