//! Payload, context and result types exchanged with callers.

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::events::StorageState;
use crate::{DEFAULT_MEMORY_MB, DEFAULT_TIMEOUT_SECS};

/// String-keyed map with optional string values, used for secrets and storage.
pub type StorageMap = HashMap<String, Option<String>>;

/// Which sandbox backend runs the script.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    /// Isolated OS process (Deno with narrowed permissions, or a native host).
    #[default]
    Thread,
    /// Docker container with cgroup limits.
    Docker,
}

impl RuntimeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeKind::Thread => "thread",
            RuntimeKind::Docker => "docker",
        }
    }
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainArgs {
    pub chain_id: u64,
    #[serde(default)]
    pub gas_price: String,
    #[serde(default)]
    pub block_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

/// Input bundle handed to a script for one invocation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Web3FunctionContextData {
    pub chain_args: ChainArgs,
    #[serde(default)]
    pub user_args: Map<String, Value>,
    #[serde(default)]
    pub secrets: StorageMap,
    #[serde(default)]
    pub storage: StorageMap,
    /// Injected by the runner at dispatch; any caller-supplied value is replaced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc_provider_url: Option<String>,
}

/// Per-invocation ceilings and sandbox selection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunnerOptions {
    pub runtime: RuntimeKind,
    /// Memory ceiling in MB.
    pub memory: u64,
    /// Execution timeout in milliseconds.
    pub timeout: u64,
    pub rpc_limit: u64,
    /// Download ceiling in bytes.
    pub download_limit: u64,
    /// Upload ceiling in bytes.
    pub upload_limit: u64,
    pub request_limit: u64,
    /// Storage ceiling in KB.
    pub storage_limit: u64,
    pub blacklisted_hosts: Vec<String>,
    pub show_logs: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_port: Option<u16>,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            runtime: RuntimeKind::Thread,
            memory: DEFAULT_MEMORY_MB,
            timeout: DEFAULT_TIMEOUT_SECS * 1000,
            rpc_limit: 100,
            download_limit: 10 * 1024 * 1024,
            upload_limit: 5 * 1024 * 1024,
            request_limit: 110,
            storage_limit: 1024,
            blacklisted_hosts: Vec::new(),
            show_logs: false,
            server_port: None,
        }
    }
}

/// Everything needed to run one invocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    /// Path to the built script bundle (or a native script host executable).
    pub script: PathBuf,
    /// Schema version the script was built against, e.g. `"2.0.0"`.
    pub version: String,
    pub context: Web3FunctionContextData,
    #[serde(default)]
    pub options: RunnerOptions,
    #[serde(default)]
    pub multi_chain_provider_config: HashMap<u64, String>,
}

/// One on-chain call requested by a script.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallData {
    pub to: String,
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum CallDataPayload {
    /// Schema version 1: a single calldata hex string.
    Legacy(String),
    /// Schema version 2+: one or more calls.
    Calls(Vec<CallData>),
}

/// Validated script outcome.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Web3FunctionResult {
    CannotExec { message: Option<String> },
    CanExec { call_data: CallDataPayload },
}

impl Web3FunctionResult {
    pub fn can_exec(&self) -> bool {
        matches!(self, Web3FunctionResult::CanExec { .. })
    }
}

impl Serialize for Web3FunctionResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        match self {
            Web3FunctionResult::CannotExec { message } => {
                map.serialize_entry("canExec", &false)?;
                if let Some(message) = message {
                    map.serialize_entry("message", message)?;
                }
            }
            Web3FunctionResult::CanExec { call_data } => {
                map.serialize_entry("canExec", &true)?;
                map.serialize_entry("callData", call_data)?;
            }
        }
        map.end()
    }
}

/// `{name, message}` error shape used on the bridge and in results.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub name: String,
    pub message: String,
}

impl From<&crate::error::RuntimeError> for ErrorPayload {
    fn from(err: &crate::error::RuntimeError) -> Self {
        Self {
            name: err.name().to_string(),
            message: err.message().to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcCallStats {
    pub total: u64,
    pub throttled: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStats {
    pub nb_requests: u64,
    pub nb_throttled: u64,
    /// KB received from upstreams.
    pub download: f64,
    /// KB sent to upstreams.
    pub upload: f64,
}

/// Which ceilings an invocation individually exceeded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionThrottled {
    pub duration: bool,
    pub memory: bool,
    pub storage: bool,
    pub network_request: bool,
    pub download: bool,
    pub upload: bool,
    pub rpc_request: bool,
}

impl ExecutionThrottled {
    pub fn any(&self) -> bool {
        self.duration
            || self.memory
            || self.storage
            || self.network_request
            || self.download
            || self.upload
            || self.rpc_request
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StorageResult {
    pub state: StorageState,
    pub data: StorageMap,
    #[serde(rename = "sizeKB")]
    pub size_kb: f64,
}

/// Final outcome of one invocation, with usage statistics.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Web3FunctionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
    pub logs: Vec<String>,
    /// Seconds.
    pub duration: f64,
    /// Peak MB.
    pub memory: f64,
    pub rpc_calls: RpcCallStats,
    pub network: NetworkStats,
    pub throttled: ExecutionThrottled,
}

impl RunnerResult {
    /// Failure with no usage recorded, for runs that never reached a runner.
    pub fn failure(err: &crate::error::RuntimeError) -> Self {
        Self {
            success: false,
            result: None,
            storage: None,
            error: Some(ErrorPayload::from(err)),
            logs: Vec::new(),
            duration: 0.0,
            memory: 0.0,
            rpc_calls: RpcCallStats::default(),
            network: NetworkStats::default(),
            throttled: ExecutionThrottled::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_parses_camel_case_with_defaults() {
        let payload: Payload = serde_json::from_value(json!({
            "script": "/tmp/index.js",
            "version": "2.0.0",
            "context": {
                "chainArgs": { "chainId": 5, "gasPrice": "10", "blockTime": 1700000000 },
                "userArgs": { "currency": "eth" },
                "secrets": { "API_KEY": "k" },
                "storage": { "last": null }
            },
            "options": { "runtime": "docker", "timeout": 5000, "blacklistedHosts": ["evil.com"] },
            "multiChainProviderConfig": { "5": "http://localhost:8545" }
        }))
        .unwrap();

        assert_eq!(payload.options.runtime, RuntimeKind::Docker);
        assert_eq!(payload.options.timeout, 5000);
        assert_eq!(payload.options.memory, DEFAULT_MEMORY_MB);
        assert_eq!(payload.context.chain_args.chain_id, 5);
        assert_eq!(payload.context.storage.get("last"), Some(&None));
        assert_eq!(
            payload.multi_chain_provider_config.get(&5).map(String::as_str),
            Some("http://localhost:8545")
        );
    }

    #[test]
    fn result_serializes_can_exec_shapes() {
        let declined = Web3FunctionResult::CannotExec {
            message: Some("Simple".into()),
        };
        assert_eq!(
            serde_json::to_value(&declined).unwrap(),
            json!({ "canExec": false, "message": "Simple" })
        );

        let exec = Web3FunctionResult::CanExec {
            call_data: CallDataPayload::Calls(vec![CallData {
                to: "0x0000000000000000000000000000000000000001".into(),
                data: "0x00".into(),
                value: None,
            }]),
        };
        assert_eq!(
            serde_json::to_value(&exec).unwrap(),
            json!({
                "canExec": true,
                "callData": [{ "to": "0x0000000000000000000000000000000000000001", "data": "0x00" }]
            })
        );
    }
}
