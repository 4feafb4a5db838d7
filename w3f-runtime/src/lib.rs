//! Sandbox orchestration runtime for Web3 Functions.
//!
//! This crate runs untrusted function scripts inside isolated, resource-bounded
//! sandboxes (an OS process under Deno, or a Docker container), bridges a
//! request/response protocol to them over loopback HTTP, and meters every RPC
//! and outbound HTTP call they make through per-invocation proxies.

pub mod bridge;
pub mod config;
pub mod error;
pub mod events;
pub mod http;
pub mod http_proxy;
pub mod metrics;
pub mod net_helper;
pub mod pool;
pub mod proxy_provider;
pub mod runner;
pub mod sandbox;
pub mod sdk;
pub mod types;
pub mod validation;

pub use config::RuntimeConfig;
pub use error::{Result, RuntimeError};
pub use events::{Event, StorageState};
pub use pool::RunnerPool;
pub use runner::{Runner, RunnerState, request_shutdown};
pub use sandbox::{Sandbox, SandboxStartParams, create_sandbox};
pub use sdk::{Web3FunctionContext, Web3FunctionHost};
pub use types::{
    Payload, RunnerOptions, RunnerResult, RuntimeKind, Web3FunctionContextData,
    Web3FunctionResult,
};

/// Environment variable carrying the bridge server port inside the sandbox.
pub const ENV_SERVER_PORT: &str = "W3F_SERVER_PORT";
/// Environment variable carrying the bridge mount path inside the sandbox.
pub const ENV_MOUNT_PATH: &str = "W3F_MOUNT_PATH";
/// Optional bind address for the bridge server (containers listen on all interfaces).
pub const ENV_SERVER_HOST: &str = "W3F_SERVER_HOST";

/// Exit code a script host uses when it was stopped for exceeding the RPC limit.
pub const RPC_LIMIT_EXIT_CODE: i32 = 250;
/// Ports leased per invocation: bridge server, http proxy, rpc provider.
pub const PORTS_PER_RUN: usize = 3;

pub const DEFAULT_DENO_PATH: &str = "deno";
pub const DEFAULT_DOCKER_IMAGE: &str = "denoland/deno:alpine-1.46.3";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MEMORY_MB: u64 = 128;
