use std::fmt;

/// Errors returned by runtime operations.
///
/// The first six variants classify why an invocation failed; the runner
/// converts every one of them into the failure variant of
/// [`RunnerResult`](crate::types::RunnerResult). The remaining variants are
/// infrastructure failures raised by individual components.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RuntimeError {
    /// Sandbox failed to launch or never became reachable.
    Startup(String),
    /// Malformed or unexpected event crossing the transport bridge.
    Protocol(String),
    /// A configured ceiling was exceeded (time, memory, storage, rpc, network).
    Quota(String),
    /// The script returned a structurally invalid result.
    ResultShape(String),
    /// The sandbox exited before producing a result.
    Crash(String),
    /// The script itself reported an error.
    Script(String),
    /// Docker/container runtime failure.
    Docker(String),
    /// HTTP transport failure.
    Http(String),
    /// Invalid input or configuration.
    Validation(String),
    /// Local I/O failure (sockets, processes).
    Io(String),
}

impl RuntimeError {
    /// Stable name of the error class, used in serialized failures.
    pub fn name(&self) -> &'static str {
        match self {
            RuntimeError::Startup(_) => "StartupError",
            RuntimeError::Protocol(_) => "ProtocolError",
            RuntimeError::Quota(_) => "QuotaError",
            RuntimeError::ResultShape(_) => "ResultShapeError",
            RuntimeError::Crash(_) => "CrashError",
            RuntimeError::Script(_) => "Web3FunctionError",
            RuntimeError::Docker(_) => "DockerError",
            RuntimeError::Http(_) => "HttpError",
            RuntimeError::Validation(_) => "ValidationError",
            RuntimeError::Io(_) => "IoError",
        }
    }

    /// The bare message, without the class prefix.
    pub fn message(&self) -> &str {
        match self {
            RuntimeError::Startup(msg)
            | RuntimeError::Protocol(msg)
            | RuntimeError::Quota(msg)
            | RuntimeError::ResultShape(msg)
            | RuntimeError::Crash(msg)
            | RuntimeError::Script(msg)
            | RuntimeError::Docker(msg)
            | RuntimeError::Http(msg)
            | RuntimeError::Validation(msg)
            | RuntimeError::Io(msg) => msg,
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::Startup(msg) => write!(f, "startup error: {msg}"),
            RuntimeError::Protocol(msg) => write!(f, "protocol error: {msg}"),
            RuntimeError::Quota(msg) => write!(f, "quota exceeded: {msg}"),
            RuntimeError::ResultShape(msg) => write!(f, "invalid result: {msg}"),
            RuntimeError::Crash(msg) => write!(f, "crash: {msg}"),
            RuntimeError::Script(msg) => write!(f, "web3 function error: {msg}"),
            RuntimeError::Docker(msg) => write!(f, "docker error: {msg}"),
            RuntimeError::Http(msg) => write!(f, "http error: {msg}"),
            RuntimeError::Validation(msg) => write!(f, "validation error: {msg}"),
            RuntimeError::Io(msg) => write!(f, "io error: {msg}"),
        }
    }
}

impl std::error::Error for RuntimeError {}

impl From<std::io::Error> for RuntimeError {
    fn from(err: std::io::Error) -> Self {
        RuntimeError::Io(err.to_string())
    }
}

impl From<reqwest::Error> for RuntimeError {
    fn from(err: reqwest::Error) -> Self {
        RuntimeError::Http(err.to_string())
    }
}

impl From<serde_json::Error> for RuntimeError {
    fn from(err: serde_json::Error) -> Self {
        RuntimeError::Protocol(format!("invalid JSON: {err}"))
    }
}

/// Convert RuntimeError to String for callers that surface plain messages.
impl From<RuntimeError> for String {
    fn from(err: RuntimeError) -> Self {
        err.to_string()
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
