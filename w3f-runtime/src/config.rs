use once_cell::sync::OnceCell;
use std::env;
use std::time::Duration;

use crate::{DEFAULT_DENO_PATH, DEFAULT_DOCKER_IMAGE};

/// Runtime configuration loaded once at startup from environment variables.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub deno_path: String,
    pub docker_image: String,
    pub docker_host: Option<String>,
    pub pull_image: bool,
    /// How long the bridge client polls the sandbox before giving up.
    pub connect_timeout: Duration,
    /// Delay after a sandbox exit before concluding no result is coming.
    pub exit_grace: Duration,
    pub memory_sample_interval: Duration,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub port_retries: u32,
    /// Extra invocations worth of ports a pool pre-allocates.
    pub pool_headroom: usize,
}

static RUNTIME_CONFIG: OnceCell<RuntimeConfig> = OnceCell::new();

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            deno_path: DEFAULT_DENO_PATH.to_string(),
            docker_image: DEFAULT_DOCKER_IMAGE.to_string(),
            docker_host: None,
            pull_image: true,
            connect_timeout: Duration::from_secs(10),
            exit_grace: Duration::from_millis(250),
            memory_sample_interval: Duration::from_millis(100),
            // Must stay below the kernel's ephemeral range (32768 and up).
            port_range_start: 20000,
            port_range_end: 32000,
            port_retries: 20,
            pool_headroom: 1,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from environment variables.
    /// Cached after the first call. Later calls return the same config.
    pub fn load() -> &'static RuntimeConfig {
        RUNTIME_CONFIG.get_or_init(Self::from_env)
    }

    /// Build a fresh configuration from the current environment, without caching.
    pub fn from_env() -> RuntimeConfig {
        let defaults = RuntimeConfig::default();

        let deno_path = env::var("W3F_DENO_PATH").unwrap_or(defaults.deno_path);
        let docker_image = env::var("W3F_DOCKER_IMAGE").unwrap_or(defaults.docker_image);
        let docker_host = env::var("DOCKER_HOST").ok().filter(|v| !v.trim().is_empty());
        let pull_image = env::var("W3F_PULL_IMAGE")
            .ok()
            .and_then(|v| v.parse::<bool>().ok())
            .unwrap_or(defaults.pull_image);
        let connect_timeout =
            env_millis("W3F_CONNECT_TIMEOUT_MS").unwrap_or(defaults.connect_timeout);
        let exit_grace = env_millis("W3F_EXIT_GRACE_MS").unwrap_or(defaults.exit_grace);
        let memory_sample_interval =
            env_millis("W3F_MEMORY_SAMPLE_MS").unwrap_or(defaults.memory_sample_interval);
        let port_range_start = env::var("W3F_PORT_RANGE_START")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(defaults.port_range_start);
        let port_range_end = env::var("W3F_PORT_RANGE_END")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .filter(|end| *end > port_range_start)
            .unwrap_or(defaults.port_range_end.max(port_range_start.saturating_add(1)));
        let port_retries = env::var("W3F_PORT_RETRIES")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(defaults.port_retries);
        let pool_headroom = env::var("W3F_POOL_HEADROOM")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults.pool_headroom);

        RuntimeConfig {
            deno_path,
            docker_image,
            docker_host,
            pull_image,
            connect_timeout,
            exit_grace,
            memory_sample_interval,
            port_range_start,
            port_range_end,
            port_retries,
            pool_headroom,
        }
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn from_env_reads_overrides() {
        // SAFETY: serialized test; no concurrent env access.
        unsafe {
            env::set_var("W3F_CONNECT_TIMEOUT_MS", "2500");
            env::set_var("W3F_POOL_HEADROOM", "3");
            env::set_var("W3F_PULL_IMAGE", "false");
        }
        let config = RuntimeConfig::from_env();
        unsafe {
            env::remove_var("W3F_CONNECT_TIMEOUT_MS");
            env::remove_var("W3F_POOL_HEADROOM");
            env::remove_var("W3F_PULL_IMAGE");
        }

        assert_eq!(config.connect_timeout, Duration::from_millis(2500));
        assert_eq!(config.pool_headroom, 3);
        assert!(!config.pull_image);
    }

    #[test]
    #[serial]
    fn invalid_port_range_falls_back() {
        unsafe {
            env::set_var("W3F_PORT_RANGE_START", "50000");
            env::set_var("W3F_PORT_RANGE_END", "40000");
        }
        let config = RuntimeConfig::from_env();
        unsafe {
            env::remove_var("W3F_PORT_RANGE_START");
            env::remove_var("W3F_PORT_RANGE_END");
        }

        assert_eq!(config.port_range_start, 50000);
        assert!(config.port_range_end > config.port_range_start);
    }

    #[test]
    fn default_range_avoids_ephemeral_ports() {
        let config = RuntimeConfig::default();
        // Linux hands out 32768-60999 for outgoing connections and port 0.
        assert!(config.port_range_end < 32768);
        assert!(config.port_range_start < config.port_range_end);
    }
}
