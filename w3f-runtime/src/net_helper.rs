//! Ephemeral port allocation.
//!
//! Ports are reserved in-process before the OS availability probe, so two
//! concurrent allocations can never hand out the same port even though the
//! probe listener is closed again before the caller binds it.

use once_cell::sync::OnceCell;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Mutex;
use tokio::net::TcpListener;

use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};

pub struct NetHelper {
    reserved: Mutex<HashSet<u16>>,
    range_start: u16,
    range_end: u16,
    retries: u32,
}

static NET_HELPER: OnceCell<NetHelper> = OnceCell::new();

/// Process-wide allocator configured from [`RuntimeConfig::load`].
pub fn net_helper() -> &'static NetHelper {
    NET_HELPER.get_or_init(|| NetHelper::new(RuntimeConfig::load()))
}

impl NetHelper {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self::with_range(
            config.port_range_start,
            config.port_range_end,
            config.port_retries,
        )
    }

    pub fn with_range(range_start: u16, range_end: u16, retries: u32) -> Self {
        let range_end = range_end.max(range_start);
        Self {
            reserved: Mutex::new(HashSet::new()),
            range_start,
            range_end,
            retries: retries.max(1),
        }
    }

    /// Allocate one port that is free on this host and not held by any other
    /// caller of this allocator.
    pub async fn get_available_port(&self) -> Result<u16> {
        for attempt in 1..=self.retries {
            let Some(candidate) = self.reserve_candidate() else {
                continue;
            };
            if is_port_free(candidate).await {
                tracing::trace!(port = candidate, attempt, "Allocated port");
                return Ok(candidate);
            }
            self.release_port(candidate);
        }
        Err(RuntimeError::Startup(format!(
            "no available port in {}..={} after {} attempts",
            self.range_start, self.range_end, self.retries
        )))
    }

    /// Allocate `count` distinct ports. On failure every port taken so far is
    /// released again.
    pub async fn get_available_ports(&self, count: usize) -> Result<Vec<u16>> {
        let mut ports = Vec::with_capacity(count);
        for _ in 0..count {
            match self.get_available_port().await {
                Ok(port) => ports.push(port),
                Err(err) => {
                    self.release_ports(&ports);
                    return Err(err);
                }
            }
        }
        Ok(ports)
    }

    pub fn release_port(&self, port: u16) {
        self.lock().remove(&port);
    }

    pub fn release_ports(&self, ports: &[u16]) {
        let mut reserved = self.lock();
        for port in ports {
            reserved.remove(port);
        }
    }

    /// Number of ports currently handed out.
    pub fn reserved_count(&self) -> usize {
        self.lock().len()
    }

    fn reserve_candidate(&self) -> Option<u16> {
        let candidate = rand::thread_rng().gen_range(self.range_start..=self.range_end);
        self.lock().insert(candidate).then_some(candidate)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<u16>> {
        self.reserved
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Probe on all interfaces: that also fails when only loopback holds the port.
pub async fn is_port_free(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn concurrent_allocations_never_collide() {
        let helper = Arc::new(NetHelper::with_range(15000, 15400, 50));
        let mut handles = Vec::new();
        for _ in 0..20 {
            let helper = helper.clone();
            handles.push(tokio::spawn(
                async move { helper.get_available_ports(3).await },
            ));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for port in handle.await.unwrap().unwrap() {
                assert!(seen.insert(port), "port {port} handed out twice");
            }
        }
        assert_eq!(helper.reserved_count(), 60);
    }

    #[tokio::test]
    async fn exhausted_range_fails_and_releases() {
        let helper = NetHelper::with_range(16000, 16001, 40);
        let first = helper.get_available_ports(2).await.unwrap();
        assert_eq!(first.len(), 2);

        let err = helper.get_available_port().await.unwrap_err();
        assert!(matches!(err, RuntimeError::Startup(_)));

        helper.release_ports(&first);
        assert_eq!(helper.reserved_count(), 0);
    }

    #[tokio::test]
    async fn busy_port_is_skipped() {
        let listener = std::net::TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let busy = listener.local_addr().unwrap().port();
        let helper = NetHelper::with_range(busy, busy, 3);

        assert!(helper.get_available_port().await.is_err());
        assert_eq!(helper.reserved_count(), 0);
    }
}
