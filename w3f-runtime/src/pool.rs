//! Bounded-concurrency runner pool.
//!
//! Jobs queue FIFO. At most `pool_size` runners are active at once, each
//! holding three ports leased from a pre-allocated free list. Ports come back
//! through a drop guard, so a failing or panicking run still returns them.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{OnceCell, oneshot};

use crate::PORTS_PER_RUN;
use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::net_helper::net_helper;
use crate::runner::Runner;
use crate::sandbox::{SandboxFactory, default_factory};
use crate::types::{Payload, RunnerResult};

struct Job {
    payload: Payload,
    reply: oneshot::Sender<RunnerResult>,
}

#[derive(Default)]
struct PoolState {
    queue: VecDeque<Job>,
    free_ports: Vec<u16>,
    active: usize,
}

struct PoolInner {
    pool_size: usize,
    config: RuntimeConfig,
    factory: SandboxFactory,
    state: Mutex<PoolState>,
    ports_ready: OnceCell<()>,
}

impl PoolInner {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Clone)]
pub struct RunnerPool {
    inner: Arc<PoolInner>,
}

impl RunnerPool {
    pub fn new(pool_size: usize, config: RuntimeConfig) -> Self {
        let factory = default_factory(config.clone());
        Self::with_factory(pool_size, config, factory)
    }

    /// Pool building sandboxes through a custom factory.
    pub fn with_factory(pool_size: usize, config: RuntimeConfig, factory: SandboxFactory) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                pool_size: pool_size.max(1),
                config,
                factory,
                state: Mutex::new(PoolState::default()),
                ports_ready: OnceCell::new(),
            }),
        }
    }

    /// Pre-allocate `(pool_size + headroom) * 3` ports. Runs once; later calls
    /// are no-ops. [`RunnerPool::run`] calls it on demand.
    pub async fn init(&self) -> Result<()> {
        let inner = &self.inner;
        inner
            .ports_ready
            .get_or_try_init(|| async {
                let count = (inner.pool_size + inner.config.pool_headroom) * PORTS_PER_RUN;
                let ports = net_helper().get_available_ports(count).await?;
                tracing::info!(
                    pool_size = inner.pool_size,
                    ports = ports.len(),
                    "Runner pool initialized"
                );
                inner.state().free_ports.extend(ports);
                Ok::<(), RuntimeError>(())
            })
            .await?;
        Ok(())
    }

    /// Queue the payload and wait for its result. Dropping the returned
    /// future before the job starts removes it from the queue.
    pub async fn run(&self, payload: Payload) -> RunnerResult {
        if let Err(err) = self.init().await {
            return RunnerResult::failure(&err);
        }
        let (reply, result) = oneshot::channel();
        self.inner.state().queue.push_back(Job { payload, reply });
        drain(&self.inner);

        match result.await {
            Ok(result) => result,
            Err(_) => RunnerResult::failure(&RuntimeError::Crash(
                "Runner terminated without producing a result".into(),
            )),
        }
    }

    pub fn active_count(&self) -> usize {
        self.inner.state().active
    }

    pub fn queued_count(&self) -> usize {
        self.inner.state().queue.len()
    }

    pub fn free_port_count(&self) -> usize {
        self.inner.state().free_ports.len()
    }
}

/// Start queued jobs while there is a free slot and enough free ports.
fn drain(inner: &Arc<PoolInner>) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        return;
    };
    loop {
        let (job, ports) = {
            let mut state = inner.state();
            if state.active >= inner.pool_size {
                return;
            }
            while state.queue.front().is_some_and(|job| job.reply.is_closed()) {
                state.queue.pop_front();
                tracing::debug!("Skipping cancelled job");
            }
            if state.free_ports.len() < PORTS_PER_RUN {
                return;
            }
            let Some(job) = state.queue.pop_front() else {
                return;
            };
            let split = state.free_ports.len() - PORTS_PER_RUN;
            let ports = state.free_ports.split_off(split);
            state.active += 1;
            (job, ports)
        };
        runtime.spawn(run_job(inner.clone(), job, ports));
    }
}

async fn run_job(inner: Arc<PoolInner>, job: Job, ports: Vec<u16>) {
    let lease = LeaseGuard {
        inner: inner.clone(),
        ports: ports.clone(),
    };
    let runner = Runner::new(inner.config.clone(), inner.factory.clone()).with_ports(ports);
    let result = runner.run(job.payload).await;
    // Ports go back before the caller wakes up.
    drop(lease);
    let _ = job.reply.send(result);
}

/// Returns leased ports and the slot, then starts whatever is next.
struct LeaseGuard {
    inner: Arc<PoolInner>,
    ports: Vec<u16>,
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state();
            state.free_ports.append(&mut self.ports);
            state.active = state.active.saturating_sub(1);
        }
        drain(&self.inner);
    }
}
