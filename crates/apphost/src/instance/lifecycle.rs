//! Drives registry transitions through the port pool and the supervisor.
//!
//! Every start runs as `RequestStart -> PortLeased -> SpawnSucceeded|SpawnFailed`,
//! every stop as `RequestStop -> StopConfirmed`. The blocking parts (spawning,
//! readiness, stopping) run on their own tasks so a dropped caller can never
//! strand an instance mid-transition. Leases are handed back to the pool through
//! [`Lifecycle::release`] on every path that ends a generation.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::models::{Instance, InstanceEvent, InstanceKey, InstanceState};
use super::registry::Registry;
use crate::checkout::CheckoutProvider;
use crate::error::{HostError, HostResult};
use crate::supervisor::{
    ExitReport, Health, LaunchConfig, PortLease, PortPool, ProcessHandle, ProcessSupervisor,
};

/// Settings for the lifecycle driver.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Directory holding one log file per instance.
    pub logs_dir: PathBuf,
    pub launch: LaunchConfig,
}

struct Inner {
    registry: Arc<Registry>,
    pool: Arc<PortPool>,
    supervisor: ProcessSupervisor,
    checkouts: Arc<dyn CheckoutProvider>,
    config: LifecycleConfig,
}

/// Start/stop/restart orchestration for instances.
#[derive(Clone)]
pub struct Lifecycle {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("instances", &self.inner.registry.len())
            .field("free_ports", &self.inner.pool.free_count())
            .finish()
    }
}

impl Lifecycle {
    pub fn new(
        registry: Arc<Registry>,
        pool: Arc<PortPool>,
        supervisor: ProcessSupervisor,
        checkouts: Arc<dyn CheckoutProvider>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                pool,
                supervisor,
                checkouts,
                config,
            }),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    pub fn pool(&self) -> &Arc<PortPool> {
        &self.inner.pool
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.inner.supervisor
    }

    /// Log file of an instance.
    pub fn log_path(&self, key: &InstanceKey) -> PathBuf {
        self.inner.config.logs_dir.join(key.log_file_name())
    }

    /// Start an instance, creating it if needed.
    ///
    /// Starting a running instance is a no-op. A start or stop already in flight
    /// for the key yields `Busy`.
    pub async fn start(&self, key: &InstanceKey) -> HostResult<Instance> {
        let registry = &self.inner.registry;
        registry.ensure(key);

        let generation = match registry.transition(key, InstanceEvent::RequestStart) {
            Ok(outcome) => outcome.instance.generation,
            Err(HostError::InvalidTransition { .. }) => {
                let current = registry.get(key)?;
                if current.state == InstanceState::Running {
                    debug!("{} is already running", key);
                    return Ok(current);
                }
                return Err(HostError::Busy(key.to_string()));
            }
            Err(e) => return Err(e),
        };

        let this = self.clone();
        let key = key.clone();
        detached(async move { this.run_start(&key, generation).await }).await
    }

    async fn run_start(&self, key: &InstanceKey, generation: u64) -> HostResult<Instance> {
        let registry = &self.inner.registry;

        let lease = match self.inner.pool.lease() {
            Ok(lease) => lease,
            Err(e) => {
                warn!("{}: {}", key, e);
                self.fail_start(key, generation, e.to_string(), None);
                return Err(e);
            }
        };

        let outcome = match registry.transition(key, InstanceEvent::PortLeased { generation, lease }) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.release(Some(lease));
                return Err(e);
            }
        };
        if outcome.instance.state == InstanceState::Stopped {
            info!("{}: start cancelled before launch", key);
            self.release(outcome.released);
            return Ok(outcome.instance);
        }

        let spawned = async {
            let checkout = self.inner.checkouts.prepare(key).await?;
            let spec = self
                .inner
                .config
                .launch
                .spawn_spec(key, &checkout, lease.port(), self.log_path(key));
            self.inner.supervisor.start(&spec).await
        }
        .await;

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                let reason = match e {
                    HostError::SpawnFailed(reason) => reason,
                    other => other.to_string(),
                };
                warn!("{} generation {} failed to start: {}", key, generation, reason);
                self.fail_start(key, generation, reason.clone(), Some(lease));
                return Err(HostError::SpawnFailed(reason));
            }
        };

        match registry.transition(
            key,
            InstanceEvent::SpawnSucceeded {
                generation,
                handle: handle.clone(),
            },
        ) {
            Ok(outcome) if outcome.instance.state == InstanceState::Stopping => {
                info!("{}: applying stop requested during start", key);
                self.finish_stop(key, generation, &handle).await
            }
            Ok(outcome) => {
                self.watch_exit(key.clone(), generation, handle);
                Ok(outcome.instance)
            }
            Err(e) => {
                self.inner
                    .supervisor
                    .stop(&handle, self.inner.supervisor.config().stop_grace())
                    .await;
                self.release(Some(lease));
                Err(e)
            }
        }
    }

    fn fail_start(
        &self,
        key: &InstanceKey,
        generation: u64,
        reason: String,
        lease: Option<PortLease>,
    ) {
        match self
            .inner
            .registry
            .transition(key, InstanceEvent::SpawnFailed { generation, reason })
        {
            Ok(outcome) => self.release(outcome.released),
            Err(e) => debug!("{}: {}", key, e),
        }
        self.release(lease);
    }

    /// Stop an instance and keep it registered as `Stopped`.
    ///
    /// If a start is still in flight the stop is recorded and applied as soon as the
    /// start resolves; the returned snapshot then has `stop_pending` set.
    pub async fn stop(&self, key: &InstanceKey) -> HostResult<Instance> {
        let outcome = self
            .inner
            .registry
            .transition(key, InstanceEvent::RequestStop)?;
        let instance = outcome.instance;

        if instance.state != InstanceState::Stopping {
            return Ok(instance);
        }

        let generation = instance.generation;
        match instance.process {
            Some(handle) => {
                let this = self.clone();
                let key = key.clone();
                detached(async move { this.finish_stop(&key, generation, &handle).await }).await
            }
            None => self.confirm_stop(key, generation),
        }
    }

    async fn finish_stop(
        &self,
        key: &InstanceKey,
        generation: u64,
        handle: &ProcessHandle,
    ) -> HostResult<Instance> {
        let grace = self.inner.supervisor.config().stop_grace();
        let report = self.inner.supervisor.stop(handle, grace).await;
        handle
            .logs()
            .note(&format!("Stopped: {}", report.status_text()))
            .await;
        self.confirm_stop(key, generation)
    }

    fn confirm_stop(&self, key: &InstanceKey, generation: u64) -> HostResult<Instance> {
        let outcome = self
            .inner
            .registry
            .transition(key, InstanceEvent::StopConfirmed { generation })?;
        self.release(outcome.released);
        Ok(outcome.instance)
    }

    /// Stop (if running) then start with a new generation.
    pub async fn restart(&self, key: &InstanceKey) -> HostResult<Instance> {
        let current = self.inner.registry.ensure(key);
        if current.in_flight() {
            return Err(HostError::Busy(key.to_string()));
        }
        if current.state == InstanceState::Running {
            self.stop(key).await?;
        }
        self.start(key).await
    }

    /// Stop if needed and drop the instance from the registry.
    pub async fn remove(&self, key: &InstanceKey) -> HostResult<Instance> {
        let current = self.inner.registry.get(key)?;
        if current.in_flight() {
            return Err(HostError::Busy(key.to_string()));
        }
        if current.state == InstanceState::Running {
            self.stop(key).await?;
        }
        self.inner.registry.remove(key)
    }

    /// Record an unexpected exit. Stale generations and non-running states are ignored.
    pub fn handle_exit(&self, key: &InstanceKey, generation: u64, reason: String) {
        match self
            .inner
            .registry
            .transition(key, InstanceEvent::ExternalCrash { generation, reason: reason.clone() })
        {
            Ok(outcome) => {
                warn!("{} generation {} crashed: {}", key, generation, reason);
                self.release(outcome.released);
            }
            Err(e) => debug!("Exit of {} generation {} not applied: {}", key, generation, e),
        }
    }

    fn watch_exit(&self, key: InstanceKey, generation: u64, handle: ProcessHandle) {
        let this = self.clone();
        tokio::spawn(async move {
            let report: ExitReport = handle.wait().await;
            this.handle_exit(&key, generation, report.describe());
        });
    }

    /// Periodically check running instances and report dead ones as crashed.
    pub fn spawn_health_monitor(&self, interval: Duration) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                this.sweep();
            }
        })
    }

    /// One health sweep. Returns the number of instances found dead.
    pub fn sweep(&self) -> usize {
        let mut dead = 0;
        for (key, generation, handle) in self.inner.registry.running() {
            if self.inner.supervisor.health_check(&handle) == Health::Dead {
                dead += 1;
                let reason = handle
                    .exit_report()
                    .map(|r| r.describe())
                    .unwrap_or_else(|| format!("process {} is no longer alive", handle.pid()));
                self.handle_exit(&key, generation, reason);
            }
        }
        dead
    }

    /// Stop every instance. Used on shutdown.
    pub async fn stop_all(&self) -> usize {
        let keys: Vec<InstanceKey> = self
            .inner
            .registry
            .list()
            .into_iter()
            .filter(|i| matches!(i.state, InstanceState::Running) || i.in_flight())
            .map(|i| i.key)
            .collect();

        if keys.is_empty() {
            return 0;
        }
        info!("Stopping {} instance(s)", keys.len());

        let results = join_all(keys.iter().map(|key| self.stop(key))).await;
        let mut stopped = 0;
        for (key, result) in keys.iter().zip(results) {
            match result {
                Ok(_) => stopped += 1,
                Err(e) => warn!("Failed to stop {}: {}", key, e),
            }
        }
        stopped
    }

    /// Hand leases back to the pool. Every path that ends a generation goes through here.
    fn release(&self, lease: Option<PortLease>) {
        if let Some(lease) = lease {
            self.inner.pool.release(lease);
        }
    }
}

/// Run a lifecycle step on its own task so cancelling the caller cannot cut it short.
async fn detached<T, F>(fut: F) -> HostResult<T>
where
    T: Send + 'static,
    F: Future<Output = HostResult<T>> + Send + 'static,
{
    tokio::spawn(fut)
        .await
        .map_err(|e| HostError::Io(format!("lifecycle task failed: {}", e)))?
}
