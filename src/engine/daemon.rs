//! The control loop run by the elected leader.
//!
//! Startup order is fixed: watchers first (and all of them ready), then the
//! optional cold-start and oracle seeding, then workers and the metrics
//! reporter. After that the loop polls the control channel, treats any dead
//! watcher as fatal, respawns dead workers and gives up only when every
//! worker is dead at once.

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use super::backoff::BackoffPolicy;
use super::reporter::{MetricsReporter, WorkerRoster};
use super::shutdown::Shutdown;
use super::worker::{DeployWorker, WorkerHandle};
use crate::bounce::BounceExecutor;
use crate::catalog::{ServiceCatalog, service_instances_with_changed_id};
use crate::cluster::ClusterState;
use crate::coord::Coordinator;
use crate::error::{Error, Result};
use crate::leader::{ControlMessage, ReconnectPolicy};
use crate::model::ServiceInstance;
use crate::queue::{CoordinatedQueue, DelayDeadlineQueue, MemoryQueue};
use crate::telemetry::metrics::MetricsSink;
use crate::watchers::{Watcher, WatcherHandle, rate_limit_instances, spawn_watcher};

/// Tunables for the control loop and everything it starts.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub cluster: String,
    pub number_workers: usize,
    /// Cold-start bounces per minute.
    pub startup_bounce_rate: u32,
    pub cold_start: bool,
    pub oracle: bool,
    pub backoff: BackoffPolicy,
    /// How often the control loop looks at the control channel and pool.
    pub poll_interval: Duration,
    /// How long a worker blocks in `get` before rechecking shutdown.
    pub worker_get_timeout: Duration,
    pub watcher_ready_attempts: u32,
    pub watcher_ready_interval: Duration,
    pub metrics_interval: Duration,
    pub reconnect: ReconnectPolicy,
    pub maintenance_poll_interval: Duration,
    pub file_poll_interval: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            cluster: "default".to_string(),
            number_workers: 4,
            startup_bounce_rate: 30,
            cold_start: true,
            oracle: false,
            backoff: BackoffPolicy::default(),
            poll_interval: Duration::from_millis(100),
            worker_get_timeout: Duration::from_secs(1),
            watcher_ready_attempts: 120,
            watcher_ready_interval: Duration::from_secs(1),
            metrics_interval: Duration::from_secs(20),
            reconnect: ReconnectPolicy::default(),
            maintenance_poll_interval: Duration::from_secs(20),
            file_poll_interval: Duration::from_secs(2),
        }
    }
}

/// Pick the queue implementation for this deployment.
pub fn build_queue(
    distributed: bool,
    client: Arc<dyn Coordinator>,
    root: &str,
) -> Result<Arc<dyn DelayDeadlineQueue>> {
    if distributed {
        info!(root, "using coordinated queue");
        Ok(Arc::new(CoordinatedQueue::new(client, root)?))
    } else {
        info!("using in-memory queue");
        Ok(Arc::new(MemoryQueue::new()?))
    }
}

/// Collaborators the daemon is assembled from.
pub struct DaemonDeps {
    pub queue: Arc<dyn DelayDeadlineQueue>,
    pub executor: Arc<dyn BounceExecutor>,
    pub metrics: Arc<dyn MetricsSink>,
    pub catalog: Arc<dyn ServiceCatalog>,
    pub cluster_state: Arc<dyn ClusterState>,
    pub watchers: Vec<Box<dyn Watcher>>,
}

#[derive(Default)]
struct Running {
    watchers: Vec<WatcherHandle>,
    workers: Vec<WorkerHandle>,
    reporter: Option<JoinHandle<()>>,
    spawned_workers: usize,
}

pub struct DeployDaemon {
    config: DaemonConfig,
    deps: DaemonDeps,
    control_tx: Sender<ControlMessage>,
    control_rx: Receiver<ControlMessage>,
    shutdown: Shutdown,
    roster: WorkerRoster,
    running: Running,
}

impl DeployDaemon {
    pub fn new(config: DaemonConfig, deps: DaemonDeps) -> Self {
        let (control_tx, control_rx) = mpsc::channel();
        Self {
            config,
            deps,
            control_tx,
            control_rx,
            shutdown: Shutdown::new(),
            roster: WorkerRoster::new(),
            running: Running::default(),
        }
    }

    /// Sender for [`ControlMessage`]s. Hand this to the leader election.
    pub fn control(&self) -> Sender<ControlMessage> {
        self.control_tx.clone()
    }

    pub fn roster(&self) -> WorkerRoster {
        self.roster.clone()
    }

    pub fn queue(&self) -> Arc<dyn DelayDeadlineQueue> {
        Arc::clone(&self.deps.queue)
    }

    /// Start everything, supervise until aborted or a fatal condition, then
    /// stop every thread this daemon started.
    pub fn run(mut self) -> Result<()> {
        let result = self.startup().and_then(|()| self.supervise());
        if let Err(e) = &result {
            error!(error = %e, "daemon stopping on fatal error");
        }
        self.stop();
        result
    }

    fn startup(&mut self) -> Result<()> {
        info!(cluster = %self.config.cluster, "daemon starting as leader");
        self.start_watchers()?;
        self.wait_for_watchers()?;

        if self.config.cold_start {
            self.seed_cold_start()?;
        }
        if self.config.oracle {
            self.seed_oracle()?;
        }

        for _ in 0..self.config.number_workers {
            self.spawn_worker()?;
        }
        self.publish_roster();

        let reporter = MetricsReporter::new(
            Arc::clone(&self.deps.queue),
            self.roster.clone(),
            Arc::clone(&self.deps.metrics),
            &self.config.cluster,
            self.config.metrics_interval,
            self.shutdown.clone(),
        );
        self.running.reporter = Some(reporter.spawn()?);
        info!(workers = self.config.number_workers, "daemon started");
        Ok(())
    }

    fn start_watchers(&mut self) -> Result<()> {
        for watcher in std::mem::take(&mut self.deps.watchers) {
            let handle = spawn_watcher(
                watcher,
                Arc::clone(&self.deps.queue),
                self.shutdown.clone(),
            )?;
            self.running.watchers.push(handle);
        }
        Ok(())
    }

    fn wait_for_watchers(&self) -> Result<()> {
        for attempt in 0..=self.config.watcher_ready_attempts {
            self.check_watchers()?;
            let pending: Vec<&str> = self
                .running
                .watchers
                .iter()
                .filter(|w| !w.is_ready())
                .map(WatcherHandle::name)
                .collect();
            if pending.is_empty() {
                info!(count = self.running.watchers.len(), "all watchers ready");
                return Ok(());
            }
            if attempt == self.config.watcher_ready_attempts {
                return Err(Error::Startup(format!(
                    "watchers not ready after {attempt} attempts: {}",
                    pending.join(", ")
                )));
            }
            info!(?pending, attempt, "waiting for watchers");
            if self.shutdown.sleep(self.config.watcher_ready_interval) {
                return Err(Error::Startup("shut down during startup".to_string()));
            }
        }
        Ok(())
    }

    fn check_watchers(&self) -> Result<()> {
        match self.running.watchers.iter().find(|w| !w.is_alive()) {
            Some(dead) => Err(Error::WatcherDied(dead.name().to_string())),
            None => Ok(()),
        }
    }

    fn seed_cold_start(&self) -> Result<()> {
        let instances = self.deps.catalog.all_instances()?;
        info!(
            count = instances.len(),
            rate = self.config.startup_bounce_rate,
            "cold start: enqueueing every instance"
        );
        // A durable queue may still hold bounces from the previous leader.
        let put = self.deps.queue.put_coalesced(rate_limit_instances(
            instances,
            self.config.startup_bounce_rate,
            "daemon_start",
        ))?;
        info!(put, "cold start enqueued");
        Ok(())
    }

    /// Front-load instances already known to be out of steady state.
    fn seed_oracle(&self) -> Result<()> {
        let changed = match service_instances_with_changed_id(
            self.deps.catalog.as_ref(),
            self.deps.cluster_state.as_ref(),
        ) {
            Ok(changed) => changed,
            Err(e) => {
                warn!(error = %e, "oracle: cannot read cluster state, skipping");
                return Ok(());
            }
        };
        info!(count = changed.len(), "oracle: enqueueing changed instances");
        let now = Utc::now();
        let items = changed
            .into_iter()
            .map(|(service, instance)| {
                ServiceInstance::new(service, instance, "oracle").bounce_by(now)
            })
            .collect();
        self.deps.queue.put_coalesced(items)?;
        Ok(())
    }

    fn spawn_worker(&mut self) -> Result<()> {
        self.running.spawned_workers += 1;
        let worker = DeployWorker::new(
            format!("worker-{}", self.running.spawned_workers),
            Arc::clone(&self.deps.queue),
            Arc::clone(&self.deps.executor),
            Arc::clone(&self.deps.metrics),
            &self.config.cluster,
            self.config.backoff,
            self.config.worker_get_timeout,
            self.shutdown.clone(),
        );
        self.running.workers.push(worker.spawn()?);
        Ok(())
    }

    fn publish_roster(&self) {
        self.roster
            .replace(self.running.workers.iter().map(WorkerHandle::status).collect());
    }

    fn supervise(&mut self) -> Result<()> {
        loop {
            match self.control_rx.recv_timeout(self.config.poll_interval) {
                Ok(ControlMessage::Abort) => {
                    info!("abort received");
                    return Ok(());
                }
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => {}
            }

            self.check_watchers()?;

            let workers = std::mem::take(&mut self.running.workers);
            if !workers.is_empty() && workers.iter().all(|w| !w.is_alive()) {
                self.running.workers = workers;
                return Err(Error::AllWorkersDead);
            }
            let (alive, dead): (Vec<_>, Vec<_>) = workers.into_iter().partition(|w| w.is_alive());
            self.running.workers = alive;
            if dead.is_empty() {
                continue;
            }
            for worker in dead {
                warn!(worker = worker.name(), "worker died; respawning");
                worker.join();
            }
            while self.running.workers.len() < self.config.number_workers {
                self.spawn_worker()?;
            }
            self.publish_roster();
        }
    }

    fn stop(&mut self) {
        info!("stopping daemon threads");
        self.shutdown.trigger();
        for worker in self.running.workers.drain(..) {
            worker.join();
        }
        for watcher in self.running.watchers.drain(..) {
            watcher.join();
        }
        if let Some(reporter) = self.running.reporter.take() {
            let _ = reporter.join();
        }
        self.roster.replace(Vec::new());
    }
}
