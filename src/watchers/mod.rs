//! Watchers: producers that turn external signals into queued bounces.
//!
//! Each watcher runs on its own thread, flips its ready flag once its
//! subscription is established, and from then on enqueues the instances a
//! change affects. A watcher thread that ends while the daemon is running
//! counts as dead.

pub mod autoscaler;
pub mod maintenance;
pub mod public_config;
pub mod soa_files;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tracing::{error, info};

use crate::catalog::{InstanceKey, ServiceCatalog};
use crate::cluster::{ClusterState, DrainRegistry};
use crate::coord::Coordinator;
use crate::engine::shutdown::Shutdown;
use crate::error::{Error, Result};
use crate::model::ServiceInstance;
use crate::queue::DelayDeadlineQueue;

pub use autoscaler::AutoscalerWatcher;
pub use maintenance::MaintenanceWatcher;
pub use public_config::PublicConfigWatcher;
pub use soa_files::SoaFileWatcher;

/// Space items `60 / per_minute` seconds apart, starting now, in both
/// `wait_until` and `bounce_by`.
pub fn rate_limit_instances(
    instances: impl IntoIterator<Item = InstanceKey>,
    per_minute: u32,
    watcher: &str,
) -> Vec<ServiceInstance> {
    let now = Utc::now();
    let step_ms = 60_000 / i64::from(per_minute.max(1));
    instances
        .into_iter()
        .enumerate()
        .map(|(i, (service, instance))| {
            let at = now + TimeDelta::milliseconds(step_ms * i as i64);
            ServiceInstance::new(service, instance, watcher)
                .wait_until(at)
                .bounce_by(at)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Watcher runtime
// ---------------------------------------------------------------------------

/// What a running watcher gets to work with.
pub struct WatcherContext {
    pub queue: Arc<dyn DelayDeadlineQueue>,
    pub shutdown: Shutdown,
    ready: Arc<AtomicBool>,
}

impl WatcherContext {
    pub fn new(queue: Arc<dyn DelayDeadlineQueue>, shutdown: Shutdown) -> Self {
        Self {
            queue,
            shutdown,
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Enqueue fresh, urgent bounces for `instances`. Instances that already
    /// have an equally urgent bounce pending are left alone.
    pub fn enqueue_now(&self, instances: Vec<InstanceKey>, watcher: &str) -> Result<()> {
        let items = instances
            .into_iter()
            .map(|(service, instance)| ServiceInstance::new(service, instance, watcher))
            .collect();
        self.enqueue(items, watcher)
    }

    /// Enqueue prepared items, coalescing with what is already pending.
    pub fn enqueue(&self, items: Vec<ServiceInstance>, watcher: &str) -> Result<()> {
        let offered = items.len();
        let put = self.queue.put_coalesced(items)?;
        info!(watcher, offered, put, "enqueued bounces");
        Ok(())
    }
}

pub trait Watcher: Send {
    fn name(&self) -> &'static str;

    /// Establish the subscription, call [`WatcherContext::mark_ready`], then
    /// react to changes until shutdown.
    fn run(self: Box<Self>, ctx: WatcherContext) -> Result<()>;
}

pub struct WatcherHandle {
    name: &'static str,
    ready: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl WatcherHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn is_alive(&self) -> bool {
        !self.thread.is_finished()
    }

    pub fn join(self) {
        let _ = self.thread.join();
    }
}

/// Start `watcher` on a thread named after it.
pub fn spawn_watcher(
    watcher: Box<dyn Watcher>,
    queue: Arc<dyn DelayDeadlineQueue>,
    shutdown: Shutdown,
) -> Result<WatcherHandle> {
    let name = watcher.name();
    let ctx = WatcherContext::new(queue, shutdown);
    let ready = Arc::clone(&ctx.ready);
    let thread = thread::Builder::new()
        .name(format!("watcher-{name}"))
        .spawn(move || {
            info!(watcher = name, "watcher starting");
            match watcher.run(ctx) {
                Ok(()) => info!(watcher = name, "watcher stopped"),
                Err(e) => error!(watcher = name, error = %e, "watcher failed"),
            }
        })?;
    Ok(WatcherHandle {
        name,
        ready,
        thread,
    })
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Every watcher the daemon knows how to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatcherKind {
    Autoscaler,
    SoaFiles,
    PublicConfig,
    Maintenance,
}

impl WatcherKind {
    pub const ALL: [WatcherKind; 4] = [
        WatcherKind::Autoscaler,
        WatcherKind::SoaFiles,
        WatcherKind::PublicConfig,
        WatcherKind::Maintenance,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WatcherKind::Autoscaler => "autoscaler",
            WatcherKind::SoaFiles => "soa_files",
            WatcherKind::PublicConfig => "public_config",
            WatcherKind::Maintenance => "maintenance",
        }
    }

    pub fn build(self, deps: &WatcherDeps) -> Box<dyn Watcher> {
        match self {
            WatcherKind::Autoscaler => Box::new(AutoscalerWatcher::new(
                Arc::clone(&deps.coordinator),
                &deps.autoscaling_root,
                deps.poll_interval,
            )),
            WatcherKind::SoaFiles => Box::new(SoaFileWatcher::new(
                Arc::clone(&deps.catalog),
                Arc::clone(&deps.cluster_state),
                deps.file_poll_interval,
            )),
            WatcherKind::PublicConfig => Box::new(PublicConfigWatcher::new(
                Arc::clone(&deps.catalog),
                Arc::clone(&deps.cluster_state),
                deps.big_bounce_rate,
                deps.file_poll_interval,
            )),
            WatcherKind::Maintenance => Box::new(MaintenanceWatcher::new(
                Arc::clone(&deps.drains),
                Arc::clone(&deps.cluster_state),
                deps.maintenance_poll_interval,
            )),
        }
    }
}

impl fmt::Display for WatcherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WatcherKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        WatcherKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s.trim())
            .ok_or_else(|| Error::Config(format!("unknown watcher: {s}")))
    }
}

/// Parse a comma-separated watcher list. Empty means all of them.
pub fn parse_watcher_list(s: &str) -> Result<Vec<WatcherKind>> {
    let kinds = s
        .split(',')
        .filter(|part| !part.trim().is_empty())
        .map(str::parse)
        .collect::<Result<Vec<WatcherKind>>>()?;
    if kinds.is_empty() {
        Ok(WatcherKind::ALL.to_vec())
    } else {
        Ok(kinds)
    }
}

/// Collaborators the watchers are built from.
pub struct WatcherDeps {
    pub coordinator: Arc<dyn Coordinator>,
    pub catalog: Arc<dyn ServiceCatalog>,
    pub cluster_state: Arc<dyn ClusterState>,
    pub drains: Arc<dyn DrainRegistry>,
    pub autoscaling_root: String,
    pub big_bounce_rate: u32,
    /// How often event-driven watchers check for shutdown.
    pub poll_interval: Duration,
    pub file_poll_interval: Duration,
    pub maintenance_poll_interval: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(n: usize) -> Vec<InstanceKey> {
        (0..n)
            .map(|i| (format!("svc{i}"), "main".to_string()))
            .collect()
    }

    #[test]
    fn rate_limit_spaces_items_evenly() {
        let items = rate_limit_instances(keys(3), 30, "test");
        assert_eq!(items.len(), 3);
        for pair in items.windows(2) {
            assert_eq!(pair[1].wait_until - pair[0].wait_until, TimeDelta::seconds(2));
            assert_eq!(pair[1].bounce_by - pair[0].bounce_by, TimeDelta::seconds(2));
        }
        assert!(items.iter().all(|i| i.watcher == "test" && i.failures == 0));
    }

    #[test]
    fn watcher_list_parsing() {
        assert_eq!(parse_watcher_list("").unwrap(), WatcherKind::ALL.to_vec());
        assert_eq!(
            parse_watcher_list("maintenance, soa_files").unwrap(),
            vec![WatcherKind::Maintenance, WatcherKind::SoaFiles]
        );
        assert!(parse_watcher_list("inotify").is_err());
    }
}
