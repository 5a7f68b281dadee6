//! Drain watcher: when hosts start draining, bounce whatever runs on them.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::{Watcher, WatcherContext};
use crate::cluster::{ClusterState, DrainRegistry};
use crate::error::Result;

const NAME: &str = "maintenance";

pub struct MaintenanceWatcher {
    drains: Arc<dyn DrainRegistry>,
    cluster: Arc<dyn ClusterState>,
    interval: Duration,
    draining: BTreeSet<String>,
}

impl MaintenanceWatcher {
    pub fn new(
        drains: Arc<dyn DrainRegistry>,
        cluster: Arc<dyn ClusterState>,
        interval: Duration,
    ) -> Self {
        Self {
            drains,
            cluster,
            interval,
            draining: BTreeSet::new(),
        }
    }

    /// Hosts draining now that were not draining at the previous poll.
    pub fn new_draining_hosts(&mut self) -> Result<Vec<String>> {
        let current: BTreeSet<String> = self.drains.draining_hosts()?.into_iter().collect();
        let fresh = current.difference(&self.draining).cloned().collect();
        self.draining = current;
        Ok(fresh)
    }
}

impl Watcher for MaintenanceWatcher {
    fn name(&self) -> &'static str {
        NAME
    }

    fn run(mut self: Box<Self>, ctx: WatcherContext) -> Result<()> {
        ctx.mark_ready();
        loop {
            match self.new_draining_hosts() {
                Ok(hosts) if hosts.is_empty() => {}
                Ok(hosts) => match self.cluster.instances_on_hosts(&hosts) {
                    Ok(instances) => {
                        info!(?hosts, count = instances.len(), "hosts draining");
                        ctx.enqueue_now(instances, NAME)?;
                    }
                    Err(e) => {
                        // Forget these hosts so the next poll sees them as new.
                        warn!(?hosts, error = %e, "cannot read placements; will retry");
                        for host in &hosts {
                            self.draining.remove(host);
                        }
                    }
                },
                Err(e) => warn!(error = %e, "cannot read drain registry; will retry"),
            }
            if ctx.shutdown.sleep(self.interval) {
                return Ok(());
            }
        }
    }
}
