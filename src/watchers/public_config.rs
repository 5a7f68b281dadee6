//! Cluster-wide config watcher.
//!
//! A change to the system config can alter every instance's app id, so the
//! resulting bounces are fanned out at `big_bounce_rate` per minute instead
//! of landing on the workers all at once.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::{Watcher, WatcherContext, rate_limit_instances};
use crate::catalog::{ServiceCatalog, service_instances_with_changed_id};
use crate::cluster::ClusterState;
use crate::error::Result;

const NAME: &str = "public_config";

pub struct PublicConfigWatcher {
    catalog: Arc<dyn ServiceCatalog>,
    cluster: Arc<dyn ClusterState>,
    big_bounce_rate: u32,
    interval: Duration,
}

impl PublicConfigWatcher {
    pub fn new(
        catalog: Arc<dyn ServiceCatalog>,
        cluster: Arc<dyn ClusterState>,
        big_bounce_rate: u32,
        interval: Duration,
    ) -> Self {
        Self {
            catalog,
            cluster,
            big_bounce_rate,
            interval,
        }
    }
}

impl Watcher for PublicConfigWatcher {
    fn name(&self) -> &'static str {
        NAME
    }

    fn run(self: Box<Self>, ctx: WatcherContext) -> Result<()> {
        let mut fingerprint = self.catalog.system_fingerprint()?;
        ctx.mark_ready();

        while !ctx.shutdown.sleep(self.interval) {
            let current = match self.catalog.system_fingerprint() {
                Ok(current) => current,
                Err(e) => {
                    warn!(error = %e, "cannot read system config; will retry");
                    continue;
                }
            };
            if current == fingerprint {
                continue;
            }

            let changed = match service_instances_with_changed_id(
                self.catalog.as_ref(),
                self.cluster.as_ref(),
            ) {
                Ok(changed) => changed,
                Err(e) => {
                    warn!(error = %e, "cannot diff against cluster state; will retry");
                    continue;
                }
            };
            fingerprint = current;
            info!(
                count = changed.len(),
                rate = self.big_bounce_rate,
                "system config changed; rate limiting bounces"
            );
            ctx.enqueue(rate_limit_instances(changed, self.big_bounce_rate, NAME), NAME)?;
        }
        Ok(())
    }
}
