//! Service config watcher.
//!
//! Polls the service catalog and fingerprints each service's config. When a
//! service appears or its fingerprint moves, the instances of that service
//! whose desired app id is not deployed are enqueued. Edits that do not
//! change an app id enqueue nothing.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{Watcher, WatcherContext};
use crate::catalog::{InstanceKey, ServiceCatalog, filter_changed, service_fingerprints};
use crate::cluster::ClusterState;
use crate::error::Result;

const NAME: &str = "soa_files";

pub struct SoaFileWatcher {
    catalog: Arc<dyn ServiceCatalog>,
    cluster: Arc<dyn ClusterState>,
    interval: Duration,
    known: BTreeMap<String, String>,
}

impl SoaFileWatcher {
    pub fn new(
        catalog: Arc<dyn ServiceCatalog>,
        cluster: Arc<dyn ClusterState>,
        interval: Duration,
    ) -> Self {
        Self {
            catalog,
            cluster,
            interval,
            known: BTreeMap::new(),
        }
    }

    /// Instances to bounce for the services that changed since last poll.
    ///
    /// A changed service whose config does not parse is skipped and not
    /// recorded, so it is looked at again on the next poll.
    pub fn poll(&mut self) -> Result<Vec<InstanceKey>> {
        let mut current = service_fingerprints(self.catalog.as_ref())?;
        let changed: Vec<String> = current
            .iter()
            .filter(|(service, fp)| self.known.get(*service) != Some(*fp))
            .map(|(service, _)| service.clone())
            .collect();

        let mut candidates = Vec::new();
        for service in changed {
            debug!(service = %service, "service config changed");
            match self.catalog.instances_for_service(&service) {
                Ok(instances) => {
                    candidates.extend(instances.into_iter().map(|i| (service.clone(), i)));
                }
                Err(e) => {
                    warn!(service = %service, error = %e, "service config unreadable; will retry");
                    current.remove(&service);
                }
            }
        }
        let instances = if candidates.is_empty() {
            Vec::new()
        } else {
            let deployed = self.cluster.deployed_app_ids()?;
            filter_changed(self.catalog.as_ref(), &deployed, candidates)?
        };
        self.known = current;
        Ok(instances)
    }
}

impl Watcher for SoaFileWatcher {
    fn name(&self) -> &'static str {
        NAME
    }

    fn run(mut self: Box<Self>, ctx: WatcherContext) -> Result<()> {
        self.known = service_fingerprints(self.catalog.as_ref())?;
        info!(services = self.known.len(), "service configs fingerprinted");
        ctx.mark_ready();

        while !ctx.shutdown.sleep(self.interval) {
            let instances = match self.poll() {
                Ok(instances) => instances,
                Err(e) => {
                    warn!(error = %e, "service config poll failed; will retry");
                    continue;
                }
            };
            if !instances.is_empty() {
                info!(count = instances.len(), "service config changes need bounces");
                ctx.enqueue_now(instances, NAME)?;
            }
        }
        Ok(())
    }
}
