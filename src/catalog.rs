//! Desired state: which service instances exist and what they should run.
//!
//! [`SoaDir`] reads per-service deploy files laid out as
//! `<soa_dir>/<service>/deploy-<cluster>.toml`, one top-level table per
//! instance. An instance's desired app id is derived from its own config
//! and the cluster-wide system config, so a change to either yields a new
//! id.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::warn;

use crate::cluster::ClusterState;
use crate::error::{Error, Result};

/// A `(service, instance)` pair.
pub type InstanceKey = (String, String);

pub trait ServiceCatalog: Send + Sync {
    /// Every service with a deploy file for this cluster.
    fn services(&self) -> Result<Vec<String>>;

    fn instances_for_service(&self, service: &str) -> Result<Vec<String>>;

    /// App id the instance should be running, or `None` if it is not
    /// configured.
    fn desired_app_id(&self, service: &str, instance: &str) -> Result<Option<String>>;

    /// Digest of one service's config files.
    fn service_fingerprint(&self, service: &str) -> Result<String>;

    /// Digest of the cluster-wide config.
    fn system_fingerprint(&self) -> Result<String>;

    /// Every configured instance. A service whose config cannot be read is
    /// logged and left out.
    fn all_instances(&self) -> Result<Vec<InstanceKey>> {
        let mut out = Vec::new();
        for service in self.services()? {
            match self.instances_for_service(&service) {
                Ok(instances) => {
                    out.extend(instances.into_iter().map(|i| (service.clone(), i)));
                }
                Err(e) => {
                    warn!(service = %service, error = %e, "skipping unreadable service config");
                }
            }
        }
        Ok(out)
    }
}

/// Instances whose desired app id is not currently deployed.
pub fn service_instances_with_changed_id(
    catalog: &dyn ServiceCatalog,
    cluster: &dyn ClusterState,
) -> Result<Vec<InstanceKey>> {
    let deployed = cluster.deployed_app_ids()?;
    filter_changed(catalog, &deployed, catalog.all_instances()?)
}

/// Keep the instances whose desired app id is not in `deployed`.
pub fn filter_changed(
    catalog: &dyn ServiceCatalog,
    deployed: &HashSet<String>,
    instances: Vec<InstanceKey>,
) -> Result<Vec<InstanceKey>> {
    let mut changed = Vec::new();
    for (service, instance) in instances {
        // An instance with no buildable app id is treated as changed too;
        // the bounce backs off until the config is fixed.
        match catalog.desired_app_id(&service, &instance) {
            Ok(Some(app_id)) if deployed.contains(&app_id) => {}
            Ok(_) => changed.push((service, instance)),
            Err(e) => {
                warn!(
                    service = %service,
                    instance = %instance,
                    error = %e,
                    "cannot compute app id"
                );
                changed.push((service, instance));
            }
        }
    }
    Ok(changed)
}

// ---------------------------------------------------------------------------
// SOA directory
// ---------------------------------------------------------------------------

pub struct SoaDir {
    root: PathBuf,
    system_dir: PathBuf,
    cluster: String,
}

impl SoaDir {
    pub fn new(root: impl Into<PathBuf>, system_dir: impl Into<PathBuf>, cluster: &str) -> Self {
        Self {
            root: root.into(),
            system_dir: system_dir.into(),
            cluster: cluster.to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn system_dir(&self) -> &Path {
        &self.system_dir
    }

    fn deploy_file(&self, service: &str) -> PathBuf {
        self.root
            .join(service)
            .join(format!("deploy-{}.toml", self.cluster))
    }

    fn load(&self, service: &str) -> Result<toml::Table> {
        let path = self.deploy_file(service);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(toml::Table::new()),
            Err(e) => return Err(e.into()),
        };
        text.parse::<toml::Table>()
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }
}

/// Sorted regular files directly inside `dir`. A missing dir has none.
fn files_in(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

fn fingerprint_files(files: &[PathBuf]) -> Result<String> {
    let mut hasher = Sha256::new();
    for file in files {
        if let Some(name) = file.file_name() {
            hasher.update(name.as_encoded_bytes());
        }
        hasher.update([0u8]);
        hasher.update(fs::read(file)?);
        hasher.update([0u8]);
    }
    Ok(hex::encode(hasher.finalize()))
}

impl ServiceCatalog for SoaDir {
    fn services(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(soa_dir = %self.root.display(), "service config directory missing");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };
        let mut services = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if self.deploy_file(&name).is_file() {
                services.push(name);
            }
        }
        services.sort();
        Ok(services)
    }

    fn instances_for_service(&self, service: &str) -> Result<Vec<String>> {
        Ok(self
            .load(service)?
            .iter()
            .filter(|(_, value)| value.is_table())
            .map(|(name, _)| name.clone())
            .collect())
    }

    fn desired_app_id(&self, service: &str, instance: &str) -> Result<Option<String>> {
        let config = self.load(service)?;
        let Some(instance_config) = config.get(instance).filter(|v| v.is_table()) else {
            return Ok(None);
        };
        let mut hasher = Sha256::new();
        hasher.update(serde_json::to_vec(instance_config)?);
        hasher.update(self.system_fingerprint()?.as_bytes());
        let digest = hex::encode(hasher.finalize());
        Ok(Some(format!("{service}.{instance}.{}", &digest[..8])))
    }

    fn service_fingerprint(&self, service: &str) -> Result<String> {
        fingerprint_files(&files_in(&self.root.join(service))?)
    }

    fn system_fingerprint(&self) -> Result<String> {
        fingerprint_files(&files_in(&self.system_dir)?)
    }
}

/// Fingerprint every service. Used to spot which services changed on disk.
/// Services whose files cannot be read are left out and show up as new once
/// they can.
pub fn service_fingerprints(catalog: &dyn ServiceCatalog) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for service in catalog.services()? {
        match catalog.service_fingerprint(&service) {
            Ok(fingerprint) => {
                out.insert(service, fingerprint);
            }
            Err(e) => warn!(service = %service, error = %e, "cannot fingerprint service"),
        }
    }
    Ok(out)
}

/// Deduplicate while keeping first-seen order.
pub fn dedup_instances(instances: impl IntoIterator<Item = InstanceKey>) -> Vec<InstanceKey> {
    let mut seen = HashSet::new();
    instances
        .into_iter()
        .filter(|key| seen.insert(key.clone()))
        .collect()
}
