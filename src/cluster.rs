//! What is actually running, and which hosts are being drained.
//!
//! [`ClusterStateFile`] reads a JSON snapshot written by whatever talks to
//! the orchestrator:
//!
//! ```json
//! { "apps": [{ "id": "web.main.1a2b3c4d", "service": "web", "instance": "main",
//!              "hosts": ["host-1"] }],
//!   "draining_hosts": ["host-1"] }
//! ```
//!
//! The file is re-read on every call so external updates show up without a
//! restart. A missing file reads as an empty cluster.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::catalog::{InstanceKey, dedup_instances};
use crate::error::Result;

pub trait ClusterState: Send + Sync {
    fn deployed_app_ids(&self) -> Result<HashSet<String>>;

    /// Instances with at least one task on any of `hosts`.
    fn instances_on_hosts(&self, hosts: &[String]) -> Result<Vec<InstanceKey>>;
}

pub trait DrainRegistry: Send + Sync {
    fn draining_hosts(&self) -> Result<Vec<String>>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeployedApp {
    pub id: String,
    pub service: String,
    pub instance: String,
    #[serde(default)]
    pub hosts: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    #[serde(default)]
    pub apps: Vec<DeployedApp>,
    #[serde(default)]
    pub draining_hosts: Vec<String>,
}

pub struct ClusterStateFile {
    path: PathBuf,
}

impl ClusterStateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn read(&self) -> Result<ClusterSnapshot> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(ClusterSnapshot::default()),
            Err(e) => Err(e.into()),
        }
    }
}

impl ClusterState for ClusterStateFile {
    fn deployed_app_ids(&self) -> Result<HashSet<String>> {
        Ok(self.read()?.apps.into_iter().map(|app| app.id).collect())
    }

    fn instances_on_hosts(&self, hosts: &[String]) -> Result<Vec<InstanceKey>> {
        let hosts: HashSet<&str> = hosts.iter().map(String::as_str).collect();
        let snapshot = self.read()?;
        Ok(dedup_instances(
            snapshot
                .apps
                .into_iter()
                .filter(|app| app.hosts.iter().any(|h| hosts.contains(h.as_str())))
                .map(|app| (app.service, app.instance)),
        ))
    }
}

impl DrainRegistry for ClusterStateFile {
    fn draining_hosts(&self) -> Result<Vec<String>> {
        Ok(self.read()?.draining_hosts)
    }
}
