//! Fakes shared by the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use deployd_rs::bounce::{BounceExecutor, BounceResult};
use deployd_rs::catalog::{InstanceKey, ServiceCatalog};
use deployd_rs::cluster::{ClusterState, DrainRegistry};
use deployd_rs::error::{Error, Result};
use deployd_rs::telemetry::metrics::{Counter, Gauge, MetricsSink, Tags, Timer};

pub fn key(service: &str, instance: &str) -> InstanceKey {
    (service.to_string(), instance.to_string())
}

/// Poll `f` until it returns true or `timeout` elapses.
pub fn wait_for(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    f()
}

// ---------------------------------------------------------------------------
// Catalog and cluster
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CatalogState {
    /// service -> instance -> desired app id
    services: BTreeMap<String, BTreeMap<String, String>>,
    fingerprints: HashMap<String, String>,
    system: String,
    /// Services whose config fails to load.
    broken: HashSet<String>,
}

#[derive(Default)]
pub struct FakeCatalog {
    state: Mutex<CatalogState>,
}

impl FakeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure an instance and bump its service's fingerprint.
    pub fn set_instance(&self, service: &str, instance: &str, app_id: &str) {
        let mut state = self.state.lock();
        state
            .services
            .entry(service.to_string())
            .or_default()
            .insert(instance.to_string(), app_id.to_string());
        let fp = state.fingerprints.entry(service.to_string()).or_default();
        fp.push('+');
    }

    pub fn set_system_fingerprint(&self, fingerprint: &str) {
        self.state.lock().system = fingerprint.to_string();
    }

    /// Make a configured service's config unreadable.
    pub fn break_service(&self, service: &str) {
        self.state.lock().broken.insert(service.to_string());
    }

    fn check(&self, service: &str) -> Result<()> {
        if self.state.lock().broken.contains(service) {
            return Err(Error::Config(format!("{service}: bad config")));
        }
        Ok(())
    }
}

impl ServiceCatalog for FakeCatalog {
    fn services(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().services.keys().cloned().collect())
    }

    fn instances_for_service(&self, service: &str) -> Result<Vec<String>> {
        self.check(service)?;
        Ok(self
            .state
            .lock()
            .services
            .get(service)
            .map(|instances| instances.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn desired_app_id(&self, service: &str, instance: &str) -> Result<Option<String>> {
        self.check(service)?;
        Ok(self
            .state
            .lock()
            .services
            .get(service)
            .and_then(|instances| instances.get(instance).cloned()))
    }

    fn service_fingerprint(&self, service: &str) -> Result<String> {
        Ok(self
            .state
            .lock()
            .fingerprints
            .get(service)
            .cloned()
            .unwrap_or_default())
    }

    fn system_fingerprint(&self) -> Result<String> {
        Ok(self.state.lock().system.clone())
    }
}

#[derive(Default)]
struct ClusterInner {
    deployed: HashSet<String>,
    placements: Vec<(String, InstanceKey)>,
    draining: Vec<String>,
}

#[derive(Default)]
pub struct FakeCluster {
    inner: Mutex<ClusterInner>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deploy(&self, app_id: &str) {
        self.inner.lock().deployed.insert(app_id.to_string());
    }

    pub fn place(&self, host: &str, service: &str, instance: &str) {
        self.inner
            .lock()
            .placements
            .push((host.to_string(), key(service, instance)));
    }

    pub fn drain(&self, host: &str) {
        self.inner.lock().draining.push(host.to_string());
    }
}

impl ClusterState for FakeCluster {
    fn deployed_app_ids(&self) -> Result<HashSet<String>> {
        Ok(self.inner.lock().deployed.clone())
    }

    fn instances_on_hosts(&self, hosts: &[String]) -> Result<Vec<InstanceKey>> {
        let inner = self.inner.lock();
        let mut out: Vec<InstanceKey> = Vec::new();
        for (host, key) in &inner.placements {
            if hosts.contains(host) && !out.contains(key) {
                out.push(key.clone());
            }
        }
        Ok(out)
    }
}

impl DrainRegistry for FakeCluster {
    fn draining_hosts(&self) -> Result<Vec<String>> {
        Ok(self.inner.lock().draining.clone())
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// What the scripted executor does for one call.
#[derive(Debug, Clone, Copy)]
pub enum Step {
    Result(BounceResult),
    Fail,
    Panic,
}

/// Replays scripted outcomes in order, then reports success.
#[derive(Default)]
pub struct ScriptedExecutor {
    script: Mutex<Vec<Step>>,
    calls: Mutex<Vec<InstanceKey>>,
}

impl ScriptedExecutor {
    pub fn new(script: Vec<Step>) -> Self {
        let mut script = script;
        script.reverse();
        Self {
            script: Mutex::new(script),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<InstanceKey> {
        self.calls.lock().clone()
    }
}

impl BounceExecutor for ScriptedExecutor {
    fn deploy(&self, service: &str, instance: &str) -> Result<BounceResult> {
        self.calls.lock().push(key(service, instance));
        let step = self.script.lock().pop();
        match step {
            None => Ok(BounceResult::done()),
            Some(Step::Result(result)) => Ok(result),
            Some(Step::Fail) => Err(Error::Other("executor exploded".to_string())),
            Some(Step::Panic) => panic!("executor panicked"),
        }
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Remembers the last value of each gauge and how often counters fired.
#[derive(Default)]
pub struct RecordingMetrics {
    gauges: Arc<Mutex<HashMap<String, f64>>>,
    counters: Arc<Mutex<HashMap<String, u64>>>,
}

impl RecordingMetrics {
    pub fn gauge(&self, name: &str) -> Option<f64> {
        self.gauges.lock().get(name).copied()
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.lock().get(name).copied().unwrap_or(0)
    }
}

struct RecordedGauge {
    name: String,
    values: Arc<Mutex<HashMap<String, f64>>>,
}

impl Gauge for RecordedGauge {
    fn set(&self, value: f64) {
        self.values.lock().insert(self.name.clone(), value);
    }
}

struct RecordedCounter {
    name: String,
    counts: Arc<Mutex<HashMap<String, u64>>>,
}

impl Counter for RecordedCounter {
    fn count(&self) {
        *self.counts.lock().entry(self.name.clone()).or_default() += 1;
    }
}

struct NullTimer;

impl Timer for NullTimer {
    fn start(&self) {}
    fn stop(&self) {}
}

impl MetricsSink for RecordingMetrics {
    fn create_gauge(&self, name: &str, _tags: Tags<'_>) -> Arc<dyn Gauge> {
        Arc::new(RecordedGauge {
            name: name.to_string(),
            values: Arc::clone(&self.gauges),
        })
    }

    fn create_timer(&self, _name: &str, _tags: Tags<'_>) -> Arc<dyn Timer> {
        Arc::new(NullTimer)
    }

    fn create_counter(&self, name: &str, _tags: Tags<'_>) -> Arc<dyn Counter> {
        Arc::new(RecordedCounter {
            name: name.to_string(),
            counts: Arc::clone(&self.counters),
        })
    }
}
