//! Watchers against fakes, the in-process coordination ensemble and real
//! files.

mod common;

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;

use deployd_rs::catalog::SoaDir;
use deployd_rs::cluster::ClusterStateFile;
use deployd_rs::coord::memory::MemoryEnsemble;
use deployd_rs::coord::{Coordinator, CreateMode};
use deployd_rs::engine::Shutdown;
use deployd_rs::model::ServiceInstance;
use deployd_rs::queue::{DelayDeadlineQueue, MemoryQueue};
use deployd_rs::watchers::{
    AutoscalerWatcher, MaintenanceWatcher, PublicConfigWatcher, SoaFileWatcher, WatcherHandle,
    spawn_watcher,
};

use common::{FakeCatalog, FakeCluster, key, wait_for};

const POLL: Duration = Duration::from_millis(20);

fn queued(queue: &MemoryQueue) -> Vec<ServiceInstance> {
    let mut rows = queue.get_available_service_instances(true).unwrap();
    rows.extend(queue.get_unavailable_service_instances(true).unwrap());
    rows.into_iter().filter_map(|row| row.instance).collect()
}

fn wait_ready(handle: &WatcherHandle) {
    assert!(wait_for(Duration::from_secs(5), || handle.is_ready()));
}

#[test]
fn soa_watcher_bounces_only_changed_app_ids() {
    let catalog = Arc::new(FakeCatalog::new());
    let cluster = Arc::new(FakeCluster::new());
    catalog.set_instance("web", "main", "web.main.1");
    catalog.set_instance("web", "canary", "web.canary.1");
    cluster.deploy("web.main.1");
    cluster.deploy("web.canary.1");

    let mut watcher = SoaFileWatcher::new(catalog.clone(), cluster.clone(), POLL);
    // First poll sees every service as new; all of them are deployed.
    assert!(watcher.poll().unwrap().is_empty());

    catalog.set_instance("web", "canary", "web.canary.2");
    assert_eq!(watcher.poll().unwrap(), vec![key("web", "canary")]);
    assert!(watcher.poll().unwrap().is_empty());

    catalog.set_instance("api", "main", "api.main.1");
    assert_eq!(watcher.poll().unwrap(), vec![key("api", "main")]);
}

#[test]
fn soa_watcher_follows_files_on_disk() {
    let soa = tempfile::tempdir().unwrap();
    let system = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    let service_dir = soa.path().join("web");
    fs::create_dir(&service_dir).unwrap();
    fs::write(service_dir.join("deploy-test.toml"), "[main]\ncpus = 1\n").unwrap();

    let catalog = Arc::new(SoaDir::new(soa.path(), system.path(), "test"));
    let cluster = Arc::new(ClusterStateFile::new(state.path().join("cluster.json")));
    let queue = Arc::new(MemoryQueue::new().unwrap());
    let shutdown = Shutdown::new();
    let handle = spawn_watcher(
        Box::new(SoaFileWatcher::new(catalog, cluster, POLL)),
        queue.clone(),
        shutdown.clone(),
    )
    .unwrap();
    wait_ready(&handle);
    assert!(queued(&queue).is_empty());

    // Swap the file in whole so a poll never reads half of it.
    let staged = state.path().join("deploy-test.toml");
    fs::write(&staged, "[main]\ncpus = 2\n\n[canary]\ncpus = 1\n").unwrap();
    fs::rename(&staged, service_dir.join("deploy-test.toml")).unwrap();
    assert!(wait_for(Duration::from_secs(5), || queued(&queue).len() == 2));
    let items = queued(&queue);
    assert!(items.iter().all(|i| i.service == "web" && i.watcher == "soa_files"));

    shutdown.trigger();
    handle.join();
}

#[test]
fn repeated_changes_leave_one_pending_bounce() {
    let catalog = Arc::new(FakeCatalog::new());
    let cluster = Arc::new(FakeCluster::new());
    catalog.set_instance("web", "main", "web.main.1");
    cluster.deploy("web.main.1");

    let queue = Arc::new(MemoryQueue::new().unwrap());
    let shutdown = Shutdown::new();
    let handle = spawn_watcher(
        Box::new(SoaFileWatcher::new(catalog.clone(), cluster.clone(), POLL)),
        queue.clone(),
        shutdown.clone(),
    )
    .unwrap();
    wait_ready(&handle);

    catalog.set_instance("web", "main", "web.main.2");
    assert!(wait_for(Duration::from_secs(5), || queued(&queue).len() == 1));
    catalog.set_instance("web", "main", "web.main.3");
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(queued(&queue).len(), 1);

    shutdown.trigger();
    handle.join();
}

#[test]
fn bad_service_config_is_skipped_until_fixed() {
    let soa = tempfile::tempdir().unwrap();
    let system = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    for service in ["web", "api"] {
        let dir = soa.path().join(service);
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("deploy-test.toml"), "[main]\ncpus = 1\n").unwrap();
    }

    let catalog = Arc::new(SoaDir::new(soa.path(), system.path(), "test"));
    let cluster = Arc::new(ClusterStateFile::new(state.path().join("cluster.json")));
    let queue = Arc::new(MemoryQueue::new().unwrap());
    let shutdown = Shutdown::new();
    let handle = spawn_watcher(
        Box::new(SoaFileWatcher::new(catalog, cluster, POLL)),
        queue.clone(),
        shutdown.clone(),
    )
    .unwrap();
    wait_ready(&handle);

    let swap = |service: &str, text: &str| {
        let staged = state.path().join("staged.toml");
        fs::write(&staged, text).unwrap();
        fs::rename(&staged, soa.path().join(service).join("deploy-test.toml")).unwrap();
    };

    // A typo in one service must not stop the others from bouncing.
    swap("web", "[main\n");
    swap("api", "[main]\ncpus = 2\n");
    assert!(wait_for(Duration::from_secs(5), || queued(&queue).len() == 1));
    assert_eq!(queued(&queue)[0].service, "api");
    assert!(handle.is_alive());

    swap("web", "[main]\ncpus = 3\n");
    assert!(wait_for(Duration::from_secs(5), || queued(&queue).len() == 2));
    assert!(handle.is_alive());

    shutdown.trigger();
    handle.join();
}

#[test]
fn maintenance_survives_unreadable_cluster_state() {
    let state = tempfile::tempdir().unwrap();
    let path = state.path().join("cluster.json");
    fs::write(&path, "{\"apps\": [").unwrap();
    let cluster = Arc::new(ClusterStateFile::new(&path));

    let queue = Arc::new(MemoryQueue::new().unwrap());
    let shutdown = Shutdown::new();
    let handle = spawn_watcher(
        Box::new(MaintenanceWatcher::new(cluster.clone(), cluster.clone(), POLL)),
        queue.clone(),
        shutdown.clone(),
    )
    .unwrap();
    wait_ready(&handle);
    std::thread::sleep(Duration::from_millis(100));
    assert!(handle.is_alive());

    let staged = state.path().join("staged.json");
    fs::write(
        &staged,
        r#"{"apps": [{"id": "web.main.1", "service": "web", "instance": "main", "hosts": ["h1"]}],
            "draining_hosts": ["h1"]}"#,
    )
    .unwrap();
    fs::rename(&staged, &path).unwrap();
    assert!(wait_for(Duration::from_secs(5), || queued(&queue).len() == 1));

    shutdown.trigger();
    handle.join();
}

#[test]
fn public_config_change_is_rate_limited() {
    let catalog = Arc::new(FakeCatalog::new());
    let cluster = Arc::new(FakeCluster::new());
    for service in ["a", "b", "c"] {
        let app_id = format!("{service}.main.1");
        catalog.set_instance(service, "main", &app_id);
        cluster.deploy(&app_id);
    }
    catalog.set_system_fingerprint("v1");

    let queue = Arc::new(MemoryQueue::new().unwrap());
    let shutdown = Shutdown::new();
    let handle = spawn_watcher(
        Box::new(PublicConfigWatcher::new(
            catalog.clone(),
            cluster.clone(),
            60,
            POLL,
        )),
        queue.clone(),
        shutdown.clone(),
    )
    .unwrap();
    wait_ready(&handle);

    // A new system config moves every app id.
    for service in ["a", "b", "c"] {
        catalog.set_instance(service, "main", &format!("{service}.main.2"));
    }
    catalog.set_system_fingerprint("v2");

    assert!(wait_for(Duration::from_secs(5), || queued(&queue).len() == 3));
    let mut items = queued(&queue);
    items.sort_by_key(|i| i.wait_until);
    assert!(items.iter().all(|i| i.watcher == "public_config"));
    for pair in items.windows(2) {
        assert_eq!(pair[1].wait_until - pair[0].wait_until, TimeDelta::seconds(1));
        assert_eq!(pair[1].bounce_by - pair[0].bounce_by, TimeDelta::seconds(1));
    }

    shutdown.trigger();
    handle.join();
}

#[test]
fn maintenance_reports_only_new_drains() {
    let cluster = Arc::new(FakeCluster::new());
    let mut watcher = MaintenanceWatcher::new(cluster.clone(), cluster.clone(), POLL);

    cluster.drain("host-1");
    assert_eq!(watcher.new_draining_hosts().unwrap(), vec!["host-1"]);
    assert!(watcher.new_draining_hosts().unwrap().is_empty());
    cluster.drain("host-2");
    assert_eq!(watcher.new_draining_hosts().unwrap(), vec!["host-2"]);
}

#[test]
fn maintenance_bounces_instances_on_draining_hosts() {
    let cluster = Arc::new(FakeCluster::new());
    cluster.place("host-1", "web", "main");
    cluster.place("host-1", "api", "main");
    cluster.place("host-2", "db", "main");

    let queue = Arc::new(MemoryQueue::new().unwrap());
    let shutdown = Shutdown::new();
    let handle = spawn_watcher(
        Box::new(MaintenanceWatcher::new(cluster.clone(), cluster.clone(), POLL)),
        queue.clone(),
        shutdown.clone(),
    )
    .unwrap();
    wait_ready(&handle);

    cluster.drain("host-1");
    assert!(wait_for(Duration::from_secs(5), || queued(&queue).len() == 2));
    let mut services: Vec<_> = queued(&queue).into_iter().map(|i| i.service).collect();
    services.sort();
    assert_eq!(services, vec!["api", "web"]);

    shutdown.trigger();
    handle.join();
}

#[test]
fn autoscaler_enqueues_on_instance_count_changes() {
    let ensemble = MemoryEnsemble::new().unwrap();
    let client = ensemble.connect();
    client.ensure_path("/autoscaling/web/main").unwrap();
    client
        .create("/autoscaling/web/main/instances", b"3", CreateMode::Persistent)
        .unwrap();

    let queue = Arc::new(MemoryQueue::new().unwrap());
    let shutdown = Shutdown::new();
    let handle = spawn_watcher(
        Box::new(AutoscalerWatcher::new(client.clone(), "/autoscaling", POLL)),
        queue.clone(),
        shutdown.clone(),
    )
    .unwrap();
    wait_ready(&handle);
    assert!(queued(&queue).is_empty());

    client.set("/autoscaling/web/main/instances", b"5").unwrap();
    assert!(wait_for(Duration::from_secs(5), || queued(&queue).len() == 1));
    let item = queue.get(false, None).unwrap();
    assert_eq!((item.service.as_str(), item.instance.as_str()), ("web", "main"));
    assert_eq!(item.watcher, "autoscaler");
    item.commit().unwrap();

    // Writing the same value again is not a change.
    client.set("/autoscaling/web/main/instances", b"5").unwrap();
    std::thread::sleep(Duration::from_millis(100));
    assert!(queued(&queue).is_empty());

    // A service that starts autoscaling later is picked up too.
    client.ensure_path("/autoscaling/api/canary").unwrap();
    client
        .create("/autoscaling/api/canary/instances", b"2", CreateMode::Persistent)
        .unwrap();
    assert!(wait_for(Duration::from_secs(5), || queued(&queue).len() == 1));
    assert_eq!(queued(&queue)[0].service, "api");

    shutdown.trigger();
    handle.join();
}

#[test]
fn autoscaler_ignores_lock_folders() {
    let ensemble = MemoryEnsemble::new().unwrap();
    let client = ensemble.connect();
    client
        .ensure_path("/autoscaling/web/main/autoscaling.lock")
        .unwrap();

    let queue = Arc::new(MemoryQueue::new().unwrap());
    let shutdown = Shutdown::new();
    let handle = spawn_watcher(
        Box::new(AutoscalerWatcher::new(client.clone(), "/autoscaling", POLL)),
        queue.clone(),
        shutdown.clone(),
    )
    .unwrap();
    wait_ready(&handle);

    client
        .create(
            "/autoscaling/web/main/autoscaling.lock/holder",
            b"x",
            CreateMode::Ephemeral,
        )
        .unwrap();
    std::thread::sleep(Duration::from_millis(100));
    assert!(queued(&queue).is_empty());
    assert!(handle.is_alive());

    shutdown.trigger();
    handle.join();
}
