//! External bounce command.

#![cfg(unix)]

mod common;

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use deployd_rs::bounce::{BounceExecutor, CommandExecutor, MAX_RETRY_AFTER};

use common::FakeCatalog;

/// Writing a script while another test forks can leave it "text file busy";
/// scripts are written and run one test at a time.
static EXEC: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    EXEC.lock().unwrap_or_else(|e| e.into_inner())
}

fn script(dir: &Path, body: &str) -> String {
    let path = dir.join("bounce.sh");
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().into_owned()
}

#[test]
fn exit_code_becomes_status() {
    let _serial = serial();
    let dir = tempfile::tempdir().unwrap();
    let command = script(dir.path(), "echo \"bouncing $1.$2\"\nexit 3");
    let result = CommandExecutor::new(&command, "test")
        .deploy("web", "main")
        .unwrap();
    assert_eq!(result.status, 3);
    assert_eq!(result.retry_after, None);
}

#[test]
fn last_line_carries_retry_hint() {
    let _serial = serial();
    let dir = tempfile::tempdir().unwrap();
    let command = script(dir.path(), "echo working\necho '{\"bounce_again_in_seconds\": 30}'");
    let result = CommandExecutor::new(&command, "test")
        .deploy("web", "main")
        .unwrap();
    assert_eq!(result.status, 0);
    assert_eq!(result.retry_after, Some(Duration::from_secs(30)));
}

#[test]
fn non_utf8_output_does_not_fail_the_bounce() {
    let _serial = serial();
    let dir = tempfile::tempdir().unwrap();
    let command = script(
        dir.path(),
        "printf '\\377\\376 binary\\n'\necho '{\"bounce_again_in_seconds\": 1e30}'",
    );
    let result = CommandExecutor::new(&command, "test")
        .deploy("web", "main")
        .unwrap();
    assert_eq!(result.status, 0);
    assert_eq!(result.retry_after, Some(MAX_RETRY_AFTER));
}

#[test]
fn command_sees_cluster_and_app_id() {
    let _serial = serial();
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("env.txt");
    let command = script(
        dir.path(),
        &format!(
            "echo \"$DEPLOYD_CLUSTER $DEPLOYD_APP_ID\" > {}",
            out.display()
        ),
    );
    let catalog = Arc::new(FakeCatalog::new());
    catalog.set_instance("web", "main", "web.main.abc123");

    let result = CommandExecutor::new(&command, "norcal-prod")
        .with_catalog(catalog)
        .deploy("web", "main")
        .unwrap();
    assert_eq!(result.status, 0);
    assert_eq!(
        fs::read_to_string(out).unwrap().trim(),
        "norcal-prod web.main.abc123"
    );
}

#[test]
fn missing_command_is_an_error() {
    let executor = CommandExecutor::new("/nonexistent/deployd-bounce", "test");
    assert!(executor.deploy("web", "main").is_err());
}
