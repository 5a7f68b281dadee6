//! Coordination service client.
//!
//! A small ZooKeeper-shaped API: a tree of nodes addressed by absolute
//! paths, with persistent, ephemeral and sequential nodes, one-shot watches
//! and all-or-nothing multi-op transactions. Ephemeral nodes belong to the
//! client session that created them and disappear when it ends.
//!
//! The leader election and the distributed queue are written against
//! [`Coordinator`] only. Two backends exist: an in-process ensemble
//! ([`memory`]) and a Postgres-backed one ([`postgres`]).
//!
//! Watch callbacks are delivered on a dedicated dispatcher thread, never on
//! the thread that triggered the change. They must not call back into the
//! coordinator; record the event and wake whoever needs to act on it.

pub mod memory;
pub mod postgres;

use std::sync::mpsc::{self, Sender};
use std::thread;

use tracing::debug;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    PersistentSequential,
    Ephemeral,
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    pub fn is_sequential(self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }
}

/// Health of the client's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Operations go through.
    Connected,
    /// Connection interrupted; the session (and its ephemeral nodes) may
    /// still be alive if it comes back in time.
    Suspended,
    /// The session is gone for good, along with its ephemeral nodes.
    Lost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Created,
    Changed,
    Deleted,
    Child,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedEvent {
    pub event_type: EventType,
    pub path: String,
}

/// One-shot watch callback.
pub type Watch = Box<dyn FnOnce(WatchedEvent) + Send>;

/// Session state listener. Called on every state transition.
pub type StateListener = Box<dyn Fn(SessionState) + Send + Sync>;

/// One operation inside a [`Coordinator::multi`] transaction.
#[derive(Debug, Clone)]
pub enum Op {
    Create {
        path: String,
        data: Vec<u8>,
        mode: CreateMode,
    },
    Delete {
        path: String,
    },
}

// ---------------------------------------------------------------------------
// Client trait
// ---------------------------------------------------------------------------

/// Blocking coordination client bound to one session.
pub trait Coordinator: Send + Sync {
    /// 32-hex-character session identity.
    fn session_id(&self) -> &str;

    fn state(&self) -> SessionState;

    fn add_listener(&self, listener: StateListener);

    /// Create a node and return its actual path (sequential nodes get a
    /// 10-digit suffix appended).
    fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String>;

    fn get(&self, path: &str) -> Result<Vec<u8>>;

    /// Replace a node's data. Fires its data watches with `Changed`.
    fn set(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Read a node if it exists, leaving a watch that fires when it is
    /// created, changed or deleted.
    fn get_data_w(&self, path: &str, watch: Watch) -> Result<Option<Vec<u8>>>;

    /// List child names (not full paths), optionally leaving a watch that
    /// fires on the next change to the set of children.
    fn get_children(&self, path: &str, watch: Option<Watch>) -> Result<Vec<String>>;

    fn delete(&self, path: &str) -> Result<()>;

    /// Apply every op or none of them.
    fn multi(&self, ops: Vec<Op>) -> Result<()>;

    /// Create every missing node along `path`.
    fn ensure_path(&self, path: &str) -> Result<()> {
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            match self.create(&current, &[], CreateMode::Persistent) {
                Ok(_) | Err(Error::NodeExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

/// Join a parent path and a child name.
pub fn join(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{child}")
    } else {
        format!("{}/{child}", parent.trim_end_matches('/'))
    }
}

/// Parent of an absolute path. The root is its own parent.
pub fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Last component of an absolute path.
pub fn name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Suffix appended to sequential node names.
pub fn sequence_suffix(seq: u64) -> String {
    format!("{seq:010}")
}

pub(crate) fn validate_path(path: &str) -> Result<()> {
    if !path.starts_with('/') || (path.len() > 1 && path.ends_with('/')) || path.contains("//") {
        return Err(Error::Other(format!("invalid node path: {path:?}")));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Watch delivery
// ---------------------------------------------------------------------------

/// Runs watch callbacks on their own thread, in the order they fired.
#[derive(Clone)]
pub(crate) struct WatchDispatcher {
    tx: Sender<(Watch, WatchedEvent)>,
}

impl WatchDispatcher {
    pub(crate) fn spawn(name: &str) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<(Watch, WatchedEvent)>();
        thread::Builder::new()
            .name(format!("{name}-events"))
            .spawn(move || {
                for (watch, event) in rx {
                    watch(event);
                }
                debug!("watch dispatcher exiting");
            })?;
        Ok(Self { tx })
    }

    pub(crate) fn deliver(&self, watch: Watch, event: WatchedEvent) {
        // The receiver only goes away with the process.
        let _ = self.tx.send((watch, event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_helpers() {
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/a", "b"), "/a/b");
        assert_eq!(parent_of("/a"), "/");
        assert_eq!(parent_of("/a/b/c"), "/a/b");
        assert_eq!(name_of("/a/b/c"), "c");
        assert_eq!(sequence_suffix(42), "0000000042");
    }

    #[test]
    fn rejects_malformed_paths() {
        assert!(validate_path("/ok/path").is_ok());
        assert!(validate_path("/").is_ok());
        assert!(validate_path("relative").is_err());
        assert!(validate_path("/trailing/").is_err());
        assert!(validate_path("/double//slash").is_err());
    }
}
