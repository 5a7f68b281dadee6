//! Autoscaler watcher.
//!
//! The autoscaler writes desired instance counts to
//! `<root>/<service>/<instance>/instances` in the coordination tree. This
//! watcher walks the tree below the root, keeps a children watch on every
//! folder and a data watch on every `instances` node, and enqueues the
//! instance whenever that node is created or its value changes.
//!
//! Watch callbacks only forward the event over a channel; the watcher
//! thread does the re-reading and re-arming.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use tracing::{debug, info};

use super::{Watcher, WatcherContext};
use crate::coord::{Coordinator, EventType, Watch, WatchedEvent, join};
use crate::error::{Error, Result};

const NAME: &str = "autoscaler";

enum Change {
    Folder(String),
    Node(WatchedEvent),
}

pub struct AutoscalerWatcher {
    client: Arc<dyn Coordinator>,
    root: String,
    poll_interval: Duration,
    tx: Sender<Change>,
    rx: Receiver<Change>,
    armed_folders: HashSet<String>,
    armed_nodes: HashSet<String>,
    values: HashMap<String, Option<Vec<u8>>>,
}

impl AutoscalerWatcher {
    pub fn new(client: Arc<dyn Coordinator>, root: &str, poll_interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            client,
            root: root.to_string(),
            poll_interval,
            tx,
            rx,
            armed_folders: HashSet::new(),
            armed_nodes: HashSet::new(),
            values: HashMap::new(),
        }
    }

    fn folder_watch(&self, path: &str) -> Watch {
        let tx = self.tx.clone();
        let path = path.to_string();
        Box::new(move |_| {
            let _ = tx.send(Change::Folder(path));
        })
    }

    fn node_watch(&self) -> Watch {
        let tx = self.tx.clone();
        Box::new(move |event| {
            let _ = tx.send(Change::Node(event));
        })
    }

    /// Walk `path`, arming watches. Newly armed `instances` nodes are
    /// pushed onto `discovered`.
    fn watch_folder(&mut self, path: &str, discovered: &mut Vec<String>) -> Result<()> {
        if path.contains("autoscaling.lock") || self.armed_folders.contains(path) {
            return Ok(());
        }
        debug!(path, "watching folder");
        let children = match self.client.get_children(path, Some(self.folder_watch(path))) {
            Ok(children) => children,
            Err(Error::NoNode(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        self.armed_folders.insert(path.to_string());
        self.forget_missing(path, &children);

        if children.iter().any(|c| c == "instances") {
            let node = join(path, "instances");
            if !self.armed_nodes.contains(&node) {
                self.watch_node(&node)?;
                discovered.push(node);
            }
        } else {
            for child in children {
                self.watch_folder(&join(path, &child), discovered)?;
            }
        }
        Ok(())
    }

    /// Drop state for anything below `parent` whose top-level child is gone.
    fn forget_missing(&mut self, parent: &str, children: &[String]) {
        let prefix = join(parent, "");
        let gone = |path: &String| {
            path.strip_prefix(prefix.as_str())
                .and_then(|rest| rest.split('/').next())
                .is_some_and(|first| !children.iter().any(|c| c == first))
        };
        self.armed_folders.retain(|path| !gone(path));
        self.armed_nodes.retain(|path| !gone(path));
        self.values.retain(|path, _| !gone(path));
    }

    /// Arm a data watch and return the current value.
    fn watch_node(&mut self, path: &str) -> Result<Option<Vec<u8>>> {
        if self.armed_nodes.contains(path) {
            return Ok(self.values.get(path).cloned().flatten());
        }
        debug!(path, "watching node");
        let value = self.client.get_data_w(path, self.node_watch())?;
        self.armed_nodes.insert(path.to_string());
        self.values.insert(path.to_string(), value.clone());
        Ok(value)
    }

    fn handle(&mut self, change: Change, ctx: &WatcherContext) -> Result<()> {
        match change {
            Change::Folder(path) => {
                self.armed_folders.remove(&path);
                let mut discovered = Vec::new();
                self.watch_folder(&path, &mut discovered)?;
                for node in discovered {
                    if self.values.get(&node).is_some_and(Option::is_some) {
                        self.enqueue(&node, ctx)?;
                    }
                }
                Ok(())
            }
            Change::Node(event) => {
                self.armed_nodes.remove(&event.path);
                let previous = self.values.remove(&event.path).flatten();
                if event.event_type == EventType::Deleted {
                    // The parent folder's watch picks it up if it comes back.
                    debug!(path = %event.path, "node deleted");
                    return Ok(());
                }
                let current = self.watch_node(&event.path)?;
                let changed = match event.event_type {
                    EventType::Created => true,
                    EventType::Changed => current != previous,
                    _ => false,
                };
                if changed && current.is_some() {
                    self.enqueue(&event.path, ctx)?;
                }
                Ok(())
            }
        }
    }

    fn enqueue(&self, node: &str, ctx: &WatcherContext) -> Result<()> {
        let Some(key) = instance_of(node) else {
            return Ok(());
        };
        info!(
            service = %key.0,
            instance = %key.1,
            "instance count changed or autoscaling enabled"
        );
        ctx.enqueue_now(vec![key], NAME)
    }
}

/// `(service, instance)` from `.../<service>/<instance>/instances`.
fn instance_of(path: &str) -> Option<(String, String)> {
    let mut parts = path.rsplit('/');
    let _instances = parts.next()?;
    let instance = parts.next()?;
    let service = parts.next()?;
    (!service.is_empty() && !instance.is_empty())
        .then(|| (service.to_string(), instance.to_string()))
}

impl Watcher for AutoscalerWatcher {
    fn name(&self) -> &'static str {
        NAME
    }

    fn run(mut self: Box<Self>, ctx: WatcherContext) -> Result<()> {
        self.client.ensure_path(&self.root)?;
        let root = self.root.clone();
        // Nodes present at startup are not bounces.
        self.watch_folder(&root, &mut Vec::new())?;
        info!(
            folders = self.armed_folders.len(),
            nodes = self.armed_nodes.len(),
            "autoscaler watches established"
        );
        ctx.mark_ready();

        while !ctx.shutdown.is_triggered() {
            match self.rx.recv_timeout(self.poll_interval) {
                Ok(change) => self.handle(change, &ctx)?,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        Ok(())
    }
}
