//! In-process coordination ensemble.
//!
//! One [`MemoryEnsemble`] holds the node tree; each [`MemorySession`] is a
//! client with its own session, so several "replicas" can share a tree
//! inside one process. Sessions can be suspended, reconnected and expired
//! by hand to exercise disconnect handling.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    Coordinator, CreateMode, EventType, Op, SessionState, StateListener, Watch, WatchDispatcher,
    WatchedEvent, parent_of, sequence_suffix, validate_path,
};
use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Tree
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Node {
    data: Vec<u8>,
    owner: Option<String>,
    next_seq: u64,
}

/// A change that may trigger watches: either on the node's data or on its
/// parent's child list.
enum Fired {
    Data(EventType, String),
    Children(String),
}

#[derive(Default)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    child_watches: HashMap<String, Vec<Watch>>,
    data_watches: HashMap<String, Vec<Watch>>,
}

fn child_prefix(path: &str) -> String {
    if path == "/" {
        "/".to_string()
    } else {
        format!("{path}/")
    }
}

fn children_of(nodes: &BTreeMap<String, Node>, path: &str) -> Vec<String> {
    let prefix = child_prefix(path);
    nodes
        .range(prefix.clone()..)
        .map(|(k, _)| k.as_str())
        .take_while(|k| k.starts_with(prefix.as_str()))
        .filter_map(|k| {
            let rest = &k[prefix.len()..];
            (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
        })
        .collect()
}

fn create_node(
    nodes: &mut BTreeMap<String, Node>,
    path: &str,
    data: &[u8],
    mode: CreateMode,
    session: &str,
    fired: &mut Vec<Fired>,
) -> Result<String> {
    validate_path(path)?;
    let parent = parent_of(path).to_string();
    let parent_node = nodes
        .get_mut(&parent)
        .ok_or_else(|| Error::NoNode(parent.clone()))?;

    let actual = if mode.is_sequential() {
        let seq = parent_node.next_seq;
        parent_node.next_seq += 1;
        format!("{path}{}", sequence_suffix(seq))
    } else {
        path.to_string()
    };

    if nodes.contains_key(&actual) {
        return Err(Error::NodeExists(actual));
    }
    nodes.insert(
        actual.clone(),
        Node {
            data: data.to_vec(),
            owner: mode.is_ephemeral().then(|| session.to_string()),
            next_seq: 0,
        },
    );
    fired.push(Fired::Data(EventType::Created, actual.clone()));
    fired.push(Fired::Children(parent));
    Ok(actual)
}

fn delete_node(
    nodes: &mut BTreeMap<String, Node>,
    path: &str,
    fired: &mut Vec<Fired>,
) -> Result<()> {
    if !nodes.contains_key(path) {
        return Err(Error::NoNode(path.to_string()));
    }
    if !children_of(nodes, path).is_empty() {
        return Err(Error::NotEmpty(path.to_string()));
    }
    nodes.remove(path);
    fired.push(Fired::Data(EventType::Deleted, path.to_string()));
    fired.push(Fired::Children(parent_of(path).to_string()));
    Ok(())
}

impl Tree {
    fn new() -> Self {
        let mut tree = Self::default();
        tree.nodes.insert(
            "/".to_string(),
            Node {
                data: Vec::new(),
                owner: None,
                next_seq: 0,
            },
        );
        tree
    }

    /// Pull out the watches a batch of changes triggers.
    fn take_watches(&mut self, fired: Vec<Fired>) -> Vec<(Watch, WatchedEvent)> {
        let mut out = Vec::new();
        for change in fired {
            match change {
                Fired::Data(event_type, path) => {
                    for watch in self.data_watches.remove(&path).unwrap_or_default() {
                        out.push((
                            watch,
                            WatchedEvent {
                                event_type,
                                path: path.clone(),
                            },
                        ));
                    }
                    if event_type == EventType::Deleted {
                        for watch in self.child_watches.remove(&path).unwrap_or_default() {
                            out.push((
                                watch,
                                WatchedEvent {
                                    event_type,
                                    path: path.clone(),
                                },
                            ));
                        }
                    }
                }
                Fired::Children(path) => {
                    for watch in self.child_watches.remove(&path).unwrap_or_default() {
                        out.push((
                            watch,
                            WatchedEvent {
                                event_type: EventType::Child,
                                path: path.clone(),
                            },
                        ));
                    }
                }
            }
        }
        out
    }

    /// Drop every ephemeral node owned by `session`, deepest first.
    fn remove_ephemerals(&mut self, session: &str) -> Vec<Fired> {
        let mut owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.owner.as_deref() == Some(session))
            .map(|(k, _)| k.clone())
            .collect();
        owned.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| b.cmp(a)));

        let mut fired = Vec::new();
        for path in owned {
            if let Err(e) = delete_node(&mut self.nodes, &path, &mut fired) {
                debug!(path, error = %e, "could not reap ephemeral node");
            }
        }
        fired
    }
}

// ---------------------------------------------------------------------------
// Ensemble
// ---------------------------------------------------------------------------

struct EnsembleInner {
    tree: Mutex<Tree>,
    dispatcher: WatchDispatcher,
}

impl EnsembleInner {
    fn deliver(&self, watches: Vec<(Watch, WatchedEvent)>) {
        for (watch, event) in watches {
            self.dispatcher.deliver(watch, event);
        }
    }
}

/// Shared in-process node tree.
#[derive(Clone)]
pub struct MemoryEnsemble {
    inner: Arc<EnsembleInner>,
}

impl MemoryEnsemble {
    pub fn new() -> Result<Self> {
        Ok(Self {
            inner: Arc::new(EnsembleInner {
                tree: Mutex::new(Tree::new()),
                dispatcher: WatchDispatcher::spawn("memory-coord")?,
            }),
        })
    }

    /// Open a new client session against this ensemble.
    pub fn connect(&self) -> Arc<MemorySession> {
        let session = MemorySession {
            ensemble: Arc::clone(&self.inner),
            id: Uuid::new_v4().simple().to_string(),
            state: Mutex::new(SessionState::Connected),
            listeners: Mutex::new(Vec::new()),
        };
        debug!(session = %session.id, "memory session opened");
        Arc::new(session)
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One client session on a [`MemoryEnsemble`].
pub struct MemorySession {
    ensemble: Arc<EnsembleInner>,
    id: String,
    state: Mutex<SessionState>,
    listeners: Mutex<Vec<Arc<dyn Fn(SessionState) + Send + Sync>>>,
}

impl MemorySession {
    fn check(&self) -> Result<()> {
        match *self.state.lock() {
            SessionState::Connected => Ok(()),
            SessionState::Suspended => Err(Error::ConnectionLoss),
            SessionState::Lost => Err(Error::SessionExpired),
        }
    }

    fn transition(&self, to: SessionState) {
        {
            let mut state = self.state.lock();
            if *state == to || *state == SessionState::Lost {
                return;
            }
            *state = to;
        }
        info!(session = %self.id, state = ?to, "session state changed");
        let listeners: Vec<_> = self.listeners.lock().clone();
        for listener in listeners {
            listener(to);
        }
    }

    fn reap(&self) {
        let watches = {
            let mut tree = self.ensemble.tree.lock();
            let fired = tree.remove_ephemerals(&self.id);
            tree.take_watches(fired)
        };
        self.ensemble.deliver(watches);
    }

    /// Simulate a dropped connection. Ephemeral nodes survive.
    pub fn suspend(&self) {
        self.transition(SessionState::Suspended);
    }

    /// Recover from [`suspend`](Self::suspend).
    pub fn reconnect(&self) {
        if *self.state.lock() == SessionState::Suspended {
            self.transition(SessionState::Connected);
        }
    }

    /// End the session: its ephemeral nodes vanish and listeners see `Lost`.
    pub fn expire(&self) {
        if *self.state.lock() == SessionState::Lost {
            return;
        }
        self.reap();
        self.transition(SessionState::Lost);
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        if *self.state.lock() != SessionState::Lost {
            self.reap();
        }
    }
}

impl Coordinator for MemorySession {
    fn session_id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> SessionState {
        *self.state.lock()
    }

    fn add_listener(&self, listener: StateListener) {
        self.listeners.lock().push(Arc::from(listener));
    }

    fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        self.check()?;
        let (actual, watches) = {
            let mut tree = self.ensemble.tree.lock();
            let mut fired = Vec::new();
            let actual = create_node(&mut tree.nodes, path, data, mode, &self.id, &mut fired)?;
            (actual, tree.take_watches(fired))
        };
        self.ensemble.deliver(watches);
        Ok(actual)
    }

    fn get(&self, path: &str) -> Result<Vec<u8>> {
        self.check()?;
        let tree = self.ensemble.tree.lock();
        tree.nodes
            .get(path)
            .map(|n| n.data.clone())
            .ok_or_else(|| Error::NoNode(path.to_string()))
    }

    fn set(&self, path: &str, data: &[u8]) -> Result<()> {
        self.check()?;
        let watches = {
            let mut tree = self.ensemble.tree.lock();
            let node = tree
                .nodes
                .get_mut(path)
                .ok_or_else(|| Error::NoNode(path.to_string()))?;
            node.data = data.to_vec();
            tree.take_watches(vec![Fired::Data(EventType::Changed, path.to_string())])
        };
        self.ensemble.deliver(watches);
        Ok(())
    }

    fn get_data_w(&self, path: &str, watch: Watch) -> Result<Option<Vec<u8>>> {
        self.check()?;
        let mut tree = self.ensemble.tree.lock();
        let data = tree.nodes.get(path).map(|n| n.data.clone());
        tree.data_watches
            .entry(path.to_string())
            .or_default()
            .push(watch);
        Ok(data)
    }

    fn get_children(&self, path: &str, watch: Option<Watch>) -> Result<Vec<String>> {
        self.check()?;
        let mut tree = self.ensemble.tree.lock();
        if !tree.nodes.contains_key(path) {
            return Err(Error::NoNode(path.to_string()));
        }
        let children = children_of(&tree.nodes, path);
        if let Some(watch) = watch {
            tree.child_watches
                .entry(path.to_string())
                .or_default()
                .push(watch);
        }
        Ok(children)
    }

    fn delete(&self, path: &str) -> Result<()> {
        self.check()?;
        let watches = {
            let mut tree = self.ensemble.tree.lock();
            let mut fired = Vec::new();
            delete_node(&mut tree.nodes, path, &mut fired)?;
            tree.take_watches(fired)
        };
        self.ensemble.deliver(watches);
        Ok(())
    }

    fn multi(&self, ops: Vec<Op>) -> Result<()> {
        self.check()?;
        let watches = {
            let mut tree = self.ensemble.tree.lock();
            let mut staged = tree.nodes.clone();
            let mut fired = Vec::new();
            for op in &ops {
                match op {
                    Op::Create { path, data, mode } => {
                        create_node(&mut staged, path, data, *mode, &self.id, &mut fired)?;
                    }
                    Op::Delete { path } => delete_node(&mut staged, path, &mut fired)?,
                }
            }
            tree.nodes = staged;
            tree.take_watches(fired)
        };
        self.ensemble.deliver(watches);
        Ok(())
    }
}
