//! Leader election over the coordination service.
//!
//! Each replica creates an ephemeral sequential candidate node under the
//! election path; the lowest sequence holds leadership. A session listener
//! watches the connection: a suspended session gets a bounded reconnection
//! window, a lost one abdicates at once. Abdication pushes
//! [`ControlMessage::Abort`] onto the daemon's control channel and cancels
//! any pending wait. It never preempts the running callback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{error, info, warn};

use crate::coord::{Coordinator, CreateMode, SessionState, Watch, join, name_of};
use crate::error::{Error, Result};

/// Messages observed by the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    Abort,
}

/// How long a suspended session may take to come back.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            attempts: 12,
            interval: Duration::from_secs(5),
        }
    }
}

#[derive(Default)]
struct Flags {
    cancelled: bool,
    changed: bool,
}

/// State shared with the session listener and watches.
struct Signal {
    flags: Mutex<Flags>,
    cond: Condvar,
    watchdog_running: AtomicBool,
    control: Mutex<Sender<ControlMessage>>,
}

impl Signal {
    fn wake(&self) {
        self.flags.lock().changed = true;
        self.cond.notify_all();
    }

    fn cancel(&self) {
        self.flags.lock().cancelled = true;
        self.cond.notify_all();
    }

    fn abdicate(&self, reason: &str) {
        warn!(reason, "abdicating leadership");
        // The daemon may already be gone.
        let _ = self.control.lock().send(ControlMessage::Abort);
        self.cancel();
    }
}

pub struct LeaderElection {
    client: Arc<dyn Coordinator>,
    path: String,
    identifier: String,
    signal: Arc<Signal>,
}

impl LeaderElection {
    pub fn new(
        client: Arc<dyn Coordinator>,
        path: &str,
        identifier: &str,
        control: Sender<ControlMessage>,
        policy: ReconnectPolicy,
    ) -> Self {
        let signal = Arc::new(Signal {
            flags: Mutex::new(Flags::default()),
            cond: Condvar::new(),
            watchdog_running: AtomicBool::new(false),
            control: Mutex::new(control),
        });

        let weak_client = Arc::downgrade(&client);
        let listener_signal = Arc::clone(&signal);
        client.add_listener(Box::new(move |state| {
            on_state_change(state, &weak_client, &listener_signal, policy);
        }));

        Self {
            client,
            path: path.to_string(),
            identifier: identifier.to_string(),
            signal,
        }
    }

    /// Give up leadership, or stop waiting for it.
    pub fn cancel(&self) {
        self.signal.cancel();
    }

    /// Block until elected, then run `f`.
    ///
    /// Returns `Ok(None)` if the election was cancelled before this replica
    /// won.
    pub fn run<F, R>(&self, f: F) -> Result<Option<R>>
    where
        F: FnOnce() -> R,
    {
        self.client.ensure_path(&self.path)?;
        let node = self.client.create(
            &join(&self.path, "candidate-"),
            self.identifier.as_bytes(),
            CreateMode::EphemeralSequential,
        )?;
        let me = name_of(&node).to_string();
        info!(candidate = %me, identifier = %self.identifier, "waiting to become leader");

        let won = self.wait_for_turn(&me);
        let outcome = match won {
            Ok(true) => {
                info!(identifier = %self.identifier, "elected leader");
                Ok(Some(f()))
            }
            Ok(false) => {
                info!("election cancelled");
                Ok(None)
            }
            Err(e) => Err(e),
        };

        match self.client.delete(&node) {
            Ok(()) | Err(Error::NoNode(_)) => {}
            Err(e) => warn!(node = %node, error = %e, "failed to withdraw election candidate"),
        }
        outcome
    }

    fn wait_for_turn(&self, me: &str) -> Result<bool> {
        loop {
            if self.signal.flags.lock().cancelled {
                return Ok(false);
            }

            let signal = Arc::clone(&self.signal);
            let watch: Watch = Box::new(move |_| signal.wake());
            let mut candidates = self.client.get_children(&self.path, Some(watch))?;
            candidates.sort();

            match candidates.first() {
                Some(first) if first == me => return Ok(true),
                _ if !candidates.iter().any(|c| c == me) => {
                    return Err(Error::SessionExpired);
                }
                _ => {}
            }

            let mut flags = self.signal.flags.lock();
            while !flags.changed && !flags.cancelled {
                self.signal.cond.wait(&mut flags);
            }
            flags.changed = false;
        }
    }

    /// Identifiers of every replica in the election, leader first.
    pub fn contenders(&self) -> Result<Vec<String>> {
        let mut candidates = self.client.get_children(&self.path, None)?;
        candidates.sort();
        let mut out = Vec::with_capacity(candidates.len());
        for name in candidates {
            match self.client.get(&join(&self.path, &name)) {
                Ok(data) => out.push(String::from_utf8_lossy(&data).into_owned()),
                Err(Error::NoNode(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }
}

fn on_state_change(
    state: SessionState,
    client: &Weak<dyn Coordinator>,
    signal: &Arc<Signal>,
    policy: ReconnectPolicy,
) {
    match state {
        SessionState::Connected => {}
        SessionState::Lost => signal.abdicate("coordination session lost"),
        SessionState::Suspended => {
            if signal.watchdog_running.swap(true, Ordering::SeqCst) {
                return;
            }
            let client = client.clone();
            let signal_for_thread = Arc::clone(signal);
            let spawned = thread::Builder::new()
                .name("leader-watchdog".to_string())
                .spawn(move || reconnect_watchdog(&client, &signal_for_thread, policy));
            if let Err(e) = spawned {
                error!(error = %e, "could not start reconnection watchdog");
                signal.abdicate("reconnection watchdog unavailable");
            }
        }
    }
}

fn reconnect_watchdog(client: &Weak<dyn Coordinator>, signal: &Signal, policy: ReconnectPolicy) {
    warn!(
        attempts = policy.attempts,
        interval_secs = policy.interval.as_secs_f64(),
        "coordination session suspended; waiting for reconnect"
    );
    for attempt in 1..=policy.attempts {
        thread::sleep(policy.interval);
        let Some(client) = client.upgrade() else {
            break;
        };
        match client.state() {
            SessionState::Connected => {
                info!(attempt, "coordination session reconnected");
                signal.watchdog_running.store(false, Ordering::SeqCst);
                return;
            }
            SessionState::Lost => break,
            SessionState::Suspended => {}
        }
    }
    signal.watchdog_running.store(false, Ordering::SeqCst);
    signal.abdicate("coordination session did not recover in time");
}
