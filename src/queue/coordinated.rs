//! Delay/deadline queue stored in the coordination service.
//!
//! Layout under the queue root:
//!
//! ```text
//! <root>/entries/entry-<bounce_by epoch secs, 10 digits>-<sequence>   JSON payload
//! <root>/locks/<entry name>                                            ephemeral, owner token
//! ```
//!
//! Entry names sort in dispatch order. `wait_until` travels in the payload;
//! entries are never rewritten, so each client caches the parsed times and
//! checks them again after taking the lock. A claim is an ephemeral lock node
//! named after the entry; committing deletes lock and entry in one
//! transaction, releasing deletes only the lock. If the holder's session
//! dies the lock goes with it and the entry is claimable again.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Checkout, DelayDeadlineQueue, QueuedInstance, Ticket};
use crate::coord::{Coordinator, CreateMode, Op, join};
use crate::error::{Error, Result};
use crate::model::ServiceInstance;

/// Longest a blocked `get` sleeps before rescanning on its own.
const MAX_SLEEP: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy)]
struct Header {
    wait_until: DateTime<Utc>,
    bounce_by: DateTime<Utc>,
}

#[derive(Default)]
struct LocalState {
    entries: Vec<String>,
    locked: HashSet<String>,
    headers: HashMap<String, Header>,
    malformed: HashSet<String>,
    /// Set by watches; cleared by a refresh.
    stale: bool,
    entries_watch_armed: bool,
    locks_watch_armed: bool,
}

struct Shared {
    state: Mutex<LocalState>,
    changed: Condvar,
}

#[derive(Clone, Copy)]
enum Listing {
    Entries,
    Locks,
}

enum Claim<'q> {
    Taken(Checkout<'q>),
    NotYet(DateTime<Utc>),
    Skipped,
}

/// Distributed [`DelayDeadlineQueue`] over any [`Coordinator`].
pub struct CoordinatedQueue {
    client: Arc<dyn Coordinator>,
    entries_path: String,
    locks_path: String,
    id: String,
    shared: Arc<Shared>,
}

impl CoordinatedQueue {
    pub fn new(client: Arc<dyn Coordinator>, root: &str) -> Result<Self> {
        let entries_path = join(root, "entries");
        let locks_path = join(root, "locks");
        client.ensure_path(&entries_path)?;
        client.ensure_path(&locks_path)?;

        let queue = Self {
            client,
            entries_path,
            locks_path,
            id: Uuid::new_v4().simple().to_string(),
            shared: Arc::new(Shared {
                state: Mutex::new(LocalState::default()),
                changed: Condvar::new(),
            }),
        };
        queue.refresh()?;
        Ok(queue)
    }

    /// Token written into lock nodes this queue creates.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Name an entry is created under. The sequence suffix is appended by
    /// the coordination service.
    pub fn entry_prefix(bounce_by: DateTime<Utc>) -> String {
        format!("entry-{:010}-", bounce_by.timestamp().max(0))
    }

    // -- local cache ------------------------------------------------------

    fn watch(&self, listing: Listing) -> crate::coord::Watch {
        let shared = Arc::clone(&self.shared);
        Box::new(move |_event| {
            let mut state = shared.state.lock();
            match listing {
                Listing::Entries => state.entries_watch_armed = false,
                Listing::Locks => state.locks_watch_armed = false,
            }
            state.stale = true;
            drop(state);
            shared.changed.notify_all();
        })
    }

    fn list(&self, path: &str, listing: Listing) -> Result<Vec<String>> {
        let arm = {
            let mut state = self.shared.state.lock();
            let armed = match listing {
                Listing::Entries => &mut state.entries_watch_armed,
                Listing::Locks => &mut state.locks_watch_armed,
            };
            !std::mem::replace(armed, true)
        };
        let watch = arm.then(|| self.watch(listing));
        let result = self.client.get_children(path, watch);
        if result.is_err() && arm {
            let mut state = self.shared.state.lock();
            match listing {
                Listing::Entries => state.entries_watch_armed = false,
                Listing::Locks => state.locks_watch_armed = false,
            }
        }
        result
    }

    /// Re-read both listings. Never holds the local lock across a call to
    /// the coordination service.
    fn refresh(&self) -> Result<()> {
        let mut entries = self.list(&self.entries_path, Listing::Entries)?;
        let locked: HashSet<String> = self
            .list(&self.locks_path, Listing::Locks)?
            .into_iter()
            .collect();
        entries.sort();

        let mut state = self.shared.state.lock();
        let present: HashSet<&String> = entries.iter().collect();
        state.headers.retain(|name, _| present.contains(name));
        state.malformed.retain(|name| present.contains(name));
        state.entries = entries;
        state.locked = locked;
        state.stale = false;
        Ok(())
    }

    fn entry_path(&self, name: &str) -> String {
        join(&self.entries_path, name)
    }

    fn lock_path(&self, name: &str) -> String {
        join(&self.locks_path, name)
    }

    fn parse(name: &str, data: &[u8]) -> Option<ServiceInstance> {
        match serde_json::from_slice::<ServiceInstance>(data) {
            Ok(item) => Some(item),
            Err(e) => {
                warn!(entry = name, error = %e, "skipping malformed queue entry");
                None
            }
        }
    }

    /// Cached times for an entry, reading the payload on first sight.
    /// `None` means the entry is gone or unreadable.
    fn header(&self, name: &str) -> Result<Option<Header>> {
        {
            let state = self.shared.state.lock();
            if state.malformed.contains(name) {
                return Ok(None);
            }
            if let Some(header) = state.headers.get(name) {
                return Ok(Some(*header));
            }
        }
        let data = match self.client.get(&self.entry_path(name)) {
            Ok(data) => data,
            Err(Error::NoNode(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let mut state = self.shared.state.lock();
        match Self::parse(name, &data) {
            Some(item) => {
                let header = Header {
                    wait_until: item.wait_until,
                    bounce_by: item.bounce_by,
                };
                state.headers.insert(name.to_string(), header);
                Ok(Some(header))
            }
            None => {
                state.malformed.insert(name.to_string());
                Ok(None)
            }
        }
    }

    fn unlocked_entries(&self) -> Vec<String> {
        let state = self.shared.state.lock();
        state
            .entries
            .iter()
            .filter(|name| !state.locked.contains(*name) && !state.malformed.contains(*name))
            .cloned()
            .collect()
    }

    fn drop_lock(&self, lock_path: &str) {
        match self.client.delete(lock_path) {
            Ok(()) | Err(Error::NoNode(_)) => {}
            Err(e) => warn!(lock = lock_path, error = %e, "failed to release queue lock"),
        }
    }

    fn try_claim(&self, name: &str, now: DateTime<Utc>) -> Result<Claim<'_>> {
        let lock_path = self.lock_path(name);
        match self
            .client
            .create(&lock_path, self.id.as_bytes(), CreateMode::Ephemeral)
        {
            Ok(_) => {}
            Err(Error::NodeExists(_)) => {
                self.shared.state.lock().locked.insert(name.to_string());
                return Ok(Claim::Skipped);
            }
            Err(e) => return Err(e),
        }

        let data = match self.client.get(&self.entry_path(name)) {
            Ok(data) => data,
            Err(Error::NoNode(_)) => {
                self.drop_lock(&lock_path);
                return Ok(Claim::Skipped);
            }
            Err(e) => {
                self.drop_lock(&lock_path);
                return Err(e);
            }
        };
        let Some(item) = Self::parse(name, &data) else {
            self.shared.state.lock().malformed.insert(name.to_string());
            self.drop_lock(&lock_path);
            return Ok(Claim::Skipped);
        };
        if item.wait_until > now {
            self.drop_lock(&lock_path);
            return Ok(Claim::NotYet(item.wait_until));
        }

        debug!(entry = name, service = %item.service, instance = %item.instance, "claimed queue entry");
        let ticket = CoordinatedTicket {
            queue: self,
            entry: name.to_string(),
        };
        Ok(Claim::Taken(Checkout::new(item, Box::new(ticket))))
    }

    fn holds_lock(&self, lock_path: &str) -> bool {
        matches!(self.client.get(lock_path), Ok(value) if value == self.id.as_bytes())
    }

    fn snapshot(&self, fetch: bool, available: bool) -> Result<Vec<QueuedInstance>> {
        self.refresh()?;
        let now = Utc::now();
        let mut rows = Vec::new();
        for name in self.unlocked_entries() {
            let Some(header) = self.header(&name)? else {
                continue;
            };
            if (header.wait_until <= now) != available {
                continue;
            }
            let instance = if fetch {
                match self.client.get(&self.entry_path(&name)) {
                    Ok(data) => Self::parse(&name, &data),
                    Err(Error::NoNode(_)) => continue,
                    Err(e) => return Err(e),
                }
            } else {
                None
            };
            rows.push(QueuedInstance {
                wait_until: header.wait_until,
                bounce_by: header.bounce_by,
                instance,
            });
        }
        if !available {
            rows.sort_by_key(|row| (row.wait_until, row.bounce_by));
        }
        Ok(rows)
    }
}

impl DelayDeadlineQueue for CoordinatedQueue {
    fn put(&self, item: ServiceInstance) -> Result<()> {
        let payload = serde_json::to_vec(&item)?;
        let path = join(&self.entries_path, &Self::entry_prefix(item.bounce_by));
        let created = self
            .client
            .create(&path, &payload, CreateMode::PersistentSequential)?;
        debug!(entry = %created, service = %item.service, instance = %item.instance, "queued");
        Ok(())
    }

    fn get(&self, block: bool, timeout: Option<Duration>) -> Result<Checkout<'_>> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            self.refresh()?;
            let now = Utc::now();
            let mut next_due: Option<DateTime<Utc>> = None;

            for name in self.unlocked_entries() {
                let Some(header) = self.header(&name)? else {
                    continue;
                };
                if header.wait_until > now {
                    next_due = Some(next_due.map_or(header.wait_until, |d| d.min(header.wait_until)));
                    continue;
                }
                match self.try_claim(&name, now)? {
                    Claim::Taken(checkout) => return Ok(checkout),
                    Claim::NotYet(at) => next_due = Some(next_due.map_or(at, |d| d.min(at))),
                    Claim::Skipped => {}
                }
            }

            if !block {
                return Err(Error::Empty);
            }
            let mut sleep = MAX_SLEEP;
            if let Some(deadline) = deadline {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return Err(Error::Empty);
                }
                sleep = sleep.min(left);
            }
            if let Some(due) = next_due {
                let until_due = (due - Utc::now())
                    .max(TimeDelta::zero())
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                sleep = sleep.min(until_due);
            }

            let mut state = self.shared.state.lock();
            if !state.stale && !sleep.is_zero() {
                self.shared.changed.wait_for(&mut state, sleep);
            }
        }
    }

    fn get_available_service_instances(&self, fetch: bool) -> Result<Vec<QueuedInstance>> {
        self.snapshot(fetch, true)
    }

    fn get_unavailable_service_instances(&self, fetch: bool) -> Result<Vec<QueuedInstance>> {
        self.snapshot(fetch, false)
    }
}

struct CoordinatedTicket<'q> {
    queue: &'q CoordinatedQueue,
    entry: String,
}

impl Ticket for CoordinatedTicket<'_> {
    fn commit(self: Box<Self>) -> Result<()> {
        let lock_path = self.queue.lock_path(&self.entry);
        // After a session loss the lock may now belong to someone else.
        if !self.queue.holds_lock(&lock_path) {
            warn!(entry = %self.entry, "lost queue lock before commit; leaving entry");
            return Err(Error::LockLost(self.entry.clone()));
        }
        let result = self.queue.client.multi(vec![
            Op::Delete {
                path: lock_path.clone(),
            },
            Op::Delete {
                path: self.queue.entry_path(&self.entry),
            },
        ]);
        if let Err(e) = &result {
            warn!(entry = %self.entry, error = %e, "commit failed; releasing queue lock");
            self.queue.drop_lock(&lock_path);
        }
        result
    }

    fn release(self: Box<Self>) {
        let lock_path = self.queue.lock_path(&self.entry);
        if self.queue.holds_lock(&lock_path) {
            self.queue.drop_lock(&lock_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_names_sort_by_bounce_by() {
        let early = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let late = DateTime::from_timestamp(1_700_000_100, 0).unwrap();
        assert_eq!(CoordinatedQueue::entry_prefix(early), "entry-1700000000-");
        assert!(CoordinatedQueue::entry_prefix(early) < CoordinatedQueue::entry_prefix(late));
    }
}
