//! Single-process delay/deadline queue.
//!
//! Two ordered maps behind one mutex: `unavailable` keyed by
//! `(wait_until, bounce_by)` and `available` keyed by `bounce_by`, each with
//! an insertion counter to keep keys unique. A promoter thread sleeps until
//! the earliest `wait_until` and moves due items across; every `put` wakes it
//! so the target is recomputed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use super::{Checkout, DelayDeadlineQueue, QueuedInstance, Ticket};
use crate::error::{Error, Result};
use crate::model::ServiceInstance;

type UnavailableKey = (DateTime<Utc>, DateTime<Utc>, u64);
type AvailableKey = (DateTime<Utc>, u64);

#[derive(Default)]
struct State {
    unavailable: BTreeMap<UnavailableKey, ServiceInstance>,
    available: BTreeMap<AvailableKey, ServiceInstance>,
    seq: u64,
    closed: bool,
}

impl State {
    fn insert(&mut self, item: ServiceInstance) {
        self.seq += 1;
        self.unavailable
            .insert((item.wait_until, item.bounce_by, self.seq), item);
    }

    /// Move everything due at `now` into `available`. Returns how many moved.
    fn promote(&mut self, now: DateTime<Utc>) -> usize {
        let mut moved = 0;
        while let Some(entry) = self.unavailable.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let ((_, bounce_by, seq), item) = entry.remove_entry();
            self.available.insert((bounce_by, seq), item);
            moved += 1;
        }
        moved
    }

    fn next_wait_until(&self) -> Option<DateTime<Utc>> {
        self.unavailable.keys().next().map(|(wait_until, _, _)| *wait_until)
    }
}

struct Inner {
    state: Mutex<State>,
    /// Signalled when items become available (or the queue closes).
    available: Condvar,
    /// Signalled on every put so the promoter recomputes its wakeup.
    promote: Condvar,
}

/// In-memory [`DelayDeadlineQueue`]. Contents are lost with the process.
pub struct MemoryQueue {
    inner: Arc<Inner>,
    promoter: Option<JoinHandle<()>>,
}

impl MemoryQueue {
    pub fn new() -> Result<Self> {
        let inner = Arc::new(Inner {
            state: Mutex::new(State::default()),
            available: Condvar::new(),
            promote: Condvar::new(),
        });
        let promoter = {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name("queue-promoter".to_string())
                .spawn(move || promote_loop(&inner))?
        };
        Ok(Self {
            inner,
            promoter: Some(promoter),
        })
    }

    fn snapshot(&self, fetch: bool, available: bool) -> Vec<QueuedInstance> {
        let mut state = self.inner.state.lock();
        if state.promote(Utc::now()) > 0 {
            self.inner.available.notify_all();
        }
        let row = |item: &ServiceInstance| QueuedInstance {
            wait_until: item.wait_until,
            bounce_by: item.bounce_by,
            instance: fetch.then(|| item.clone()),
        };
        if available {
            state.available.values().map(row).collect()
        } else {
            state.unavailable.values().map(row).collect()
        }
    }
}

fn promote_loop(inner: &Inner) {
    let mut state = inner.state.lock();
    loop {
        if state.closed {
            debug!("queue promoter exiting");
            return;
        }
        let now = Utc::now();
        if state.promote(now) > 0 {
            inner.available.notify_all();
        }
        match state.next_wait_until() {
            Some(wait_until) => {
                let sleep = (wait_until - now).to_std().unwrap_or(Duration::ZERO);
                inner.promote.wait_for(&mut state, sleep);
            }
            None => inner.promote.wait(&mut state),
        }
    }
}

impl DelayDeadlineQueue for MemoryQueue {
    fn put(&self, item: ServiceInstance) -> Result<()> {
        let mut state = self.inner.state.lock();
        state.insert(item);
        if state.promote(Utc::now()) > 0 {
            self.inner.available.notify_all();
        }
        self.inner.promote.notify_one();
        Ok(())
    }

    fn get(&self, block: bool, timeout: Option<Duration>) -> Result<Checkout<'_>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.inner.state.lock();
        loop {
            state.promote(Utc::now());
            if let Some(entry) = state.available.first_entry() {
                let item = entry.remove();
                let ticket = MemoryTicket {
                    queue: self,
                    original: Some(item.clone()),
                };
                return Ok(Checkout::new(item, Box::new(ticket)));
            }
            if !block || state.closed {
                return Err(Error::Empty);
            }
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Err(Error::Empty);
                    }
                    self.inner.available.wait_until(&mut state, deadline);
                }
                None => self.inner.available.wait(&mut state),
            }
        }
    }

    fn get_available_service_instances(&self, fetch: bool) -> Result<Vec<QueuedInstance>> {
        Ok(self.snapshot(fetch, true))
    }

    fn get_unavailable_service_instances(&self, fetch: bool) -> Result<Vec<QueuedInstance>> {
        Ok(self.snapshot(fetch, false))
    }
}

impl Drop for MemoryQueue {
    fn drop(&mut self) {
        self.inner.state.lock().closed = true;
        self.inner.promote.notify_all();
        self.inner.available.notify_all();
        if let Some(handle) = self.promoter.take() {
            let _ = handle.join();
        }
    }
}

struct MemoryTicket<'q> {
    queue: &'q MemoryQueue,
    original: Option<ServiceInstance>,
}

impl Ticket for MemoryTicket<'_> {
    fn commit(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    fn release(mut self: Box<Self>) {
        if let Some(item) = self.original.take() {
            debug!(service = %item.service, instance = %item.instance, "returning uncommitted item");
            // Infallible for the in-memory queue.
            let _ = self.queue.put(item);
        }
    }
}
