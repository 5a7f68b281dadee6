//! Delay/deadline work queue.
//!
//! Items become visible once `wait_until` has passed; among visible items
//! the one with the lowest `bounce_by` is handed out first. A handed-out
//! item is exclusive to its [`Checkout`] until the checkout is committed
//! (consumed) or dropped (returned to the queue unchanged).
//!
//! Two implementations share [`DelayDeadlineQueue`]: [`memory`] keeps
//! everything in process memory, [`coordinated`] stores entries in the
//! coordination service so they survive restarts and leader changes.

pub mod coordinated;
pub mod memory;

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::Result;
use crate::model::ServiceInstance;

pub use coordinated::CoordinatedQueue;
pub use memory::MemoryQueue;

/// `(wait_until, bounce_by)` of one queued copy.
type Urgency = (DateTime<Utc>, DateTime<Utc>);

/// Snapshot row returned by the queue inspection methods.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedInstance {
    pub wait_until: DateTime<Utc>,
    pub bounce_by: DateTime<Utc>,
    /// Only populated when the caller asked for payloads.
    pub instance: Option<ServiceInstance>,
}

pub trait DelayDeadlineQueue: Send + Sync {
    /// Insert an item. Never blocks on other consumers.
    fn put(&self, item: ServiceInstance) -> Result<()>;

    /// Check out one due item.
    ///
    /// With `block == false`, or once `timeout` elapses, returns
    /// [`Error::Empty`](crate::error::Error::Empty) instead of waiting.
    fn get(&self, block: bool, timeout: Option<Duration>) -> Result<Checkout<'_>>;

    /// Items that are due now, in dispatch order.
    fn get_available_service_instances(&self, fetch: bool) -> Result<Vec<QueuedInstance>>;

    /// Items still waiting for their `wait_until`.
    fn get_unavailable_service_instances(&self, fetch: bool) -> Result<Vec<QueuedInstance>>;

    /// Put each item unless a pending copy of the same instance is already
    /// at least as urgent (due no later, deadline no later). Returns how
    /// many were put.
    ///
    /// Checked-out items are not pending. The check and the puts are not
    /// atomic, so two producers racing can still both insert.
    fn put_coalesced(&self, items: Vec<ServiceInstance>) -> Result<usize> {
        let mut pending: HashMap<(String, String), Vec<Urgency>> = HashMap::new();
        let mut rows = self.get_available_service_instances(true)?;
        rows.extend(self.get_unavailable_service_instances(true)?);
        for row in rows {
            if let Some(queued) = row.instance {
                note_pending(&mut pending, &queued);
            }
        }

        let mut put = 0;
        for item in items {
            let key = (item.service.clone(), item.instance.clone());
            let covered = pending.get(&key).is_some_and(|copies| {
                copies.iter().any(|&(wait_until, bounce_by)| {
                    wait_until <= item.wait_until && bounce_by <= item.bounce_by
                })
            });
            if covered {
                debug!(service = %item.service, instance = %item.instance, "already queued");
                continue;
            }
            note_pending(&mut pending, &item);
            self.put(item)?;
            put += 1;
        }
        Ok(put)
    }
}

fn note_pending(
    pending: &mut HashMap<(String, String), Vec<Urgency>>,
    item: &ServiceInstance,
) {
    pending
        .entry((item.service.clone(), item.instance.clone()))
        .or_default()
        .push((item.wait_until, item.bounce_by));
}

// ---------------------------------------------------------------------------
// Checkout
// ---------------------------------------------------------------------------

/// Backend half of a checkout: knows how to consume or give back the item.
pub trait Ticket: Send {
    fn commit(self: Box<Self>) -> Result<()>;
    fn release(self: Box<Self>);
}

/// Exclusive hold on one queued item.
///
/// Call [`commit`](Checkout::commit) once the item has been handled.
/// Dropping the checkout without committing puts the item back.
pub struct Checkout<'q> {
    item: ServiceInstance,
    ticket: Option<Box<dyn Ticket + 'q>>,
}

impl<'q> Checkout<'q> {
    pub fn new(item: ServiceInstance, ticket: Box<dyn Ticket + 'q>) -> Self {
        Self {
            item,
            ticket: Some(ticket),
        }
    }

    pub fn item(&self) -> &ServiceInstance {
        &self.item
    }

    /// Mark the item consumed.
    pub fn commit(mut self) -> Result<()> {
        match self.ticket.take() {
            Some(ticket) => ticket.commit(),
            None => Ok(()),
        }
    }
}

impl Deref for Checkout<'_> {
    type Target = ServiceInstance;

    fn deref(&self) -> &ServiceInstance {
        &self.item
    }
}

impl Drop for Checkout<'_> {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            ticket.release();
        }
    }
}

impl fmt::Debug for Checkout<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Checkout")
            .field("item", &self.item)
            .field("pending", &self.ticket.is_some())
            .finish()
    }
}
