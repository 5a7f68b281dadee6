//! Core data model.
//!
//! A service instance is the unit of scheduling. It carries its identity
//! (service + instance), who enqueued it, when it may run (`wait_until`),
//! how urgent it is once due (`bounce_by`), and bookkeeping that follows a
//! single logical bounce across requeues.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::telemetry::metrics::Timer;

// ---------------------------------------------------------------------------
// Service instance
// ---------------------------------------------------------------------------

/// A service instance waiting to be bounced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub service: String,
    pub instance: String,

    /// Producer that created or last touched this item. Diagnostic only.
    #[serde(default = "unknown_watcher")]
    pub watcher: String,

    /// Deadline used to rank items that are already due. Lower runs sooner.
    #[serde(default = "Utc::now")]
    pub bounce_by: DateTime<Utc>,

    /// Earliest time this item may be handed to a worker.
    #[serde(default = "Utc::now")]
    pub wait_until: DateTime<Utc>,

    /// When the logical bounce was first enqueued.
    #[serde(default = "Utc::now")]
    pub enqueue_time: DateTime<Utc>,

    /// When a worker first picked up the logical bounce. Equal to the
    /// creation time until then.
    #[serde(default = "Utc::now")]
    pub bounce_start_time: DateTime<Utc>,

    /// Consecutive dispatch failures for this logical bounce.
    #[serde(default)]
    pub failures: u32,

    /// How many times this logical bounce has been dispatched.
    #[serde(default)]
    pub processed_count: u32,

    /// In-flight timers. Never persisted; recreated on first dispatch.
    #[serde(skip)]
    pub bounce_timers: Option<BounceTimers>,
}

fn unknown_watcher() -> String {
    "unknown".to_string()
}

impl ServiceInstance {
    /// A fresh logical bounce, due and urgent right now.
    pub fn new(
        service: impl Into<String>,
        instance: impl Into<String>,
        watcher: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            service: service.into(),
            instance: instance.into(),
            watcher: watcher.into(),
            bounce_by: now,
            wait_until: now,
            enqueue_time: now,
            bounce_start_time: now,
            failures: 0,
            processed_count: 0,
            bounce_timers: None,
        }
    }

    pub fn bounce_by(mut self, at: DateTime<Utc>) -> Self {
        self.bounce_by = at;
        self
    }

    pub fn wait_until(mut self, at: DateTime<Utc>) -> Self {
        self.wait_until = at;
        self
    }

    /// Stable identity of the deployable unit.
    pub fn key(&self) -> (&str, &str) {
        (&self.service, &self.instance)
    }
}

impl PartialEq for ServiceInstance {
    fn eq(&self, other: &Self) -> bool {
        self.service == other.service
            && self.instance == other.instance
            && self.watcher == other.watcher
            && self.bounce_by == other.bounce_by
            && self.wait_until == other.wait_until
            && self.enqueue_time == other.enqueue_time
            && self.bounce_start_time == other.bounce_start_time
            && self.failures == other.failures
            && self.processed_count == other.processed_count
    }
}

impl fmt::Display for ServiceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.service, self.instance)
    }
}

// ---------------------------------------------------------------------------
// Bounce timers
// ---------------------------------------------------------------------------

/// Timers that live for one logical bounce.
///
/// `bounce_length` is started on the first dispatch and stopped when the
/// bounce completes; the other two are recreated on every worker pass.
#[derive(Clone)]
pub struct BounceTimers {
    /// Time spent waiting in the queue between worker passes.
    pub processed_by_worker: Arc<dyn Timer>,
    /// Time spent inside the bounce executor.
    pub bounce_executor: Arc<dyn Timer>,
    /// Whole-bounce wall time.
    pub bounce_length: Arc<dyn Timer>,
}

impl fmt::Debug for BounceTimers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BounceTimers").finish_non_exhaustive()
    }
}
