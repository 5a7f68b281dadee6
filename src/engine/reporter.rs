//! Periodic queue and worker-pool gauges.
//!
//! Read-only: each tick snapshots the queue without fetching payloads and
//! the worker roster, then sets gauges. Nothing here mutates either.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::shutdown::Shutdown;
use super::worker::WorkerStatus;
use crate::error::Result;
use crate::queue::{DelayDeadlineQueue, QueuedInstance};
use crate::telemetry::metrics::MetricsSink;

/// Horizons, in seconds, for the "due within" gauges.
pub const HORIZONS: [i64; 3] = [60, 300, 3600];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueStats {
    pub available: usize,
    pub unavailable: usize,
    /// Available items whose `bounce_by` is within each horizon of now.
    pub available_within: [usize; 3],
    /// Unavailable items whose `wait_until` is within each horizon of now.
    pub unavailable_within: [usize; 3],
    /// Largest `now - bounce_by` over overdue available items.
    pub overdue_max_secs: f64,
    /// Sum of `now - bounce_by` over overdue available items.
    pub overdue_sum_secs: f64,
}

pub fn queue_stats(
    available: &[QueuedInstance],
    unavailable: &[QueuedInstance],
    now: DateTime<Utc>,
) -> QueueStats {
    let within = |at: DateTime<Utc>| HORIZONS.map(|h| usize::from(at <= now + TimeDelta::seconds(h)));
    let mut stats = QueueStats {
        available: available.len(),
        unavailable: unavailable.len(),
        ..QueueStats::default()
    };

    for row in available {
        for (count, hit) in stats.available_within.iter_mut().zip(within(row.bounce_by)) {
            *count += hit;
        }
        if row.bounce_by < now {
            let overdue = (now - row.bounce_by).num_milliseconds() as f64 / 1000.0;
            stats.overdue_max_secs = stats.overdue_max_secs.max(overdue);
            stats.overdue_sum_secs += overdue;
        }
    }
    for row in unavailable {
        for (count, hit) in stats.unavailable_within.iter_mut().zip(within(row.wait_until)) {
            *count += hit;
        }
    }
    stats
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerCounts {
    pub busy: usize,
    pub idle: usize,
    pub dead: usize,
}

/// Worker statuses the daemon publishes for observers.
#[derive(Clone, Default)]
pub struct WorkerRoster {
    statuses: Arc<Mutex<Vec<Arc<WorkerStatus>>>>,
}

impl WorkerRoster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&self, statuses: Vec<Arc<WorkerStatus>>) {
        *self.statuses.lock() = statuses;
    }

    pub fn counts(&self) -> WorkerCounts {
        let mut counts = WorkerCounts::default();
        for status in self.statuses.lock().iter() {
            if !status.is_alive() {
                counts.dead += 1;
            } else if status.is_busy() {
                counts.busy += 1;
            } else {
                counts.idle += 1;
            }
        }
        counts
    }
}

pub struct MetricsReporter {
    queue: Arc<dyn DelayDeadlineQueue>,
    roster: WorkerRoster,
    metrics: Arc<dyn MetricsSink>,
    cluster: String,
    interval: Duration,
    shutdown: Shutdown,
}

impl MetricsReporter {
    pub fn new(
        queue: Arc<dyn DelayDeadlineQueue>,
        roster: WorkerRoster,
        metrics: Arc<dyn MetricsSink>,
        cluster: &str,
        interval: Duration,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            queue,
            roster,
            metrics,
            cluster: cluster.to_string(),
            interval,
            shutdown,
        }
    }

    pub fn spawn(self) -> Result<JoinHandle<()>> {
        Ok(thread::Builder::new()
            .name("metrics-reporter".to_string())
            .spawn(move || {
                loop {
                    if let Err(e) = self.tick() {
                        warn!(error = %e, "metrics tick failed");
                    }
                    if self.shutdown.sleep(self.interval) {
                        debug!("metrics reporter stopped");
                        return;
                    }
                }
            })?)
    }

    fn gauge(&self, name: &str, value: f64) {
        let tags = [("cluster", self.cluster.as_str())];
        self.metrics.create_gauge(name, &tags).set(value);
    }

    pub fn tick(&self) -> Result<()> {
        let available = self.queue.get_available_service_instances(false)?;
        let unavailable = self.queue.get_unavailable_service_instances(false)?;
        let stats = queue_stats(&available, &unavailable, Utc::now());

        self.gauge("queue.available", stats.available as f64);
        self.gauge("queue.unavailable", stats.unavailable as f64);
        for (i, horizon) in HORIZONS.iter().enumerate() {
            self.gauge(
                &format!("queue.available_within_{horizon}s"),
                stats.available_within[i] as f64,
            );
            self.gauge(
                &format!("queue.unavailable_within_{horizon}s"),
                stats.unavailable_within[i] as f64,
            );
        }
        self.gauge("queue.overdue_max_seconds", stats.overdue_max_secs);
        self.gauge("queue.overdue_sum_seconds", stats.overdue_sum_secs);

        let workers = self.roster.counts();
        self.gauge("workers.busy", workers.busy as f64);
        self.gauge("workers.idle", workers.idle as f64);
        self.gauge("workers.dead", workers.dead as f64);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(wait_until: DateTime<Utc>, bounce_by: DateTime<Utc>) -> QueuedInstance {
        QueuedInstance {
            wait_until,
            bounce_by,
            instance: None,
        }
    }

    #[test]
    fn buckets_and_overdue() {
        let now = Utc::now();
        let secs = TimeDelta::seconds;
        let available = vec![
            row(now - secs(10), now - secs(30)),
            row(now - secs(10), now - secs(10)),
            row(now - secs(10), now + secs(120)),
        ];
        let unavailable = vec![
            row(now + secs(30), now + secs(30)),
            row(now + secs(1000), now + secs(1000)),
            row(now + secs(7200), now + secs(7200)),
        ];

        let stats = queue_stats(&available, &unavailable, now);
        assert_eq!(stats.available, 3);
        assert_eq!(stats.unavailable, 3);
        assert_eq!(stats.available_within, [2, 3, 3]);
        assert_eq!(stats.unavailable_within, [1, 1, 2]);
        assert!((stats.overdue_max_secs - 30.0).abs() < 1e-6);
        assert!((stats.overdue_sum_secs - 40.0).abs() < 1e-6);
    }

    #[test]
    fn empty_queue_is_all_zero() {
        assert_eq!(queue_stats(&[], &[], Utc::now()), QueueStats::default());
    }
}
