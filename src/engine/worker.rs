//! Bounce workers.
//!
//! A worker checks out one due instance at a time, hands it to the bounce
//! executor and decides from the verdict whether the instance goes back on
//! the queue:
//!
//! | verdict                         | failures | requeue at              |
//! |---------------------------------|----------|-------------------------|
//! | status 0, no retry hint         | same     | not requeued            |
//! | status 0, retry after `d`       | same     | now + `d`               |
//! | status != 0, or executor error  | +1       | now + backoff(failures) |
//!
//! The requeued copy carries the original `bounce_by`, `enqueue_time` and
//! timers forward. `bounce_start_time` is stamped on the first pickup and
//! carried after that.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{error, info, warn};

use super::backoff::BackoffPolicy;
use super::shutdown::Shutdown;
use crate::bounce::{BounceExecutor, BounceResult};
use crate::error::{Error, Result};
use crate::model::{BounceTimers, ServiceInstance};
use crate::queue::{Checkout, DelayDeadlineQueue};
use crate::telemetry::bounce::{record_bounce_outcome, start_bounce_span};
use crate::telemetry::metrics::MetricsSink;

/// Decide what, if anything, goes back on the queue.
///
/// `verdict` is `None` when the executor itself failed.
pub fn next_attempt(
    item: &ServiceInstance,
    verdict: Option<BounceResult>,
    now: DateTime<Utc>,
    backoff: &BackoffPolicy,
) -> Option<ServiceInstance> {
    let (failures, delay) = match verdict {
        Some(BounceResult {
            status: 0,
            retry_after: None,
        }) => return None,
        Some(BounceResult {
            status: 0,
            retry_after: Some(delay),
        }) => (item.failures, delay),
        _ => {
            let failures = item.failures.saturating_add(1);
            (failures, backoff.delay(failures))
        }
    };

    let delay = TimeDelta::from_std(delay).unwrap_or(TimeDelta::MAX);
    let mut next = item.clone();
    next.failures = failures;
    next.processed_count = item.processed_count.saturating_add(1);
    next.wait_until = now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC);
    Some(next)
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Liveness and activity, readable from other threads.
#[derive(Debug)]
pub struct WorkerStatus {
    busy: AtomicBool,
    alive: AtomicBool,
}

impl WorkerStatus {
    fn new() -> Self {
        Self {
            busy: AtomicBool::new(false),
            alive: AtomicBool::new(true),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

/// Marks the worker dead however its thread ends, panics included.
struct AliveGuard(Arc<WorkerStatus>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.busy.store(false, Ordering::SeqCst);
        self.0.alive.store(false, Ordering::SeqCst);
    }
}

pub struct DeployWorker {
    name: String,
    queue: Arc<dyn DelayDeadlineQueue>,
    executor: Arc<dyn BounceExecutor>,
    metrics: Arc<dyn MetricsSink>,
    cluster: String,
    backoff: BackoffPolicy,
    poll_interval: Duration,
    status: Arc<WorkerStatus>,
    shutdown: Shutdown,
}

impl DeployWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        queue: Arc<dyn DelayDeadlineQueue>,
        executor: Arc<dyn BounceExecutor>,
        metrics: Arc<dyn MetricsSink>,
        cluster: &str,
        backoff: BackoffPolicy,
        poll_interval: Duration,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            name: name.into(),
            queue,
            executor,
            metrics,
            cluster: cluster.to_string(),
            backoff,
            poll_interval,
            status: Arc::new(WorkerStatus::new()),
            shutdown,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> Arc<WorkerStatus> {
        Arc::clone(&self.status)
    }

    /// Run on a dedicated thread named after the worker.
    pub fn spawn(self) -> Result<WorkerHandle> {
        let status = self.status();
        let name = self.name.clone();
        let thread = thread::Builder::new().name(name.clone()).spawn(move || {
            let _guard = AliveGuard(self.status());
            if let Err(e) = self.run() {
                error!(worker = %self.name, error = %e, "worker exiting");
            }
        })?;
        Ok(WorkerHandle {
            name,
            status,
            thread: Some(thread),
        })
    }

    /// Work until shutdown. Returns early only on a queue failure.
    pub fn run(&self) -> Result<()> {
        info!(worker = %self.name, "worker starting");
        while !self.shutdown.is_triggered() {
            let checkout = match self.queue.get(true, Some(self.poll_interval)) {
                Ok(checkout) => checkout,
                Err(Error::Empty) => continue,
                Err(e) => return Err(e),
            };
            self.status.busy.store(true, Ordering::SeqCst);
            let result = self.process(checkout);
            self.status.busy.store(false, Ordering::SeqCst);
            result?;
        }
        info!(worker = %self.name, "worker stopped");
        Ok(())
    }

    fn setup_timers(&self, item: &ServiceInstance) -> BounceTimers {
        let tags = [
            ("service", item.service.as_str()),
            ("instance", item.instance.as_str()),
            ("cluster", self.cluster.as_str()),
        ];
        let bounce_length = match &item.bounce_timers {
            Some(timers) => {
                timers.processed_by_worker.stop();
                Arc::clone(&timers.bounce_length)
            }
            None => {
                let timer = self.metrics.create_timer("bounce_length_timer", &tags);
                timer.start();
                timer
            }
        };
        BounceTimers {
            processed_by_worker: self.metrics.create_timer("processed_by_worker", &tags),
            bounce_executor: self.metrics.create_timer("bounce_executor_timer", &tags),
            bounce_length,
        }
    }

    /// Handle one checked-out item, requeueing it if needed, then commit.
    pub fn process(&self, checkout: Checkout<'_>) -> Result<()> {
        let picked_up = Utc::now();
        let timers = self.setup_timers(&checkout);
        let span = start_bounce_span(&checkout.service, &checkout.instance, &self.name);
        let _entered = span.enter();
        info!(worker = %self.name, "processing {}", *checkout);

        timers.bounce_executor.start();
        let verdict = match self.executor.deploy(&checkout.service, &checkout.instance) {
            Ok(result) => {
                record_bounce_outcome(&span, result.status, result.retry_after);
                Some(result)
            }
            Err(e) => {
                warn!(worker = %self.name, error = %e, "bounce executor failed");
                None
            }
        };
        timers.bounce_executor.stop();

        let tags = [
            ("service", checkout.service.as_str()),
            ("instance", checkout.instance.as_str()),
            ("cluster", self.cluster.as_str()),
        ];
        if !matches!(verdict, Some(BounceResult { status: 0, .. })) {
            self.metrics.create_counter("bounce_failures", &tags).count();
        }

        match next_attempt(&checkout, verdict, Utc::now(), &self.backoff) {
            Some(mut next) => {
                info!(
                    failures = next.failures,
                    wait_until = %next.wait_until,
                    "not in steady state; requeueing"
                );
                timers.processed_by_worker.start();
                if checkout.processed_count == 0 {
                    next.bounce_start_time = picked_up;
                }
                next.watcher = self.name.clone();
                next.bounce_timers = Some(timers);
                self.queue.put(next)?;
            }
            None => {
                timers.bounce_length.stop();
                info!("{} in steady state", *checkout);
            }
        }
        checkout.commit()
    }
}

/// A running worker thread.
pub struct WorkerHandle {
    name: String,
    status: Arc<WorkerStatus>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_alive(&self) -> bool {
        self.status.is_alive()
    }

    pub fn is_busy(&self) -> bool {
        self.status.is_busy()
    }

    pub fn status(&self) -> Arc<WorkerStatus> {
        Arc::clone(&self.status)
    }

    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item() -> ServiceInstance {
        ServiceInstance::new("web", "main", "test")
    }

    #[test]
    fn success_without_hint_is_final() {
        let verdict = Some(BounceResult::done());
        assert!(next_attempt(&item(), verdict, Utc::now(), &BackoffPolicy::default()).is_none());
    }

    #[test]
    fn failure_without_verdict_backs_off() {
        let now = Utc::now();
        let mut start = item();
        start.failures = 2;
        let next = next_attempt(&start, None, now, &BackoffPolicy::default()).unwrap();
        assert_eq!(next.failures, 3);
        assert_eq!(next.wait_until, now + TimeDelta::seconds(4));
        assert_eq!(next.bounce_by, start.bounce_by);
    }
}
