//! Scheduling engine: workers, the leader's control loop and its observers.

pub mod backoff;
pub mod daemon;
pub mod reporter;
pub mod shutdown;
pub mod worker;

pub use backoff::BackoffPolicy;
pub use daemon::{DaemonConfig, DaemonDeps, DeployDaemon, build_queue};
pub use reporter::{MetricsReporter, WorkerRoster};
pub use shutdown::Shutdown;
pub use worker::{DeployWorker, WorkerHandle};
