//! Error types for deployd-rs.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// `get` found nothing due before its timeout elapsed.
    #[error("queue is empty")]
    Empty,

    #[error("node already exists: {0}")]
    NodeExists(String),

    #[error("no such node: {0}")]
    NoNode(String),

    #[error("node has children: {0}")]
    NotEmpty(String),

    #[error("coordination connection lost")]
    ConnectionLoss,

    #[error("coordination session expired")]
    SessionExpired,

    /// A checked-out entry's lock no longer belongs to this consumer.
    #[error("queue lock lost: {0}")]
    LockLost(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("watcher {0} died")]
    WatcherDied(String),

    #[error("all workers died")]
    AllWorkersDead,

    #[error("startup failed: {0}")]
    Startup(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Errors that mean the coordination session itself is unusable.
    pub fn is_session_failure(&self) -> bool {
        matches!(self, Error::ConnectionLoss | Error::SessionExpired)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
