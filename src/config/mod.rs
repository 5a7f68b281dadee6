//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or a
//! value does not parse. The database URL is wrapped in
//! [`secrecy::SecretString`] so it never ends up in logs.

pub mod secrets;

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use uuid::Uuid;

use crate::engine::{BackoffPolicy, DaemonConfig};
use crate::error::{Error, Result};
use crate::telemetry::metrics::MetricsProvider;
use crate::watchers::{WatcherKind, parse_watcher_list};

#[derive(Debug)]
pub struct Config {
    pub cluster: String,
    /// Postgres coordination backend. `None` keeps coordination in process.
    pub database_url: Option<SecretString>,
    pub soa_dir: PathBuf,
    pub system_config_dir: PathBuf,
    pub cluster_state_path: PathBuf,
    pub bounce_command: String,
    pub number_workers: usize,
    pub startup_bounce_rate: u32,
    pub big_bounce_rate: u32,
    pub cold_start: bool,
    pub oracle: bool,
    pub use_distributed_queue: bool,
    pub queue_root: String,
    pub leader_path: String,
    pub watchers: Vec<WatcherKind>,
    pub metrics_provider: MetricsProvider,
    pub backoff: BackoffPolicy,
    pub identity: String,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// In production, systemd EnvironmentFile provides the vars.
    pub fn from_env() -> Result<Self> {
        let backoff = BackoffPolicy {
            factor: seconds("DEPLOYD_BACKOFF_FACTOR_SECS", 0.5)?,
            base: growth("DEPLOYD_BACKOFF_BASE", 2.0)?,
            max: seconds("DEPLOYD_BACKOFF_MAX_SECS", 6000.0)?,
        };
        let number_workers: usize = parse_var("DEPLOYD_NUMBER_WORKERS", 4)?;
        if number_workers == 0 {
            return Err(Error::Config("DEPLOYD_NUMBER_WORKERS must be at least 1".to_string()));
        }

        Ok(Self {
            cluster: required_var("DEPLOYD_CLUSTER")?,
            database_url: optional_var("DATABASE_URL").map(SecretString::from),
            soa_dir: path_var("DEPLOYD_SOA_DIR", "/etc/deployd/services"),
            system_config_dir: path_var("DEPLOYD_SYSTEM_CONFIG_DIR", "/etc/deployd/system"),
            cluster_state_path: path_var(
                "DEPLOYD_CLUSTER_STATE",
                "/var/lib/deployd/cluster-state.json",
            ),
            bounce_command: optional_var("DEPLOYD_BOUNCE_COMMAND")
                .unwrap_or_else(|| "setup-deploy".to_string()),
            number_workers,
            startup_bounce_rate: rate("DEPLOYD_STARTUP_BOUNCE_RATE", 30)?,
            big_bounce_rate: rate("DEPLOYD_BIG_BOUNCE_RATE", 15)?,
            cold_start: parse_var("DEPLOYD_STARTUP_COLD_START", true)?,
            oracle: parse_var("DEPLOYD_STARTUP_ORACLE", false)?,
            use_distributed_queue: parse_var("DEPLOYD_USE_DISTRIBUTED_QUEUE", false)?,
            queue_root: optional_var("DEPLOYD_QUEUE_ROOT")
                .unwrap_or_else(|| "/deployd-queue".to_string()),
            leader_path: optional_var("DEPLOYD_LEADER_PATH")
                .unwrap_or_else(|| "/deployd-leader".to_string()),
            watchers: parse_watcher_list(&optional_var("DEPLOYD_WATCHERS").unwrap_or_default())?,
            metrics_provider: parse_var("DEPLOYD_METRICS_PROVIDER", MetricsProvider::None)?,
            backoff,
            identity: optional_var("DEPLOYD_IDENTITY")
                .or_else(|| optional_var("HOSTNAME"))
                .unwrap_or_else(|| Uuid::new_v4().simple().to_string()),
            otel_endpoint: optional_var("OTEL_ENDPOINT"),
            log_level: optional_var("DEPLOYD_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    /// Engine tunables for this deployment, defaults for everything the
    /// environment does not set.
    pub fn daemon_config(&self) -> DaemonConfig {
        DaemonConfig {
            cluster: self.cluster.clone(),
            number_workers: self.number_workers,
            startup_bounce_rate: self.startup_bounce_rate,
            cold_start: self.cold_start,
            oracle: self.oracle,
            backoff: self.backoff,
            ..DaemonConfig::default()
        }
    }
}

fn required_var(name: &str) -> Result<String> {
    optional_var(name)
        .ok_or_else(|| Error::Config(format!("required environment variable {name} is not set")))
}

/// Unset and empty are the same.
fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn path_var(name: &str, default: &str) -> PathBuf {
    PathBuf::from(optional_var(name).unwrap_or_else(|| default.to_string()))
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional_var(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{name}={raw}: {e}"))),
    }
}

fn rate(name: &str, default: u32) -> Result<u32> {
    match parse_var(name, default)? {
        0 => Err(Error::Config(format!("{name} must be at least 1 per minute"))),
        n => Ok(n),
    }
}

fn positive(name: &str, default: f64) -> Result<f64> {
    let value: f64 = parse_var(name, default)?;
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(Error::Config(format!("{name} must be a positive number")))
    }
}

fn seconds(name: &str, default: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(positive(name, default)?)
        .map_err(|e| Error::Config(format!("{name}: {e}")))
}

/// Backoff must never shrink as failures pile up.
fn growth(name: &str, default: f64) -> Result<f64> {
    match positive(name, default)? {
        base if base >= 1.0 => Ok(base),
        _ => Err(Error::Config(format!("{name} must be at least 1"))),
    }
}
