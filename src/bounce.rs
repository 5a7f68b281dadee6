//! Bounce executor: the thing that actually converges a service instance.
//!
//! The scheduler only needs a verdict back: an exit status and, optionally,
//! how soon to look at the instance again.

use std::io::{BufRead, BufReader, Read};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::catalog::ServiceCatalog;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BounceResult {
    /// Zero means the bounce step succeeded.
    pub status: i32,
    /// Ask to be called again after this long, even on success.
    pub retry_after: Option<Duration>,
}

impl BounceResult {
    pub fn done() -> Self {
        Self {
            status: 0,
            retry_after: None,
        }
    }
}

/// Safe to call repeatedly for the same instance.
pub trait BounceExecutor: Send + Sync {
    fn deploy(&self, service: &str, instance: &str) -> Result<BounceResult>;
}

// ---------------------------------------------------------------------------
// External command
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CommandVerdict {
    bounce_again_in_seconds: Option<f64>,
}

/// Runs `<command> <service> <instance>`.
///
/// The exit code becomes the status (-1 if the process was killed). If the
/// last line of stdout is JSON with `bounce_again_in_seconds`, that becomes
/// the retry hint.
pub struct CommandExecutor {
    command: String,
    cluster: String,
    catalog: Option<Arc<dyn ServiceCatalog>>,
}

impl CommandExecutor {
    pub fn new(command: &str, cluster: &str) -> Self {
        Self {
            command: command.to_string(),
            cluster: cluster.to_string(),
            catalog: None,
        }
    }

    /// Export the desired app id to the command as `DEPLOYD_APP_ID`.
    pub fn with_catalog(mut self, catalog: Arc<dyn ServiceCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }
}

/// Longest retry hint honoured; larger hints are clamped to it.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

fn parse_retry_after(stdout: &[String]) -> Option<Duration> {
    let last = stdout.iter().rev().find(|line| !line.trim().is_empty())?;
    let verdict: CommandVerdict = serde_json::from_str(last.trim()).ok()?;
    let secs = verdict
        .bounce_again_in_seconds
        .filter(|secs| secs.is_finite() && *secs > 0.0)?;
    Some(
        Duration::try_from_secs_f64(secs)
            .map_or(MAX_RETRY_AFTER, |hint| hint.min(MAX_RETRY_AFTER)),
    )
}

/// Collect stdout line by line. Bytes that are not UTF-8 are replaced, and a
/// read error ends collection early rather than failing the bounce.
fn read_lines(stdout: impl Read, service: &str, instance: &str) -> Vec<String> {
    let mut reader = BufReader::new(stdout);
    let mut lines = Vec::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\n', '\r'])
                    .to_string();
                info!(service, instance, output = %line, "bounce command output");
                lines.push(line);
            }
            Err(e) => {
                warn!(service, instance, error = %e, "stopped reading bounce command output");
                break;
            }
        }
    }
    lines
}

impl BounceExecutor for CommandExecutor {
    fn deploy(&self, service: &str, instance: &str) -> Result<BounceResult> {
        let mut command = Command::new(&self.command);
        command
            .arg(service)
            .arg(instance)
            .env("DEPLOYD_CLUSTER", &self.cluster)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if let Some(catalog) = &self.catalog {
            if let Some(app_id) = catalog.desired_app_id(service, instance)? {
                command.env("DEPLOYD_APP_ID", app_id);
            }
        }

        debug!(command = %self.command, service, instance, "running bounce command");
        let mut child = command.spawn().map_err(|e| {
            Error::Other(format!("failed to start bounce command {}: {e}", self.command))
        })?;

        let lines = child
            .stdout
            .take()
            .map(|stdout| read_lines(stdout, service, instance))
            .unwrap_or_default();

        let status = child.wait()?;
        let code = status.code().unwrap_or_else(|| {
            warn!(service, instance, "bounce command terminated by signal");
            -1
        });
        Ok(BounceResult {
            status: code,
            retry_after: parse_retry_after(&lines),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_hint_comes_from_last_line() {
        let lines = vec![
            "deploying".to_string(),
            r#"{"bounce_again_in_seconds": 60}"#.to_string(),
            String::new(),
        ];
        assert_eq!(parse_retry_after(&lines), Some(Duration::from_secs(60)));
    }

    #[test]
    fn missing_or_bad_hint_is_none() {
        assert_eq!(parse_retry_after(&["done".to_string()]), None);
        assert_eq!(
            parse_retry_after(&[r#"{"bounce_again_in_seconds": null}"#.to_string()]),
            None
        );
        assert_eq!(parse_retry_after(&[]), None);
        assert_eq!(
            parse_retry_after(&[r#"{"bounce_again_in_seconds": -5}"#.to_string()]),
            None
        );
    }

    #[test]
    fn huge_hint_is_clamped() {
        assert_eq!(
            parse_retry_after(&[r#"{"bounce_again_in_seconds": 1e30}"#.to_string()]),
            Some(MAX_RETRY_AFTER)
        );
        assert_eq!(
            parse_retry_after(&[r#"{"bounce_again_in_seconds": 90000}"#.to_string()]),
            Some(MAX_RETRY_AFTER)
        );
    }

    #[test]
    fn invalid_utf8_output_is_kept_lossily() {
        let output: &[u8] = b"\xff\xfe progress\n{\"bounce_again_in_seconds\": 5}\n";
        let lines = read_lines(output, "web", "main");
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" progress"));
        assert_eq!(parse_retry_after(&lines), Some(Duration::from_secs(5)));
    }
}
