//! Complexity scoring through the mutator's metrics mode.

use crate::process::{run_until, ProcessOutcome, ShutdownCheck};
use crate::{Complexity, ComplexityScorer};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

/// `--mode` value that makes the mutator print metrics instead of mutating.
pub const METRICS_MODE: &str = "ttdn_metrics";

/// Collect the non-negative integer fields of a JSON object.
#[must_use]
pub fn parse_metrics(stdout: &str) -> Complexity {
    let trimmed = stdout.trim();
    let parsed = serde_json::from_str::<serde_json::Value>(if trimmed.is_empty() { "{}" } else { trimmed });
    match parsed {
        Ok(serde_json::Value::Object(map)) => map
            .into_iter()
            .filter_map(|(k, v)| v.as_u64().map(|n| (k, n)))
            .collect(),
        _ => Complexity::default(),
    }
}

/// Scorer that runs an external binary in metrics mode.
#[derive(Clone)]
pub struct ProcessScorer {
    binary: PathBuf,
    timeout: Duration,
    shutdown: Option<ShutdownCheck>,
}

impl std::fmt::Debug for ProcessScorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessScorer")
            .field("binary", &self.binary)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ProcessScorer {
    /// Create a scorer for `binary` with a per-call timeout.
    #[must_use]
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
            shutdown: None,
        }
    }

    /// Kill a running scorer as soon as `shutdown` reports true.
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: ShutdownCheck) -> Self {
        self.shutdown = Some(shutdown);
        self
    }
}

impl ComplexityScorer for ProcessScorer {
    fn score(&self, source: &Path) -> Complexity {
        let scratch = match tempfile::Builder::new().prefix("tfuzz-metrics").tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                tracing::debug!(error = %e, "cannot create scratch dir for scoring");
                return Complexity::default();
            }
        };
        let input = std::path::absolute(source).unwrap_or_else(|_| source.to_path_buf());
        let binary = std::path::absolute(&self.binary).unwrap_or_else(|_| self.binary.clone());

        let mut cmd = Command::new(binary);
        cmd.arg("--input")
            .arg(input)
            .arg("--output")
            .arg(scratch.path().join("metrics.out"))
            .arg("--mode")
            .arg(METRICS_MODE);

        match run_until(cmd, None, self.timeout, self.shutdown.as_ref()) {
            Ok(ProcessOutcome::Exited { status, stdout, .. }) if status.success() => {
                parse_metrics(&stdout)
            }
            Ok(ProcessOutcome::Exited { status, .. }) => {
                tracing::debug!(source = %source.display(), %status, "scorer exited unsuccessfully");
                Complexity::default()
            }
            Ok(ProcessOutcome::TimedOut { .. }) => {
                tracing::debug!(source = %source.display(), "scorer timed out");
                Complexity::default()
            }
            Err(e) => {
                tracing::debug!(source = %source.display(), error = %e, "failed to run scorer");
                Complexity::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_metrics_keeps_integers() {
        let c = parse_metrics(
            r#"{"constraint_sites": 3, "constraint_choice_sum": 27, "ratio": 0.5, "name": "x", "neg": -1}"#,
        );
        assert_eq!(c.get("constraint_sites"), 3);
        assert_eq!(c.get("constraint_choice_sum"), 27);
        assert_eq!(c.0.len(), 2);
    }

    #[test]
    fn test_parse_metrics_degrades_to_empty() {
        assert!(parse_metrics("").is_empty());
        assert!(parse_metrics("not json").is_empty());
        assert!(parse_metrics("[1, 2]").is_empty());
    }

    #[test]
    fn test_missing_binary_scores_empty() {
        let scorer = ProcessScorer::new("/nonexistent/mutation-ast", Duration::from_secs(1));
        assert!(scorer.score(Path::new("seed.rs")).is_empty());
    }
}
