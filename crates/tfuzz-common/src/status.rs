//! Compilation outcomes and their severity ordering.
//!
//! Every compiler invocation ends in exactly one [`CompilationStatus`].
//! Statuses are totally ordered by severity so that the worst result
//! across several compiler configurations can be picked:
//! CRASH > HANG > ERROR > SUCCESS > UNKNOWN.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Normalized outcome of one compiler invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompilationStatus {
    /// Compiled without errors.
    Success,
    /// Rejected with ordinary diagnostics.
    Error,
    /// Did not finish within the timeout.
    Hang,
    /// Internal compiler error or compiler panic.
    Crash,
    /// The adapter itself failed (e.g. the compiler could not be spawned).
    Unknown,
}

impl fmt::Display for CompilationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "SUCCESS"),
            Self::Error => write!(f, "ERROR"),
            Self::Hang => write!(f, "HANG"),
            Self::Crash => write!(f, "CRASH"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

impl CompilationStatus {
    /// Severity rank; higher is worse.
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::Crash => 4,
            Self::Hang => 3,
            Self::Error => 2,
            Self::Success => 1,
            Self::Unknown => 0,
        }
    }

    /// Returns true for the statuses that count as a finding (crash or hang).
    #[must_use]
    pub fn is_finding(self) -> bool {
        matches!(self, Self::Crash | Self::Hang)
    }

    /// Returns true if the compiler produced a definite accept/reject verdict.
    #[must_use]
    pub fn is_verdict(self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }

    /// Pick the more severe of two statuses.
    #[must_use]
    pub fn worse(self, other: Self) -> Self {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }

    /// Worst status of an iterator, or `None` if it is empty.
    pub fn worst<I: IntoIterator<Item = Self>>(statuses: I) -> Option<Self> {
        statuses.into_iter().reduce(Self::worse)
    }
}

/// Immutable record of one compiler invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilationResult {
    /// Normalized outcome.
    pub status: CompilationStatus,
    /// Process exit code; `None` when the process was killed on timeout.
    pub exit_code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Wall-clock duration of the invocation.
    pub duration: Duration,
}

impl CompilationResult {
    /// Result for an invocation that exceeded its deadline.
    #[must_use]
    pub fn hang(duration: Duration) -> Self {
        Self {
            status: CompilationStatus::Hang,
            exit_code: None,
            stdout: String::new(),
            stderr: "TimeoutExpired".to_string(),
            duration,
        }
    }

    /// Result for an invocation the adapter could not run at all.
    #[must_use]
    pub fn unknown(message: impl Into<String>, duration: Duration) -> Self {
        Self {
            status: CompilationStatus::Unknown,
            exit_code: Some(-1),
            stdout: String::new(),
            stderr: message.into(),
            duration,
        }
    }
}
