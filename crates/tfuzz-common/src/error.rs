use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Fuzzer error types covering configuration, external tools, and the case store.
///
/// Findings (crashes, hangs, miscompilations) are not errors; they are
/// reported through [`crate::status::CompilationStatus`].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FuzzError {
    /// Configuration or initialization error.
    #[error("configuration error: {0}")]
    Config(String),

    /// An external tool (mutator, scorer, rewriter) failed to run or exited non-zero.
    #[error("external tool failed: {0}")]
    Tool(String),

    /// An external tool did not finish within its deadline.
    #[error("external tool timed out after {timeout:?}: {command}")]
    ToolTimeout {
        /// Rendered command line.
        command: String,
        /// Deadline that was exceeded.
        timeout: Duration,
    },

    /// Filesystem operation failed.
    #[error("I/O error on {path}: {message}")]
    Io {
        /// Path involved in the failed operation.
        path: PathBuf,
        /// Rendered underlying error.
        message: String,
    },

    /// An advisory directory lock could not be acquired in time.
    #[error("could not acquire lock {path} within {timeout:?}")]
    LockTimeout {
        /// Lock directory.
        path: PathBuf,
        /// How long the caller was willing to wait.
        timeout: Duration,
    },
}

impl FuzzError {
    /// Build an [`FuzzError::Io`] from a path and an `std::io::Error`.
    pub fn io(path: impl Into<PathBuf>, err: &std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

/// Convenience type alias for fuzzer operations.
pub type FuzzResult<T> = Result<T, FuzzError>;
