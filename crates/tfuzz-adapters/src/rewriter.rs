//! Rewrite pass collaborator: source on stdin, rewritten source on stdout.

use crate::process::{render_command, run_until, ProcessOutcome, ShutdownCheck};
use crate::Rewriter;
use std::process::Command;
use std::time::Duration;
use tfuzz_common::{FuzzError, FuzzResult};

/// Rewriter that pipes the seed through an external command.
#[derive(Clone)]
pub struct CommandRewriter {
    command: Vec<String>,
    timeout: Duration,
    shutdown: Option<ShutdownCheck>,
}

impl std::fmt::Debug for CommandRewriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRewriter")
            .field("command", &self.command)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl CommandRewriter {
    /// Create a rewriter for `command` (program followed by arguments).
    ///
    /// # Errors
    ///
    /// Returns [`FuzzError::Config`] when the command is empty.
    pub fn new(command: Vec<String>, timeout: Duration) -> FuzzResult<Self> {
        if command.is_empty() {
            return Err(FuzzError::Config("rewrite command is empty".to_string()));
        }
        Ok(Self {
            command,
            timeout,
            shutdown: None,
        })
    }

    /// Kill a running rewrite as soon as `shutdown` reports true.
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: ShutdownCheck) -> Self {
        self.shutdown = Some(shutdown);
        self
    }
}

impl Rewriter for CommandRewriter {
    fn rewrite(&self, source: &str) -> FuzzResult<String> {
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..]);
        let rendered = render_command(&cmd);

        match run_until(cmd, Some(source.as_bytes()), self.timeout, self.shutdown.as_ref()) {
            Ok(ProcessOutcome::Exited { status, stdout, .. }) if status.success() => Ok(stdout),
            Ok(ProcessOutcome::Exited { status, stderr, .. }) => Err(FuzzError::Tool(format!(
                "{rendered} exited with {status}: {}",
                stderr.trim()
            ))),
            Ok(ProcessOutcome::TimedOut { .. }) => Err(FuzzError::ToolTimeout {
                command: rendered,
                timeout: self.timeout,
            }),
            Err(e) => Err(FuzzError::Tool(format!("{rendered}: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_command_rejected() {
        let err = CommandRewriter::new(Vec::new(), Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, FuzzError::Config(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_pipes_source_through_command() {
        let rewriter = CommandRewriter::new(
            vec!["sed".to_string(), "s/foo/bar/".to_string()],
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(rewriter.rewrite("fn foo() {}\n").unwrap(), "fn bar() {}\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_command_is_tool_error() {
        let rewriter =
            CommandRewriter::new(vec!["false".to_string()], Duration::from_secs(5)).unwrap();
        assert!(matches!(rewriter.rewrite("x"), Err(FuzzError::Tool(_))));
    }
}
