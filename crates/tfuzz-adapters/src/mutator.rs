//! AST mutation tool adapter and its stderr contract.

use crate::process::{run_until, ProcessOutcome, ShutdownCheck};
use crate::MutationTool;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

/// Stderr marker for input the tool cannot parse.
pub const PARSE_FAILED_MARKER: &str = "Parse failed:";

/// Stderr marker for an inapplicable mutation.
pub const NO_MUTATION_MARKER: &str = "No mutation performed";

/// Prefix of the machine-readable choice line.
pub const CHOICE_LINE_PREFIX: &str = "MUTATION_CHOICE";

/// Flag used to force a target index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexFlag {
    /// `--constraint-index`, a global choice index for constraint injection.
    Constraint,
    /// `--choice-index`, a global choice index for projection rewriting.
    Choice,
    /// `--index`, a mutation-site index.
    Site,
}

impl IndexFlag {
    /// Command-line spelling of the flag.
    #[must_use]
    pub fn as_arg(self) -> &'static str {
        match self {
            Self::Constraint => "--constraint-index",
            Self::Choice => "--choice-index",
            Self::Site => "--index",
        }
    }
}

/// One mutation request.
#[derive(Debug, Clone, Copy)]
pub struct MutationRequest<'a> {
    /// Source file to mutate.
    pub input: &'a Path,
    /// Strategy identifier passed as `--mode`.
    pub mode: &'a str,
    /// Optional forced target index.
    pub index: Option<(IndexFlag, usize)>,
}

/// Parsed `MUTATION_CHOICE` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationChoice {
    /// Mode echoed by the tool.
    pub mode: String,
    /// Number of mutation sites.
    pub count: u64,
    /// Site that was chosen.
    pub index: u64,
    /// Whether a mutation happened.
    pub mutated: bool,
    /// Global choice total, for injection-style strategies.
    pub choice_count: Option<u64>,
    /// Global choice index, for injection-style strategies.
    pub choice_index: Option<u64>,
}

impl MutationChoice {
    /// Find and parse the first choice line in `stderr`.
    #[must_use]
    pub fn parse(stderr: &str) -> Option<Self> {
        let line = stderr
            .lines()
            .find_map(|l| l.trim().strip_prefix(CHOICE_LINE_PREFIX))?;

        let mut mode = None;
        let mut count = None;
        let mut index = None;
        let mut mutated = None;
        let mut choice_count = None;
        let mut choice_index = None;
        for field in line.split_whitespace() {
            let Some((key, value)) = field.split_once('=') else {
                continue;
            };
            match key {
                "mode" => mode = Some(value.to_string()),
                "count" => count = value.parse().ok(),
                "index" => index = value.parse().ok(),
                "mutated" => mutated = value.parse::<u8>().ok().map(|v| v != 0),
                "choice_count" => choice_count = value.parse().ok(),
                "choice_index" => choice_index = value.parse().ok(),
                _ => {}
            }
        }

        Some(Self {
            mode: mode?,
            count: count?,
            index: index?,
            mutated: mutated?,
            choice_count,
            choice_index,
        })
    }
}

/// What the tool did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationSignal {
    /// New program text.
    Mutated(String),
    /// The tool found nothing to change.
    NoOp,
    /// The input could not be parsed.
    Unparsable,
    /// The tool failed, timed out, or wrote no output.
    Failed(String),
}

/// Signal plus the optional choice line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationReply {
    /// Primary outcome.
    pub signal: MutationSignal,
    /// Parsed choice metadata, when the tool emitted it.
    pub choice: Option<MutationChoice>,
}

impl MutationReply {
    /// Reply for a failed invocation without metadata.
    #[must_use]
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            signal: MutationSignal::Failed(reason.into()),
            choice: None,
        }
    }
}

/// Interpret a zero-exit tool run. Parse failure wins over no-op, which wins over output.
#[must_use]
pub fn interpret_stderr(stderr: &str, output: Option<String>) -> MutationSignal {
    if stderr.contains(PARSE_FAILED_MARKER) {
        MutationSignal::Unparsable
    } else if stderr.contains(NO_MUTATION_MARKER) {
        MutationSignal::NoOp
    } else {
        match output {
            Some(text) => MutationSignal::Mutated(text),
            None => MutationSignal::Failed("mutation tool produced no output".to_string()),
        }
    }
}

/// Mutation tool backed by the external AST mutator binary.
#[derive(Clone)]
pub struct ProcessMutationTool {
    binary: PathBuf,
    timeout: Duration,
    shutdown: Option<ShutdownCheck>,
}

impl std::fmt::Debug for ProcessMutationTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessMutationTool")
            .field("binary", &self.binary)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ProcessMutationTool {
    /// Create an adapter for `binary` with a per-call timeout.
    #[must_use]
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
            shutdown: None,
        }
    }

    /// Kill a running mutation as soon as `shutdown` reports true.
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: ShutdownCheck) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Path to the mutator binary.
    #[must_use]
    pub fn binary(&self) -> &Path {
        &self.binary
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

impl MutationTool for ProcessMutationTool {
    fn mutate(&self, request: &MutationRequest<'_>) -> MutationReply {
        let scratch = match tempfile::Builder::new().prefix("tfuzz-mutant").tempdir() {
            Ok(dir) => dir,
            Err(e) => return MutationReply::failed(format!("cannot create scratch dir: {e}")),
        };
        let output = scratch.path().join("mutant.rs");

        let mut cmd = Command::new(absolute(&self.binary));
        cmd.arg("--input")
            .arg(absolute(request.input))
            .arg("--output")
            .arg(&output)
            .arg("--mode")
            .arg(request.mode)
            .arg("--emit-choice");
        if let Some((flag, index)) = request.index {
            cmd.arg(flag.as_arg()).arg(index.to_string());
        }
        if let Some(dir) = self.binary.parent().filter(|p| !p.as_os_str().is_empty()) {
            cmd.current_dir(absolute(dir));
        }

        match run_until(cmd, None, self.timeout, self.shutdown.as_ref()) {
            Ok(ProcessOutcome::Exited { status, stderr, .. }) => {
                if !status.success() {
                    return MutationReply::failed(format!(
                        "mutation tool exited with {status}: {}",
                        stderr.trim()
                    ));
                }
                let choice = MutationChoice::parse(&stderr);
                let text = std::fs::read_to_string(&output).ok();
                MutationReply {
                    signal: interpret_stderr(&stderr, text),
                    choice,
                }
            }
            Ok(ProcessOutcome::TimedOut { duration }) => {
                MutationReply::failed(format!("mutation tool timed out after {duration:?}"))
            }
            Err(e) => MutationReply::failed(format!("failed to run mutation tool: {e}")),
        }
    }
}
