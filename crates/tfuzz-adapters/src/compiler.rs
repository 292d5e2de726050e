//! Compiler invocation and outcome normalization.

use crate::process::{run_until, ProcessOutcome, ShutdownCheck};
use crate::CompilerBackend;
use std::path::Path;
use std::process::Command;
use std::time::{Duration, Instant};
use tfuzz_common::{CompilationResult, CompilationStatus, CompilerConfig};

/// Which differential configuration a toolchain represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ToolchainLabel {
    /// Primary compiler, always run.
    Stable,
    /// Secondary toolchain without extra flags.
    Nightly,
    /// Secondary toolchain with the experimental solver flag.
    Next,
}

impl ToolchainLabel {
    /// Short name used in log fields.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Stable => "stable",
            Self::Nightly => "nightly",
            Self::Next => "next",
        }
    }

    /// Name used in the detail record's status breakdown.
    #[must_use]
    pub fn breakdown_name(self) -> &'static str {
        match self {
            Self::Stable => "Stable",
            Self::Nightly => "Nightly",
            Self::Next => "Next",
        }
    }

    /// Section heading used in the detail record.
    #[must_use]
    pub fn section_title(self) -> &'static str {
        match self {
            Self::Stable => "rustc (stable)",
            Self::Nightly => "rustc (+nightly)",
            Self::Next => "rustc (-Z next trait-solver)",
        }
    }
}

/// One compiler configuration: a command prefix plus flags appended after the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
    /// Configuration this toolchain plays in the oracle.
    pub label: ToolchainLabel,
    /// Program and leading arguments, e.g. `["rustc", "+nightly"]`.
    pub command: Vec<String>,
    /// Arguments placed after the source path.
    pub extra_args: Vec<String>,
}

impl Toolchain {
    /// Enabled configurations in oracle order (stable, nightly, next).
    #[must_use]
    pub fn from_config(config: &CompilerConfig) -> Vec<Self> {
        let mut toolchains = vec![Self {
            label: ToolchainLabel::Stable,
            command: config.stable_cmd.clone(),
            extra_args: Vec::new(),
        }];
        if config.nightly_enabled() {
            toolchains.push(Self {
                label: ToolchainLabel::Nightly,
                command: config.nightly_cmd.clone(),
                extra_args: Vec::new(),
            });
        }
        if config.enable_next_solver {
            toolchains.push(Self {
                label: ToolchainLabel::Next,
                command: config.nightly_cmd.clone(),
                extra_args: vec![config.next_solver_flag.clone()],
            });
        }
        toolchains
    }

    /// Full argument vector for compiling `source`.
    #[must_use]
    pub fn argv(&self, source: &Path) -> Vec<String> {
        let mut argv = self.command.clone();
        argv.push(source.display().to_string());
        argv.extend(self.extra_args.iter().cloned());
        argv
    }
}

/// Map an exited compiler to a status. ICE markers win over the exit code.
#[must_use]
pub fn classify_exit(exit_code: Option<i32>, stderr: &str, ice_markers: &[String]) -> CompilationStatus {
    let lowered = stderr.to_lowercase();
    if ice_markers.iter().any(|m| lowered.contains(m.as_str())) {
        return CompilationStatus::Crash;
    }
    if exit_code == Some(0) {
        CompilationStatus::Success
    } else {
        CompilationStatus::Error
    }
}

/// Compiler backend that spawns the configured command.
///
/// Every invocation runs in its own scratch directory, so toolchains
/// compiling the same source concurrently never share build artifacts.
#[derive(Clone)]
pub struct ProcessCompiler {
    ice_markers: Vec<String>,
    shutdown: Option<ShutdownCheck>,
}

impl std::fmt::Debug for ProcessCompiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessCompiler")
            .field("ice_markers", &self.ice_markers)
            .finish_non_exhaustive()
    }
}

impl ProcessCompiler {
    /// Create a backend recognising the given (lower-case) ICE markers.
    #[must_use]
    pub fn new(ice_markers: Vec<String>) -> Self {
        Self {
            ice_markers: ice_markers.into_iter().map(|m| m.to_lowercase()).collect(),
            shutdown: None,
        }
    }

    /// Create a backend from the `[compiler]` section.
    #[must_use]
    pub fn from_config(config: &CompilerConfig) -> Self {
        Self::new(config.ice_markers.clone())
    }

    /// Kill a running compiler as soon as `shutdown` reports true.
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: ShutdownCheck) -> Self {
        self.shutdown = Some(shutdown);
        self
    }
}

impl CompilerBackend for ProcessCompiler {
    fn compile(&self, source: &Path, toolchain: &Toolchain, timeout: Duration) -> CompilationResult {
        let start = Instant::now();
        let Some((program, prefix)) = toolchain.command.split_first() else {
            return CompilationResult::unknown("empty compiler command", start.elapsed());
        };
        let scratch = match tempfile::Builder::new().prefix("tfuzz-rustc").tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                return CompilationResult::unknown(
                    format!("cannot create build dir: {e}"),
                    start.elapsed(),
                )
            }
        };
        let input = std::path::absolute(source).unwrap_or_else(|_| source.to_path_buf());

        let mut cmd = Command::new(program);
        cmd.args(prefix)
            .arg(&input)
            .args(&toolchain.extra_args)
            .current_dir(scratch.path());

        match run_until(cmd, None, timeout, self.shutdown.as_ref()) {
            Ok(ProcessOutcome::Exited {
                status,
                stdout,
                stderr,
                duration,
            }) => {
                let exit_code = status.code();
                CompilationResult {
                    status: classify_exit(exit_code, &stderr, &self.ice_markers),
                    exit_code,
                    stdout,
                    stderr,
                    duration,
                }
            }
            Ok(ProcessOutcome::TimedOut { duration }) => {
                tracing::warn!(
                    source = %source.display(),
                    toolchain = toolchain.label.name(),
                    "compilation timed out"
                );
                CompilationResult::hang(duration)
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                CompilationResult::unknown(e.to_string(), start.elapsed())
            }
            Err(e) => {
                tracing::error!(
                    source = %source.display(),
                    toolchain = toolchain.label.name(),
                    error = %e,
                    "failed to run compiler"
                );
                CompilationResult::unknown(e.to_string(), start.elapsed())
            }
        }
    }
}
