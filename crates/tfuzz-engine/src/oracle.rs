//! Differential oracle: compile a mutant under every enabled configuration,
//! reduce the results to one verdict, and decide where the case belongs.
//!
//! Decision order for a mutant:
//! 1. Overall status is the most severe configuration status
//! 2. Nightly and next-solver disagreeing on accept/reject is a miscompilation
//! 3. A miscompilation the unmutated program already shows is filed as `fate`
//! 4. CRASH or HANG halts the seed; if the unmutated program already crashed
//!    or hung the case is filed as `fate` as well
//!
//! The baseline (unmutated pass content) is compiled at most once per seed
//! pass and only when steps 3 or 4 need it.

use crossbeam_utils::thread;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tfuzz_adapters::{CompilerBackend, Toolchain, ToolchainLabel};
use tfuzz_common::{CompilationResult, CompilationStatus, FuzzConfig};
use tracing::{debug, warn};

/// Directory a case is filed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CaseCategory {
    /// Accepted by the worst-case configuration.
    Success,
    /// Rejected with ordinary diagnostics.
    Error,
    /// A configuration timed out.
    Hang,
    /// A configuration hit an internal compiler error.
    Crash,
    /// Finding already present in the unmutated program.
    Fate,
    /// Nightly and next-solver disagree.
    Miscompilation,
}

impl CaseCategory {
    /// Directory name under the results root.
    #[must_use]
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Hang => "hang",
            Self::Crash => "crash",
            Self::Fate => "fate",
            Self::Miscompilation => "miscompilation",
        }
    }

    /// Category for an overall status; UNKNOWN is never filed.
    #[must_use]
    pub fn from_status(status: CompilationStatus) -> Option<Self> {
        match status {
            CompilationStatus::Success => Some(Self::Success),
            CompilationStatus::Error => Some(Self::Error),
            CompilationStatus::Hang => Some(Self::Hang),
            CompilationStatus::Crash => Some(Self::Crash),
            CompilationStatus::Unknown => None,
        }
    }
}

impl fmt::Display for CaseCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// One configuration's result.
#[derive(Debug, Clone)]
pub struct ToolchainRun {
    /// Configuration that ran.
    pub toolchain: Toolchain,
    /// What it produced.
    pub result: CompilationResult,
}

impl ToolchainRun {
    /// Command line recorded in the detail log (without the source path).
    #[must_use]
    pub fn rendered_command(&self) -> String {
        self.toolchain
            .command
            .iter()
            .chain(&self.toolchain.extra_args)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn status_of(runs: &[ToolchainRun], label: ToolchainLabel) -> Option<CompilationStatus> {
    runs.iter()
        .find(|r| r.toolchain.label == label)
        .map(|r| r.result.status)
}

/// True when nightly and next-solver both gave a verdict and the verdicts differ.
#[must_use]
pub fn verdicts_disagree(runs: &[ToolchainRun]) -> bool {
    match (
        status_of(runs, ToolchainLabel::Nightly),
        status_of(runs, ToolchainLabel::Next),
    ) {
        (Some(nightly), Some(next)) => nightly.is_verdict() && next.is_verdict() && nightly != next,
        _ => false,
    }
}

/// What the unmutated program does.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Baseline {
    /// Worst baseline status is CRASH or HANG.
    pub fate: bool,
    /// Baseline already shows a nightly/next-solver disagreement.
    pub miscompiles: bool,
}

/// Baseline for one seed pass, compiled on first use.
#[derive(Debug)]
pub struct LazyBaseline {
    content: String,
    scratch: PathBuf,
    value: Option<Baseline>,
}

impl LazyBaseline {
    /// Baseline over `content`, staged at `scratch` when it is needed.
    pub fn new(content: impl Into<String>, scratch: impl Into<PathBuf>) -> Self {
        Self {
            content: content.into(),
            scratch: scratch.into(),
            value: None,
        }
    }

    /// True once the baseline has been compiled.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.value.is_some()
    }

    /// Compile the baseline if needed and return it.
    pub fn resolve(&mut self, oracle: &DifferentialOracle) -> Baseline {
        if let Some(value) = self.value {
            return value;
        }
        let value = match std::fs::write(&self.scratch, &self.content) {
            Ok(()) => {
                let runs = oracle.compile_all(&self.scratch);
                let worst = CompilationStatus::worst(runs.iter().map(|r| r.result.status));
                Baseline {
                    fate: worst.is_some_and(CompilationStatus::is_finding),
                    miscompiles: oracle.detect_miscompilation && verdicts_disagree(&runs),
                }
            }
            Err(e) => {
                warn!(path = %self.scratch.display(), error = %e, "cannot stage baseline");
                Baseline::default()
            }
        };
        if let Err(e) = std::fs::remove_file(&self.scratch) {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(path = %self.scratch.display(), error = %e, "baseline cleanup failed");
            }
        }
        debug!(fate = value.fate, miscompiles = value.miscompiles, "baseline resolved");
        self.value = Some(value);
        value
    }
}

/// Verdict for one mutant.
#[derive(Debug, Clone)]
pub struct Classification {
    /// Most severe status across configurations.
    pub overall: CompilationStatus,
    /// Per-configuration results in oracle order.
    pub runs: Vec<ToolchainRun>,
    /// Primary category, `None` when the case is not persisted.
    pub category: Option<CaseCategory>,
    /// Additionally filed under `miscompilation`.
    pub miscompilation: bool,
    /// Stop mutating this seed and ban its family.
    pub halt: bool,
}

impl Classification {
    /// Every category the case is written to, primary first.
    #[must_use]
    pub fn categories(&self) -> Vec<CaseCategory> {
        let mut out: Vec<CaseCategory> = self.category.into_iter().collect();
        if self.miscompilation && !out.contains(&CaseCategory::Miscompilation) {
            out.push(CaseCategory::Miscompilation);
        }
        out
    }

    /// True when the finding predates the mutation.
    #[must_use]
    pub fn is_fate(&self) -> bool {
        self.category == Some(CaseCategory::Fate)
    }

    /// Status of one configuration, if it ran.
    #[must_use]
    pub fn status_of(&self, label: ToolchainLabel) -> Option<CompilationStatus> {
        status_of(&self.runs, label)
    }

    /// Configurations whose status equals the overall status, e.g. `nightly/next-solver`.
    #[must_use]
    pub fn culprits(&self) -> String {
        self.runs
            .iter()
            .filter(|r| r.result.status == self.overall)
            .map(|r| match r.toolchain.label {
                ToolchainLabel::Next => "next-solver",
                label => label.name(),
            })
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Per-configuration summary, e.g. `Stable:SUCCESS, Nightly:CRASH`.
    #[must_use]
    pub fn breakdown(&self) -> String {
        self.runs
            .iter()
            .map(|r| format!("{}:{}", r.toolchain.label.breakdown_name(), r.result.status))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Compiles mutants under the enabled configurations and classifies them.
pub struct DifferentialOracle {
    backend: Arc<dyn CompilerBackend>,
    toolchains: Vec<Toolchain>,
    timeout: Duration,
    parallel_workers: Option<usize>,
    detect_miscompilation: bool,
    keep_success: bool,
}

impl fmt::Debug for DifferentialOracle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DifferentialOracle")
            .field("toolchains", &self.toolchains)
            .field("timeout", &self.timeout)
            .field("parallel_workers", &self.parallel_workers)
            .finish_non_exhaustive()
    }
}

impl DifferentialOracle {
    /// Build an oracle from the campaign configuration.
    pub fn new(backend: Arc<dyn CompilerBackend>, config: &FuzzConfig) -> Self {
        let toolchains = Toolchain::from_config(&config.compiler);
        let parallel_workers = (config.compiler.parallel_compile && toolchains.len() > 1)
            .then_some(config.compiler.parallel_workers.max(1));
        Self {
            backend,
            toolchains,
            timeout: config.fuzzer.case_timeout,
            parallel_workers,
            detect_miscompilation: config.retention.detect_miscompilation,
            keep_success: config.retention.keep_success_cases != 0,
        }
    }

    /// Enabled configurations in oracle order.
    #[must_use]
    pub fn toolchains(&self) -> &[Toolchain] {
        &self.toolchains
    }

    fn compile_one(&self, source: &Path, toolchain: &Toolchain) -> ToolchainRun {
        ToolchainRun {
            toolchain: toolchain.clone(),
            result: self.backend.compile(source, toolchain, self.timeout),
        }
    }

    fn compile_chunk(&self, source: &Path, chunk: &[Toolchain]) -> Vec<ToolchainRun> {
        let scoped = thread::scope(|s| {
            let handles: Vec<_> = chunk
                .iter()
                .map(|toolchain| s.spawn(move |_| self.compile_one(source, toolchain)))
                .collect();
            handles
                .into_iter()
                .zip(chunk)
                .map(|(handle, toolchain)| {
                    handle.join().unwrap_or_else(|_| ToolchainRun {
                        toolchain: toolchain.clone(),
                        result: CompilationResult::unknown("compile thread panicked", Duration::ZERO),
                    })
                })
                .collect::<Vec<_>>()
        });
        scoped.unwrap_or_else(|_| {
            warn!("parallel compile scope failed; compiling sequentially");
            chunk.iter().map(|t| self.compile_one(source, t)).collect()
        })
    }

    /// Compile `source` under every configuration.
    pub fn compile_all(&self, source: &Path) -> Vec<ToolchainRun> {
        match self.parallel_workers {
            Some(width) => self
                .toolchains
                .chunks(width)
                .flat_map(|chunk| self.compile_chunk(source, chunk))
                .collect(),
            None => self
                .toolchains
                .iter()
                .map(|t| self.compile_one(source, t))
                .collect(),
        }
    }

    /// Compile and classify a staged mutant.
    pub fn classify(&self, mutant: &Path, baseline: &mut LazyBaseline) -> Classification {
        let runs = self.compile_all(mutant);
        self.judge(runs, baseline)
    }

    /// Classify already-collected results.
    pub fn judge(&self, runs: Vec<ToolchainRun>, baseline: &mut LazyBaseline) -> Classification {
        let overall = CompilationStatus::worst(runs.iter().map(|r| r.result.status))
            .unwrap_or(CompilationStatus::Unknown);

        let mut category = CaseCategory::from_status(overall);
        if category == Some(CaseCategory::Success) && !self.keep_success {
            category = None;
        }

        let mut miscompilation = self.detect_miscompilation && verdicts_disagree(&runs);
        if miscompilation && baseline.resolve(self).miscompiles {
            category = Some(CaseCategory::Fate);
            miscompilation = false;
        }

        let halt = overall.is_finding();
        if halt && baseline.resolve(self).fate {
            category = Some(CaseCategory::Fate);
        }

        Classification {
            overall,
            runs,
            category,
            miscompilation,
            halt,
        }
    }
}
