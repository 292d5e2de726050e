//! In-memory adapters for deterministic tests.
//!
//! Each double is driven by a closure over the file content it is handed,
//! so a test can script compiler verdicts and mutator replies without any
//! toolchain installed.

use crate::{
    Complexity, ComplexityScorer, CompilerBackend, IndexFlag, MutationReply, MutationRequest,
    MutationSignal, MutationTool, Rewriter, Toolchain, ToolchainLabel,
};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tfuzz_common::{CompilationResult, CompilationStatus, FuzzResult};

type CompileRule = dyn Fn(&str, ToolchainLabel) -> CompilationStatus + Send + Sync;
type MutateRule = dyn Fn(&str, &MutationRequest<'_>, usize) -> MutationReply + Send + Sync;
type ScoreRule = dyn Fn(&str) -> Complexity + Send + Sync;
type RewriteRule = dyn Fn(&str) -> FuzzResult<String> + Send + Sync;

/// Compiler double deciding the status from source text and configuration.
pub struct SimulatedCompiler {
    rule: Box<CompileRule>,
    calls: AtomicUsize,
}

impl fmt::Debug for SimulatedCompiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedCompiler")
            .field("calls", &self.calls())
            .finish_non_exhaustive()
    }
}

impl SimulatedCompiler {
    /// Create a compiler double from a verdict rule.
    pub fn new(
        rule: impl Fn(&str, ToolchainLabel) -> CompilationStatus + Send + Sync + 'static,
    ) -> Self {
        Self {
            rule: Box::new(rule),
            calls: AtomicUsize::new(0),
        }
    }

    /// Compiler double that always returns `status`.
    #[must_use]
    pub fn always(status: CompilationStatus) -> Self {
        Self::new(move |_, _| status)
    }

    /// Number of compilations performed.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

impl CompilerBackend for SimulatedCompiler {
    fn compile(&self, source: &Path, toolchain: &Toolchain, timeout: Duration) -> CompilationResult {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let elapsed = Duration::from_millis(1);
        let content = match std::fs::read_to_string(source) {
            Ok(content) => content,
            Err(e) => return CompilationResult::unknown(e.to_string(), elapsed),
        };

        let (exit_code, stderr) = match (self.rule)(&content, toolchain.label) {
            CompilationStatus::Success => (Some(0), String::new()),
            CompilationStatus::Error => (
                Some(1),
                "error[E0277]: the trait bound is not satisfied (simulated)".to_string(),
            ),
            CompilationStatus::Crash => (
                Some(101),
                "error: internal compiler error: simulated\nthread 'rustc' panicked".to_string(),
            ),
            CompilationStatus::Hang => return CompilationResult::hang(timeout),
            CompilationStatus::Unknown => {
                return CompilationResult::unknown("simulated adapter failure", elapsed)
            }
        };
        let status = crate::classify_exit(
            exit_code,
            &stderr,
            &tfuzz_common::CompilerConfig::default().ice_markers,
        );
        CompilationResult {
            status,
            exit_code,
            stdout: String::new(),
            stderr,
            duration: elapsed,
        }
    }
}

/// One call observed by [`SimulatedMutationTool`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedMutation {
    /// Requested mode.
    pub mode: String,
    /// Forced index, if any.
    pub index: Option<(IndexFlag, usize)>,
    /// Input content at call time.
    pub input: String,
}

/// Mutation tool double with a scripted reply rule.
pub struct SimulatedMutationTool {
    rule: Box<MutateRule>,
    calls: Mutex<Vec<RecordedMutation>>,
}

impl fmt::Debug for SimulatedMutationTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedMutationTool")
            .field("calls", &self.call_count())
            .finish_non_exhaustive()
    }
}

impl SimulatedMutationTool {
    /// Create a double from a rule `(input content, request, call number) -> reply`.
    pub fn new(
        rule: impl Fn(&str, &MutationRequest<'_>, usize) -> MutationReply + Send + Sync + 'static,
    ) -> Self {
        Self {
            rule: Box::new(rule),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Double that appends a unique comment on every call.
    #[must_use]
    pub fn appending() -> Self {
        Self::new(|content, request, n| MutationReply {
            signal: MutationSignal::Mutated(format!("{content}\n// {} #{n}\n", request.mode)),
            choice: None,
        })
    }

    /// Every call observed so far.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedMutation> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of calls observed so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl MutationTool for SimulatedMutationTool {
    fn mutate(&self, request: &MutationRequest<'_>) -> MutationReply {
        let content = match std::fs::read_to_string(request.input) {
            Ok(content) => content,
            Err(e) => return MutationReply::failed(e.to_string()),
        };
        let n = {
            let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
            calls.push(RecordedMutation {
                mode: request.mode.to_string(),
                index: request.index,
                input: content.clone(),
            });
            calls.len()
        };
        (self.rule)(&content, request, n)
    }
}

/// Scorer double computing metrics from source text.
pub struct SimulatedScorer {
    rule: Box<ScoreRule>,
    calls: AtomicUsize,
}

impl fmt::Debug for SimulatedScorer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedScorer")
            .field("calls", &self.calls())
            .finish_non_exhaustive()
    }
}

impl SimulatedScorer {
    /// Create a scorer from a rule over file content.
    pub fn new(rule: impl Fn(&str) -> Complexity + Send + Sync + 'static) -> Self {
        Self {
            rule: Box::new(rule),
            calls: AtomicUsize::new(0),
        }
    }

    /// Scorer returning the same metrics for every file.
    #[must_use]
    pub fn fixed(complexity: Complexity) -> Self {
        Self::new(move |_| complexity.clone())
    }

    /// Number of scoring calls.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

impl ComplexityScorer for SimulatedScorer {
    fn score(&self, source: &Path) -> Complexity {
        self.calls.fetch_add(1, Ordering::Relaxed);
        std::fs::read_to_string(source)
            .map(|content| (self.rule)(&content))
            .unwrap_or_default()
    }
}

/// Rewriter double.
pub struct SimulatedRewriter {
    rule: Box<RewriteRule>,
}

impl fmt::Debug for SimulatedRewriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedRewriter").finish_non_exhaustive()
    }
}

impl SimulatedRewriter {
    /// Create a rewriter from a rule over source text.
    pub fn new(rule: impl Fn(&str) -> FuzzResult<String> + Send + Sync + 'static) -> Self {
        Self {
            rule: Box::new(rule),
        }
    }
}

impl Rewriter for SimulatedRewriter {
    fn rewrite(&self, source: &str) -> FuzzResult<String> {
        (self.rule)(source)
    }
}
