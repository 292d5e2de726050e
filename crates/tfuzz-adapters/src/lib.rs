//! Boundaries to the external tools a campaign drives.
//!
//! This crate provides:
//! - [`CompilerBackend`] for a single compiler invocation under a timeout
//! - [`MutationTool`] for one AST mutation with an optional target index
//! - [`ComplexityScorer`] for the flat metric map used in seed weighting
//! - [`Rewriter`] for the optional source rewrite pass
//! - subprocess implementations of each, and in-memory doubles under the
//!   `simulated` feature

pub mod compiler;
pub mod mutator;
pub mod process;
pub mod rewriter;
pub mod scorer;
#[cfg(feature = "simulated")]
pub mod simulated;

pub use compiler::*;
pub use mutator::*;
pub use process::ShutdownCheck;
pub use rewriter::*;
pub use scorer::*;
#[cfg(feature = "simulated")]
pub use simulated::*;

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tfuzz_common::{CompilationResult, FuzzResult};

/// Runs one compiler configuration over a source file.
///
/// Implementations never fail: spawn problems become
/// [`tfuzz_common::CompilationStatus::Unknown`] and deadline overruns become
/// [`tfuzz_common::CompilationStatus::Hang`].
pub trait CompilerBackend: Send + Sync {
    /// Compile `source` with `toolchain`, giving up after `timeout`.
    fn compile(&self, source: &Path, toolchain: &Toolchain, timeout: Duration) -> CompilationResult;
}

/// Performs a single structural edit on a source file.
pub trait MutationTool: Send + Sync {
    /// Mutate `request.input` with `request.mode`.
    fn mutate(&self, request: &MutationRequest<'_>) -> MutationReply;
}

/// Extracts named integer metrics from a source file.
pub trait ComplexityScorer: Send + Sync {
    /// Score `source`; failures degrade to an empty map.
    fn score(&self, source: &Path) -> Complexity;
}

/// Produces an alternative rendition of a seed for a second fuzz pass.
pub trait Rewriter: Send + Sync {
    /// Rewrite `source`, returning the new program text.
    ///
    /// # Errors
    ///
    /// Returns an error if the collaborator fails or times out.
    fn rewrite(&self, source: &str) -> FuzzResult<String>;
}

/// Flat map of named non-negative metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Complexity(pub BTreeMap<String, u64>);

impl Complexity {
    /// Metric value, zero when absent.
    #[must_use]
    pub fn get(&self, key: &str) -> u64 {
        self.0.get(key).copied().unwrap_or(0)
    }

    /// True when the scorer produced nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Sampling score: `constraint_choice_sum`, else `depth*20 + cycles`, floored at 1.
    #[must_use]
    pub fn seed_score(&self) -> u64 {
        let primary = self.get("constraint_choice_sum");
        if primary > 0 {
            return primary;
        }
        let fallback = self
            .get("depth")
            .saturating_mul(20)
            .saturating_add(self.get("cycles"));
        fallback.max(1)
    }
}

impl<K: Into<String>> FromIterator<(K, u64)> for Complexity {
    fn from_iter<T: IntoIterator<Item = (K, u64)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}
