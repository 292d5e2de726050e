//! Per-worker campaign statistics.
//!
//! Compile durations go into a bounded ring buffer so long campaigns keep a
//! fixed memory footprint while still reporting recent percentiles.

use crate::status::CompilationStatus;
use std::time::Duration;

/// Default number of compile-duration samples retained.
pub const DEFAULT_SAMPLE_WINDOW: usize = 4096;

/// Counters and compile-time statistics for one worker.
#[derive(Debug)]
pub struct CampaignMetrics {
    samples: Box<[u64]>,
    write_pos: usize,
    sample_count: usize,
    compiles: u64,
    min_ns: u64,
    max_ns: u64,
    sum_ns: u64,
    iterations: u64,
    judged: [u64; 5],
    fate_cases: u64,
    miscompilations: u64,
    duplicates: u64,
    tool_failures: u64,
    promotions: u64,
    blacklisted_seeds: u64,
    max_choice_sum: u64,
}

fn status_slot(status: CompilationStatus) -> usize {
    match status {
        CompilationStatus::Success => 0,
        CompilationStatus::Error => 1,
        CompilationStatus::Hang => 2,
        CompilationStatus::Crash => 3,
        CompilationStatus::Unknown => 4,
    }
}

fn duration_ns(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

impl Default for CampaignMetrics {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_WINDOW)
    }
}

impl CampaignMetrics {
    /// Create a collector retaining `sample_window` compile durations.
    #[must_use]
    pub fn new(sample_window: usize) -> Self {
        let size = sample_window.max(1);
        Self {
            samples: vec![0u64; size].into_boxed_slice(),
            write_pos: 0,
            sample_count: 0,
            compiles: 0,
            min_ns: u64::MAX,
            max_ns: 0,
            sum_ns: 0,
            iterations: 0,
            judged: [0; 5],
            fate_cases: 0,
            miscompilations: 0,
            duplicates: 0,
            tool_failures: 0,
            promotions: 0,
            blacklisted_seeds: 0,
            max_choice_sum: 0,
        }
    }

    /// Record the duration of one compiler invocation.
    pub fn record_compile(&mut self, duration: Duration) {
        let ns = duration_ns(duration);
        self.samples[self.write_pos] = ns;
        self.write_pos = (self.write_pos + 1) % self.samples.len();
        self.sample_count = self.sample_count.saturating_add(1).min(self.samples.len());

        self.compiles += 1;
        self.min_ns = self.min_ns.min(ns);
        self.max_ns = self.max_ns.max(ns);
        self.sum_ns = self.sum_ns.saturating_add(ns);
    }

    /// Count one selected seed.
    pub fn record_iteration(&mut self) {
        self.iterations += 1;
    }

    /// Count one judged mutant by its overall status.
    pub fn record_verdict(&mut self, status: CompilationStatus) {
        self.judged[status_slot(status)] += 1;
    }

    /// Count one case persisted under the fate category.
    pub fn record_fate(&mut self) {
        self.fate_cases += 1;
    }

    /// Count one flagged miscompilation.
    pub fn record_miscompilation(&mut self) {
        self.miscompilations += 1;
    }

    /// Count one discarded duplicate mutant.
    pub fn record_duplicate(&mut self) {
        self.duplicates += 1;
    }

    /// Count one failed mutation tool call.
    pub fn record_tool_failure(&mut self) {
        self.tool_failures += 1;
    }

    /// Count one promoted seed.
    pub fn record_promotion(&mut self) {
        self.promotions += 1;
    }

    /// Count one seed excluded as unparsable.
    pub fn record_blacklist(&mut self) {
        self.blacklisted_seeds += 1;
    }

    /// Track the largest `constraint_choice_sum` seen so far.
    pub fn observe_choice_sum(&mut self, value: u64) {
        self.max_choice_sum = self.max_choice_sum.max(value);
    }

    /// Mutants judged with the given overall status.
    #[must_use]
    pub fn judged(&self, status: CompilationStatus) -> u64 {
        self.judged[status_slot(status)]
    }

    /// Total compiler invocations.
    #[must_use]
    pub fn compiles(&self) -> u64 {
        self.compiles
    }

    /// Seeds selected so far.
    #[must_use]
    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    /// Mean compile duration.
    #[must_use]
    pub fn mean_compile(&self) -> Option<Duration> {
        if self.compiles > 0 {
            Some(Duration::from_nanos(self.sum_ns / self.compiles))
        } else {
            None
        }
    }

    /// Compile-duration percentile over the retained window (0.0 to 100.0).
    #[must_use]
    pub fn compile_percentile(&self, percentile: f64) -> Option<Duration> {
        if self.sample_count == 0 || !(0.0..=100.0).contains(&percentile) {
            return None;
        }
        let mut sorted: Vec<u64> = self.samples[..self.sample_count].to_vec();
        sorted.sort_unstable();

        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss
        )]
        let idx = ((percentile / 100.0) * (sorted.len() - 1) as f64).round() as usize;
        Some(Duration::from_nanos(sorted[idx.min(sorted.len() - 1)]))
    }

    /// Immutable snapshot for reporting.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let any = self.compiles > 0;
        MetricsSnapshot {
            iterations: self.iterations,
            compiles: self.compiles,
            success: self.judged(CompilationStatus::Success),
            error: self.judged(CompilationStatus::Error),
            hang: self.judged(CompilationStatus::Hang),
            crash: self.judged(CompilationStatus::Crash),
            unknown: self.judged(CompilationStatus::Unknown),
            fate_cases: self.fate_cases,
            miscompilations: self.miscompilations,
            duplicates: self.duplicates,
            tool_failures: self.tool_failures,
            promotions: self.promotions,
            blacklisted_seeds: self.blacklisted_seeds,
            max_choice_sum: self.max_choice_sum,
            compile_min_ns: any.then_some(self.min_ns),
            compile_max_ns: any.then_some(self.max_ns),
            compile_mean_ns: self.mean_compile().map(duration_ns),
        }
    }
}

/// Immutable snapshot of campaign metrics.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Seeds selected.
    pub iterations: u64,
    /// Compiler invocations.
    pub compiles: u64,
    /// Mutants whose overall status was SUCCESS.
    pub success: u64,
    /// Mutants whose overall status was ERROR.
    pub error: u64,
    /// Mutants whose overall status was HANG.
    pub hang: u64,
    /// Mutants whose overall status was CRASH.
    pub crash: u64,
    /// Mutants whose overall status was UNKNOWN.
    pub unknown: u64,
    /// Cases persisted as fate.
    pub fate_cases: u64,
    /// Flagged miscompilations.
    pub miscompilations: u64,
    /// Discarded duplicate mutants.
    pub duplicates: u64,
    /// Failed mutation tool calls.
    pub tool_failures: u64,
    /// Promoted seeds.
    pub promotions: u64,
    /// Seeds excluded as unparsable.
    pub blacklisted_seeds: u64,
    /// Largest observed `constraint_choice_sum`.
    pub max_choice_sum: u64,
    /// Fastest compile in nanoseconds.
    pub compile_min_ns: Option<u64>,
    /// Slowest compile in nanoseconds.
    pub compile_max_ns: Option<u64>,
    /// Mean compile in nanoseconds.
    pub compile_mean_ns: Option<u64>,
}
