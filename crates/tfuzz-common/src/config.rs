//! Configuration structures for a fuzzing campaign.
//!
//! Supports TOML deserialization with defaults matching a small local
//! campaign; every section may be omitted.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level campaign configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FuzzConfig {
    /// Filesystem layout.
    pub paths: PathsConfig,

    /// Iteration and mutation budgets.
    pub fuzzer: FuzzerConfig,

    /// Seed selection smoothing knobs.
    pub selection: SelectionConfig,

    /// Compiler configurations used by the differential oracle.
    pub compiler: CompilerConfig,

    /// Disk budgets, retention, and promotion policy.
    pub retention: RetentionConfig,

    /// External AST mutation tool.
    pub mutator: MutatorConfig,

    /// External complexity scorer.
    pub scorer: ScorerConfig,

    /// Optional rewrite pass.
    pub rewrite: RewriteConfig,
}

/// Filesystem layout of a campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Seed corpus root; promoted pools live in numbered subdirectories.
    pub seeds: PathBuf,

    /// Case store root (`<results>/<category>/case_*`).
    pub results: PathBuf,

    /// Per-worker log files.
    pub logs: PathBuf,

    /// Saved rewrite-pass sources. Defaults to `<results>/../LLM/rewrites`.
    pub rewrites: Option<PathBuf>,

    /// Scratch directory for mutants and baselines in flight.
    pub work_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            seeds: PathBuf::from("seeds"),
            results: PathBuf::from("results"),
            logs: PathBuf::from("logs"),
            rewrites: None,
            work_dir: PathBuf::from("work"),
        }
    }
}

impl PathsConfig {
    /// Directory holding saved rewrite-pass sources.
    #[must_use]
    pub fn rewrites_dir(&self) -> PathBuf {
        if let Some(dir) = &self.rewrites {
            return dir.clone();
        }
        let parent = self
            .results
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        parent.join("LLM").join("rewrites")
    }
}

/// How the next seed is drawn from the candidate set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Uniform over candidates.
    #[default]
    Random,
    /// Weighted by complexity score with pick-count decay.
    TtdnMetric,
}

/// Per-structural-operation draw weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StructuralWeights {
    /// Weight of `add_assoc_type`.
    pub add_assoc_type: f64,
    /// Weight of `add_trait`.
    pub add_trait: f64,
    /// Weight of `add_impl`.
    pub add_impl: f64,
}

impl Default for StructuralWeights {
    fn default() -> Self {
        Self {
            add_assoc_type: 1.0,
            add_trait: 1.0,
            add_impl: 1.0,
        }
    }
}

/// Iteration and mutation budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FuzzerConfig {
    /// Seeds selected per worker before the campaign ends.
    pub iterations: u64,

    /// Number of worker processes (shards).
    pub workers: usize,

    /// Mutation rounds per fuzz pass.
    pub rounds_per_seed: usize,

    /// `constraint_injection` attempts planned per round.
    pub injection_per_round: usize,

    /// `projection_rewrite` attempts planned per round.
    pub projection_per_round: usize,

    /// `lifetime_obfuscation` attempts planned per round.
    pub lifetime_per_round: usize,

    /// `lifetime_outlive` attempts planned per round.
    pub outlive_per_round: usize,

    /// Structural (chaining) attempts planned per round.
    pub structural_per_round: usize,

    /// Draw weights among structural operations.
    pub structural_weights: StructuralWeights,

    /// Only plan structural operations.
    pub structural_only: bool,

    /// Mutation tool attempts per planned strategy.
    pub mutation_max_retries: usize,

    /// Random draws when looking for an unused candidate index.
    pub choice_pick_tries: usize,

    /// Seed selection strategy.
    pub seed_selection_strategy: SelectionStrategy,

    /// Promoted descendants allowed per parent seed (0 disables promotion).
    pub max_promotions_per_seed: usize,

    /// Timeout applied to each compiler invocation.
    #[serde(with = "humantime_serde")]
    pub case_timeout: Duration,

    /// Mirror every worker's log to the console, not only worker 0.
    pub worker_console_logging: bool,

    /// Fixed RNG seed for reproducible campaigns (mixed with the worker index).
    pub rng_seed: Option<u64>,
}

impl Default for FuzzerConfig {
    fn default() -> Self {
        Self {
            iterations: 1000,
            workers: 1,
            rounds_per_seed: 1,
            injection_per_round: 20,
            projection_per_round: 20,
            lifetime_per_round: 20,
            outlive_per_round: 20,
            structural_per_round: 1,
            structural_weights: StructuralWeights::default(),
            structural_only: false,
            mutation_max_retries: 10,
            choice_pick_tries: 20,
            seed_selection_strategy: SelectionStrategy::Random,
            max_promotions_per_seed: 2,
            case_timeout: Duration::from_secs(10),
            worker_console_logging: false,
            rng_seed: None,
        }
    }
}

/// Seed selection smoothing knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// Probability of drawing from the promoted pool.
    pub promoted_pool_prob: f64,

    /// Score temperature; higher flattens the distribution.
    pub weight_temperature: f64,

    /// Per-seed pick decay exponent.
    pub pick_decay_beta: f64,

    /// Floor of the per-seed weight.
    pub min_weight: f64,

    /// Seed-level recency window.
    pub repeat_window: usize,

    /// Per-seed pick budget; negative means unlimited.
    pub max_picks_per_seed: i64,

    /// Family-level recency window.
    pub family_repeat_window: usize,

    /// Per-family pick decay exponent.
    pub family_pick_decay_beta: f64,

    /// Floor of the family suppression factor.
    pub family_min_weight: f64,

    /// Attempts when a picked seed vanished from disk.
    pub pick_retry_limit: usize,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            promoted_pool_prob: 0.10,
            weight_temperature: 2.0,
            pick_decay_beta: 1.0,
            min_weight: 1.0,
            repeat_window: 32,
            max_picks_per_seed: 1,
            family_repeat_window: 8,
            family_pick_decay_beta: 0.75,
            family_min_weight: 0.3,
            pick_retry_limit: 16,
        }
    }
}

impl SelectionConfig {
    /// Clamp out-of-range knobs to usable values.
    #[must_use]
    pub fn normalized(&self) -> Self {
        let mut out = self.clone();
        if !out.promoted_pool_prob.is_finite() {
            out.promoted_pool_prob = 0.0;
        }
        out.promoted_pool_prob = out.promoted_pool_prob.clamp(0.0, 1.0);
        if out.weight_temperature <= 0.0 {
            out.weight_temperature = 1.0;
        }
        if out.pick_decay_beta < 0.0 {
            out.pick_decay_beta = 0.0;
        }
        if out.min_weight <= 0.0 {
            out.min_weight = 1.0;
        }
        if out.family_pick_decay_beta < 0.0 {
            out.family_pick_decay_beta = 0.0;
        }
        if out.family_min_weight <= 0.0 {
            out.family_min_weight = 0.1;
        }
        if out.pick_retry_limit == 0 {
            out.pick_retry_limit = 1;
        }
        out
    }

    /// Per-seed pick budget, `None` when unlimited.
    #[must_use]
    pub fn pick_budget(&self) -> Option<u64> {
        u64::try_from(self.max_picks_per_seed).ok()
    }
}

/// Compiler configurations for the differential oracle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    /// Primary ("stable") compiler command.
    pub stable_cmd: Vec<String>,

    /// Secondary toolchain command, also used for the solver configuration.
    pub nightly_cmd: Vec<String>,

    /// Compile with the secondary toolchain. Defaults to `enable_next_solver`.
    pub enable_nightly_compile: Option<bool>,

    /// Compile with the secondary toolchain plus `next_solver_flag`.
    pub enable_next_solver: bool,

    /// Experimental solver flag for the third configuration.
    pub next_solver_flag: String,

    /// Run the enabled configurations concurrently.
    pub parallel_compile: bool,

    /// Upper bound on concurrent compiler processes per mutant.
    pub parallel_workers: usize,

    /// Lower-case stderr substrings identifying an internal compiler error.
    pub ice_markers: Vec<String>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            stable_cmd: vec!["rustc".to_string()],
            nightly_cmd: vec!["rustc".to_string(), "+nightly".to_string()],
            enable_nightly_compile: None,
            enable_next_solver: false,
            next_solver_flag: "-Znext-solver=coherence".to_string(),
            parallel_compile: false,
            parallel_workers: 3,
            ice_markers: vec![
                "internal compiler error".to_string(),
                "thread 'rustc' panicked".to_string(),
            ],
        }
    }
}

impl CompilerConfig {
    /// Whether the plain secondary-toolchain configuration runs.
    #[must_use]
    pub fn nightly_enabled(&self) -> bool {
        self.enable_nightly_compile.unwrap_or(self.enable_next_solver)
    }
}

/// Disk budgets, retention, and promotion policy.
///
/// Keep counts use `-1` for "unlimited".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Global cap on success+error cases.
    pub max_cases: Option<usize>,

    /// Global size cap on success+error cases, in GiB.
    pub max_results_gb: Option<f64>,

    /// Stop the campaign when free space stays below this many GiB.
    pub min_free_gb: Option<f64>,

    /// SUCCESS cases kept; `0` disables SUCCESS persistence.
    pub keep_success_cases: i64,

    /// ERROR cases kept.
    pub keep_error_cases: i64,

    /// FATE cases kept.
    pub keep_fate_cases: i64,

    /// Saved rewrite sources kept.
    pub keep_rewritten_cases: i64,

    /// Flag disagreements between the secondary and solver configurations.
    pub detect_miscompilation: bool,

    /// Promote qualifying SUCCESS mutants into the live seed pool.
    pub promote_success: bool,

    /// Files per promoted pool directory before rolling to the next one.
    pub new_seeds_max: usize,

    /// Prefix of promoted pool directories (`<prefix><N>`).
    pub new_seeds_prefix: String,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_cases: None,
            max_results_gb: None,
            min_free_gb: None,
            keep_success_cases: 2000,
            keep_error_cases: 2000,
            keep_fate_cases: 100,
            keep_rewritten_cases: -1,
            detect_miscompilation: true,
            promote_success: true,
            new_seeds_max: 2000,
            new_seeds_prefix: "new".to_string(),
        }
    }
}

/// Convert a `-1`-means-unlimited keep count into a limit.
#[must_use]
pub fn keep_limit(value: i64) -> Option<usize> {
    usize::try_from(value).ok()
}

/// External AST mutation tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MutatorConfig {
    /// Path to the mutation tool binary.
    pub binary: PathBuf,

    /// Timeout for one mutation invocation.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for MutatorConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("mutation/mutation-AST/target/release/mutation-ast"),
            timeout: Duration::from_secs(30),
        }
    }
}

/// External complexity scorer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScorerConfig {
    /// Scorer binary; defaults to the mutation tool, which has a metrics mode.
    pub binary: Option<PathBuf>,

    /// Timeout for one scoring invocation.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            binary: None,
            timeout: Duration::from_secs(20),
        }
    }
}

/// Optional rewrite pass run on each selected seed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RewriteConfig {
    /// Run the rewrite pass.
    pub enabled: bool,

    /// Command reading source on stdin and writing the rewrite to stdout.
    pub command: Vec<String>,

    /// Advisory lock directory shared by all workers.
    pub lock_path: PathBuf,

    /// Maximum wait for the lock.
    #[serde(with = "humantime_serde")]
    pub lock_timeout: Duration,

    /// Maximum duration of one rewrite call.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Rewrites not longer than this many bytes are discarded.
    pub min_length: usize,
}

impl Default for RewriteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            command: Vec::new(),
            lock_path: PathBuf::from("llm_global_lock.dir"),
            lock_timeout: Duration::from_secs(120),
            timeout: Duration::from_secs(300),
            min_length: 10,
        }
    }
}

impl FuzzConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fuzzer.workers == 0 {
            return Err(ConfigError::Invalid("fuzzer.workers must be at least 1".into()));
        }
        if self.compiler.stable_cmd.is_empty() {
            return Err(ConfigError::Invalid("compiler.stable_cmd must not be empty".into()));
        }
        let extras = self.compiler.nightly_enabled() || self.compiler.enable_next_solver;
        if extras && self.compiler.nightly_cmd.is_empty() {
            return Err(ConfigError::Invalid(
                "compiler.nightly_cmd must not be empty when nightly or next-solver compiles are enabled"
                    .into(),
            ));
        }
        if self.rewrite.enabled && self.rewrite.command.is_empty() {
            return Err(ConfigError::Invalid(
                "rewrite.command must not be empty when rewrite.enabled is set".into(),
            ));
        }
        if self.retention.new_seeds_prefix.is_empty() {
            return Err(ConfigError::Invalid("retention.new_seeds_prefix must not be empty".into()));
        }
        Ok(())
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Semantically invalid configuration.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Serde helper module for `Duration` using humantime format.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
