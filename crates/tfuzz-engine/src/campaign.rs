//! Per-worker fuzzing campaign.
//!
//! One campaign owns one shard of the seed corpus and loops:
//! 1. Select a seed and load it (plus an optional rewritten pass)
//! 2. For each pass, run `rounds_per_seed` mutation rounds
//! 3. Compile every fresh mutant through the differential oracle
//! 4. Persist findings, promote accepted injections, enforce retention
//!
//! All state lives on the [`Campaign`]; nothing is global.

use crate::case::{CaseRecord, CaseStore};
use crate::oracle::{Classification, DifferentialOracle, LazyBaseline};
use crate::promotion::{is_promotable, PromotionManager};
use crate::retention::{enforce_limits, RetentionPolicy};
use crate::round::{
    plan_round, run_strategy, AttemptLimits, MutationContext, Outcome, RoundState,
    SeedMutationState, Strategy,
};
use crate::seed::{discover, Seed};
use crate::selector::SeedSelector;
use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tfuzz_adapters::{
    CommandRewriter, ComplexityScorer, CompilerBackend, MutationTool, ProcessCompiler,
    ProcessMutationTool, ProcessScorer, Rewriter, ShutdownCheck,
};
use tfuzz_common::{CampaignMetrics, DirLock, FuzzConfig};
use tracing::{debug, error, info, warn};

/// Why a campaign stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CampaignExit {
    /// All iterations ran.
    Completed,
    /// The shard had no seeds to begin with.
    NoSeeds,
    /// Every seed was banned, spent or blacklisted.
    SeedsExhausted,
    /// Free disk space fell below the configured minimum.
    DiskBudget,
    /// Shutdown was requested.
    Interrupted,
}

/// File removed when dropped.
struct ScratchFile(PathBuf);

impl ScratchFile {
    fn create(path: PathBuf, content: &str) -> Result<Self> {
        std::fs::write(&path, content)
            .with_context(|| format!("failed to stage {}", path.display()))?;
        Ok(Self(path))
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0) {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(path = %self.0.display(), error = %e, "scratch cleanup failed");
            }
        }
    }
}

/// Named program text a seed is fuzzed from.
struct Pass {
    name: &'static str,
    content: String,
}

enum Flow {
    Continue,
    Halt,
    Blacklisted,
    Stop(CampaignExit),
}

/// One worker's fuzzing loop and everything it remembers.
pub struct Campaign {
    config: FuzzConfig,
    worker: usize,
    selector: SeedSelector,
    oracle: DifferentialOracle,
    mutator: Arc<dyn MutationTool>,
    scorer: Arc<dyn ComplexityScorer>,
    rewriter: Option<Arc<dyn Rewriter>>,
    cases: CaseStore,
    promotions: PromotionManager,
    policy: RetentionPolicy,
    metrics: CampaignMetrics,
    bad_seeds: HashSet<PathBuf>,
    rng: StdRng,
    shutdown: Option<ShutdownCheck>,
}

impl std::fmt::Debug for Campaign {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Campaign")
            .field("worker", &self.worker)
            .field("selector", &self.selector)
            .field("oracle", &self.oracle)
            .finish_non_exhaustive()
    }
}

impl Campaign {
    /// Worker index.
    #[must_use]
    pub fn worker(&self) -> usize {
        self.worker
    }

    /// Seed selector for this shard.
    #[must_use]
    pub fn selector(&self) -> &SeedSelector {
        &self.selector
    }

    /// Campaign statistics.
    #[must_use]
    pub fn metrics(&self) -> &CampaignMetrics {
        &self.metrics
    }

    /// Seeds excluded because the mutation tool cannot parse them.
    #[must_use]
    pub fn bad_seeds(&self) -> &HashSet<PathBuf> {
        &self.bad_seeds
    }

    /// Promotion bookkeeping.
    #[must_use]
    pub fn promotions(&self) -> &PromotionManager {
        &self.promotions
    }

    fn interrupted(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|flag| flag())
    }

    fn enforce_retention(&self) -> bool {
        enforce_limits(
            &self.config.paths.results,
            &self.config.paths.rewrites_dir(),
            &self.policy,
        )
    }

    fn scratch_path(&self, name: &str) -> PathBuf {
        self.config.paths.work_dir.join(name)
    }

    fn display_seed(&self, path: &Path) -> String {
        path.strip_prefix(&self.config.paths.seeds)
            .unwrap_or(path)
            .display()
            .to_string()
    }

    /// Run until the iteration budget is spent or something stops the worker.
    ///
    /// # Errors
    ///
    /// Returns an error for unexpected filesystem failures in the outer loop.
    pub fn run(&mut self) -> Result<CampaignExit> {
        info!(seeds = self.selector.len(), "found seeds");
        if self.selector.is_empty() {
            warn!(seeds = %self.config.paths.seeds.display(), "no seeds found");
            return Ok(CampaignExit::NoSeeds);
        }

        if self.promotions.is_enabled() {
            let pool = self
                .promotions
                .open_pool()
                .context("failed to open promotion pool")?;
            info!(pool = %pool.display(), "promoting accepted mutants");
        }
        if !self.enforce_retention() {
            return Ok(CampaignExit::DiskBudget);
        }

        let exit = self.run_iterations()?;
        let snapshot = self.metrics.snapshot();
        info!(
            ?exit,
            iterations = snapshot.iterations,
            compiles = snapshot.compiles,
            crash = snapshot.crash,
            hang = snapshot.hang,
            fate = snapshot.fate_cases,
            miscompilations = snapshot.miscompilations,
            promotions = snapshot.promotions,
            max_choice_sum = snapshot.max_choice_sum,
            "campaign finished"
        );
        Ok(exit)
    }

    fn run_iterations(&mut self) -> Result<CampaignExit> {
        let iterations = self.config.fuzzer.iterations;
        for i in 0..iterations {
            if self.interrupted() {
                return Ok(CampaignExit::Interrupted);
            }
            let Some(seed) = self.next_seed() else {
                warn!("no usable seeds available");
                return Ok(CampaignExit::SeedsExhausted);
            };
            self.metrics.record_iteration();

            if let Flow::Stop(exit) = self.fuzz_seed(i, &seed)? {
                return Ok(exit);
            }
            if !self.enforce_retention() {
                return Ok(CampaignExit::DiskBudget);
            }
        }
        Ok(CampaignExit::Completed)
    }

    fn next_seed(&mut self) -> Option<Seed> {
        let strategy = self.config.fuzzer.seed_selection_strategy;
        for _ in 0..=self.selector.len() {
            let seed = self.selector.select(strategy)?;
            if !self.bad_seeds.contains(&seed.path) {
                return Some(seed);
            }
            self.selector.remove_seed(&seed.path);
        }
        None
    }

    fn fuzz_seed(&mut self, i: u64, seed: &Seed) -> Result<Flow> {
        let content = match std::fs::read_to_string(&seed.path) {
            Ok(content) => content,
            Err(e) => {
                warn!(seed = %seed.path.display(), error = %e, "cannot read seed; dropping");
                self.selector.remove_seed(&seed.path);
                return Ok(Flow::Continue);
            }
        };
        info!(
            iteration = i + 1,
            iterations = self.config.fuzzer.iterations,
            seed = %self.display_seed(&seed.path),
            family = %seed.family,
            size = content.len(),
            "selected seed"
        );

        let mut passes = vec![Pass {
            name: "original",
            content: content.clone(),
        }];
        if let Some(rewritten) = self.rewrite_pass(i, &seed.path, &content) {
            passes.push(Pass {
                name: "rewritten",
                content: rewritten,
            });
        }

        for pass in &passes {
            match self.fuzz_pass(i, seed, &content, pass)? {
                Flow::Continue => {}
                Flow::Halt => {
                    info!(seed = %self.display_seed(&seed.path), "finding recorded; skipping the rest of this seed");
                    break;
                }
                Flow::Blacklisted => break,
                stop @ Flow::Stop(_) => return Ok(stop),
            }
        }
        Ok(Flow::Continue)
    }

    fn rewrite_pass(&self, i: u64, seed_path: &Path, content: &str) -> Option<String> {
        let rewriter = self.rewriter.clone()?;
        let settings = &self.config.rewrite;

        info!(lock = %settings.lock_path.display(), "acquiring rewrite lock");
        let lock = match DirLock::acquire(&settings.lock_path, settings.lock_timeout) {
            Ok(lock) => lock,
            Err(e) => {
                warn!(error = %e, "skipping rewrite");
                return None;
            }
        };
        let result = rewriter.rewrite(content);
        drop(lock);

        let rewritten = match result {
            Ok(text) if text.len() > settings.min_length => text,
            Ok(_) => {
                warn!("rewrite returned empty or invalid code");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "rewrite failed");
                return None;
            }
        };

        let stem = seed_path
            .file_stem()
            .map_or_else(|| "seed".into(), |s| s.to_string_lossy());
        let dir = self.config.paths.rewrites_dir();
        let path = dir.join(format!("llm_rewrite_{}_{i}_{stem}.rs", self.worker));
        match std::fs::create_dir_all(&dir).and_then(|()| std::fs::write(&path, &rewritten)) {
            Ok(()) => info!(path = %path.display(), "rewrite saved; adding rewritten pass"),
            Err(e) => warn!(path = %path.display(), error = %e, "cannot save rewrite"),
        }
        Some(rewritten)
    }

    fn log_round_complexity(&self, input: &Path, round: usize) {
        let c = self.scorer.score(input);
        info!(
            round = round + 1,
            rounds = self.config.fuzzer.rounds_per_seed,
            base = %input.file_name().unwrap_or_default().to_string_lossy(),
            constraint_sites = c.get("constraint_sites"),
            constraint_choice = c.get("constraint_choice_sum"),
            rewrite_sites = c.get("rewrite_sites"),
            rewrite_choice = c.get("rewrite_choice_sum"),
            lifetime_sites = c.get("lifetime_sites"),
            outlive_sites = c.get("outlive_sites"),
            "round started"
        );
    }

    fn fuzz_pass(&mut self, i: u64, seed: &Seed, seed_content: &str, pass: &Pass) -> Result<Flow> {
        info!(pass = pass.name, "starting fuzz pass");
        let mut baseline = LazyBaseline::new(
            pass.content.as_str(),
            self.scratch_path(&format!("temp_seed_baseline_w{}_iter_{}.rs", self.worker, i + 1)),
        );
        let limits = AttemptLimits::from(&self.config.fuzzer);
        let mutator = Arc::clone(&self.mutator);
        let mut seed_state = SeedMutationState::new();
        let mut round = RoundState::new();
        let mut current = pass.content.clone();
        let mut variant = 0usize;

        for round_no in 0..self.config.fuzzer.rounds_per_seed {
            let round_content = current.clone();
            let staged_round = if round_content == seed_content {
                None
            } else {
                Some(ScratchFile::create(
                    self.scratch_path(&format!(
                        "temp_round_seed_w{}_iter_{}_round_{}.rs",
                        self.worker,
                        i + 1,
                        round_no + 1
                    )),
                    &round_content,
                )?)
            };
            let input = staged_round
                .as_ref()
                .map_or_else(|| seed.path.clone(), |s| s.0.clone());
            self.log_round_complexity(&input, round_no);

            round.reset();
            let plan = plan_round(&self.config.fuzzer, &seed_state, &mut self.rng);
            for strategy in plan {
                if round.is_abandoned(strategy) {
                    continue;
                }
                if self.interrupted() {
                    return Ok(Flow::Stop(CampaignExit::Interrupted));
                }
                variant += 1;
                let variant_id = format!("w{}_iter_{}_{}_var_{variant}", self.worker, i + 1, pass.name);

                let report = {
                    let mut ctx = MutationContext {
                        input: &input,
                        seed: &mut seed_state,
                        round: &mut round,
                        rng: &mut self.rng,
                    };
                    run_strategy(mutator.as_ref(), strategy, limits, &mut ctx)
                };
                for _ in 0..report.duplicates {
                    self.metrics.record_duplicate();
                }
                for _ in 0..report.tool_failures {
                    self.metrics.record_tool_failure();
                }
                if self.interrupted() {
                    return Ok(Flow::Stop(CampaignExit::Interrupted));
                }

                let mutant = match report.outcome {
                    Outcome::Mutated(mutant) => mutant,
                    Outcome::Unparsable => {
                        warn!(variant = %variant_id, seed = %self.display_seed(&seed.path), "seed not parseable by the mutation tool; skipping");
                        if staged_round.is_none() {
                            self.bad_seeds.insert(seed.path.clone());
                            self.selector.remove_seed(&seed.path);
                            self.metrics.record_blacklist();
                        }
                        return Ok(Flow::Blacklisted);
                    }
                    _ => continue,
                };

                let flow = self.evaluate(&variant_id, seed, strategy, &round_content, &mutant, &mut baseline)?;
                if strategy.is_structural() {
                    current = mutant;
                    seed_state.reset();
                    round.reset();
                }
                match flow {
                    Flow::Continue => {}
                    other => return Ok(other),
                }
            }
        }
        Ok(Flow::Continue)
    }

    fn evaluate(
        &mut self,
        variant_id: &str,
        seed: &Seed,
        strategy: Strategy,
        before: &str,
        mutant: &str,
        baseline: &mut LazyBaseline,
    ) -> Result<Flow> {
        let staged = ScratchFile::create(self.scratch_path(&format!("temp_{variant_id}.rs")), mutant)?;
        let verdict = self.oracle.classify(&staged.0, baseline);
        // Compilers killed on shutdown leave a meaningless verdict.
        if self.interrupted() {
            return Ok(Flow::Stop(CampaignExit::Interrupted));
        }
        self.record_verdict(variant_id, seed, &verdict);

        let complexity = self.scorer.score(&staged.0);
        self.metrics
            .observe_choice_sum(complexity.get("constraint_choice_sum"));
        drop(staged);

        if !verdict.categories().is_empty() {
            if !self.enforce_retention() {
                return Ok(Flow::Stop(CampaignExit::DiskBudget));
            }
            let record = CaseRecord {
                variant_id,
                seed: &seed.path,
                family: &seed.family,
                strategy,
                before,
                after: mutant,
                verdict: &verdict,
                complexity: &complexity,
            };
            if let Err(e) = self.cases.write(&record) {
                error!(variant = %variant_id, error = %e, "failed to write case");
            }
        }
        info!(variant = %variant_id, %strategy, status = %verdict.overall, "result");

        if is_promotable(strategy, verdict.overall) {
            match self.promotions.promote(&seed.path, variant_id, mutant) {
                Ok(Some(path)) => {
                    if self.selector.add_seed(&path, Some(&seed.family)) {
                        debug!(seed = %path.display(), "promoted seed registered");
                    }
                    self.metrics.record_promotion();
                }
                Ok(None) => {}
                Err(e) => warn!(variant = %variant_id, error = %e, "failed to promote seed"),
            }
        }

        Ok(if verdict.halt { Flow::Halt } else { Flow::Continue })
    }

    fn record_verdict(&mut self, variant_id: &str, seed: &Seed, verdict: &Classification) {
        for run in &verdict.runs {
            self.metrics.record_compile(run.result.duration);
        }
        self.metrics.record_verdict(verdict.overall);
        if verdict.miscompilation {
            self.metrics.record_miscompilation();
            warn!(variant = %variant_id, breakdown = %verdict.breakdown(), "nightly and next-solver disagree");
        }
        if verdict.is_fate() {
            self.metrics.record_fate();
        }
        if !verdict.halt {
            return;
        }

        self.selector.ban_family(&seed.family);
        if verdict.is_fate() {
            info!(variant = %variant_id, status = %verdict.overall, "baseline already fails this way; classifying as fate");
        } else {
            error!(
                variant = %variant_id,
                status = %verdict.overall,
                breakdown = %verdict.breakdown(),
                "finding detected; stopping further mutation for this seed"
            );
        }
    }
}

/// Builder for [`Campaign`].
///
/// Collaborators not supplied explicitly are built from the configuration:
/// subprocess compiler, mutation tool and scorer, plus a command rewriter
/// when rewriting is enabled.
pub struct CampaignBuilder {
    config: FuzzConfig,
    worker: usize,
    shards: usize,
    compiler: Option<Arc<dyn CompilerBackend>>,
    mutator: Option<Arc<dyn MutationTool>>,
    scorer: Option<Arc<dyn ComplexityScorer>>,
    rewriter: Option<Arc<dyn Rewriter>>,
    shutdown: Option<ShutdownCheck>,
}

impl CampaignBuilder {
    /// Start from `config`, as worker 0 of 1.
    #[must_use]
    pub fn new(config: FuzzConfig) -> Self {
        Self {
            config,
            worker: 0,
            shards: 1,
            compiler: None,
            mutator: None,
            scorer: None,
            rewriter: None,
            shutdown: None,
        }
    }

    /// Run shard `index` of `count`.
    #[must_use]
    pub fn shard(mut self, index: usize, count: usize) -> Self {
        self.worker = index;
        self.shards = count.max(1);
        self
    }

    /// Use `compiler` instead of spawning the configured commands.
    #[must_use]
    pub fn compiler(mut self, compiler: Arc<dyn CompilerBackend>) -> Self {
        self.compiler = Some(compiler);
        self
    }

    /// Use `mutator` instead of the configured binary.
    #[must_use]
    pub fn mutator(mut self, mutator: Arc<dyn MutationTool>) -> Self {
        self.mutator = Some(mutator);
        self
    }

    /// Use `scorer` instead of the configured binary.
    #[must_use]
    pub fn scorer(mut self, scorer: Arc<dyn ComplexityScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    /// Enable the rewritten pass with `rewriter`.
    #[must_use]
    pub fn rewriter(mut self, rewriter: Arc<dyn Rewriter>) -> Self {
        self.rewriter = Some(rewriter);
        self
    }

    /// Poll `flag` between mutants; `true` stops the campaign.
    ///
    /// Subprocess adapters built by [`CampaignBuilder::build`] also poll it
    /// and kill their running child.
    #[must_use]
    pub fn shutdown(mut self, flag: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.shutdown = Some(Arc::new(flag));
        self
    }

    /// Discover this shard's seeds and assemble the campaign.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the work directory
    /// cannot be created, or the seed root cannot be scanned.
    pub fn build(self) -> Result<Campaign> {
        let config = self.config;
        config.validate().context("invalid configuration")?;
        std::fs::create_dir_all(&config.paths.work_dir).with_context(|| {
            format!("failed to create work dir {}", config.paths.work_dir.display())
        })?;

        let mut rng = match config.fuzzer.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(self.worker as u64)),
            None => StdRng::from_entropy(),
        };

        let shutdown = self.shutdown;
        let compiler = self.compiler.unwrap_or_else(|| {
            let mut compiler = ProcessCompiler::from_config(&config.compiler);
            if let Some(check) = &shutdown {
                compiler = compiler.with_shutdown(Arc::clone(check));
            }
            Arc::new(compiler) as Arc<dyn CompilerBackend>
        });
        let mutator = self.mutator.unwrap_or_else(|| {
            let mut mutator = ProcessMutationTool::new(&config.mutator.binary, config.mutator.timeout);
            if let Some(check) = &shutdown {
                mutator = mutator.with_shutdown(Arc::clone(check));
            }
            Arc::new(mutator) as Arc<dyn MutationTool>
        });
        let scorer = self.scorer.unwrap_or_else(|| {
            let binary = config
                .scorer
                .binary
                .clone()
                .unwrap_or_else(|| config.mutator.binary.clone());
            let mut scorer = ProcessScorer::new(binary, config.scorer.timeout);
            if let Some(check) = &shutdown {
                scorer = scorer.with_shutdown(Arc::clone(check));
            }
            Arc::new(scorer) as Arc<dyn ComplexityScorer>
        });
        let rewriter = match self.rewriter {
            Some(rewriter) => Some(rewriter),
            None if config.rewrite.enabled => {
                let mut rewriter =
                    CommandRewriter::new(config.rewrite.command.clone(), config.rewrite.timeout)
                        .context("invalid rewrite command")?;
                if let Some(check) = &shutdown {
                    rewriter = rewriter.with_shutdown(Arc::clone(check));
                }
                Some(Arc::new(rewriter) as Arc<dyn Rewriter>)
            }
            None => None,
        };

        let discovery = discover(&config.paths.seeds, self.worker, self.shards)
            .context("failed to scan seed directory")?;
        info!(
            shard = self.worker,
            shards = self.shards,
            assigned = discovery.seeds.len(),
            total = discovery.total_valid,
            "seed shard assigned"
        );
        let mut selector = SeedSelector::new(
            &config.paths.seeds,
            config.retention.new_seeds_prefix.as_str(),
            &config.selection,
            Arc::clone(&scorer),
            StdRng::seed_from_u64(rng.gen()),
        );
        selector.extend(&discovery.seeds);

        let promotions = PromotionManager::new(
            &config.paths.seeds,
            config.retention.new_seeds_prefix.as_str(),
            config.retention.new_seeds_max,
            config.fuzzer.max_promotions_per_seed,
            config.retention.promote_success,
        );
        if config.compiler.parallel_compile {
            info!(workers = config.compiler.parallel_workers, "parallel compile enabled");
        }

        Ok(Campaign {
            oracle: DifferentialOracle::new(compiler, &config),
            cases: CaseStore::new(&config.paths.results),
            policy: RetentionPolicy::from(&config.retention),
            metrics: CampaignMetrics::default(),
            bad_seeds: HashSet::new(),
            worker: self.worker,
            selector,
            mutator,
            scorer,
            rewriter,
            promotions,
            rng,
            shutdown,
            config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tfuzz_adapters::{
        MutationReply, MutationSignal, SimulatedCompiler, SimulatedMutationTool, SimulatedRewriter,
        SimulatedScorer,
    };
    use tfuzz_common::{CompilationStatus, FuzzError};

    fn config(root: &Path) -> FuzzConfig {
        let mut config = FuzzConfig::default();
        config.paths.seeds = root.join("seeds");
        config.paths.results = root.join("results");
        config.paths.work_dir = root.join("work");
        config.paths.rewrites = Some(root.join("rewrites"));
        config.rewrite.lock_path = root.join("rewrite.lock");
        config.fuzzer.iterations = 1;
        config.fuzzer.rounds_per_seed = 1;
        config.fuzzer.injection_per_round = 0;
        config.fuzzer.projection_per_round = 0;
        config.fuzzer.lifetime_per_round = 0;
        config.fuzzer.outlive_per_round = 0;
        config.fuzzer.structural_per_round = 1;
        config.fuzzer.rng_seed = Some(3);
        config
    }

    fn seed(root: &Path, name: &str, content: &str) -> PathBuf {
        let dir = root.join("seeds");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    fn builder(config: FuzzConfig, status: CompilationStatus) -> CampaignBuilder {
        CampaignBuilder::new(config)
            .compiler(Arc::new(SimulatedCompiler::always(status)))
            .mutator(Arc::new(SimulatedMutationTool::appending()))
            .scorer(Arc::new(SimulatedScorer::fixed(Default::default())))
    }

    fn case_count(results: &Path, category: &str) -> usize {
        std::fs::read_dir(results.join(category)).map_or(0, Iterator::count)
    }

    #[test]
    fn test_empty_corpus() {
        let dir = tempfile::tempdir().unwrap();
        let mut campaign = builder(config(dir.path()), CompilationStatus::Success)
            .build()
            .unwrap();
        assert_eq!(campaign.run().unwrap(), CampaignExit::NoSeeds);
    }

    #[test]
    fn test_error_cases_are_written() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path(), "a.rs", "trait A {}\n");
        let mut cfg = config(dir.path());
        cfg.fuzzer.structural_per_round = 3;
        let mut campaign = builder(cfg, CompilationStatus::Error).build().unwrap();

        assert_eq!(campaign.run().unwrap(), CampaignExit::Completed);
        let results = dir.path().join("results");
        assert_eq!(case_count(&results, "error"), 3);
        let case = results.join("error/case_w0_iter_1_original_var_1");
        assert_eq!(std::fs::read_to_string(case.join("before.rs")).unwrap(), "trait A {}\n");
        assert_eq!(campaign.metrics().judged(CompilationStatus::Error), 3);
        // Scratch files are cleaned up.
        assert_eq!(std::fs::read_dir(dir.path().join("work")).unwrap().count(), 0);
    }

    #[test]
    fn test_structural_success_chains_rounds() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path(), "a.rs", "trait A {}\n");
        let mut cfg = config(dir.path());
        cfg.fuzzer.rounds_per_seed = 3;
        let tool = Arc::new(SimulatedMutationTool::appending());
        let mut campaign = builder(cfg, CompilationStatus::Error)
            .mutator(tool.clone())
            .build()
            .unwrap();
        campaign.run().unwrap();

        let calls = tool.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls[1].input.starts_with(&calls[0].input));
        assert!(calls[1].input.len() > calls[0].input.len());
        assert!(calls[2].input.len() > calls[1].input.len());
    }

    #[test]
    fn test_unparsable_seed_is_blacklisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = seed(dir.path(), "a.rs", "trait A {}\n");
        let mut cfg = config(dir.path());
        cfg.fuzzer.iterations = 3;
        cfg.selection.max_picks_per_seed = -1;
        let tool = Arc::new(SimulatedMutationTool::new(|_, _, _| MutationReply {
            signal: MutationSignal::Unparsable,
            choice: None,
        }));
        let mut campaign = builder(cfg, CompilationStatus::Success)
            .mutator(tool.clone())
            .build()
            .unwrap();

        assert_eq!(campaign.run().unwrap(), CampaignExit::SeedsExhausted);
        assert!(campaign.bad_seeds().contains(&path));
        assert!(!campaign.selector().contains(&path));
        assert_eq!(tool.call_count(), 1);
    }

    #[test]
    fn test_rewritten_pass() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path(), "a.rs", "trait A {}\n");
        let tool = Arc::new(SimulatedMutationTool::appending());
        let mut campaign = builder(config(dir.path()), CompilationStatus::Error)
            .mutator(tool.clone())
            .rewriter(Arc::new(SimulatedRewriter::new(|src| {
                Ok(format!("// rewritten\n{src}"))
            })))
            .build()
            .unwrap();
        campaign.run().unwrap();

        let saved = dir.path().join("rewrites/llm_rewrite_0_0_a.rs");
        assert!(std::fs::read_to_string(saved).unwrap().starts_with("// rewritten"));
        assert!(dir
            .path()
            .join("results/error/case_w0_iter_1_rewritten_var_1")
            .is_dir());
        assert_eq!(tool.call_count(), 2);
        assert!(!dir.path().join("rewrite.lock").exists());
    }

    #[test]
    fn test_short_or_failed_rewrite_skips_pass() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path(), "a.rs", "trait A {}\n");
        let tool = Arc::new(SimulatedMutationTool::appending());
        let mut campaign = builder(config(dir.path()), CompilationStatus::Error)
            .mutator(tool.clone())
            .rewriter(Arc::new(SimulatedRewriter::new(|_| {
                Err(FuzzError::Tool("collaborator offline".to_string()))
            })))
            .build()
            .unwrap();
        campaign.run().unwrap();
        assert_eq!(tool.call_count(), 1);
    }

    #[test]
    fn test_shutdown_interrupts() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path(), "a.rs", "trait A {}\n");
        let stop = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&stop);
        let mut campaign = builder(config(dir.path()), CompilationStatus::Success)
            .shutdown(move || flag.load(Ordering::Relaxed))
            .build()
            .unwrap();
        assert_eq!(campaign.run().unwrap(), CampaignExit::Interrupted);
    }

    #[test]
    fn test_shutdown_during_compile_discards_verdict() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path(), "a.rs", "trait A {}\n");
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let setter = Arc::clone(&stop);
        // Shutdown lands while the mutant compiles.
        let compiler = SimulatedCompiler::new(move |_, _| {
            setter.store(true, Ordering::Relaxed);
            CompilationStatus::Error
        });
        let mut campaign = builder(config(dir.path()), CompilationStatus::Success)
            .compiler(Arc::new(compiler))
            .shutdown(move || flag.load(Ordering::Relaxed))
            .build()
            .unwrap();

        assert_eq!(campaign.run().unwrap(), CampaignExit::Interrupted);
        assert_eq!(case_count(&dir.path().join("results"), "error"), 0);
        assert_eq!(campaign.metrics().judged(CompilationStatus::Error), 0);
    }

    #[test]
    fn test_rewrite_enabled_without_command_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.rewrite.enabled = true;
        assert!(builder(cfg, CompilationStatus::Success).build().is_err());
    }
}
