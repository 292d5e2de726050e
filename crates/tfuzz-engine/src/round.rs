//! Mutation round planning and the per-strategy attempt loop.

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use tfuzz_adapters::{IndexFlag, MutationChoice, MutationRequest, MutationSignal, MutationTool};
use tfuzz_common::FuzzerConfig;
use tracing::{debug, info, warn};

/// Mutation strategies understood by the AST mutation tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Strategy {
    /// Inject trait-bound constraints at a global choice index.
    ConstraintInjection,
    /// Rewrite associated-type projections.
    ProjectionRewrite,
    /// Obscure lifetime parameters.
    LifetimeObfuscation,
    /// Add outlives bounds.
    LifetimeOutlive,
    /// Add an associated type to a trait.
    AddAssocType,
    /// Add a new trait.
    AddTrait,
    /// Add a new impl.
    AddImpl,
}

impl Strategy {
    /// Structural strategies, in weight-table order.
    pub const STRUCTURAL: [Self; 3] = [Self::AddAssocType, Self::AddTrait, Self::AddImpl];

    /// Mode string passed to the mutation tool.
    #[must_use]
    pub fn mode(self) -> &'static str {
        match self {
            Self::ConstraintInjection => "constraint_injection",
            Self::ProjectionRewrite => "projection_rewrite",
            Self::LifetimeObfuscation => "lifetime_obfuscation",
            Self::LifetimeOutlive => "lifetime_outlive",
            Self::AddAssocType => "add_assoc_type",
            Self::AddTrait => "add_trait",
            Self::AddImpl => "add_impl",
        }
    }

    /// Structural successes carry over as the next round's input.
    #[must_use]
    pub fn is_structural(self) -> bool {
        matches!(self, Self::AddAssocType | Self::AddTrait | Self::AddImpl)
    }

    /// A no-op reply abandons these strategies for the round instead of retrying.
    #[must_use]
    pub fn expects_noop(self) -> bool {
        matches!(self, Self::AddTrait | Self::AddImpl | Self::ConstraintInjection)
    }

    /// Flag used to force a target index.
    #[must_use]
    pub fn index_flag(self) -> IndexFlag {
        match self {
            Self::ConstraintInjection => IndexFlag::Constraint,
            Self::ProjectionRewrite => IndexFlag::Choice,
            _ => IndexFlag::Site,
        }
    }

    /// Uses the global `choice_count`/`choice_index` fields of the choice line.
    #[must_use]
    pub fn tracks_global_choice(self) -> bool {
        matches!(self, Self::ConstraintInjection | Self::ProjectionRewrite)
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mode())
    }
}

/// sha-256 of a mutant, hex encoded.
#[must_use]
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Mutation memory for one seed and pass: seen mutants and exhausted strategies.
#[derive(Debug, Default)]
pub struct SeedMutationState {
    seen: HashMap<Strategy, HashSet<String>>,
    exhausted: HashSet<Strategy>,
}

impl SeedMutationState {
    /// Fresh state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything, e.g. after a structural success changed the program.
    pub fn reset(&mut self) {
        self.seen.clear();
        self.exhausted.clear();
    }

    /// Record a mutant. Returns false if `strategy` already produced it.
    pub fn remember(&mut self, strategy: Strategy, content: &str) -> bool {
        self.seen
            .entry(strategy)
            .or_default()
            .insert(content_hash(content))
    }

    /// Mark `strategy` as having no mutation points left.
    pub fn mark_exhausted(&mut self, strategy: Strategy) {
        self.exhausted.insert(strategy);
    }

    /// True if `strategy` has no mutation points left.
    #[must_use]
    pub fn is_exhausted(&self, strategy: Strategy) -> bool {
        self.exhausted.contains(&strategy)
    }
}

/// Index bookkeeping for one round.
#[derive(Debug, Default)]
pub struct RoundState {
    used: HashMap<Strategy, HashSet<usize>>,
    totals: HashMap<Strategy, usize>,
    abandoned: HashSet<Strategy>,
}

/// Result of picking a target index before a mutation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexPick {
    /// Candidate total unknown; let the tool choose.
    Free,
    /// Force this unused index.
    Forced(usize),
    /// Every index has been used, or there are none.
    Exhausted,
}

impl RoundState {
    /// Fresh state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget all indices and abandonments.
    pub fn reset(&mut self) {
        self.used.clear();
        self.totals.clear();
        self.abandoned.clear();
    }

    /// True if `strategy` was abandoned earlier in this round.
    #[must_use]
    pub fn is_abandoned(&self, strategy: Strategy) -> bool {
        self.abandoned.contains(&strategy)
    }

    /// Skip remaining planned uses of `strategy` in this round.
    pub fn abandon(&mut self, strategy: Strategy) {
        self.abandoned.insert(strategy);
    }

    /// Known candidate total for `strategy`.
    #[must_use]
    pub fn total(&self, strategy: Strategy) -> Option<usize> {
        self.totals.get(&strategy).copied()
    }

    /// Indices already tried for `strategy`.
    #[must_use]
    pub fn used(&self, strategy: Strategy) -> usize {
        self.used.get(&strategy).map_or(0, HashSet::len)
    }

    /// Choose an unused index: `tries` random draws, then uniformly among the rest.
    pub fn pick_index(&self, strategy: Strategy, tries: usize, rng: &mut StdRng) -> IndexPick {
        let Some(total) = self.total(strategy) else {
            return IndexPick::Free;
        };
        let empty = HashSet::new();
        let used = self.used.get(&strategy).unwrap_or(&empty);
        if total == 0 || used.len() >= total {
            return IndexPick::Exhausted;
        }

        for _ in 0..tries {
            let candidate = rng.gen_range(0..total);
            if !used.contains(&candidate) {
                return IndexPick::Forced(candidate);
            }
        }
        let remaining: Vec<usize> = (0..total).filter(|i| !used.contains(i)).collect();
        if remaining.is_empty() {
            return IndexPick::Exhausted;
        }
        IndexPick::Forced(remaining[rng.gen_range(0..remaining.len())])
    }

    /// Fold a choice line into the bookkeeping. Returns true when the
    /// strategy's sites are all used up.
    pub fn record_choice(&mut self, strategy: Strategy, choice: &MutationChoice) -> bool {
        let (total, index) = if strategy.tracks_global_choice() {
            match (choice.choice_count, choice.choice_index) {
                (Some(count), Some(index)) => (count, index),
                _ => return false,
            }
        } else {
            (choice.count, choice.index)
        };
        let (Ok(total), Ok(index)) = (usize::try_from(total), usize::try_from(index)) else {
            return false;
        };

        self.totals.insert(strategy, total);
        let used = self.used.entry(strategy).or_default();
        used.insert(index);
        !strategy.tracks_global_choice() && total > 0 && used.len() >= total
    }
}

/// Build the ordered strategy list for one round.
///
/// Strategies exhausted for the seed are left out.
pub fn plan_round(
    config: &FuzzerConfig,
    state: &SeedMutationState,
    rng: &mut StdRng,
) -> Vec<Strategy> {
    let mut plan = Vec::new();
    if !config.structural_only {
        for (strategy, count) in [
            (Strategy::ConstraintInjection, config.injection_per_round),
            (Strategy::ProjectionRewrite, config.projection_per_round),
            (Strategy::LifetimeObfuscation, config.lifetime_per_round),
            (Strategy::LifetimeOutlive, config.outlive_per_round),
        ] {
            if !state.is_exhausted(strategy) {
                plan.extend(std::iter::repeat(strategy).take(count));
            }
        }
    }

    let weights = &config.structural_weights;
    let table = [weights.add_assoc_type, weights.add_trait, weights.add_impl]
        .map(|w| if w.is_finite() && w > 0.0 { w } else { 0.0 });
    let weighted = WeightedIndex::new(table).ok();
    for _ in 0..config.structural_per_round {
        let idx = match &weighted {
            Some(dist) => dist.sample(rng),
            None => rng.gen_range(0..Strategy::STRUCTURAL.len()),
        };
        let strategy = Strategy::STRUCTURAL[idx];
        if !state.is_exhausted(strategy) {
            plan.push(strategy);
        }
    }
    plan
}

/// Result of a single mutation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// New, previously unseen program text.
    Mutated(String),
    /// The tool found nothing to change.
    NoOp,
    /// No unused mutation points remain.
    Exhausted,
    /// The tool produced a mutant this strategy already produced.
    Duplicate,
    /// The round input could not be parsed.
    Unparsable,
    /// The tool failed, timed out, or wrote nothing.
    ToolError(String),
}

/// Retry limits for the attempt loop.
#[derive(Debug, Clone, Copy)]
pub struct AttemptLimits {
    /// Attempts per planned strategy.
    pub max_retries: usize,
    /// Random draws before falling back to the remaining-index set.
    pub pick_tries: usize,
}

impl From<&FuzzerConfig> for AttemptLimits {
    fn from(config: &FuzzerConfig) -> Self {
        Self {
            max_retries: config.mutation_max_retries.max(1),
            pick_tries: config.choice_pick_tries,
        }
    }
}

/// Everything the attempt loop needs besides the tool.
pub struct MutationContext<'a> {
    /// Round input file.
    pub input: &'a Path,
    /// Seed-level memory.
    pub seed: &'a mut SeedMutationState,
    /// Round-level memory.
    pub round: &'a mut RoundState,
    /// Shared sampling source.
    pub rng: &'a mut StdRng,
}

/// Run one mutation attempt for `strategy`.
pub fn attempt(
    tool: &dyn MutationTool,
    strategy: Strategy,
    pick_tries: usize,
    ctx: &mut MutationContext<'_>,
) -> Outcome {
    let index = match ctx.round.pick_index(strategy, pick_tries, ctx.rng) {
        IndexPick::Exhausted => return Outcome::Exhausted,
        IndexPick::Forced(index) => Some((strategy.index_flag(), index)),
        IndexPick::Free => None,
    };

    let reply = tool.mutate(&MutationRequest {
        input: ctx.input,
        mode: strategy.mode(),
        index,
    });
    if let Some(choice) = &reply.choice {
        if ctx.round.record_choice(strategy, choice) {
            ctx.seed.mark_exhausted(strategy);
        }
    }

    match reply.signal {
        MutationSignal::Failed(reason) => Outcome::ToolError(reason),
        MutationSignal::Unparsable => Outcome::Unparsable,
        MutationSignal::NoOp => Outcome::NoOp,
        MutationSignal::Mutated(text) => {
            if ctx.seed.remember(strategy, &text) {
                Outcome::Mutated(text)
            } else {
                Outcome::Duplicate
            }
        }
    }
}

/// Counters from one run of the attempt loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyReport {
    /// Final outcome. Anything other than `Mutated` or `Unparsable` means skip.
    pub outcome: Outcome,
    /// Tool invocations made.
    pub attempts: usize,
    /// Duplicate mutants seen.
    pub duplicates: usize,
    /// Tool failures seen.
    pub tool_failures: usize,
}

/// Retry `strategy` until it yields a mutant, gives up, or runs out of attempts.
pub fn run_strategy(
    tool: &dyn MutationTool,
    strategy: Strategy,
    limits: AttemptLimits,
    ctx: &mut MutationContext<'_>,
) -> StrategyReport {
    let mut report = StrategyReport {
        outcome: Outcome::ToolError("no attempts made".to_string()),
        attempts: 0,
        duplicates: 0,
        tool_failures: 0,
    };
    let mut logged_noop = false;

    for _ in 0..limits.max_retries.max(1) {
        report.attempts += 1;
        let outcome = attempt(tool, strategy, limits.pick_tries, ctx);
        match &outcome {
            Outcome::Mutated(_) | Outcome::Unparsable => {
                report.outcome = outcome;
                return report;
            }
            Outcome::Exhausted => {
                info!(
                    %strategy,
                    count = ctx.round.total(strategy).unwrap_or(0),
                    "strategy has no remaining mutation points; skipping"
                );
                ctx.seed.mark_exhausted(strategy);
                ctx.round.abandon(strategy);
                report.outcome = outcome;
                return report;
            }
            Outcome::NoOp if strategy.expects_noop() => {
                info!(%strategy, "strategy produced no mutation; skipping without retry");
                ctx.round.abandon(strategy);
                report.outcome = outcome;
                return report;
            }
            Outcome::NoOp => {
                if !logged_noop {
                    info!(%strategy, "strategy inapplicable; retrying");
                    logged_noop = true;
                }
            }
            Outcome::Duplicate => {
                debug!(%strategy, "identical mutant; retrying");
                report.duplicates += 1;
            }
            Outcome::ToolError(reason) => {
                warn!(%strategy, reason = %reason, "mutation tool failed");
                report.tool_failures += 1;
            }
        }
        report.outcome = outcome;
    }

    warn!(
        %strategy,
        attempts = report.attempts,
        "no usable mutant within the retry limit"
    );
    report
}
