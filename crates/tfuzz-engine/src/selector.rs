//! Adaptive seed scheduling over base and promoted pools.
//!
//! Each call to [`SeedSelector::select`] narrows the corpus in stages:
//! 1. Eligible: family not banned and per-seed pick budget not spent
//! 2. Pool: promoted with probability `promoted_pool_prob`, else base
//! 3. Not recent: outside the seed window, then outside the family window,
//!    relaxing each stage when it would leave nothing
//! 4. Draw: uniform, or weighted by complexity score with pick decay

use crate::seed::{infer_family, is_internal_only_file, is_promoted, Seed};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::Rng;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tfuzz_adapters::ComplexityScorer;
use tfuzz_common::{SelectionConfig, SelectionStrategy};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct SeedEntry {
    family: String,
    promoted: bool,
    picks: u64,
}

/// Seed corpus with pick history, recency windows, and family bans.
pub struct SeedSelector {
    root: PathBuf,
    promoted_prefix: String,
    knobs: SelectionConfig,
    scorer: Arc<dyn ComplexityScorer>,
    rng: StdRng,
    order: Vec<PathBuf>,
    entries: HashMap<PathBuf, SeedEntry>,
    scores: HashMap<PathBuf, u64>,
    score_cache: HashMap<(PathBuf, u128), u64>,
    scores_initialized: bool,
    recent: VecDeque<PathBuf>,
    family_picks: HashMap<String, u64>,
    family_recent: VecDeque<String>,
    banned: HashSet<String>,
}

impl std::fmt::Debug for SeedSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeedSelector")
            .field("root", &self.root)
            .field("seeds", &self.order.len())
            .field("banned_families", &self.banned.len())
            .finish_non_exhaustive()
    }
}

fn push_bounded<T>(window: &mut VecDeque<T>, capacity: usize, item: T) {
    if capacity == 0 {
        return;
    }
    window.push_back(item);
    while window.len() > capacity {
        window.pop_front();
    }
}

impl SeedSelector {
    /// Create an empty selector rooted at `root`.
    ///
    /// `promoted_prefix` names promoted pool directories (`<prefix><N>`).
    /// Knobs are normalized before use.
    pub fn new(
        root: impl Into<PathBuf>,
        promoted_prefix: impl Into<String>,
        knobs: &SelectionConfig,
        scorer: Arc<dyn ComplexityScorer>,
        rng: StdRng,
    ) -> Self {
        Self {
            root: root.into(),
            promoted_prefix: promoted_prefix.into(),
            knobs: knobs.normalized(),
            scorer,
            rng,
            order: Vec::new(),
            entries: HashMap::new(),
            scores: HashMap::new(),
            score_cache: HashMap::new(),
            scores_initialized: false,
            recent: VecDeque::new(),
            family_picks: HashMap::new(),
            family_recent: VecDeque::new(),
            banned: HashSet::new(),
        }
    }

    /// Add every path in `seeds`, inferring families. Returns how many were added.
    pub fn extend<I, P>(&mut self, seeds: I) -> usize
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        seeds
            .into_iter()
            .filter(|p| self.add_seed(p.as_ref(), None))
            .count()
    }

    /// Number of live seeds.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// True when the corpus is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// True if `path` is a live seed.
    #[must_use]
    pub fn contains(&self, path: &Path) -> bool {
        self.entries.contains_key(path)
    }

    /// Number of live promoted seeds.
    #[must_use]
    pub fn promoted_len(&self) -> usize {
        self.entries.values().filter(|e| e.promoted).count()
    }

    /// Family of a live seed, inferred from the path otherwise.
    #[must_use]
    pub fn family_of(&self, path: &Path) -> String {
        self.entries
            .get(path)
            .map_or_else(|| infer_family(path), |e| e.family.clone())
    }

    /// Times `path` has been selected.
    #[must_use]
    pub fn pick_count(&self, path: &Path) -> u64 {
        self.entries.get(path).map_or(0, |e| e.picks)
    }

    /// Exclude `family` from selection for the rest of the run.
    pub fn ban_family(&mut self, family: &str) {
        if self.banned.insert(family.to_string()) {
            info!(family, "family banned");
        }
    }

    /// True if `family` has been banned.
    #[must_use]
    pub fn is_banned(&self, family: &str) -> bool {
        self.banned.contains(family)
    }

    /// Register a seed. Non-files, non-`.rs`, duplicates and internal-only seeds are ignored.
    ///
    /// Returns true if the seed was added.
    pub fn add_seed(&mut self, path: &Path, family: Option<&str>) -> bool {
        if !path.is_file() || path.extension().is_none_or(|ext| ext != "rs") {
            return false;
        }
        if self.entries.contains_key(path) || is_internal_only_file(path) {
            return false;
        }

        let family = family.map_or_else(|| infer_family(path), str::to_string);
        let promoted = is_promoted(&self.root, path, &self.promoted_prefix);
        self.order.push(path.to_path_buf());
        self.entries.insert(
            path.to_path_buf(),
            SeedEntry {
                family,
                promoted,
                picks: 0,
            },
        );
        if self.scores_initialized {
            let score = self.score(path);
            self.scores.insert(path.to_path_buf(), score);
        }
        true
    }

    /// Forget a seed. Family bookkeeping goes only with the family's last live seed.
    ///
    /// Returns true if the seed was present.
    pub fn remove_seed(&mut self, path: &Path) -> bool {
        let Some(entry) = self.entries.remove(path) else {
            return false;
        };
        self.order.retain(|p| p != path);
        self.scores.remove(path);
        self.score_cache.retain(|(p, _), _| p != path);
        self.recent.retain(|p| p != path);

        let family_alive = self.entries.values().any(|e| e.family == entry.family);
        if !family_alive {
            self.family_picks.remove(&entry.family);
            self.family_recent.retain(|f| f != &entry.family);
        }
        debug!(seed = %path.display(), "seed removed");
        true
    }

    /// Complexity score of `path`, cached per (path, mtime). Always at least 1.
    pub fn score(&mut self, path: &Path) -> u64 {
        let mtime_ns = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos());
        let Some(mtime_ns) = mtime_ns else {
            return 1;
        };

        let key = (path.to_path_buf(), mtime_ns);
        if let Some(cached) = self.score_cache.get(&key) {
            return (*cached).max(1);
        }
        let score = self.scorer.score(path).seed_score().max(1);
        self.score_cache.insert(key, score);
        score
    }

    fn initialize_scores(&mut self) {
        info!(seeds = self.order.len(), "calculating seed scores");
        for path in self.order.clone() {
            let score = self.score(&path);
            self.scores.insert(path, score);
        }
        self.scores_initialized = true;
    }

    fn eligible(&self) -> Vec<PathBuf> {
        let budget = self.knobs.pick_budget();
        self.order
            .iter()
            .filter(|p| {
                let entry = &self.entries[*p];
                !self.banned.contains(&entry.family) && budget.is_none_or(|max| entry.picks < max)
            })
            .cloned()
            .collect()
    }

    fn choose_pool(&mut self, eligible: Vec<PathBuf>) -> Vec<PathBuf> {
        let (promoted, base): (Vec<_>, Vec<_>) = eligible
            .into_iter()
            .partition(|p| self.entries[p].promoted);
        let want_promoted = self.rng.gen::<f64>() < self.knobs.promoted_pool_prob;
        if want_promoted && !promoted.is_empty() {
            return promoted;
        }
        if base.is_empty() {
            promoted
        } else {
            base
        }
    }

    fn outside_windows(&self, pool: Vec<PathBuf>) -> Vec<PathBuf> {
        let by_seed = if self.knobs.repeat_window == 0 || pool.len() <= 1 {
            pool
        } else {
            let fresh: Vec<PathBuf> = pool
                .iter()
                .filter(|p| !self.recent.contains(p))
                .cloned()
                .collect();
            if fresh.is_empty() {
                pool
            } else {
                fresh
            }
        };

        if self.knobs.family_repeat_window == 0 || by_seed.len() <= 1 {
            return by_seed;
        }
        let fresh: Vec<PathBuf> = by_seed
            .iter()
            .filter(|p| !self.family_recent.contains(&self.entries[*p].family))
            .cloned()
            .collect();
        if fresh.is_empty() {
            by_seed
        } else {
            fresh
        }
    }

    fn weight(&self, path: &Path) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        let score = self.scores.get(path).copied().unwrap_or(1) as f64;
        let shaped = score.max(1.0).powf(1.0 / self.knobs.weight_temperature);

        let entry = &self.entries[path];
        #[allow(clippy::cast_precision_loss)]
        let picks = entry.picks as f64;
        let decayed = shaped / (1.0 + picks).powf(self.knobs.pick_decay_beta);

        #[allow(clippy::cast_precision_loss)]
        let family_picks = self.family_picks.get(&entry.family).copied().unwrap_or(0) as f64;
        let family_factor = 1.0 / (1.0 + family_picks).powf(self.knobs.family_pick_decay_beta);

        decayed.max(self.knobs.min_weight) * family_factor.max(self.knobs.family_min_weight)
    }

    fn draw(&mut self, candidates: &[PathBuf], strategy: SelectionStrategy) -> usize {
        if strategy == SelectionStrategy::TtdnMetric {
            let weights: Vec<f64> = candidates.iter().map(|p| self.weight(p)).collect();
            if let Ok(dist) = WeightedIndex::new(&weights) {
                return dist.sample(&mut self.rng);
            }
        }
        self.rng.gen_range(0..candidates.len())
    }

    fn record_pick(&mut self, path: &Path) {
        let family = match self.entries.get_mut(path) {
            Some(entry) => {
                entry.picks += 1;
                entry.family.clone()
            }
            None => return,
        };
        push_bounded(&mut self.recent, self.knobs.repeat_window, path.to_path_buf());
        *self.family_picks.entry(family.clone()).or_insert(0) += 1;
        push_bounded(&mut self.family_recent, self.knobs.family_repeat_window, family);
    }

    /// Pick the next seed, or `None` when nothing is eligible.
    ///
    /// Seeds that vanished from disk are dropped and the draw retried up to
    /// `pick_retry_limit` times.
    pub fn select(&mut self, strategy: SelectionStrategy) -> Option<Seed> {
        if self.order.is_empty() {
            return None;
        }
        if strategy == SelectionStrategy::TtdnMetric && !self.scores_initialized {
            self.initialize_scores();
        }

        let eligible = self.eligible();
        if eligible.is_empty() {
            return None;
        }
        let pool = self.choose_pool(eligible);
        let mut candidates = self.outside_windows(pool);

        for _ in 0..self.knobs.pick_retry_limit {
            if candidates.is_empty() {
                return None;
            }
            let idx = self.draw(&candidates, strategy);
            let path = candidates.swap_remove(idx);
            if path.exists() {
                self.record_pick(&path);
                let entry = &self.entries[&path];
                return Some(Seed {
                    family: entry.family.clone(),
                    promoted: entry.promoted,
                    path,
                });
            }
            warn!(seed = %path.display(), "selected seed vanished from disk; dropping");
            self.remove_seed(&path);
        }
        None
    }
}
