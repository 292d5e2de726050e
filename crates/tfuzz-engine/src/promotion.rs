//! Promotion of accepted constraint-injection mutants into rolling seed pools.

use crate::round::Strategy;
use crate::seed::pool_number;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tfuzz_common::{CompilationStatus, FuzzError, FuzzResult};
use tracing::info;

/// Create and return `<root>/<prefix><max N + 1>`.
///
/// # Errors
///
/// Returns [`FuzzError::Io`] if the seed root cannot be listed or the pool
/// directory cannot be created.
pub fn next_pool_dir(root: &Path, prefix: &str) -> FuzzResult<PathBuf> {
    std::fs::create_dir_all(root).map_err(|e| FuzzError::io(root, &e))?;
    let read = std::fs::read_dir(root).map_err(|e| FuzzError::io(root, &e))?;
    let max_n = read
        .flatten()
        .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
        .filter_map(|e| pool_number(&e.file_name().to_string_lossy(), prefix))
        .max()
        .unwrap_or(0);
    let dir = root.join(format!("{prefix}{}", max_n + 1));
    std::fs::create_dir_all(&dir).map_err(|e| FuzzError::io(&dir, &e))?;
    Ok(dir)
}

fn count_seed_files(dir: &Path) -> usize {
    std::fs::read_dir(dir).map_or(0, |read| {
        read.flatten()
            .filter(|e| e.file_type().is_ok_and(|t| t.is_file()))
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
            .count()
    })
}

/// True for mutants that may be promoted.
#[must_use]
pub fn is_promotable(strategy: Strategy, status: CompilationStatus) -> bool {
    strategy == Strategy::ConstraintInjection && status == CompilationStatus::Success
}

/// Tracks the current pool directory and how many children each parent produced.
#[derive(Debug)]
pub struct PromotionManager {
    root: PathBuf,
    prefix: String,
    pool_capacity: usize,
    per_parent_cap: usize,
    enabled: bool,
    current: Option<PathBuf>,
    ledger: HashMap<PathBuf, usize>,
}

impl PromotionManager {
    /// Manager for pools under `root` named `<prefix><N>`.
    ///
    /// A `pool_capacity` of zero never rolls; a `per_parent_cap` of zero disables promotion.
    pub fn new(
        root: impl Into<PathBuf>,
        prefix: impl Into<String>,
        pool_capacity: usize,
        per_parent_cap: usize,
        enabled: bool,
    ) -> Self {
        Self {
            root: root.into(),
            prefix: prefix.into(),
            pool_capacity,
            per_parent_cap,
            enabled: enabled && per_parent_cap > 0,
            current: None,
            ledger: HashMap::new(),
        }
    }

    /// Whether promotion can happen at all.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Current pool directory, if one was opened.
    #[must_use]
    pub fn current_pool(&self) -> Option<&Path> {
        self.current.as_deref()
    }

    /// Children promoted from `parent` so far.
    #[must_use]
    pub fn promoted_from(&self, parent: &Path) -> usize {
        self.ledger.get(parent).copied().unwrap_or(0)
    }

    /// Open a fresh pool directory for this worker.
    ///
    /// # Errors
    ///
    /// See [`next_pool_dir`].
    pub fn open_pool(&mut self) -> FuzzResult<&Path> {
        let dir = next_pool_dir(&self.root, &self.prefix)?;
        info!(pool = %dir.display(), "promotion pool opened");
        Ok(self.current.insert(dir).as_path())
    }

    fn pool_for_write(&mut self) -> FuzzResult<PathBuf> {
        let current = match self.current.clone() {
            Some(dir) => dir,
            None => self.open_pool()?.to_path_buf(),
        };
        if self.pool_capacity == 0 {
            return Ok(current);
        }
        let held = count_seed_files(&current);
        if held < self.pool_capacity {
            return Ok(current);
        }
        let next = next_pool_dir(&self.root, &self.prefix)?;
        info!(
            held,
            capacity = self.pool_capacity,
            pool = %next.display(),
            "promotion pool full; rolling"
        );
        self.current = Some(next.clone());
        Ok(next)
    }

    /// Write `content` as a new seed derived from `parent`.
    ///
    /// Returns `Ok(None)` when promotion is disabled or `parent` reached its cap.
    ///
    /// # Errors
    ///
    /// Returns [`FuzzError::Io`] if the pool directory or seed file cannot be written.
    pub fn promote(
        &mut self,
        parent: &Path,
        variant_id: &str,
        content: &str,
    ) -> FuzzResult<Option<PathBuf>> {
        if !self.enabled {
            return Ok(None);
        }
        let so_far = self.promoted_from(parent);
        if so_far >= self.per_parent_cap {
            tracing::debug!(
                parent = %parent.display(),
                cap = self.per_parent_cap,
                "promotion cap reached"
            );
            return Ok(None);
        }

        let pool = self.pool_for_write()?;
        let mut target = pool.join(format!("seed_{variant_id}.rs"));
        if target.exists() {
            let secs = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_secs());
            target = pool.join(format!("seed_{variant_id}_{secs}.rs"));
        }
        std::fs::write(&target, content).map_err(|e| FuzzError::io(&target, &e))?;
        self.ledger.insert(parent.to_path_buf(), so_far + 1);
        Ok(Some(target))
    }
}
