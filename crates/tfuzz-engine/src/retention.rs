//! Results-directory budget enforcement.
//!
//! Only `success`, `error` and `fate` case directories and rewrite files are
//! ever pruned. Crash, hang and miscompilation findings are kept no matter
//! what; the free-space guard stops the worker instead.

use crate::case::CASE_DIR_PREFIX;
use crate::oracle::CaseCategory;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tfuzz_common::{keep_limit, RetentionConfig};
use tracing::{info, warn};

/// Fraction of a limit that pruning brings usage down to.
pub const WATERMARK: f64 = 0.90;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Limits applied by [`enforce_limits`]. `None` means unlimited.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetentionPolicy {
    /// Combined success+error case cap.
    pub max_cases: Option<usize>,
    /// Combined success+error size cap in bytes.
    pub max_results_bytes: Option<u64>,
    /// Minimum free space on the results filesystem in bytes.
    pub min_free_bytes: Option<u64>,
    /// Success cases to keep.
    pub keep_success: Option<usize>,
    /// Error cases to keep.
    pub keep_error: Option<usize>,
    /// Fate cases to keep.
    pub keep_fate: Option<usize>,
    /// Rewrite files to keep.
    pub keep_rewritten: Option<usize>,
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn gb_to_bytes(gb: f64) -> u64 {
    (gb.max(0.0) * BYTES_PER_GB) as u64
}

impl From<&RetentionConfig> for RetentionPolicy {
    fn from(config: &RetentionConfig) -> Self {
        Self {
            max_cases: config.max_cases,
            max_results_bytes: config.max_results_gb.map(gb_to_bytes),
            min_free_bytes: config.min_free_gb.map(gb_to_bytes),
            keep_success: keep_limit(config.keep_success_cases),
            keep_error: keep_limit(config.keep_error_cases),
            keep_fate: keep_limit(config.keep_fate_cases),
            keep_rewritten: keep_limit(config.keep_rewritten_cases),
        }
    }
}

/// `min(limit, floor(limit * WATERMARK))`.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
pub fn watermark_target(limit: u64) -> u64 {
    ((limit as f64 * WATERMARK).floor() as u64).min(limit)
}

#[derive(Debug, Clone)]
struct Entry {
    path: PathBuf,
    modified: SystemTime,
}

fn oldest_first(mut entries: Vec<Entry>) -> Vec<Entry> {
    entries.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));
    entries
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// `case_*` directories under `dir`, oldest first. A missing directory is empty.
fn case_dirs(dir: &Path) -> Vec<Entry> {
    let Ok(read) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let entries = read
        .flatten()
        .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
        .filter(|e| e.file_name().to_string_lossy().starts_with(CASE_DIR_PREFIX))
        .filter_map(|e| {
            let path = e.path();
            modified(&path).map(|modified| Entry { path, modified })
        })
        .collect();
    oldest_first(entries)
}

/// `*.rs` files directly under `dir`, oldest first.
fn rewrite_files(dir: &Path) -> Vec<Entry> {
    let Ok(read) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let entries = read
        .flatten()
        .filter(|e| e.file_type().is_ok_and(|t| t.is_file()))
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "rs"))
        .filter_map(|path| modified(&path).map(|modified| Entry { path, modified }))
        .collect();
    oldest_first(entries)
}

/// Total size of regular files under `path`.
#[must_use]
pub fn tree_size(path: &Path) -> u64 {
    let Ok(meta) = std::fs::symlink_metadata(path) else {
        return 0;
    };
    if !meta.is_dir() {
        return meta.len();
    }
    std::fs::read_dir(path)
        .map(|read| read.flatten().map(|e| tree_size(&e.path())).sum())
        .unwrap_or(0)
}

/// Delete a file or directory tree. Already-gone counts as success.
fn remove(path: &Path) -> bool {
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    match result {
        Ok(()) => true,
        Err(e) if e.kind() == ErrorKind::NotFound => true,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to prune");
            false
        }
    }
}

/// Delete oldest entries until at most `target` remain. Returns how many were deleted.
fn prune_to(entries: &[Entry], target: usize, label: &str) -> usize {
    let excess = entries.len().saturating_sub(target);
    let mut removed = 0;
    for entry in &entries[..excess] {
        if !remove(&entry.path) {
            break;
        }
        if removed == 0 {
            info!(label, path = %entry.path.display(), "pruned old entry");
        }
        removed += 1;
    }
    removed
}

fn prune_category(entries: &[Entry], keep: Option<usize>, label: &str) {
    let Some(keep) = keep else { return };
    if entries.len() > keep {
        let target = usize::try_from(watermark_target(keep as u64)).unwrap_or(keep);
        let removed = prune_to(entries, target, label);
        info!(label, removed, kept = entries.len() - removed, "category over its keep limit");
    }
}

/// Free bytes available to unprivileged users on the filesystem holding `path`.
#[cfg(unix)]
#[must_use]
pub fn free_space(path: &Path) -> Option<u64> {
    let stat = nix::sys::statvfs::statvfs(path).ok()?;
    #[allow(clippy::useless_conversion, clippy::unnecessary_cast)]
    let free = u64::from(stat.blocks_available()) * stat.fragment_size() as u64;
    Some(free)
}

/// Free bytes available on the filesystem holding `path`.
#[cfg(not(unix))]
#[must_use]
pub fn free_space(_path: &Path) -> Option<u64> {
    None
}

/// Prune prunable categories down to their limits.
///
/// Returns `false` when free space is still below the configured minimum,
/// meaning the worker should stop.
pub fn enforce_limits(results: &Path, rewrites: &Path, policy: &RetentionPolicy) -> bool {
    if let Err(e) = std::fs::create_dir_all(results) {
        warn!(path = %results.display(), error = %e, "cannot create results directory");
    }
    let dir = |c: CaseCategory| results.join(c.dir_name());

    prune_category(&case_dirs(&dir(CaseCategory::Success)), policy.keep_success, "success");
    prune_category(&case_dirs(&dir(CaseCategory::Error)), policy.keep_error, "error");
    prune_category(&case_dirs(&dir(CaseCategory::Fate)), policy.keep_fate, "fate");
    prune_category(&rewrite_files(rewrites), policy.keep_rewritten, "rewrite");

    let prunable = || {
        let mut all = case_dirs(&dir(CaseCategory::Success));
        all.extend(case_dirs(&dir(CaseCategory::Error)));
        oldest_first(all)
    };

    if let Some(max_cases) = policy.max_cases {
        let entries = prunable();
        if entries.len() > max_cases {
            let target = usize::try_from(watermark_target(max_cases as u64)).unwrap_or(max_cases);
            let removed = prune_to(&entries, target, "max-cases");
            info!(removed, max_cases, "case cap reached");
        }
    }

    if let Some(cap) = policy.max_results_bytes {
        let sized: Vec<(Entry, u64)> = prunable()
            .into_iter()
            .map(|e| {
                let size = tree_size(&e.path);
                (e, size)
            })
            .collect();
        let mut total: u64 = sized.iter().map(|(_, s)| s).sum();
        if total > cap {
            let target = watermark_target(cap);
            let mut removed = 0usize;
            for (entry, size) in &sized {
                if total <= target || !remove(&entry.path) {
                    break;
                }
                total = total.saturating_sub(*size);
                removed += 1;
            }
            info!(removed, remaining_bytes = total, cap_bytes = cap, "size cap reached");
        }
    }

    if let Some(min_free) = policy.min_free_bytes {
        if let Some(free) = free_space(results) {
            if free < min_free {
                warn!(
                    free_bytes = free,
                    min_free_bytes = min_free,
                    "free disk space below minimum; stopping"
                );
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn make_case(dir: &Path, name: &str, age_secs: u64, bytes: usize) -> PathBuf {
        let case = dir.join(name);
        std::fs::create_dir_all(&case).unwrap();
        std::fs::write(case.join("after.rs"), vec![b'x'; bytes]).unwrap();
        let when = SystemTime::now() - Duration::from_secs(age_secs);
        std::fs::File::open(&case).unwrap().set_modified(when).unwrap();
        case
    }

    fn populate(dir: &Path, count: u64, bytes: usize) -> Vec<PathBuf> {
        // Index 0 is the newest.
        (0..count)
            .map(|i| make_case(dir, &format!("case_{i:03}"), 100 + i * 10, bytes))
            .collect()
    }

    fn policy() -> RetentionPolicy {
        RetentionPolicy::default()
    }

    #[test]
    fn test_watermark_target() {
        assert_eq!(watermark_target(10), 9);
        assert_eq!(watermark_target(2000), 1800);
        assert_eq!(watermark_target(1), 0);
        assert_eq!(watermark_target(0), 0);
    }

    #[test]
    fn test_policy_from_config() {
        let config = RetentionConfig {
            max_results_gb: Some(1.0),
            keep_rewritten_cases: -1,
            ..RetentionConfig::default()
        };
        let policy = RetentionPolicy::from(&config);
        assert_eq!(policy.max_results_bytes, Some(1 << 30));
        assert_eq!(policy.keep_success, Some(2000));
        assert_eq!(policy.keep_rewritten, None);
    }

    #[test]
    fn test_keeps_newest_below_watermark() {
        let dir = tempfile::tempdir().unwrap();
        let success = dir.path().join("success");
        let cases = populate(&success, 12, 1);
        std::fs::create_dir_all(success.join("not_a_case")).unwrap();

        let policy = RetentionPolicy {
            keep_success: Some(10),
            ..policy()
        };
        assert!(enforce_limits(dir.path(), &dir.path().join("rw"), &policy));

        let survivors: Vec<bool> = cases.iter().map(|c| c.exists()).collect();
        assert_eq!(survivors.iter().filter(|s| **s).count(), 9);
        assert!(survivors[..9].iter().all(|s| *s));
        assert!(success.join("not_a_case").exists());
    }

    #[test]
    fn test_under_limit_is_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let cases = populate(&dir.path().join("error"), 5, 1);
        let policy = RetentionPolicy {
            keep_error: Some(5),
            ..policy()
        };
        assert!(enforce_limits(dir.path(), &dir.path().join("rw"), &policy));
        assert!(cases.iter().all(|c| c.exists()));
    }

    #[test]
    fn test_findings_are_never_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let crashes = populate(&dir.path().join("crash"), 5, 1);
        let hangs = populate(&dir.path().join("hang"), 5, 1);
        let policy = RetentionPolicy {
            max_cases: Some(0),
            max_results_bytes: Some(0),
            keep_success: Some(0),
            keep_error: Some(0),
            keep_fate: Some(0),
            ..policy()
        };
        assert!(enforce_limits(dir.path(), &dir.path().join("rw"), &policy));
        assert!(crashes.iter().chain(&hangs).all(|c| c.exists()));
    }

    #[test]
    fn test_global_case_cap_spans_success_and_error() {
        let dir = tempfile::tempdir().unwrap();
        let success = populate(&dir.path().join("success"), 6, 1);
        let error = populate(&dir.path().join("error"), 6, 1);
        let policy = RetentionPolicy {
            max_cases: Some(10),
            ..policy()
        };
        assert!(enforce_limits(dir.path(), &dir.path().join("rw"), &policy));
        let alive = success.iter().chain(&error).filter(|c| c.exists()).count();
        assert_eq!(alive, 9);
        // Oldest of each category went first.
        assert!(!success[5].exists());
        assert!(!error[5].exists());
        assert!(success[0].exists() && error[0].exists());
    }

    #[test]
    fn test_byte_cap() {
        let dir = tempfile::tempdir().unwrap();
        let cases = populate(&dir.path().join("success"), 10, 100);
        let policy = RetentionPolicy {
            max_results_bytes: Some(500),
            ..policy()
        };
        assert!(enforce_limits(dir.path(), &dir.path().join("rw"), &policy));
        // 1000 bytes pruned until <= 450.
        assert_eq!(cases.iter().filter(|c| c.exists()).count(), 4);
        assert!(tree_size(&dir.path().join("success")) <= 450);
    }

    #[test]
    fn test_rewrite_files_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let rewrites = dir.path().join("LLM/rewrites");
        std::fs::create_dir_all(&rewrites).unwrap();
        for i in 0..5u64 {
            let path = rewrites.join(format!("llm_rewrite_0_{i}_seed.rs"));
            std::fs::write(&path, "fn main() {}").unwrap();
            let when = SystemTime::now() - Duration::from_secs(100 - i);
            std::fs::File::options()
                .write(true)
                .open(&path)
                .unwrap()
                .set_modified(when)
                .unwrap();
        }
        std::fs::write(rewrites.join("notes.txt"), "kept").unwrap();

        let policy = RetentionPolicy {
            keep_rewritten: Some(3),
            ..policy()
        };
        assert!(enforce_limits(dir.path().join("results").as_path(), &rewrites, &policy));
        assert!(!rewrites.join("llm_rewrite_0_0_seed.rs").exists());
        assert!(!rewrites.join("llm_rewrite_0_2_seed.rs").exists());
        assert!(rewrites.join("llm_rewrite_0_3_seed.rs").exists());
        assert!(rewrites.join("notes.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_free_space_guard() {
        let dir = tempfile::tempdir().unwrap();
        let policy = RetentionPolicy {
            min_free_bytes: Some(u64::MAX),
            ..policy()
        };
        assert!(!enforce_limits(dir.path(), &dir.path().join("rw"), &policy));

        let relaxed = RetentionPolicy {
            min_free_bytes: Some(0),
            ..self::policy()
        };
        assert!(enforce_limits(dir.path(), &dir.path().join("rw"), &relaxed));
    }

    #[test]
    fn test_missing_directories_are_fine() {
        let dir = tempfile::tempdir().unwrap();
        let results = dir.path().join("does/not/exist");
        let policy = RetentionPolicy {
            max_cases: Some(1),
            keep_success: Some(1),
            ..policy()
        };
        assert!(enforce_limits(&results, &dir.path().join("rw"), &policy));
        assert!(results.exists());
    }
}
