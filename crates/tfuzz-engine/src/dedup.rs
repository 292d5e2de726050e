//! Crash-signature deduplication over a result category.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use tfuzz_common::{FuzzError, FuzzResult};
use tracing::{error, info, warn};

const STDERR_MARKER: &str = "Stderr:";

/// Case names grouped by signature.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupReport {
    /// Number of distinct signatures.
    pub total_unique: usize,
    /// Signature to case directory names.
    pub groups: BTreeMap<String, Vec<String>>,
}

/// Signature of a detail log: the first stderr block with all whitespace removed, hashed.
#[must_use]
pub fn signature(detail: &str) -> String {
    let block = detail.split(STDERR_MARKER).nth(1).unwrap_or(detail);
    let normalized: String = block.split_whitespace().collect();
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

/// Group the cases of `results/<category>` by signature.
///
/// A missing category directory yields an empty report.
///
/// # Errors
///
/// Returns [`FuzzError::Io`] if the category directory exists but cannot be listed.
pub fn deduplicate(results: &Path, category: &str) -> FuzzResult<DedupReport> {
    let dir = results.join(category);
    if !dir.is_dir() {
        warn!(path = %dir.display(), "category directory does not exist");
        return Ok(DedupReport::default());
    }

    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for entry in std::fs::read_dir(&dir).map_err(|e| FuzzError::io(&dir, &e))? {
        let entry = entry.map_err(|e| FuzzError::io(&dir, &e))?;
        let case = entry.path();
        let detail = case.join("detail.log");
        if !case.is_dir() || !detail.is_file() {
            continue;
        }
        match std::fs::read_to_string(&detail) {
            Ok(text) => groups
                .entry(signature(&text))
                .or_default()
                .push(entry.file_name().to_string_lossy().into_owned()),
            Err(e) => error!(case = %case.display(), error = %e, "failed to read detail log"),
        }
    }
    for cases in groups.values_mut() {
        cases.sort();
    }

    info!(category, unique = groups.len(), "deduplication complete");
    Ok(DedupReport {
        total_unique: groups.len(),
        groups,
    })
}

impl DedupReport {
    /// Write the report as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns [`FuzzError::Io`] if the file cannot be written.
    pub fn save(&self, path: &Path) -> FuzzResult<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| FuzzError::Config(format!("cannot serialize report: {e}")))?;
        std::fs::write(path, json).map_err(|e| FuzzError::io(path, &e))
    }
}
