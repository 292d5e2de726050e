//! Seed corpus discovery, hygiene filtering, and lineage naming.

use std::path::{Path, PathBuf};
use tfuzz_common::{FuzzError, FuzzResult};

/// Filename marker separating a seed's stem from its family: `<stem>__fam__<family>`.
pub const FAMILY_MARKER: &str = "__fam__";

/// Bytes of a seed inspected by the internal-feature filter.
pub const HYGIENE_SCAN_BYTES: usize = 8000;

const INTERNAL_FEATURES: [&str; 5] = [
    "rustc_attrs",
    "lang_items",
    "intrinsics",
    "core_intrinsics",
    "rustc_private",
];

const INTERNAL_ATTR_MARKERS: [&str; 5] = [
    "#[rustc_",
    "#![rustc_",
    "#[lang =",
    "#![no_core]",
    "#![rustc_attrs]",
];

/// A seed handed out by the selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seed {
    /// Location on disk.
    pub path: PathBuf,
    /// Lineage the seed belongs to.
    pub family: String,
    /// Lives in a promoted pool directory.
    pub promoted: bool,
}

/// True if the head of `text` relies on compiler-internal features.
#[must_use]
pub fn is_internal_only(text: &str) -> bool {
    let mut end = text.len().min(HYGIENE_SCAN_BYTES);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    let head = &text[..end];

    if head.contains("#![feature(") && INTERNAL_FEATURES.iter().any(|f| head.contains(f)) {
        return true;
    }
    if INTERNAL_ATTR_MARKERS.iter().any(|m| head.contains(m)) {
        return true;
    }
    head.contains("extern \"rust-intrinsic\"")
}

/// [`is_internal_only`] over a file; unreadable files pass the filter.
#[must_use]
pub fn is_internal_only_file(path: &Path) -> bool {
    match std::fs::read(path) {
        Ok(bytes) => {
            let head = &bytes[..bytes.len().min(HYGIENE_SCAN_BYTES)];
            is_internal_only(&String::from_utf8_lossy(head))
        }
        Err(_) => false,
    }
}

/// Family encoded in the filename, else the seed's canonical path.
#[must_use]
pub fn infer_family(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    if let Some((_, family)) = stem.split_once(FAMILY_MARKER) {
        return family.to_string();
    }
    std::fs::canonicalize(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string()
}

/// Number `N` of a pool directory named `<prefix><N>`.
#[must_use]
pub fn pool_number(name: &str, prefix: &str) -> Option<u64> {
    let digits = name.strip_prefix(prefix)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// True if `path` lives under `<root>/<prefix><digits>/`.
#[must_use]
pub fn is_promoted(root: &Path, path: &Path, prefix: &str) -> bool {
    let canonical_root = std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
    let canonical_path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let Ok(rel) = canonical_path
        .strip_prefix(&canonical_root)
        .or_else(|_| path.strip_prefix(root))
    else {
        return false;
    };
    let mut parts = rel.components();
    let (Some(top), Some(_)) = (parts.next(), parts.next()) else {
        return false;
    };
    pool_number(&top.as_os_str().to_string_lossy(), prefix).is_some()
}

/// Result of scanning the seed root.
#[derive(Debug, Default)]
pub struct Discovery {
    /// Seeds assigned to this shard, in sorted order.
    pub seeds: Vec<PathBuf>,
    /// Zero-byte files skipped.
    pub empty: usize,
    /// Files dropped by the internal-feature filter.
    pub filtered: usize,
    /// Valid seeds across all shards.
    pub total_valid: usize,
}

fn collect_rs_files(dir: &Path, out: &mut Vec<PathBuf>) -> FuzzResult<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(FuzzError::io(dir, &e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| FuzzError::io(dir, &e))?;
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            collect_rs_files(&path, out)?;
        } else if path.extension().is_some_and(|ext| ext == "rs") {
            out.push(path);
        }
    }
    Ok(())
}

/// Recursively find `*.rs` seeds under `root` and keep those where `index % shards == shard`.
///
/// # Errors
///
/// Returns [`FuzzError::Io`] if a directory cannot be listed.
pub fn discover(root: &Path, shard: usize, shards: usize) -> FuzzResult<Discovery> {
    let shards = shards.max(1);
    let mut all = Vec::new();
    collect_rs_files(root, &mut all)?;
    all.sort();

    let mut discovery = Discovery::default();
    let mut valid = Vec::with_capacity(all.len());
    for path in all {
        match std::fs::metadata(&path) {
            Ok(meta) if !meta.is_file() => continue,
            Ok(meta) if meta.len() == 0 => {
                discovery.empty += 1;
                continue;
            }
            Ok(_) => {}
            Err(_) => continue,
        }
        if is_internal_only_file(&path) {
            discovery.filtered += 1;
        } else {
            valid.push(path);
        }
    }

    discovery.total_valid = valid.len();
    discovery.seeds = valid
        .into_iter()
        .enumerate()
        .filter(|(i, _)| i % shards == shard)
        .map(|(_, p)| p)
        .collect();

    if discovery.empty > 0 {
        tracing::warn!(count = discovery.empty, "ignored empty seed files");
    }
    if discovery.filtered > 0 {
        tracing::info!(
            count = discovery.filtered,
            "filtered seeds relying on compiler-internal features"
        );
    }
    Ok(discovery)
}
