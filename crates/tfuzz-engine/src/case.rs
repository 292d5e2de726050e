//! On-disk case records: `results/<category>/case_<variant>/{before.rs,after.rs,detail.log}`.

use crate::oracle::{CaseCategory, Classification};
use crate::round::Strategy;
use std::path::{Path, PathBuf};
use tfuzz_adapters::{Complexity, ToolchainLabel};
use tfuzz_common::{FuzzError, FuzzResult};

/// Prefix of every case directory name.
pub const CASE_DIR_PREFIX: &str = "case_";

/// Everything recorded about one persisted mutant.
#[derive(Debug)]
pub struct CaseRecord<'a> {
    /// Variant identifier, `w<worker>_iter_<n>_<pass>_var_<k>`.
    pub variant_id: &'a str,
    /// Seed the round input came from.
    pub seed: &'a Path,
    /// Ancestor family.
    pub family: &'a str,
    /// Strategy that produced the mutant.
    pub strategy: Strategy,
    /// Round input text.
    pub before: &'a str,
    /// Mutant text.
    pub after: &'a str,
    /// Oracle verdict.
    pub verdict: &'a Classification,
    /// Scorer metrics of the mutant.
    pub complexity: &'a Complexity,
}

fn return_code(code: Option<i32>) -> String {
    code.map_or_else(|| "None".to_string(), |c| c.to_string())
}

/// Render `detail.log`.
#[must_use]
pub fn render_detail(record: &CaseRecord<'_>) -> String {
    let verdict = record.verdict;
    let mut out = format!(
        "Seed: {}\nRoot: {}\nStrategy: {}\nStatus: {}\nVersion: {}\nStatus Breakdown: {}\n",
        record.seed.display(),
        record.family,
        record.strategy,
        verdict.overall,
        verdict.culprits(),
        verdict.breakdown(),
    );
    if verdict.miscompilation {
        if let (Some(nightly), Some(next)) = (
            verdict.status_of(ToolchainLabel::Nightly),
            verdict.status_of(ToolchainLabel::Next),
        ) {
            out.push_str(&format!(
                "Miscompilation: nightly vs next-solver mismatch\nNightly: {nightly}\nNext: {next}\n"
            ));
        }
    }
    out.push_str(&format!(
        "Constraint Sites: {}\nConstraint Choice Sum: {}\n",
        record.complexity.get("constraint_sites"),
        record.complexity.get("constraint_choice_sum"),
    ));

    for run in &verdict.runs {
        let result = &run.result;
        out.push_str(&format!(
            "\n=== {} ===\nCommand: {}\nStatus: {}\nDuration: {:.4}s\nReturn code: {}\nStdout:\n{}\nStderr:\n{}\n",
            run.toolchain.label.section_title(),
            run.rendered_command(),
            result.status,
            result.duration.as_secs_f64(),
            return_code(result.exit_code),
            result.stdout,
            result.stderr,
        ));
    }
    out
}

/// Writes case directories under the results root.
#[derive(Debug, Clone)]
pub struct CaseStore {
    results: PathBuf,
}

impl CaseStore {
    /// Store rooted at `results`.
    pub fn new(results: impl Into<PathBuf>) -> Self {
        Self {
            results: results.into(),
        }
    }

    /// Results root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.results
    }

    /// Directory of `variant_id` in `category`.
    #[must_use]
    pub fn case_dir(&self, category: CaseCategory, variant_id: &str) -> PathBuf {
        self.results
            .join(category.dir_name())
            .join(format!("{CASE_DIR_PREFIX}{variant_id}"))
    }

    /// Write `record` into every category of its verdict. Returns the directories written.
    ///
    /// # Errors
    ///
    /// Returns [`FuzzError::Io`] if a directory or file cannot be written.
    pub fn write(&self, record: &CaseRecord<'_>) -> FuzzResult<Vec<PathBuf>> {
        let detail = render_detail(record);
        let mut written = Vec::new();
        for category in record.verdict.categories() {
            let dir = self.case_dir(category, record.variant_id);
            std::fs::create_dir_all(&dir).map_err(|e| FuzzError::io(&dir, &e))?;
            for (name, content) in [
                ("before.rs", record.before),
                ("after.rs", record.after),
                ("detail.log", detail.as_str()),
            ] {
                let path = dir.join(name);
                std::fs::write(&path, content).map_err(|e| FuzzError::io(&path, &e))?;
            }
            tracing::debug!(case = %dir.display(), "case written");
            written.push(dir);
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::ToolchainRun;
    use std::time::Duration;
    use tfuzz_adapters::Toolchain;
    use tfuzz_common::{CompilationResult, CompilationStatus};

    fn run(label: ToolchainLabel, command: &[&str], extra: &[&str], result: CompilationResult) -> ToolchainRun {
        ToolchainRun {
            toolchain: Toolchain {
                label,
                command: command.iter().map(ToString::to_string).collect(),
                extra_args: extra.iter().map(ToString::to_string).collect(),
            },
            result,
        }
    }

    fn exited(status: CompilationStatus, code: i32, stderr: &str) -> CompilationResult {
        CompilationResult {
            status,
            exit_code: Some(code),
            stdout: String::new(),
            stderr: stderr.to_string(),
            duration: Duration::from_millis(1500),
        }
    }

    fn miscompiling_hang() -> Classification {
        Classification {
            overall: CompilationStatus::Hang,
            runs: vec![
                run(
                    ToolchainLabel::Stable,
                    &["rustc"],
                    &[],
                    CompilationResult::hang(Duration::from_secs(10)),
                ),
                run(
                    ToolchainLabel::Nightly,
                    &["rustc", "+nightly"],
                    &[],
                    exited(CompilationStatus::Success, 0, ""),
                ),
                run(
                    ToolchainLabel::Next,
                    &["rustc", "+nightly"],
                    &["-Znext-solver=coherence"],
                    exited(CompilationStatus::Error, 1, "error[E0119]"),
                ),
            ],
            category: Some(CaseCategory::Hang),
            miscompilation: true,
            halt: true,
        }
    }

    #[test]
    fn test_detail_log_layout() {
        let verdict = miscompiling_hang();
        let complexity: Complexity = [("constraint_sites", 3u64), ("constraint_choice_sum", 17)]
            .into_iter()
            .collect();
        let record = CaseRecord {
            variant_id: "w0_iter_1_original_var_2",
            seed: Path::new("seeds/a.rs"),
            family: "fam",
            strategy: Strategy::AddImpl,
            before: "",
            after: "",
            verdict: &verdict,
            complexity: &complexity,
        };
        let detail = render_detail(&record);
        let expected_head = "Seed: seeds/a.rs\n\
            Root: fam\n\
            Strategy: add_impl\n\
            Status: HANG\n\
            Version: stable\n\
            Status Breakdown: Stable:HANG, Nightly:SUCCESS, Next:ERROR\n\
            Miscompilation: nightly vs next-solver mismatch\n\
            Nightly: SUCCESS\n\
            Next: ERROR\n\
            Constraint Sites: 3\n\
            Constraint Choice Sum: 17\n\
            \n=== rustc (stable) ===\n\
            Command: rustc\n\
            Status: HANG\n\
            Duration: 10.0000s\n\
            Return code: None\n\
            Stdout:\n\n\
            Stderr:\nTimeoutExpired\n";
        assert!(detail.starts_with(expected_head), "{detail}");
        assert!(detail.contains("\n=== rustc (-Z next trait-solver) ===\nCommand: rustc +nightly -Znext-solver=coherence\n"));
        assert!(detail.contains("Duration: 1.5000s\nReturn code: 1\n"));
    }

    #[test]
    fn test_detail_log_without_disagreement() {
        let verdict = Classification {
            overall: CompilationStatus::Error,
            runs: vec![run(
                ToolchainLabel::Stable,
                &["rustc"],
                &[],
                exited(CompilationStatus::Error, 1, "error[E0277]"),
            )],
            category: Some(CaseCategory::Error),
            miscompilation: false,
            halt: false,
        };
        let complexity = Complexity::default();
        let record = CaseRecord {
            variant_id: "w0_iter_1_original_var_1",
            seed: Path::new("seeds/b.rs"),
            family: "b",
            strategy: Strategy::AddImpl,
            before: "",
            after: "",
            verdict: &verdict,
            complexity: &complexity,
        };
        let detail = render_detail(&record);
        assert!(!detail.contains("Miscompilation"));
        assert!(detail.contains("Status Breakdown: Stable:ERROR\nConstraint Sites: 0\nConstraint Choice Sum: 0\n"));
        assert!(detail.ends_with("Return code: 1\nStdout:\n\nStderr:\nerror[E0277]\n"));
    }

    #[test]
    fn test_write_to_every_category() {
        let dir = tempfile::tempdir().unwrap();
        let store = CaseStore::new(dir.path());
        let verdict = miscompiling_hang();
        let complexity = Complexity::default();
        let record = CaseRecord {
            variant_id: "w1_iter_3_rewritten_var_1",
            seed: Path::new("a.rs"),
            family: "a",
            strategy: Strategy::ConstraintInjection,
            before: "fn a() {}",
            after: "fn a() where (): Sized {}",
            verdict: &verdict,
            complexity: &complexity,
        };
        let written = store.write(&record).unwrap();
        assert_eq!(
            written,
            vec![
                dir.path().join("hang/case_w1_iter_3_rewritten_var_1"),
                dir.path().join("miscompilation/case_w1_iter_3_rewritten_var_1"),
            ]
        );
        for case in &written {
            assert_eq!(std::fs::read_to_string(case.join("before.rs")).unwrap(), "fn a() {}");
            assert!(std::fs::read_to_string(case.join("detail.log"))
                .unwrap()
                .contains("Strategy: constraint_injection"));
        }
    }
}
