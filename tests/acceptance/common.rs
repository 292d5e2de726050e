//! Shared fixture for campaign acceptance tests.

#![allow(dead_code)] // Not every test file uses every helper

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tfuzz_adapters::{
    Complexity, SimulatedCompiler, SimulatedMutationTool, SimulatedScorer,
};
use tfuzz_common::{CompilationStatus, FuzzConfig};
use tfuzz_engine::{Campaign, CampaignBuilder};

/// Seed text used by most tests. Contains no `// ` so mutants are recognisable.
pub const SEED: &str = "trait Tr { type A; }\nimpl Tr for () { type A = u8; }\n";

/// Temporary campaign root with `seeds/`, `results/`, `work/` and `rewrites/`.
pub struct Fixture {
    pub dir: TempDir,
    pub config: FuzzConfig,
}

impl Fixture {
    /// One iteration, one round, one structural mutation, reproducible RNG.
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        std::fs::create_dir_all(root.join("seeds")).expect("seeds dir");

        let mut config = FuzzConfig::default();
        config.paths.seeds = root.join("seeds");
        config.paths.results = root.join("results");
        config.paths.logs = root.join("logs");
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
        config.fuzzer.rng_seed = Some(11);
        Self { dir, config }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn results(&self) -> PathBuf {
        self.config.paths.results.clone()
    }

    /// Write a seed under `seeds/`.
    pub fn seed(&self, name: &str, content: &str) -> PathBuf {
        let path = self.config.paths.seeds.join(name);
        std::fs::write(&path, content).expect("write seed");
        path
    }

    /// Builder with simulated collaborators; `compiler` decides every verdict.
    pub fn builder(&self, compiler: SimulatedCompiler) -> CampaignBuilder {
        CampaignBuilder::new(self.config.clone())
            .compiler(Arc::new(compiler))
            .mutator(Arc::new(SimulatedMutationTool::appending()))
            .scorer(Arc::new(SimulatedScorer::fixed(Complexity::default())))
    }

    pub fn campaign(&self, compiler: SimulatedCompiler) -> Campaign {
        self.builder(compiler).build().expect("campaign")
    }

    /// Case directory names in `results/<category>`, sorted.
    pub fn cases(&self, category: &str) -> Vec<String> {
        let Ok(read) = std::fs::read_dir(self.results().join(category)) else {
            return Vec::new();
        };
        let mut names: Vec<String> = read
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    pub fn detail(&self, category: &str, case: &str) -> String {
        std::fs::read_to_string(self.results().join(category).join(case).join("detail.log"))
            .expect("detail.log")
    }
}

/// Compiler that returns `status` for mutants and SUCCESS for unmutated seeds.
pub fn on_mutants(status: CompilationStatus) -> SimulatedCompiler {
    SimulatedCompiler::new(move |content, _| {
        if content.contains("// ") {
            status
        } else {
            CompilationStatus::Success
        }
    })
}
