//! Findings halt a seed's lineage and ban its family.

use super::common::{on_mutants, Fixture, SEED};
use std::sync::Arc;
use tfuzz_adapters::{SimulatedCompiler, SimulatedMutationTool};
use tfuzz_common::CompilationStatus;
use tfuzz_engine::CampaignExit;

#[test]
fn test_crash_is_persisted_and_halts_the_seed() {
    let mut fx = Fixture::new();
    fx.config.fuzzer.iterations = 2;
    fx.config.fuzzer.rounds_per_seed = 2;
    fx.config.fuzzer.structural_per_round = 3;
    fx.seed("a__fam__alpha.rs", SEED);
    fx.seed("b__fam__beta.rs", SEED);

    let tool = Arc::new(SimulatedMutationTool::appending());
    let mut campaign = fx
        .builder(on_mutants(CompilationStatus::Crash))
        .mutator(tool.clone())
        .build()
        .unwrap();
    assert_eq!(campaign.run().unwrap(), CampaignExit::Completed);

    // One mutant per seed: the crash stops the remaining strategies and rounds.
    assert_eq!(tool.call_count(), 2);
    let crashes = fx.cases("crash");
    assert_eq!(crashes.len(), 2);
    assert!(crashes.iter().all(|c| c.starts_with("case_w0_iter_")));
    assert!(campaign.selector().is_banned("alpha"));
    assert!(campaign.selector().is_banned("beta"));

    let detail = fx.detail("crash", &crashes[0]);
    assert!(detail.contains("Status: CRASH\n"));
    assert!(detail.contains("Status Breakdown: Stable:CRASH\n"));
    assert!(detail.contains("internal compiler error"));
    assert_eq!(campaign.metrics().judged(CompilationStatus::Crash), 2);
}

#[test]
fn test_always_hanging_baseline_is_fate() {
    let mut fx = Fixture::new();
    fx.config.fuzzer.iterations = 5;
    fx.config.selection.max_picks_per_seed = -1;
    fx.seed("x__fam__core.rs", SEED);
    fx.seed("y__fam__core.rs", SEED);

    let tool = Arc::new(SimulatedMutationTool::appending());
    let mut campaign = fx
        .builder(SimulatedCompiler::always(CompilationStatus::Hang))
        .mutator(tool.clone())
        .build()
        .unwrap();

    // The banned family leaves nothing to select after the first finding.
    assert_eq!(campaign.run().unwrap(), CampaignExit::SeedsExhausted);
    assert_eq!(tool.call_count(), 1);
    assert!(campaign.selector().is_banned("core"));
    assert_eq!(fx.cases("fate").len(), 1);
    assert!(fx.cases("hang").is_empty());
    assert_eq!(campaign.metrics().snapshot().fate_cases, 1);

    let detail = fx.detail("fate", &fx.cases("fate")[0]);
    assert!(detail.contains("Status: HANG\n"));
    assert!(detail.contains("Return code: None\n"));
    assert!(detail.contains("Root: core\n"));
}

#[test]
fn test_errors_do_not_halt() {
    let mut fx = Fixture::new();
    fx.config.fuzzer.rounds_per_seed = 2;
    fx.config.fuzzer.structural_per_round = 2;
    fx.seed("a__fam__alpha.rs", SEED);

    let tool = Arc::new(SimulatedMutationTool::appending());
    let mut campaign = fx
        .builder(on_mutants(CompilationStatus::Error))
        .mutator(tool.clone())
        .build()
        .unwrap();
    campaign.run().unwrap();

    assert_eq!(tool.call_count(), 4);
    assert_eq!(fx.cases("error").len(), 4);
    assert!(!campaign.selector().is_banned("alpha"));
    // Structural mutants carry over: the second round starts from a mutant.
    assert!(tool.calls()[2].input.contains("// "));
}

#[test]
fn test_accepted_mutants_not_kept_when_disabled() {
    let mut fx = Fixture::new();
    fx.config.retention.keep_success_cases = 0;
    fx.seed("a.rs", SEED);

    let mut campaign = fx.campaign(SimulatedCompiler::always(CompilationStatus::Success));
    campaign.run().unwrap();
    assert!(fx.cases("success").is_empty());
    assert_eq!(campaign.metrics().judged(CompilationStatus::Success), 1);
}
