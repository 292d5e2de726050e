//! Retention limits applied during a campaign.

use super::common::{on_mutants, Fixture, SEED};
use tfuzz_common::CompilationStatus;
use tfuzz_engine::CampaignExit;

#[test]
fn test_error_cases_stay_within_keep_limit() {
    let mut fx = Fixture::new();
    fx.config.fuzzer.structural_per_round = 10;
    fx.config.retention.keep_error_cases = 4;
    fx.seed("a.rs", SEED);

    let mut campaign = fx.campaign(on_mutants(CompilationStatus::Error));
    campaign.run().unwrap();

    // Over the limit, the category is cut to floor(4 * 0.9) = 3 before the next write.
    assert_eq!(fx.cases("error").len(), 4);
    assert_eq!(campaign.metrics().judged(CompilationStatus::Error), 10);
}

#[test]
fn test_zero_keep_limit_empties_category() {
    let mut fx = Fixture::new();
    fx.config.fuzzer.structural_per_round = 3;
    fx.config.retention.keep_error_cases = 0;
    fx.seed("a.rs", SEED);

    let mut campaign = fx.campaign(on_mutants(CompilationStatus::Error));
    campaign.run().unwrap();
    assert!(fx.cases("error").is_empty());
}

#[test]
fn test_findings_are_never_pruned() {
    let mut fx = Fixture::new();
    fx.config.fuzzer.iterations = 3;
    fx.config.retention.max_cases = Some(0);
    fx.config.retention.keep_error_cases = 0;
    for name in ["a__fam__a.rs", "b__fam__b.rs", "c__fam__c.rs"] {
        fx.seed(name, SEED);
    }

    let mut campaign = fx.campaign(on_mutants(CompilationStatus::Crash));
    campaign.run().unwrap();
    assert_eq!(fx.cases("crash").len(), 3);
}

#[test]
fn test_free_space_floor_stops_worker() {
    let mut fx = Fixture::new();
    fx.config.retention.min_free_gb = Some(1.0e12);
    fx.seed("a.rs", SEED);

    let mut campaign = fx.campaign(on_mutants(CompilationStatus::Error));
    assert_eq!(campaign.run().unwrap(), CampaignExit::DiskBudget);
    assert!(fx.cases("error").is_empty());
}

#[test]
fn test_rewrites_are_pruned() {
    let mut fx = Fixture::new();
    fx.config.fuzzer.iterations = 3;
    fx.config.retention.keep_rewritten_cases = 1;
    for name in ["a.rs", "b.rs", "c.rs"] {
        fx.seed(name, SEED);
    }

    let rewriter = tfuzz_adapters::SimulatedRewriter::new(|src| Ok(format!("mod rewritten {{}}\n{src}")));
    let mut campaign = fx
        .builder(on_mutants(CompilationStatus::Error))
        .rewriter(std::sync::Arc::new(rewriter))
        .build()
        .unwrap();
    campaign.run().unwrap();

    // Three rewrites saved; the last check cut them to floor(1 * 0.9) = 0 once over the limit.
    let saved = std::fs::read_dir(fx.root().join("rewrites")).unwrap().count();
    assert!(saved <= 1, "{saved} rewrites kept");
}
