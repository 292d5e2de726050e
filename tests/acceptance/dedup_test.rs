//! Crash deduplication over a finished campaign.

use super::common::{on_mutants, Fixture, SEED};
use tfuzz_common::CompilationStatus;
use tfuzz_engine::{deduplicate, DedupReport};

#[test]
fn test_identical_crashes_share_a_signature() {
    let mut fx = Fixture::new();
    fx.config.fuzzer.iterations = 3;
    for name in ["a__fam__a.rs", "b__fam__b.rs", "c__fam__c.rs"] {
        fx.seed(name, SEED);
    }
    let mut campaign = fx.campaign(on_mutants(CompilationStatus::Crash));
    campaign.run().unwrap();

    let report = deduplicate(&fx.results(), "crash").unwrap();
    assert_eq!(report.total_unique, 1);
    let group = report.groups.values().next().unwrap();
    assert_eq!(group, &fx.cases("crash"));

    let out = fx.root().join("deduplication_report.json");
    report.save(&out).unwrap();
    let parsed: DedupReport = serde_json::from_str(&std::fs::read_to_string(out).unwrap()).unwrap();
    assert_eq!(parsed, report);
}
