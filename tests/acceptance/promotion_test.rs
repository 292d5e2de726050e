//! Promotion of accepted constraint injections.

use super::common::{Fixture, SEED};
use tfuzz_adapters::SimulatedCompiler;
use tfuzz_common::CompilationStatus;

fn injecting(fx: &mut Fixture, per_round: usize) {
    fx.config.fuzzer.injection_per_round = per_round;
    fx.config.fuzzer.structural_per_round = 0;
    fx.config.retention.promote_success = true;
}

#[test]
fn test_promotions_capped_per_parent() {
    let mut fx = Fixture::new();
    injecting(&mut fx, 3);
    fx.config.fuzzer.max_promotions_per_seed = 2;
    fx.seed("p__fam__parent.rs", SEED);

    let mut campaign = fx.campaign(SimulatedCompiler::always(CompilationStatus::Success));
    campaign.run().unwrap();

    let pool = fx.root().join("seeds/new1");
    let mut promoted: Vec<_> = std::fs::read_dir(&pool)
        .unwrap()
        .flatten()
        .map(|e| e.path())
        .collect();
    promoted.sort();
    assert_eq!(promoted.len(), 2);
    assert!(promoted[0]
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("seed_w0_iter_1_original_var_"));

    assert_eq!(campaign.selector().promoted_len(), 2);
    for path in &promoted {
        assert!(campaign.selector().contains(path));
        assert_eq!(campaign.selector().family_of(path), "parent");
    }
    assert_eq!(campaign.metrics().snapshot().promotions, 2);
    assert_eq!(fx.cases("success").len(), 3);
}

#[test]
fn test_pool_rolls_over() {
    let mut fx = Fixture::new();
    injecting(&mut fx, 3);
    fx.config.fuzzer.max_promotions_per_seed = 5;
    fx.config.retention.new_seeds_max = 1;
    fx.seed("p.rs", SEED);

    let mut campaign = fx.campaign(SimulatedCompiler::always(CompilationStatus::Success));
    campaign.run().unwrap();

    for pool in ["new1", "new2", "new3"] {
        let held = std::fs::read_dir(fx.root().join("seeds").join(pool)).unwrap().count();
        assert_eq!(held, 1, "{pool}");
    }
    assert_eq!(campaign.promotions().current_pool(), Some(fx.root().join("seeds/new3").as_path()));
}

#[test]
fn test_rejected_or_disabled_injection_is_not_promoted() {
    let mut fx = Fixture::new();
    injecting(&mut fx, 2);
    fx.seed("p.rs", SEED);
    let mut campaign = fx.campaign(SimulatedCompiler::new(|content, _| {
        if content.contains("// ") {
            CompilationStatus::Error
        } else {
            CompilationStatus::Success
        }
    }));
    campaign.run().unwrap();
    assert_eq!(campaign.metrics().snapshot().promotions, 0);

    let mut fx = Fixture::new();
    injecting(&mut fx, 2);
    fx.config.retention.promote_success = false;
    fx.seed("p.rs", SEED);
    let mut campaign = fx.campaign(SimulatedCompiler::always(CompilationStatus::Success));
    campaign.run().unwrap();
    assert!(!fx.root().join("seeds/new1").exists());
    assert_eq!(campaign.selector().promoted_len(), 0);
}

#[test]
fn test_existing_pools_are_not_reused() {
    let mut fx = Fixture::new();
    injecting(&mut fx, 1);
    std::fs::create_dir_all(fx.root().join("seeds/new4")).unwrap();
    fx.seed("p.rs", SEED);

    let mut campaign = fx.campaign(SimulatedCompiler::always(CompilationStatus::Success));
    campaign.run().unwrap();
    assert_eq!(
        std::fs::read_dir(fx.root().join("seeds/new5")).unwrap().count(),
        1
    );
}
