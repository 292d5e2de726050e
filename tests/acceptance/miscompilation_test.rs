//! Nightly and next-solver disagreement.

use super::common::{Fixture, SEED};
use tfuzz_adapters::{SimulatedCompiler, ToolchainLabel};
use tfuzz_common::CompilationStatus;

fn differential(fx: &mut Fixture) {
    fx.config.compiler.enable_next_solver = true;
    fx.config.retention.detect_miscompilation = true;
    fx.seed("a__fam__alpha.rs", SEED);
}

#[test]
fn test_disagreement_is_flagged() {
    let mut fx = Fixture::new();
    differential(&mut fx);
    // The next solver rejects every mutant, nightly accepts it.
    let compiler = SimulatedCompiler::new(|content, label| {
        if matches!(label, ToolchainLabel::Next) && content.contains("// ") {
            CompilationStatus::Error
        } else {
            CompilationStatus::Success
        }
    });
    let mut campaign = fx.campaign(compiler);
    campaign.run().unwrap();

    let flagged = fx.cases("miscompilation");
    assert_eq!(flagged.len(), 1);
    assert_eq!(fx.cases("error"), flagged);
    let detail = fx.detail("miscompilation", &flagged[0]);
    assert!(detail.contains("Miscompilation: nightly vs next-solver mismatch\n"));
    assert!(detail.contains("Nightly: SUCCESS\nNext: ERROR\n"));
    assert!(detail.contains("Status Breakdown: Stable:SUCCESS, Nightly:SUCCESS, Next:ERROR\n"));
    assert!(detail.contains("=== rustc (-Z next trait-solver) ==="));
    assert_eq!(campaign.metrics().snapshot().miscompilations, 1);
    // Disagreement alone is not a finding.
    assert!(!campaign.selector().is_banned("alpha"));
}

#[test]
fn test_preexisting_disagreement_is_fate() {
    let mut fx = Fixture::new();
    differential(&mut fx);
    // The seed itself already splits the two configurations.
    let compiler = SimulatedCompiler::new(|_, label| match label {
        ToolchainLabel::Next => CompilationStatus::Error,
        _ => CompilationStatus::Success,
    });
    let mut campaign = fx.campaign(compiler);
    campaign.run().unwrap();

    assert!(fx.cases("miscompilation").is_empty());
    assert!(fx.cases("error").is_empty());
    assert_eq!(fx.cases("fate").len(), 1);
    assert_eq!(campaign.metrics().snapshot().miscompilations, 0);
}

#[test]
fn test_detection_can_be_disabled() {
    let mut fx = Fixture::new();
    differential(&mut fx);
    fx.config.retention.detect_miscompilation = false;
    let compiler = SimulatedCompiler::new(|content, label| {
        if matches!(label, ToolchainLabel::Next) && content.contains("// ") {
            CompilationStatus::Error
        } else {
            CompilationStatus::Success
        }
    });
    let mut campaign = fx.campaign(compiler);
    campaign.run().unwrap();

    assert!(fx.cases("miscompilation").is_empty());
    assert_eq!(fx.cases("error").len(), 1);
}
