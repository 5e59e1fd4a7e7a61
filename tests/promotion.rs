//! Gate evaluation feeding bundle promotion, end to end on a temp root.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{Duration, TimeZone, Utc};
use rollgate::{
    evaluate_gate, AbsoluteThresholds, BundleStore, GateMetrics, GateReason, PointerName,
    RelativeThresholds, MANIFEST_FILE,
};

fn model(test_r2: f64) -> GateMetrics {
    GateMetrics::Model {
        r2_gap: 0.01,
        mse_ratio: 1.02,
        nrmse_ratio: 1.05,
        test_r2,
    }
}

fn write(dir: &Path, name: &str, body: &[u8]) -> PathBuf {
    let p = dir.join(name);
    fs::write(&p, body).unwrap();
    p
}

#[test]
fn first_promotion_then_relative_gate_uses_stable() {
    let src = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let store = BundleStore::new(root.path());
    let abs = AbsoluteThresholds::default();
    let rel = RelativeThresholds::default();
    let weights = write(src.path(), "model.bin", b"v1 weights");
    let t0 = Utc.with_ymd_and_hms(2026, 4, 2, 9, 30, 0).unwrap();

    assert_eq!(store.stable_baseline().unwrap(), None);
    let first = evaluate_gate(&model(0.80), &abs, None, &rel);
    assert!(first.pass);
    let m1 = store.promote(&[weights.clone()], &first, t0).unwrap();
    assert_eq!(m1.tag, "20260402T093000Z");
    assert_eq!(store.stable_baseline().unwrap(), Some(0.80));

    // 0.804 - 0.80 is below the 0.005 minimum improvement.
    let baseline = store.stable_baseline().unwrap();
    let weak = evaluate_gate(&model(0.804), &abs, baseline, &rel);
    assert!(!weak.pass);
    assert_eq!(weak.reason, GateReason::Rel);
    assert!(store.promote(&[weights.clone()], &weak, t0 + Duration::hours(1)).is_err());

    let strong = evaluate_gate(&model(0.83), &abs, baseline, &rel);
    assert!(strong.pass);
    let m2 = store.promote(&[weights], &strong, t0 + Duration::hours(1)).unwrap();
    assert_eq!(m2.baseline_test_r2, Some(0.80));

    let stable = store.resolve_pointer(PointerName::Stable).unwrap().unwrap();
    let latest = store.resolve_pointer(PointerName::Latest).unwrap().unwrap();
    assert_eq!(stable.tag, m2.tag);
    assert_eq!(latest.tag, m2.tag);
    assert_eq!(store.stable_baseline().unwrap(), Some(0.83));
}

#[test]
fn bundle_contents_match_manifest() {
    let src = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let store = BundleStore::new(root.path());
    let a = write(src.path(), "model.bin", b"abc");
    let b = write(src.path(), "features.json", b"{\"cols\": [\"x\"]}");
    let outcome = evaluate_gate(
        &model(0.9),
        &AbsoluteThresholds::default(),
        None,
        &RelativeThresholds::default(),
    );
    let m = store.promote(&[a, b], &outcome, Utc::now()).unwrap();

    let dir = store.bundle_dir(&m.tag);
    assert!(dir.join(MANIFEST_FILE).is_file());
    assert_eq!(m.files.len(), 2);
    assert_eq!(m.files[0].file, "model.bin");
    assert_eq!(
        m.files[0].checksum,
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );
    let verified = store.verify_bundle(&m.tag).unwrap();
    assert_eq!(verified.tag, m.tag);
    assert_eq!(verified.files, m.files);
}

#[test]
fn tampered_bundle_fails_verification() {
    let src = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let store = BundleStore::new(root.path());
    let a = write(src.path(), "model.bin", b"original");
    let outcome = evaluate_gate(
        &model(0.9),
        &AbsoluteThresholds::default(),
        None,
        &RelativeThresholds::default(),
    );
    let m = store.promote(&[a], &outcome, Utc::now()).unwrap();

    fs::write(store.bundle_dir(&m.tag).join("model.bin"), b"tampered").unwrap();
    let err = store.verify_bundle(&m.tag).unwrap_err();
    assert_eq!(err.exit_code(), 3);
    assert!(err.to_string().contains("checksum mismatch"), "{err}");

    fs::remove_file(store.bundle_dir(&m.tag).join("model.bin")).unwrap();
    let err = store.verify_bundle(&m.tag).unwrap_err();
    assert!(err.to_string().contains("missing"), "{err}");
}

#[test]
fn duplicate_artifact_names_rejected_without_side_effects() {
    let a = tempfile::tempdir().unwrap();
    let b = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let store = BundleStore::new(root.path());
    let x = write(a.path(), "model.bin", b"one");
    let y = write(b.path(), "model.bin", b"two");
    let outcome = evaluate_gate(
        &model(0.9),
        &AbsoluteThresholds::default(),
        None,
        &RelativeThresholds::default(),
    );
    assert!(store.promote(&[x, y], &outcome, Utc::now()).is_err());
    assert!(store.resolve_pointer(PointerName::Latest).unwrap().is_none());
}

#[test]
fn missing_artifact_leaves_no_partial_bundle() {
    let root = tempfile::tempdir().unwrap();
    let store = BundleStore::new(root.path());
    let outcome = evaluate_gate(
        &model(0.9),
        &AbsoluteThresholds::default(),
        None,
        &RelativeThresholds::default(),
    );
    let now = Utc.with_ymd_and_hms(2026, 4, 3, 0, 0, 0).unwrap();
    let ghost = root.path().join("does-not-exist.bin");
    assert!(store.promote(&[ghost], &outcome, now).is_err());
    assert!(!store.bundle_dir("20260403T000000Z").exists());
    assert!(store.resolve_pointer(PointerName::Stable).unwrap().is_none());
}

#[test]
fn rehab_gate_floors_and_baseline() {
    let abs = AbsoluteThresholds::default();
    let rel = RelativeThresholds::default();
    let plan = GateMetrics::Rehab {
        safety: 0.95,
        sustainability: 0.8,
        efficiency: 0.7,
        adherence: 0.75,
    };
    assert!(evaluate_gate(&plan, &abs, None, &rel).pass);

    let unsafe_plan = GateMetrics::Rehab {
        safety: 0.85,
        sustainability: 0.8,
        efficiency: 0.7,
        adherence: 0.75,
    };
    let out = evaluate_gate(&unsafe_plan, &abs, None, &rel);
    assert_eq!(out.reason, GateReason::AbsFloor);
    assert!(out.detail.contains("safety"), "{}", out.detail);

    // Mean of the four scores is 0.8; a baseline of 0.8 leaves no improvement.
    let out = evaluate_gate(&plan, &abs, Some(0.8), &rel);
    assert_eq!(out.reason, GateReason::Rel);
}

#[test]
fn manifest_annotates_gate_decision() {
    let src = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let store = BundleStore::new(root.path());
    let a = write(src.path(), "model.bin", b"w");
    let outcome = evaluate_gate(
        &model(0.9),
        &AbsoluteThresholds::default(),
        None,
        &RelativeThresholds::default(),
    );
    let m = store.promote(&[a], &outcome, Utc::now()).unwrap();
    let d = m.annotate(outcome.to_decision());
    assert_eq!(d.exit_code(), 0);
    assert!(d.summary_line().contains(&format!("tag={}", m.tag)), "{}", d.summary_line());
}
