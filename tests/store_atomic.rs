//! Crash-safety of state files: an interrupted write never corrupts the committed value.

use std::fs;

use rollgate::store::{load_json, save_json};
use rollgate::{Error, SequentialTester, SprtConfig, SprtState};

#[test]
fn leftover_temp_file_does_not_affect_committed_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sprt.json");

    let mut t = SequentialTester::new(SprtConfig::default()).unwrap();
    t.observe_batch(30, 40).unwrap();
    t.save(&path).unwrap();

    // Simulate a writer killed mid-write: a truncated temp next to the target.
    let junk = dir.path().join(".sprt.json.tmp.99999.0");
    fs::write(&junk, b"{\"log_likelihood_ratio\": 1.2, \"green_co").unwrap();

    let resumed = SequentialTester::load(SprtConfig::default(), &path).unwrap();
    assert_eq!(resumed.state(), t.state());

    // The next commit goes through regardless.
    let mut next = resumed;
    next.observe_batch(5, 5).unwrap();
    next.save(&path).unwrap();
    let loaded: SprtState = load_json(&path).unwrap().unwrap();
    assert_eq!(loaded.total_count, 45);
}

#[test]
fn truncated_target_is_reported_not_reset() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sprt.json");
    let t = SequentialTester::new(SprtConfig::default()).unwrap();
    t.save(&path).unwrap();

    let full = fs::read(&path).unwrap();
    fs::write(&path, &full[..full.len() / 2]).unwrap();

    let err = SequentialTester::load(SprtConfig::default(), &path).unwrap_err();
    assert!(matches!(err, Error::MalformedState { .. }), "{err}");
    assert_eq!(err.exit_code(), 3);
    // The broken file is left for an operator to inspect.
    assert_eq!(fs::read(&path).unwrap(), &full[..full.len() / 2]);
}

#[test]
fn save_creates_missing_parent_directories() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a/b/c/state.json");
    save_json(&path, &vec![1u32, 2, 3]).unwrap();
    assert_eq!(load_json::<Vec<u32>>(&path).unwrap(), Some(vec![1, 2, 3]));
}
