//! Property and statistical tests for the traffic allocator.

use std::collections::BTreeMap;

use proptest::prelude::*;
use rollgate::{ArmCounts, BanditConfig, BanditRouter};

fn arms(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("arm{i}")).collect()
}

proptest! {
    /// Every fraction respects the floor and the split sums to one, for any K.
    #[test]
    fn floor_and_sum_hold(
        n_arms in 1usize..8,
        floor_share in 0.0f64..=1.0,
        counts in prop::collection::vec((0u64..500, 0u64..500), 8),
        seed in any::<u64>(),
    ) {
        let ids = arms(n_arms);
        let min_explore = floor_share / n_arms as f64;
        let counts: BTreeMap<String, ArmCounts> = ids
            .iter()
            .zip(&counts)
            .map(|(id, &(s, f))| (id.clone(), ArmCounts { success: s, fail: f }))
            .collect();
        let cfg = BanditConfig { min_explore, ..BanditConfig::default() };
        let mut router = BanditRouter::with_seed(cfg, seed);
        let d = router.allocate(&ids, &counts).unwrap();

        let sum: f64 = d.fractions.values().sum();
        prop_assert!((sum - 1.0).abs() < 1e-9, "sum={sum}");
        prop_assert_eq!(d.fractions.len(), n_arms);
        for (arm, &f) in &d.fractions {
            prop_assert!(f >= min_explore - 1e-12, "{arm}: {f} < {min_explore}");
        }
    }

    /// `pick` always lands on a known arm.
    #[test]
    fn pick_returns_member(n_arms in 1usize..6, u in 0.0f64..1.0, seed in any::<u64>()) {
        let ids = arms(n_arms);
        let mut router = BanditRouter::with_seed(BanditConfig::default(), seed);
        let d = router.allocate(&ids, &BTreeMap::new()).unwrap();
        let picked = d.pick(u).unwrap();
        prop_assert!(ids.iter().any(|a| a == picked));
    }
}

#[test]
fn better_arm_gets_more_traffic_on_average() {
    let ids = arms(2);
    let counts: BTreeMap<String, ArmCounts> = [
        ("arm0".to_string(), ArmCounts { success: 70, fail: 30 }),
        ("arm1".to_string(), ArmCounts { success: 50, fail: 50 }),
    ]
    .into();
    let mut router = BanditRouter::with_seed(BanditConfig::default(), 7);
    let trials = 2000;
    let mut mean0 = 0.0;
    let mut mean1 = 0.0;
    for _ in 0..trials {
        let d = router.allocate(&ids, &counts).unwrap();
        mean0 += d.fraction("arm0").unwrap();
        mean1 += d.fraction("arm1").unwrap();
    }
    mean0 /= trials as f64;
    mean1 /= trials as f64;
    assert!(mean0 > mean1, "better arm mean {mean0} <= worse arm mean {mean1}");
}

#[test]
fn missing_counts_default_to_prior() {
    let ids = arms(3);
    let mut router = BanditRouter::default();
    let d = router.allocate(&ids, &BTreeMap::new()).unwrap();
    assert_eq!(d.fractions.len(), 3);
}

#[test]
fn empty_arm_list_is_an_error() {
    let mut router = BanditRouter::default();
    assert!(router.allocate(&[], &BTreeMap::new()).is_err());
}

#[test]
fn same_seed_same_split() {
    let ids = arms(4);
    let a = BanditRouter::with_seed(BanditConfig::default(), 42)
        .allocate(&ids, &BTreeMap::new())
        .unwrap();
    let b = BanditRouter::with_seed(BanditConfig::default(), 42)
        .allocate(&ids, &BTreeMap::new())
        .unwrap();
    assert_eq!(a, b);
}
