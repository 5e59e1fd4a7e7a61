//! Calibration checks for the p-value health statistics.

use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rollgate::stats::{binned_entropy, ks_uniform, kolmogorov_survival, runs_test};
use rollgate::{DistributionHealthChecker, HealthConfig, PValueSample};

#[test]
fn uniform_pvalues_pass_ks_most_of_the_time() {
    let mut rng = StdRng::seed_from_u64(11);
    let trials = 200;
    let mut passes = 0;
    for _ in 0..trials {
        let v: Vec<f64> = (0..300).map(|_| rng.random::<f64>()).collect();
        if ks_uniform(&v).unwrap().p_value > 0.05 {
            passes += 1;
        }
    }
    // Nominal rate is 95%.
    assert!(passes >= 170, "only {passes}/{trials} uniform samples passed");
}

#[test]
fn skewed_pvalues_fail_ks() {
    let mut rng = StdRng::seed_from_u64(12);
    let v: Vec<f64> = (0..500).map(|_| rng.random::<f64>().powi(3)).collect();
    assert!(ks_uniform(&v).unwrap().p_value < 1e-6);
}

#[test]
fn constant_log_is_flagged_in_every_window() {
    let now = Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap();
    let samples: Vec<PValueSample> = (0..600)
        .map(|i| PValueSample::new(0.5, now - Duration::minutes(i)))
        .collect();
    let report = DistributionHealthChecker::new(HealthConfig::default()).check(&samples, now);
    for w in &report.windows {
        assert!(w.ks_p_value.unwrap() < 1e-6, "{}", w.label);
        assert!(w.unique_ratio.unwrap() < 0.01, "{}", w.label);
        assert!(w.entropy.unwrap() < 1e-9, "{}", w.label);
    }
    assert_eq!(report.windows[0].n, 120);
    assert_eq!(report.windows[1].n, 600);
}

#[test]
fn alternating_sequence_has_too_many_runs() {
    let v: Vec<f64> = (0..200).map(|i| if i % 2 == 0 { 0.1 } else { 0.9 }).collect();
    let r = runs_test(&v).unwrap();
    assert_eq!(r.runs, 200);
    assert!(r.p_value < 1e-6);
}

proptest! {
    #[test]
    fn kolmogorov_survival_is_a_probability(lambda in 0.0f64..5.0) {
        let q = kolmogorov_survival(lambda);
        prop_assert!((0.0..=1.0).contains(&q));
    }

    #[test]
    fn entropy_never_exceeds_log_bins(values in prop::collection::vec(0.0f64..=1.0, 2..200)) {
        let h = binned_entropy(&values, 10).unwrap();
        prop_assert!(h >= 0.0 && h <= 10f64.ln() + 1e-12);
    }
}
