//! Thompson-sampling traffic allocator.
//!
//! Produces a *traffic split* rather than a single arm: each arm's Beta
//! posterior is sampled once, samples are floored at `min_explore`, and the
//! result is normalized into fractions.
//!
//! Notes:
//! - The router is **seedable** so allocations are reproducible in tests.
//! - Default construction uses a fixed seed (deterministic by default).
//! - Counts are owned by the caller; allocation has no side effects beyond
//!   advancing the RNG.
//!
//! # Floor guarantee
//!
//! Clamping raw samples before normalizing is not enough on its own: a single
//! dominant sample can push the others back under the floor. After
//! normalizing, the split is projected onto `{q : q_i >= min_explore, Σq = 1}`
//! by water-filling: arms under the floor are pinned to it and the remaining
//! mass is rescaled across the others, repeating until nothing is under.
//! This holds for any number of arms as long as `min_explore <= 1/K`; above
//! that the floor is infeasible and the split is uniform.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::env_f64;
use crate::decision::{Decision, DecisionNote, DecisionSource, Status};
use crate::error::{Error, Result};
use crate::stats::sample_beta;

/// Configuration for the allocator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanditConfig {
    /// Minimum fraction any arm receives.
    pub min_explore: f64,
    /// Prior alpha (must be > 0).
    pub alpha0: f64,
    /// Prior beta (must be > 0).
    pub beta0: f64,
    /// Optional per-arm priors (alpha, beta). If present, overrides (alpha0, beta0).
    #[serde(default)]
    pub priors: BTreeMap<String, (f64, f64)>,
}

impl Default for BanditConfig {
    fn default() -> Self {
        Self {
            min_explore: 0.1,
            alpha0: 1.0,
            beta0: 1.0,
            priors: BTreeMap::new(),
        }
    }
}

impl BanditConfig {
    /// Defaults overlaid with `ROLLGATE_MIN_EXPLORE`.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(v) = env_f64("ROLLGATE_MIN_EXPLORE")? {
            cfg.min_explore = v;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.min_explore.is_finite() && (0.0..=1.0).contains(&self.min_explore)) {
            return Err(Error::config(
                "min_explore",
                format!("{} not in [0,1]", self.min_explore),
            ));
        }
        Ok(())
    }

    fn prior_for(&self, arm: &str) -> (f64, f64) {
        let (a, b) = self
            .priors
            .get(arm)
            .copied()
            .unwrap_or((self.alpha0, self.beta0));
        (
            if a.is_finite() && a > 0.0 { a } else { 1.0 },
            if b.is_finite() && b > 0.0 { b } else { 1.0 },
        )
    }
}

/// Observed success/failure counts for one arm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArmCounts {
    pub success: u64,
    pub fail: u64,
}

/// One routable variant with its Beta prior and observed outcomes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Arm {
    pub id: String,
    pub alpha_prior: f64,
    pub beta_prior: f64,
    pub success_count: u64,
    pub fail_count: u64,
}

impl Arm {
    /// Arm with the flat `Beta(1, 1)` prior.
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_prior(id, 1.0, 1.0)
    }

    pub fn with_prior(id: impl Into<String>, alpha_prior: f64, beta_prior: f64) -> Self {
        Self {
            id: id.into(),
            alpha_prior,
            beta_prior,
            success_count: 0,
            fail_count: 0,
        }
    }

    /// Record one observed outcome.
    pub fn record(&mut self, success: bool) {
        if success {
            self.success_count = self.success_count.saturating_add(1);
        } else {
            self.fail_count = self.fail_count.saturating_add(1);
        }
    }

    /// Operator reset: drop observed counts, keep the prior.
    pub fn reset(&mut self) {
        self.success_count = 0;
        self.fail_count = 0;
    }

    /// Posterior `(alpha, beta)`.
    #[must_use]
    pub fn posterior(&self) -> (f64, f64) {
        (
            self.alpha_prior + self.success_count as f64,
            self.beta_prior + self.fail_count as f64,
        )
    }

    #[must_use]
    pub fn posterior_mean(&self) -> f64 {
        let (a, b) = self.posterior();
        let denom = a + b;
        if denom <= 0.0 {
            0.5
        } else {
            a / denom
        }
    }

    #[must_use]
    pub fn counts(&self) -> ArmCounts {
        ArmCounts {
            success: self.success_count,
            fail: self.fail_count,
        }
    }
}

/// A traffic split over arms. Fractions sum to 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub fractions: BTreeMap<String, f64>,
    /// Raw posterior samples that produced this split (audit only).
    pub samples: BTreeMap<String, f64>,
    /// Arms pinned to the floor by the projection.
    pub floored: Vec<String>,
    /// Raw samples summed to zero and the split fell back to uniform.
    pub uniform_fallback: bool,
}

impl RoutingDecision {
    #[must_use]
    pub fn fraction(&self, arm: &str) -> Option<f64> {
        self.fractions.get(arm).copied()
    }

    /// Route one request given a uniform draw `u ∈ [0, 1)`.
    ///
    /// Walks the cumulative split in key order. If rounding leaves `u` past the
    /// last boundary, the last arm is returned.
    #[must_use]
    pub fn pick(&self, u: f64) -> Option<&str> {
        let u = if u.is_finite() { u.clamp(0.0, 1.0) } else { 0.0 };
        let mut acc = 0.0;
        let mut last = None;
        for (arm, &f) in &self.fractions {
            acc += f;
            last = Some(arm.as_str());
            if u < acc {
                return last;
            }
        }
        last
    }

    /// Envelope for reporting.
    #[must_use]
    pub fn to_decision(&self) -> Decision {
        let mut d = Decision::new(DecisionSource::Bandit, Status::Ok);
        for (arm, f) in &self.fractions {
            d = d.value(&format!("fraction.{arm}"), *f);
        }
        if !self.floored.is_empty() {
            d = d.note(DecisionNote::FloorApplied {
                arms: self.floored.clone(),
            });
        }
        if self.uniform_fallback {
            d = d.note(DecisionNote::UniformFallback);
        }
        d
    }
}

/// Seedable Thompson-sampling allocator.
#[derive(Debug, Clone)]
pub struct BanditRouter {
    cfg: BanditConfig,
    rng: StdRng,
}

impl BanditRouter {
    /// Allocator with a deterministic fixed seed (0).
    pub fn new(cfg: BanditConfig) -> Self {
        Self::with_seed(cfg, 0)
    }

    /// Allocator with a fixed seed (reproducible).
    pub fn with_seed(cfg: BanditConfig, seed: u64) -> Self {
        Self {
            cfg,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    #[must_use]
    pub fn config(&self) -> &BanditConfig {
        &self.cfg
    }

    /// Allocate across `arm_ids`. Arms absent from `counts` are treated as `(0, 0)`.
    pub fn allocate(
        &mut self,
        arm_ids: &[String],
        counts: &BTreeMap<String, ArmCounts>,
    ) -> Result<RoutingDecision> {
        let arms: Vec<Arm> = arm_ids
            .iter()
            .map(|id| {
                let (a, b) = self.cfg.prior_for(id);
                let c = counts.get(id).copied().unwrap_or_default();
                Arm {
                    id: id.clone(),
                    alpha_prior: a,
                    beta_prior: b,
                    success_count: c.success,
                    fail_count: c.fail,
                }
            })
            .collect();
        self.allocate_arms(&arms)
    }

    /// Allocate across fully specified arms (their own priors are used).
    pub fn allocate_arms(&mut self, arms: &[Arm]) -> Result<RoutingDecision> {
        if arms.is_empty() {
            return Err(Error::EmptyArms);
        }
        self.cfg.validate()?;
        let floor = self.cfg.min_explore;

        let mut samples: BTreeMap<String, f64> = BTreeMap::new();
        for arm in arms {
            let (a, b) = arm.posterior();
            let x = sample_beta(&mut self.rng, a, b);
            samples.insert(arm.id.clone(), x);
        }

        let raw_sum: f64 = samples.values().sum();
        if !(raw_sum.is_finite() && raw_sum > 0.0) {
            debug!(arms = samples.len(), "zero posterior mass, uniform split");
            return Ok(RoutingDecision {
                fractions: uniform(samples.keys()),
                samples,
                floored: Vec::new(),
                uniform_fallback: true,
            });
        }

        let clamped: BTreeMap<String, f64> = samples
            .iter()
            .map(|(k, &v)| (k.clone(), v.max(floor)))
            .collect();
        let total: f64 = clamped.values().sum();
        let normalized: BTreeMap<String, f64> = clamped
            .into_iter()
            .map(|(k, v)| (k, v / total))
            .collect();

        let (fractions, floored) = project_onto_floor(&normalized, floor);
        debug!(?fractions, ?floored, "allocation computed");
        Ok(RoutingDecision {
            fractions,
            samples,
            floored,
            uniform_fallback: false,
        })
    }
}

impl Default for BanditRouter {
    fn default() -> Self {
        Self::new(BanditConfig::default())
    }
}

fn uniform<'a>(keys: impl Iterator<Item = &'a String>) -> BTreeMap<String, f64> {
    let keys: Vec<&String> = keys.collect();
    let n = keys.len().max(1) as f64;
    keys.into_iter().map(|k| (k.clone(), 1.0 / n)).collect()
}

/// Water-filling projection of a distribution onto `q_i >= floor`.
///
/// Returns the projected split and the arms pinned to the floor.
fn project_onto_floor(p: &BTreeMap<String, f64>, floor: f64) -> (BTreeMap<String, f64>, Vec<String>) {
    let k = p.len();
    if floor <= 0.0 || k == 0 {
        return (p.clone(), Vec::new());
    }
    if floor * k as f64 > 1.0 + 1e-12 {
        return (uniform(p.keys()), p.keys().cloned().collect());
    }

    let mut pinned: Vec<String> = Vec::new();
    loop {
        let free: Vec<(&String, f64)> = p
            .iter()
            .filter(|(name, _)| !pinned.contains(*name))
            .map(|(name, &v)| (name, v))
            .collect();
        if free.is_empty() {
            return (uniform(p.keys()), pinned);
        }
        let remaining = 1.0 - floor * pinned.len() as f64;
        let free_sum: f64 = free.iter().map(|(_, v)| v).sum();

        let scaled: Vec<(&String, f64)> = if free_sum > 0.0 {
            free.iter()
                .map(|&(n, v)| (n, v * remaining / free_sum))
                .collect()
        } else {
            let share = remaining / free.len() as f64;
            free.iter().map(|&(n, _)| (n, share)).collect()
        };

        let under: Vec<String> = scaled
            .iter()
            .filter(|(_, v)| *v < floor)
            .map(|(n, _)| (*n).clone())
            .collect();
        if under.is_empty() {
            let mut out: BTreeMap<String, f64> =
                scaled.into_iter().map(|(n, v)| (n.clone(), v)).collect();
            for name in &pinned {
                out.insert(name.clone(), floor);
            }
            return (out, pinned);
        }
        pinned.extend(under);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("arm{i}")).collect()
    }

    #[test]
    fn empty_arm_list_is_an_error() {
        let mut r = BanditRouter::default();
        assert!(matches!(
            r.allocate(&[], &BTreeMap::new()),
            Err(Error::EmptyArms)
        ));
    }

    #[test]
    fn missing_counts_default_to_uninformative() {
        let mut r = BanditRouter::with_seed(BanditConfig::default(), 9);
        let d = r.allocate(&ids(2), &BTreeMap::new()).unwrap();
        assert_eq!(d.fractions.len(), 2);
        let s: f64 = d.fractions.values().sum();
        assert!((s - 1.0).abs() < 1e-9);
    }

    #[test]
    fn deterministic_given_same_seed() {
        let mut counts = BTreeMap::new();
        counts.insert("arm0".to_string(), ArmCounts { success: 30, fail: 5 });
        counts.insert("arm1".to_string(), ArmCounts { success: 10, fail: 20 });
        let mut a = BanditRouter::with_seed(BanditConfig::default(), 42);
        let mut b = BanditRouter::with_seed(BanditConfig::default(), 42);
        assert_eq!(
            a.allocate(&ids(2), &counts).unwrap(),
            b.allocate(&ids(2), &counts).unwrap()
        );
    }

    #[test]
    fn skewed_two_arm_split_respects_floor() {
        let mut counts = BTreeMap::new();
        counts.insert("arm0".to_string(), ArmCounts { success: 10_000, fail: 0 });
        counts.insert("arm1".to_string(), ArmCounts { success: 0, fail: 10_000 });
        let mut r = BanditRouter::with_seed(BanditConfig::default(), 1);
        let d = r.allocate(&ids(2), &counts).unwrap();
        let loser = d.fraction("arm1").unwrap();
        assert!(loser >= 0.1, "loser={loser}");
        assert!((loser - 0.1).abs() < 1e-9, "floor should bind exactly: {loser}");
        assert_eq!(d.floored, vec!["arm1".to_string()]);
    }

    #[test]
    fn infeasible_floor_is_uniform() {
        let cfg = BanditConfig {
            min_explore: 0.5,
            ..BanditConfig::default()
        };
        let mut r = BanditRouter::with_seed(cfg, 3);
        let d = r.allocate(&ids(4), &BTreeMap::new()).unwrap();
        for f in d.fractions.values() {
            assert!((f - 0.25).abs() < 1e-12);
        }
    }

    #[test]
    fn projection_keeps_unpinned_proportions() {
        let mut p = BTreeMap::new();
        p.insert("a".to_string(), 0.02);
        p.insert("b".to_string(), 0.49);
        p.insert("c".to_string(), 0.49);
        let (q, pinned) = project_onto_floor(&p, 0.1);
        assert_eq!(pinned, vec!["a".to_string()]);
        assert!((q["a"] - 0.1).abs() < 1e-12);
        assert!((q["b"] - 0.45).abs() < 1e-12);
        assert!((q["c"] - 0.45).abs() < 1e-12);
    }

    #[test]
    fn pick_walks_cumulative_split() {
        let mut fractions = BTreeMap::new();
        fractions.insert("a".to_string(), 0.25);
        fractions.insert("b".to_string(), 0.75);
        let d = RoutingDecision {
            fractions,
            samples: BTreeMap::new(),
            floored: Vec::new(),
            uniform_fallback: false,
        };
        assert_eq!(d.pick(0.0), Some("a"));
        assert_eq!(d.pick(0.3), Some("b"));
        assert_eq!(d.pick(1.0), Some("b"));
    }

    #[test]
    fn arm_record_and_reset() {
        let mut arm = Arm::new("candidate");
        arm.record(true);
        arm.record(true);
        arm.record(false);
        assert_eq!(arm.posterior(), (3.0, 2.0));
        assert!((arm.posterior_mean() - 0.6).abs() < 1e-12);
        arm.reset();
        assert_eq!(arm.counts(), ArmCounts::default());
    }

    #[test]
    fn per_arm_prior_overrides_default() {
        let mut cfg = BanditConfig::default();
        cfg.priors.insert("arm0".to_string(), (50.0, 1.0));
        assert_eq!(cfg.prior_for("arm0"), (50.0, 1.0));
        assert_eq!(cfg.prior_for("arm1"), (1.0, 1.0));
    }
}
