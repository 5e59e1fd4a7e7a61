//! Beta-Bernoulli progress tracker.
//!
//! Starts from a flat `Beta(1, 1)` prior and absorbs one outcome at a time.
//! The tracker *declares* once `P(p >= threshold) >= declare_prob`; declaring
//! only signals readiness downstream, observations keep accumulating for audit.
//!
//! `P(p >= threshold)` is `1 - I_threshold(alpha, beta)`. If the incomplete
//! beta fails to produce a finite value, the documented fallback compares the
//! posterior mean with the threshold (probability 1 or 0) and the result is
//! flagged as approximate.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::env_f64;
use crate::decision::{Decision, DecisionNote, DecisionSource, Status};
use crate::error::{Error, Result};
use crate::stats::regularized_incomplete_beta;
use crate::store;

/// Declaration rule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BayesConfig {
    /// Success rate the candidate must plausibly reach.
    pub threshold: f64,
    /// Posterior probability required to declare.
    pub declare_prob: f64,
}

impl Default for BayesConfig {
    fn default() -> Self {
        Self {
            threshold: 0.8,
            declare_prob: 0.8,
        }
    }
}

impl BayesConfig {
    /// Defaults overlaid with `ROLLGATE_BAYES_THRESHOLD` and `ROLLGATE_BAYES_DECLARE_PROB`.
    pub fn from_env() -> Result<Self> {
        let mut c = Self::default();
        if let Some(v) = env_f64("ROLLGATE_BAYES_THRESHOLD")? {
            c.threshold = v;
        }
        if let Some(v) = env_f64("ROLLGATE_BAYES_DECLARE_PROB")? {
            c.declare_prob = v;
        }
        c.validate()?;
        Ok(c)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.threshold.is_finite() && (0.0..=1.0).contains(&self.threshold)) {
            return Err(Error::config("threshold", format!("{} not in [0,1]", self.threshold)));
        }
        if !(self.declare_prob.is_finite() && (0.0..=1.0).contains(&self.declare_prob)) {
            return Err(Error::config(
                "declare_prob",
                format!("{} not in [0,1]", self.declare_prob),
            ));
        }
        Ok(())
    }
}

/// Persisted posterior. `alpha = 1 + n_green`, `beta = 1 + n_total - n_green`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BayesState {
    pub alpha: f64,
    pub beta: f64,
    pub n_total: u64,
    pub n_green: u64,
}

impl Default for BayesState {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            beta: 1.0,
            n_total: 0,
            n_green: 0,
        }
    }
}

impl BayesState {
    /// Posterior implied by counts under the flat prior.
    pub fn from_counts(n_green: u64, n_total: u64) -> Result<Self> {
        if n_green > n_total {
            return Err(Error::config(
                "n_green",
                format!("{n_green} exceeds n_total {n_total}"),
            ));
        }
        Ok(Self {
            alpha: 1.0 + n_green as f64,
            beta: 1.0 + (n_total - n_green) as f64,
            n_total,
            n_green,
        })
    }

    #[must_use]
    pub fn mean(&self) -> f64 {
        self.alpha / (self.alpha + self.beta)
    }

    fn is_consistent(&self) -> bool {
        self.n_green <= self.n_total
            && (self.alpha - (1.0 + self.n_green as f64)).abs() < 1e-9
            && (self.beta - (1.0 + (self.n_total - self.n_green) as f64)).abs() < 1e-9
    }
}

/// `P(p >= threshold)` and whether it came from the fallback.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TailProbability {
    pub prob: f64,
    pub approximate: bool,
}

/// Beta-Bernoulli tracker.
#[derive(Debug, Clone)]
pub struct BayesianTracker {
    cfg: BayesConfig,
    state: BayesState,
    declared: bool,
}

impl BayesianTracker {
    pub fn new(cfg: BayesConfig) -> Result<Self> {
        Self::from_state(cfg, BayesState::default())
    }

    pub fn from_state(cfg: BayesConfig, state: BayesState) -> Result<Self> {
        cfg.validate()?;
        if !state.is_consistent() {
            return Err(Error::config(
                "bayes_state",
                format!(
                    "alpha={} beta={} inconsistent with n_green={} n_total={}",
                    state.alpha, state.beta, state.n_green, state.n_total
                ),
            ));
        }
        let mut t = Self {
            cfg,
            state,
            declared: false,
        };
        t.declared = t.confident();
        Ok(t)
    }

    /// Load from `path`, starting from the prior if the file does not exist.
    pub fn load(cfg: BayesConfig, path: &Path) -> Result<Self> {
        match store::load_json::<BayesState>(path)? {
            None => Self::new(cfg),
            Some(s) => Self::from_state(cfg, s).map_err(|e| Error::MalformedState {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        store::save_json(path, &self.state)
    }

    #[must_use]
    pub fn state(&self) -> &BayesState {
        &self.state
    }

    #[must_use]
    pub fn config(&self) -> &BayesConfig {
        &self.cfg
    }

    /// Absorb one Bernoulli outcome. Returns `true` on the step that first declares.
    pub fn observe(&mut self, success: bool) -> bool {
        self.state.n_total += 1;
        if success {
            self.state.n_green += 1;
            self.state.alpha += 1.0;
        } else {
            self.state.beta += 1.0;
        }
        let now = self.confident();
        let newly = now && !self.declared;
        if newly {
            info!(
                n_total = self.state.n_total,
                n_green = self.state.n_green,
                threshold = self.cfg.threshold,
                "bayesian tracker declared"
            );
        } else {
            debug!(alpha = self.state.alpha, beta = self.state.beta, "posterior updated");
        }
        self.declared = now;
        newly
    }

    /// Absorb `green` successes out of `total` outcomes at once.
    /// Returns `true` if this batch produced the first declaration.
    pub fn observe_counts(&mut self, green: u64, total: u64) -> Result<bool> {
        if green > total {
            return Err(Error::config(
                "green",
                format!("{green} exceeds batch total {total}"),
            ));
        }
        self.state = BayesState::from_counts(
            self.state.n_green.saturating_add(green),
            self.state.n_total.saturating_add(total),
        )?;
        let now = self.confident();
        let newly = now && !self.declared;
        if newly {
            info!(
                n_total = self.state.n_total,
                n_green = self.state.n_green,
                threshold = self.cfg.threshold,
                "bayesian tracker declared"
            );
        }
        self.declared = now;
        Ok(newly)
    }

    /// `P(p >= threshold)` under the current posterior.
    #[must_use]
    pub fn prob_at_least(&self, threshold: f64) -> TailProbability {
        match regularized_incomplete_beta(threshold, self.state.alpha, self.state.beta) {
            Some(cdf) => TailProbability {
                prob: (1.0 - cdf).clamp(0.0, 1.0),
                approximate: false,
            },
            None => TailProbability {
                prob: if self.state.mean() >= threshold { 1.0 } else { 0.0 },
                approximate: true,
            },
        }
    }

    /// Tail probability at the configured threshold.
    #[must_use]
    pub fn progress(&self) -> TailProbability {
        self.prob_at_least(self.cfg.threshold)
    }

    /// Whether the declaration rule currently holds.
    #[must_use]
    pub fn confident(&self) -> bool {
        self.progress().prob >= self.cfg.declare_prob
    }

    /// Equal-tailed credible interval at level `level` (e.g. 0.95), by bisection.
    #[must_use]
    pub fn credible_interval(&self, level: f64) -> Option<(f64, f64)> {
        if !(level.is_finite() && level > 0.0 && level < 1.0) {
            return None;
        }
        let tail = (1.0 - level) / 2.0;
        Some((self.quantile(tail)?, self.quantile(1.0 - tail)?))
    }

    fn quantile(&self, q: f64) -> Option<f64> {
        let (mut lo, mut hi) = (0.0_f64, 1.0_f64);
        for _ in 0..100 {
            let mid = 0.5 * (lo + hi);
            let c = regularized_incomplete_beta(mid, self.state.alpha, self.state.beta)?;
            if c < q {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        Some(0.5 * (lo + hi))
    }

    #[must_use]
    pub fn to_decision(&self) -> Decision {
        let tp = self.progress();
        let confident = tp.prob >= self.cfg.declare_prob;
        let mut d = Decision::new(
            DecisionSource::Bayes,
            if confident { Status::Ok } else { Status::Warn },
        )
        .label("declared", if confident { "true" } else { "false" })
        .value("prob", tp.prob)
        .value("threshold", self.cfg.threshold)
        .value("mean", self.state.mean())
        .value("n_total", self.state.n_total as f64)
        .value("n_green", self.state.n_green as f64);
        let (lo, hi) = self.credible_interval(0.95).unwrap_or((f64::NAN, f64::NAN));
        d = d.value("ci95_lo", lo).value("ci95_hi", hi);
        if confident {
            d = d.note(DecisionNote::Declared {
                prob: tp.prob,
                threshold: self.cfg.declare_prob,
            });
        }
        if tp.approximate {
            d = d.note(DecisionNote::ApproximateProbability);
        }
        d
    }
}
