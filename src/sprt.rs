//! Wald sequential probability ratio test on a Bernoulli outcome stream.
//!
//! Hypotheses are fixed: `H0: p = p0` against `H1: p = p1` with `p0 < p1`.
//! With type-I error `alpha` and type-II error `beta` the decision bounds are
//!
//! ```text
//! A = ln((1 - beta) / alpha)      (accept H1 at or above)
//! B = ln(beta / (1 - alpha))      (accept H0 at or below)
//! ```
//!
//! The log-likelihood ratio is **recomputed from counts** on every update
//! rather than accumulated step by step, so the verdict is a pure function of
//! `(green_count, total_count)`. Reloading a state file and replaying it is
//! idempotent.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::env_f64;
use crate::decision::{Decision, DecisionNote, DecisionSource, Status, Verdict};
use crate::error::{Error, Result};
use crate::store;

/// SPRT hypotheses and error rates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SprtConfig {
    /// Null success rate.
    pub p0: f64,
    /// Alternative success rate (must exceed `p0`).
    pub p1: f64,
    /// Type-I error.
    pub alpha: f64,
    /// Type-II error.
    pub beta: f64,
}

impl Default for SprtConfig {
    fn default() -> Self {
        Self {
            p0: 0.6,
            p1: 0.8,
            alpha: 0.05,
            beta: 0.2,
        }
    }
}

impl SprtConfig {
    /// Defaults overlaid with `ROLLGATE_SPRT_{P0,P1,ALPHA,BETA}`.
    pub fn from_env() -> Result<Self> {
        let mut c = Self::default();
        if let Some(v) = env_f64("ROLLGATE_SPRT_P0")? {
            c.p0 = v;
        }
        if let Some(v) = env_f64("ROLLGATE_SPRT_P1")? {
            c.p1 = v;
        }
        if let Some(v) = env_f64("ROLLGATE_SPRT_ALPHA")? {
            c.alpha = v;
        }
        if let Some(v) = env_f64("ROLLGATE_SPRT_BETA")? {
            c.beta = v;
        }
        c.validate()?;
        Ok(c)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, v) in [
            ("p0", self.p0),
            ("p1", self.p1),
            ("alpha", self.alpha),
            ("beta", self.beta),
        ] {
            if !(v.is_finite() && v > 0.0 && v < 1.0) {
                return Err(Error::config(name, format!("{v} not in (0,1)")));
            }
        }
        if self.p0 >= self.p1 {
            return Err(Error::config(
                "p1",
                format!("p1={} must exceed p0={}", self.p1, self.p0),
            ));
        }
        Ok(())
    }

    /// Upper bound `A`.
    #[must_use]
    pub fn upper(&self) -> f64 {
        ((1.0 - self.beta) / self.alpha).ln()
    }

    /// Lower bound `B`.
    #[must_use]
    pub fn lower(&self) -> f64 {
        (self.beta / (1.0 - self.alpha)).ln()
    }

    fn llr_success(&self) -> f64 {
        (self.p1 / self.p0).ln()
    }

    fn llr_failure(&self) -> f64 {
        ((1.0 - self.p1) / (1.0 - self.p0)).ln()
    }

    /// `log_lr` for given counts; `0` when `total == 0`.
    #[must_use]
    pub fn log_lr(&self, green: u64, total: u64) -> f64 {
        if total == 0 {
            return 0.0;
        }
        let n = total as f64;
        let p_hat = green as f64 / n;
        n * (p_hat * self.llr_success() + (1.0 - p_hat) * self.llr_failure())
    }

    /// Verdict for a given log-likelihood ratio.
    #[must_use]
    pub fn classify(&self, log_lr: f64) -> Verdict {
        if log_lr >= self.upper() {
            Verdict::Accept
        } else if log_lr <= self.lower() {
            Verdict::Reject
        } else {
            Verdict::Continue
        }
    }

    /// Wald's approximate average sample number `(under H0, under H1)`.
    #[must_use]
    pub fn expected_sample_size(&self) -> (f64, f64) {
        let (a, b) = (self.upper(), self.lower());
        let drift = |p: f64| p * self.llr_success() + (1.0 - p) * self.llr_failure();
        let h0 = (self.alpha * a + (1.0 - self.alpha) * b) / drift(self.p0);
        let h1 = ((1.0 - self.beta) * a + self.beta * b) / drift(self.p1);
        (h0, h1)
    }
}

/// Persisted SPRT state.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SprtState {
    pub green_count: u64,
    pub total_count: u64,
    pub log_likelihood_ratio: f64,
    #[serde(default)]
    pub verdict: Verdict,
}

impl SprtState {
    /// Rebuild state from counts alone.
    pub fn from_counts(cfg: &SprtConfig, green_count: u64, total_count: u64) -> Result<Self> {
        if green_count > total_count {
            return Err(Error::config(
                "green_count",
                format!("{green_count} exceeds total_count {total_count}"),
            ));
        }
        let log_likelihood_ratio = cfg.log_lr(green_count, total_count);
        Ok(Self {
            green_count,
            total_count,
            log_likelihood_ratio,
            verdict: cfg.classify(log_likelihood_ratio),
        })
    }
}

/// SPRT state machine: `Continue` until a bound is crossed.
#[derive(Debug, Clone)]
pub struct SequentialTester {
    cfg: SprtConfig,
    state: SprtState,
    /// Most recent verdict transition in this process, `(from, to)`.
    transition: Option<(Verdict, Verdict)>,
}

impl SequentialTester {
    pub fn new(cfg: SprtConfig) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            cfg,
            state: SprtState::default(),
            transition: None,
        })
    }

    /// Resume from a persisted state; the ratio and verdict are recomputed.
    pub fn from_state(cfg: SprtConfig, state: SprtState) -> Result<Self> {
        cfg.validate()?;
        let state = SprtState::from_counts(&cfg, state.green_count, state.total_count)?;
        Ok(Self {
            cfg,
            state,
            transition: None,
        })
    }

    /// Load from `path`, starting fresh if the file does not exist.
    pub fn load(cfg: SprtConfig, path: &Path) -> Result<Self> {
        match store::load_json::<SprtState>(path)? {
            None => Self::new(cfg),
            Some(s) => Self::from_state(cfg, s).map_err(|e| Error::MalformedState {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }),
        }
    }

    /// Commit current state atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        store::save_json(path, &self.state)
    }

    #[must_use]
    pub fn config(&self) -> &SprtConfig {
        &self.cfg
    }

    #[must_use]
    pub fn state(&self) -> &SprtState {
        &self.state
    }

    #[must_use]
    pub fn verdict(&self) -> Verdict {
        self.state.verdict
    }

    /// The last verdict change since this tester was created or loaded.
    #[must_use]
    pub fn transition(&self) -> Option<(Verdict, Verdict)> {
        self.transition
    }

    /// Record one Bernoulli observation and return the (recomputed) verdict.
    pub fn observe(&mut self, success: bool) -> Verdict {
        let green = self.state.green_count + u64::from(success);
        let total = self.state.total_count + 1;
        self.set_counts(green, total)
    }

    /// Record a batch of observations.
    pub fn observe_batch(&mut self, green: u64, total: u64) -> Result<Verdict> {
        if green > total {
            return Err(Error::config(
                "green",
                format!("{green} exceeds batch total {total}"),
            ));
        }
        let g = self.state.green_count.saturating_add(green);
        let t = self.state.total_count.saturating_add(total);
        Ok(self.set_counts(g, t))
    }

    /// Operator reset: restart the trial from zero.
    pub fn reset(&mut self) {
        info!(
            green = self.state.green_count,
            total = self.state.total_count,
            "sprt state reset"
        );
        let before = self.state.verdict;
        self.state = SprtState::default();
        if before != self.state.verdict {
            self.transition = Some((before, self.state.verdict));
        }
    }

    fn set_counts(&mut self, green: u64, total: u64) -> Verdict {
        let before = self.state.verdict;
        let log_lr = self.cfg.log_lr(green, total);
        let verdict = self.cfg.classify(log_lr);
        self.state = SprtState {
            green_count: green,
            total_count: total,
            log_likelihood_ratio: log_lr,
            verdict,
        };
        if verdict != before {
            self.transition = Some((before, verdict));
            if verdict.is_terminal() {
                info!(
                    from = before.as_str(),
                    to = verdict.as_str(),
                    green,
                    total,
                    log_lr,
                    "sprt reached a terminal verdict"
                );
            } else {
                info!(from = before.as_str(), green, total, log_lr, "sprt back to continue");
            }
        } else {
            debug!(green, total, log_lr, "sprt updated");
        }
        verdict
    }

    /// Envelope for reporting. `Continue` maps to a soft warning.
    #[must_use]
    pub fn to_decision(&self) -> Decision {
        let status = match self.state.verdict {
            Verdict::Accept => Status::Ok,
            Verdict::Reject => Status::Fail,
            Verdict::Continue => Status::Warn,
        };
        let d = Decision::new(DecisionSource::Sprt, status)
            .label("verdict", self.state.verdict.as_str())
            .value("green", self.state.green_count as f64)
            .value("total", self.state.total_count as f64)
            .value("log_lr", self.state.log_likelihood_ratio)
            .value("upper", self.cfg.upper())
            .value("lower", self.cfg.lower());
        match self.transition {
            Some((from, to)) => d.note(DecisionNote::VerdictChanged { from, to }),
            None => d,
        }
    }

    /// Envelope annotated with an underpowered note when `required` exceeds the count.
    #[must_use]
    pub fn to_decision_with_plan(&self, required: u64) -> Decision {
        let d = self.to_decision();
        if self.state.total_count < required {
            d.note(DecisionNote::Underpowered {
                observed: self.state.total_count,
                required,
            })
        } else {
            d
        }
    }
}
