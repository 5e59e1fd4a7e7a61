//! Sample-size planning: how many observations before a verdict is worth trusting.
//!
//! Uses the two-proportion normal approximation at the most conservative
//! null rate `p = 0.5`:
//!
//! ```text
//! n_per_group = (z_{1-α/2} + z_{power})² · 2·p(1-p) / Δp²
//! ```
//!
//! # Example
//!
//! ```rust
//! use rollgate::PowerPlanner;
//!
//! let planner = PowerPlanner::default();
//! let row = planner.plan(0.05).unwrap();
//! assert_eq!(row.n_per_group, 1570);
//! assert_eq!(row.n_total, 3140);
//! ```

use std::env;

use serde::{Deserialize, Serialize};

use crate::config::env_f64;
use crate::decision::{Decision, DecisionSource, Status};
use crate::error::{Error, Result};
use crate::stats::normal_quantile;

/// Effect sizes reported when no explicit list is configured.
pub const DEFAULT_EFFECT_SIZES: [f64; 3] = [0.02, 0.03, 0.05];

/// Power-analysis configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerPlanner {
    /// Two-sided type-I error.
    pub alpha: f64,
    /// Target power (1 − type-II error).
    pub power: f64,
    /// Null success rate used for the variance term.
    pub baseline_rate: f64,
    /// Detectable effect sizes `Δp` to tabulate.
    pub effect_sizes: Vec<f64>,
}

impl Default for PowerPlanner {
    fn default() -> Self {
        Self {
            alpha: 0.05,
            power: 0.8,
            baseline_rate: 0.5,
            effect_sizes: DEFAULT_EFFECT_SIZES.to_vec(),
        }
    }
}

/// One row of the sample-size table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerRow {
    pub effect_size: f64,
    pub n_per_group: u64,
    pub n_total: u64,
}

impl PowerPlanner {
    /// Defaults overlaid with `ROLLGATE_POWER_ALPHA`, `ROLLGATE_POWER`, and
    /// `ROLLGATE_POWER_EFFECTS` (comma-separated).
    pub fn from_env() -> Result<Self> {
        let mut p = Self::default();
        if let Some(v) = env_f64("ROLLGATE_POWER_ALPHA")? {
            p.alpha = v;
        }
        if let Some(v) = env_f64("ROLLGATE_POWER")? {
            p.power = v;
        }
        if let Ok(raw) = env::var("ROLLGATE_POWER_EFFECTS") {
            p.effect_sizes = raw
                .split(',')
                .map(|s| {
                    s.trim().parse::<f64>().map_err(|e| {
                        Error::config("ROLLGATE_POWER_EFFECTS", format!("{s:?}: {e}"))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
        }
        p.validate()?;
        Ok(p)
    }

    fn validate(&self) -> Result<()> {
        let open_unit = |v: f64| v.is_finite() && v > 0.0 && v < 1.0;
        if !open_unit(self.alpha) {
            return Err(Error::config("alpha", format!("{} not in (0,1)", self.alpha)));
        }
        if !open_unit(self.power) {
            return Err(Error::config("power", format!("{} not in (0,1)", self.power)));
        }
        if !open_unit(self.baseline_rate) {
            return Err(Error::config(
                "baseline_rate",
                format!("{} not in (0,1)", self.baseline_rate),
            ));
        }
        Ok(())
    }

    /// Required sample sizes to detect `effect_size` with the configured α/power.
    pub fn plan(&self, effect_size: f64) -> Result<PowerRow> {
        self.validate()?;
        if !(effect_size.is_finite() && effect_size > 0.0 && effect_size < 1.0) {
            return Err(Error::config(
                "effect_size",
                format!("{effect_size} not in (0,1)"),
            ));
        }
        let z_alpha = normal_quantile(1.0 - self.alpha / 2.0);
        let z_power = normal_quantile(self.power);
        let p = self.baseline_rate;
        let n = (z_alpha + z_power).powi(2) * 2.0 * p * (1.0 - p) / effect_size.powi(2);
        let n_per_group = n.ceil() as u64;
        Ok(PowerRow {
            effect_size,
            n_per_group,
            n_total: n_per_group.saturating_mul(2),
        })
    }

    /// Table keyed by effect size, in configured order.
    pub fn table(&self) -> Result<Vec<PowerRow>> {
        self.effect_sizes.iter().map(|&d| self.plan(d)).collect()
    }

    /// Whether `n_observed` per group is enough to detect `effect_size`.
    pub fn is_sufficient(&self, n_observed: u64, effect_size: f64) -> Result<bool> {
        Ok(n_observed >= self.plan(effect_size)?.n_per_group)
    }

    /// The table as a decision: `n_per_group.<Δp>` and `n_total.<Δp>` per row.
    pub fn to_decision(&self) -> Result<Decision> {
        let mut d = Decision::new(DecisionSource::Power, Status::Ok)
            .value("alpha", self.alpha)
            .value("power", self.power);
        for row in self.table()? {
            d = d
                .value(&format!("n_per_group.{}", row.effect_size), row.n_per_group as f64)
                .value(&format!("n_total.{}", row.effect_size), row.n_total as f64);
        }
        Ok(d)
    }
}
