//! Promotion gate: absolute and relative thresholds over tagged metrics.
//!
//! Checks run in a fixed order and the first violation wins:
//! 1. absolute ceilings on gaps and ratios (`abs_gap`)
//! 2. absolute floors (`abs_floor`)
//! 3. relative improvement over the promoted baseline (`rel`)
//!
//! The relative check is skipped when nothing has been promoted yet.
//! Evaluation is pure; promotion itself lives in [`crate::bundle`].

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::decision::{Decision, DecisionNote, DecisionSource, Status};

/// Candidate metrics, one variant per gate flavor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "flavor", rename_all = "snake_case")]
pub enum GateMetrics {
    /// Regression model quality. `r2_gap` is train minus test R²; ratios are
    /// candidate over reference and must be non-negative.
    Model {
        r2_gap: f64,
        mse_ratio: f64,
        nrmse_ratio: f64,
        test_r2: f64,
    },
    /// Domain scores, each in `[0, 1]`.
    Rehab {
        safety: f64,
        sustainability: f64,
        efficiency: f64,
        adherence: f64,
    },
}

impl GateMetrics {
    /// The score compared against the promoted baseline: `test_r2` for models,
    /// the mean of the four scores for rehab plans.
    #[must_use]
    pub fn primary(&self) -> f64 {
        match *self {
            Self::Model { test_r2, .. } => test_r2,
            Self::Rehab {
                safety,
                sustainability,
                efficiency,
                adherence,
            } => (safety + sustainability + efficiency + adherence) / 4.0,
        }
    }

    #[must_use]
    pub fn flavor(&self) -> &'static str {
        match self {
            Self::Model { .. } => "model",
            Self::Rehab { .. } => "rehab",
        }
    }

    fn values(&self) -> Vec<(&'static str, f64)> {
        match *self {
            Self::Model {
                r2_gap,
                mse_ratio,
                nrmse_ratio,
                test_r2,
            } => vec![
                ("r2_gap", r2_gap),
                ("mse_ratio", mse_ratio),
                ("nrmse_ratio", nrmse_ratio),
                ("test_r2", test_r2),
            ],
            Self::Rehab {
                safety,
                sustainability,
                efficiency,
                adherence,
            } => vec![
                ("safety", safety),
                ("sustainability", sustainability),
                ("efficiency", efficiency),
                ("adherence", adherence),
            ],
        }
    }
}

/// Hard limits. Model gates use the ceilings and `min_test_r2`; rehab gates use
/// the four domain floors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AbsoluteThresholds {
    pub max_r2_gap: f64,
    pub max_mse_ratio: f64,
    pub max_nrmse_ratio: f64,
    pub min_test_r2: f64,
    pub min_safety: f64,
    pub min_sustainability: f64,
    pub min_efficiency: f64,
    pub min_adherence: f64,
}

impl Default for AbsoluteThresholds {
    fn default() -> Self {
        Self {
            max_r2_gap: 0.02,
            max_mse_ratio: 1.10,
            max_nrmse_ratio: 1.20,
            min_test_r2: 0.80,
            min_safety: 0.9,
            min_sustainability: 0.7,
            min_efficiency: 0.6,
            min_adherence: 0.7,
        }
    }
}

/// Minimum improvement of the primary score over the promoted baseline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelativeThresholds {
    pub min_delta: f64,
}

impl Default for RelativeThresholds {
    fn default() -> Self {
        Self { min_delta: 0.005 }
    }
}

/// Thresholds as read from a gate config file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateThresholds {
    pub absolute: AbsoluteThresholds,
    pub relative: RelativeThresholds,
}

/// The first check that failed, or `Ok`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateReason {
    AbsGap,
    AbsFloor,
    Rel,
    Ok,
}

impl GateReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AbsGap => "abs_gap",
            Self::AbsFloor => "abs_floor",
            Self::Rel => "rel",
            Self::Ok => "ok",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateOutcome {
    pub pass: bool,
    pub reason: GateReason,
    /// Which check failed and by how much; empty on pass.
    pub detail: String,
    pub metrics: GateMetrics,
    pub baseline: Option<f64>,
}

impl GateOutcome {
    #[must_use]
    pub fn to_decision(&self) -> Decision {
        let mut d = Decision::new(
            DecisionSource::Gate,
            if self.pass { Status::Ok } else { Status::Fail },
        )
        .label("check", "gate")
        .label("flavor", self.metrics.flavor())
        .label("reason", self.reason.as_str())
        .value("primary", self.metrics.primary())
        .value("baseline", self.baseline.unwrap_or(f64::NAN));
        for (k, v) in self.metrics.values() {
            d = d.value(k, v);
        }
        if self.pass {
            if self.baseline.is_none() {
                d = d.note(DecisionNote::BaselineBootstrapped {
                    what: "promotion_baseline".into(),
                });
            }
        } else {
            d = d.note(DecisionNote::GateViolation {
                check: self.reason.as_str().into(),
                detail: self.detail.clone(),
            });
        }
        d
    }
}

// `!(x <= limit)` so that NaN counts as a violation.
fn above(name: &str, x: f64, limit: f64) -> Option<String> {
    if !(x <= limit) {
        Some(format!("{name}={x} max={limit}"))
    } else {
        None
    }
}

/// Ratios are additionally non-negative.
fn ratio_above(name: &str, x: f64, limit: f64) -> Option<String> {
    if x < 0.0 {
        Some(format!("{name}={x} min=0"))
    } else {
        above(name, x, limit)
    }
}

fn below(name: &str, x: f64, limit: f64) -> Option<String> {
    if !(x >= limit) {
        Some(format!("{name}={x} min={limit}"))
    } else {
        None
    }
}

/// Evaluate a candidate. `baseline` is the promoted baseline's primary score
/// (test R² for model gates), `None` on the first promotion.
#[must_use]
pub fn evaluate_gate(
    metrics: &GateMetrics,
    absolute: &AbsoluteThresholds,
    baseline: Option<f64>,
    relative: &RelativeThresholds,
) -> GateOutcome {
    let (gap, floor) = match *metrics {
        GateMetrics::Model {
            r2_gap,
            mse_ratio,
            nrmse_ratio,
            test_r2,
        } => (
            above("r2_gap", r2_gap, absolute.max_r2_gap)
                .or_else(|| ratio_above("mse_ratio", mse_ratio, absolute.max_mse_ratio))
                .or_else(|| ratio_above("nrmse_ratio", nrmse_ratio, absolute.max_nrmse_ratio)),
            below("test_r2", test_r2, absolute.min_test_r2),
        ),
        GateMetrics::Rehab {
            safety,
            sustainability,
            efficiency,
            adherence,
        } => (
            None,
            below("safety", safety, absolute.min_safety)
                .or_else(|| below("sustainability", sustainability, absolute.min_sustainability))
                .or_else(|| below("efficiency", efficiency, absolute.min_efficiency))
                .or_else(|| below("adherence", adherence, absolute.min_adherence)),
        ),
    };

    let rel = baseline.and_then(|b| {
        let delta = metrics.primary() - b;
        if !(delta >= relative.min_delta) {
            Some(format!("delta={delta:.6} min_delta={}", relative.min_delta))
        } else {
            None
        }
    });

    let (reason, detail) = match (gap, floor, rel) {
        (Some(d), _, _) => (GateReason::AbsGap, d),
        (None, Some(d), _) => (GateReason::AbsFloor, d),
        (None, None, Some(d)) => (GateReason::Rel, d),
        (None, None, None) => (GateReason::Ok, String::new()),
    };
    let out = GateOutcome {
        pass: reason == GateReason::Ok,
        reason,
        detail,
        metrics: *metrics,
        baseline,
    };
    if out.pass {
        info!(flavor = metrics.flavor(), primary = metrics.primary(), baseline = ?baseline, "gate passed");
    } else {
        debug!(reason = reason.as_str(), detail = %out.detail, "gate rejected candidate");
    }
    out
}
