//! Canary check: a candidate's holdout metrics against a stored baseline.
//!
//! Fails when `baseline_r2 - candidate_r2 > max_r2_drop` or
//! `candidate_mse / baseline_mse > max_mse_ratio`. With no stored baseline the
//! candidate's metrics become the baseline and the check passes.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::env_f64;
use crate::decision::{Decision, DecisionNote, DecisionSource, Status};
use crate::error::{Error, Result};
use crate::runner::{CommandRunner, CommandSpec};
use crate::store;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CanaryThresholds {
    pub max_r2_drop: f64,
    pub max_mse_ratio: f64,
}

impl Default for CanaryThresholds {
    fn default() -> Self {
        Self {
            max_r2_drop: 0.02,
            max_mse_ratio: 1.05,
        }
    }
}

impl CanaryThresholds {
    /// Defaults overlaid with `ROLLGATE_CANARY_MAX_R2_DROP` and `ROLLGATE_CANARY_MAX_MSE_RATIO`.
    pub fn from_env() -> Result<Self> {
        let mut t = Self::default();
        if let Some(v) = env_f64("ROLLGATE_CANARY_MAX_R2_DROP")? {
            t.max_r2_drop = v;
        }
        if let Some(v) = env_f64("ROLLGATE_CANARY_MAX_MSE_RATIO")? {
            if v <= 0.0 {
                return Err(Error::config("ROLLGATE_CANARY_MAX_MSE_RATIO", "must be > 0"));
            }
            t.max_mse_ratio = v;
        }
        Ok(t)
    }
}

/// Holdout metrics reported by a canary evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CanaryMetrics {
    pub r2: f64,
    pub mse: f64,
}

impl CanaryMetrics {
    fn validate(&self) -> std::result::Result<(), String> {
        if !self.r2.is_finite() || !self.mse.is_finite() {
            return Err("metrics must be finite".into());
        }
        if self.mse < 0.0 {
            return Err(format!("mse {} is negative", self.mse));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanaryReason {
    Ok,
    R2Drop,
    MseRatio,
    Bootstrapped,
}

impl CanaryReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::R2Drop => "r2_drop",
            Self::MseRatio => "mse_ratio",
            Self::Bootstrapped => "bootstrapped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CanaryOutcome {
    pub pass: bool,
    pub reason: CanaryReason,
    pub candidate: CanaryMetrics,
    /// `None` when there was no baseline to compare against.
    pub r2_drop: Option<f64>,
    pub mse_ratio: Option<f64>,
}

impl CanaryOutcome {
    #[must_use]
    pub fn to_decision(&self) -> Decision {
        let mut d = Decision::new(
            DecisionSource::Gate,
            if self.pass { Status::Ok } else { Status::Fail },
        )
        .label("check", "canary")
        .label("reason", self.reason.as_str())
        .value("candidate_r2", self.candidate.r2)
        .value("candidate_mse", self.candidate.mse)
        .value("r2_drop", self.r2_drop.unwrap_or(f64::NAN))
        .value("mse_ratio", self.mse_ratio.unwrap_or(f64::NAN));
        match self.reason {
            CanaryReason::Bootstrapped => {
                d = d.note(DecisionNote::BaselineBootstrapped {
                    what: "canary".into(),
                });
            }
            CanaryReason::R2Drop | CanaryReason::MseRatio => {
                d = d.note(DecisionNote::GateViolation {
                    check: format!("canary_{}", self.reason.as_str()),
                    detail: format!(
                        "r2_drop={:.4} mse_ratio={:.4}",
                        self.r2_drop.unwrap_or(f64::NAN),
                        self.mse_ratio.unwrap_or(f64::NAN)
                    ),
                });
            }
            CanaryReason::Ok => {}
        }
        d
    }
}

/// Pure canary comparison.
#[must_use]
pub fn evaluate_canary(
    baseline: Option<&CanaryMetrics>,
    candidate: &CanaryMetrics,
    t: &CanaryThresholds,
) -> CanaryOutcome {
    let Some(base) = baseline else {
        return CanaryOutcome {
            pass: true,
            reason: CanaryReason::Bootstrapped,
            candidate: *candidate,
            r2_drop: None,
            mse_ratio: None,
        };
    };
    let r2_drop = base.r2 - candidate.r2;
    let mse_ratio = if base.mse > 0.0 {
        candidate.mse / base.mse
    } else if candidate.mse > 0.0 {
        f64::INFINITY
    } else {
        1.0
    };
    let reason = if r2_drop > t.max_r2_drop {
        CanaryReason::R2Drop
    } else if mse_ratio > t.max_mse_ratio {
        CanaryReason::MseRatio
    } else {
        CanaryReason::Ok
    };
    CanaryOutcome {
        pass: reason == CanaryReason::Ok,
        reason,
        candidate: *candidate,
        r2_drop: Some(r2_drop),
        mse_ratio: Some(mse_ratio),
    }
}

/// Evaluate against the baseline stored at `path`; a missing baseline is
/// created from `candidate`.
pub fn check_canary(path: &Path, candidate: &CanaryMetrics, t: &CanaryThresholds) -> Result<CanaryOutcome> {
    candidate.validate().map_err(|reason| Error::config("canary_metrics", reason))?;
    let baseline = store::load_json::<CanaryMetrics>(path)?;
    if baseline.is_none() {
        store::save_json(path, candidate)?;
        info!(path = %path.display(), r2 = candidate.r2, mse = candidate.mse, "canary baseline bootstrapped");
    }
    let out = evaluate_canary(baseline.as_ref(), candidate, t);
    if !out.pass {
        warn!(
            reason = out.reason.as_str(),
            r2_drop = ?out.r2_drop,
            mse_ratio = ?out.mse_ratio,
            "canary check failed"
        );
    }
    Ok(out)
}

/// Run an external canary evaluator and parse `{"r2": .., "mse": ..}` from its stdout.
///
/// The last non-empty stdout line is parsed, so evaluators may log above it.
pub fn fetch_metrics<R: CommandRunner + ?Sized>(
    runner: &mut R,
    spec: &CommandSpec,
    timeout: Duration,
) -> Result<CanaryMetrics> {
    let out = runner.run(spec, timeout)?;
    if !out.success() {
        return Err(Error::CommandOutput {
            program: spec.program.clone(),
            reason: format!("{}: {}", out.failure_kind(), out.stderr_tail().trim()),
        });
    }
    let line = out
        .stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| Error::CommandOutput {
            program: spec.program.clone(),
            reason: "empty stdout".into(),
        })?;
    let m: CanaryMetrics = serde_json::from_str(line).map_err(|e| Error::CommandOutput {
        program: spec.program.clone(),
        reason: format!("not canary metrics JSON: {e}"),
    })?;
    m.validate().map_err(|reason| Error::CommandOutput {
        program: spec.program.clone(),
        reason,
    })?;
    Ok(m)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::CommandOutput;

    struct Canned(CommandOutput);

    impl CommandRunner for Canned {
        fn run(&mut self, _: &CommandSpec, _: Duration) -> Result<CommandOutput> {
            Ok(self.0.clone())
        }
    }

    fn output(code: i32, stdout: &str) -> CommandOutput {
        CommandOutput {
            exit_code: Some(code),
            stdout: stdout.into(),
            stderr: String::new(),
            timed_out: false,
        }
    }

    const BASE: CanaryMetrics = CanaryMetrics { r2: 0.80, mse: 1.0 };

    #[test]
    fn within_thresholds_passes() {
        let o = evaluate_canary(Some(&BASE), &CanaryMetrics { r2: 0.79, mse: 1.04 }, &CanaryThresholds::default());
        assert!(o.pass);
        assert_eq!(o.reason, CanaryReason::Ok);
    }

    #[test]
    fn r2_drop_checked_before_mse() {
        let t = CanaryThresholds::default();
        let o = evaluate_canary(Some(&BASE), &CanaryMetrics { r2: 0.70, mse: 2.0 }, &t);
        assert_eq!(o.reason, CanaryReason::R2Drop);
        let o = evaluate_canary(Some(&BASE), &CanaryMetrics { r2: 0.80, mse: 1.2 }, &t);
        assert_eq!(o.reason, CanaryReason::MseRatio);
        assert_eq!(o.to_decision().exit_code(), 1);
    }

    #[test]
    fn bootstrap_persists_baseline_then_compares() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("canary_baseline.json");
        let t = CanaryThresholds::default();
        let first = check_canary(&path, &BASE, &t).unwrap();
        assert!(first.pass);
        assert_eq!(first.reason, CanaryReason::Bootstrapped);
        let second = check_canary(&path, &CanaryMetrics { r2: 0.5, mse: 1.0 }, &t).unwrap();
        assert!(!second.pass);
    }

    #[test]
    fn metrics_come_from_last_stdout_line() {
        let mut r = Canned(output(0, "loading model\n{\"r2\": 0.81, \"mse\": 0.9}\n\n"));
        let m = fetch_metrics(&mut r, &CommandSpec::new("eval"), Duration::from_secs(1)).unwrap();
        assert_eq!(m, CanaryMetrics { r2: 0.81, mse: 0.9 });
    }

    #[test]
    fn evaluator_failures_are_errors() {
        let mut r = Canned(output(1, ""));
        assert!(fetch_metrics(&mut r, &CommandSpec::new("eval"), Duration::from_secs(1)).is_err());
        let mut r = Canned(output(0, "not json"));
        let err = fetch_metrics(&mut r, &CommandSpec::new("eval"), Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, Error::CommandOutput { .. }));
    }
}
