//! Unified decision envelope for engine outputs.
//!
//! Every step function ends in a decision that automation has to act on. This
//! module gives them one audit-friendly shape that can be:
//! - logged (one machine-parseable summary line)
//! - written as a JSON report artifact
//! - mapped onto the process exit-code convention
//!
//! Notes are small, typed and stable. Prefer adding variants over changing
//! existing semantics.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

/// Three-way verdict of a sequential test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    /// Not enough evidence either way.
    #[default]
    Continue,
    /// Evidence favors the alternative (the candidate is good).
    Accept,
    /// Evidence favors the null (the candidate is not better).
    Reject,
}

impl Verdict {
    /// Whether the verdict is terminal.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Continue)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Continue => "CONTINUE",
            Self::Accept => "ACCEPT",
            Self::Reject => "REJECT",
        }
    }
}

/// Which component produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Bandit,
    Sprt,
    Bayes,
    Health,
    Power,
    Gate,
    Rollback,
}

impl DecisionSource {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bandit => "bandit",
            Self::Sprt => "sprt",
            Self::Bayes => "bayes",
            Self::Health => "health",
            Self::Power => "power",
            Self::Gate => "gate",
            Self::Rollback => "rollback",
        }
    }
}

/// Outcome class, mapped onto exit codes `0` / `1` / `2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    Fail,
    /// Soft warning: not a failure, but automation should skip this cycle.
    Warn,
}

impl Status {
    #[must_use]
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::Fail => 1,
            Self::Warn => 2,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Fail => "fail",
            Self::Warn => "warn",
        }
    }
}

/// Audit notes attached to a decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "note", rename_all = "snake_case")]
pub enum DecisionNote {
    /// A sequential test changed verdict on this step.
    VerdictChanged { from: Verdict, to: Verdict },

    /// The Bayesian tracker crossed its declaration probability.
    Declared { prob: f64, threshold: f64 },

    /// A probability was computed with the documented mean-vs-threshold fallback.
    ApproximateProbability,

    /// Fewer samples than the statistic requires; reported as undefined.
    InsufficientData { statistic: String, n: usize },

    /// Observed sample count is below the power plan for the target effect.
    Underpowered { observed: u64, required: u64 },

    /// The minimum-exploration floor was binding for these arms.
    FloorApplied { arms: Vec<String> },

    /// Raw Beta scores summed to zero; traffic was split uniformly.
    UniformFallback,

    /// A gate check failed.
    GateViolation { check: String, detail: String },

    /// A baseline did not exist and was created from this run.
    BaselineBootstrapped { what: String },

    /// Drift beyond tolerance on one feature statistic.
    Drift { feature: String, detail: String },

    /// A promotion bundle was committed.
    Promoted { tag: String },

    /// A rollback trigger was suppressed by the freeze marker.
    FrozenNoop,

    /// An external command failed.
    CommandFailed { program: String, kind: String },
}

/// A single engine decision in a unified envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub source: DecisionSource,
    pub status: Status,
    /// Key numbers, printed in the summary line in key order.
    pub values: BTreeMap<String, f64>,
    /// Short string-valued fields (verdicts, reasons, tags).
    pub labels: BTreeMap<String, String>,
    pub notes: Vec<DecisionNote>,
}

impl Decision {
    pub fn new(source: DecisionSource, status: Status) -> Self {
        Self {
            source,
            status,
            values: BTreeMap::new(),
            labels: BTreeMap::new(),
            notes: Vec::new(),
        }
    }

    #[must_use]
    pub fn value(mut self, key: &str, v: f64) -> Self {
        self.values.insert(key.to_string(), v);
        self
    }

    #[must_use]
    pub fn label(mut self, key: &str, v: impl Into<String>) -> Self {
        self.labels.insert(key.to_string(), v.into());
        self
    }

    #[must_use]
    pub fn note(mut self, n: DecisionNote) -> Self {
        self.notes.push(n);
        self
    }

    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }

    /// One machine-parseable line: `status=<s> source=<c> k=v ...`.
    ///
    /// Labels come before numbers; both in key order. Undefined numbers print as `NaN`.
    #[must_use]
    pub fn summary_line(&self) -> String {
        let mut line = format!(
            "status={} source={}",
            self.status.as_str(),
            self.source.as_str()
        );
        for (k, v) in &self.labels {
            let _ = write!(line, " {k}={}", v.replace(char::is_whitespace, "_"));
        }
        for (k, v) in &self.values {
            if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e15 {
                let _ = write!(line, " {k}={}", *v as i64);
            } else if v.is_finite() {
                let _ = write!(line, " {k}={v:.6}");
            } else {
                let _ = write!(line, " {k}=NaN");
            }
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_line_is_stable_and_flat() {
        let d = Decision::new(DecisionSource::Sprt, Status::Ok)
            .label("verdict", Verdict::Accept.as_str())
            .value("total", 100.0)
            .value("log_lr", 9.150_5)
            .value("p", f64::NAN);
        assert_eq!(
            d.summary_line(),
            "status=ok source=sprt verdict=ACCEPT log_lr=9.150500 p=NaN total=100"
        );
    }

    #[test]
    fn labels_never_contain_spaces() {
        let d = Decision::new(DecisionSource::Gate, Status::Fail).label("detail", "a b\tc");
        assert!(d.summary_line().ends_with("detail=a_b_c"));
    }

    #[test]
    fn status_exit_codes() {
        assert_eq!(Status::Ok.exit_code(), 0);
        assert_eq!(Status::Fail.exit_code(), 1);
        assert_eq!(Status::Warn.exit_code(), 2);
    }

    #[test]
    fn verdict_terminality() {
        assert!(!Verdict::Continue.is_terminal());
        assert!(Verdict::Accept.is_terminal());
        assert!(Verdict::Reject.is_terminal());
    }
}
