//! Feature drift between a stored baseline snapshot and the current data.
//!
//! Drift is advisory: it never blocks a promotion on its own, but it turns an
//! otherwise clean run into a soft warning (exit code `2`).

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::env_f64;
use crate::decision::{Decision, DecisionNote, DecisionSource, Status};
use crate::error::{Error, Result};
use crate::store;

/// Drift tolerances.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DriftTolerance {
    /// Max absolute change in a column's NA rate.
    pub na_delta: f64,
    /// Max absolute change in a column's outlier rate.
    pub outlier_delta: f64,
    /// Max ratio (larger / smaller) between baseline and current target IQR.
    pub iqr_ratio: f64,
}

impl Default for DriftTolerance {
    fn default() -> Self {
        Self {
            na_delta: 0.02,
            outlier_delta: 0.10,
            iqr_ratio: 1.15,
        }
    }
}

impl DriftTolerance {
    /// Defaults overlaid with `ROLLGATE_DRIFT_NA_DELTA`, `ROLLGATE_DRIFT_OUTLIER_DELTA`
    /// and `ROLLGATE_DRIFT_IQR_RATIO`.
    pub fn from_env() -> Result<Self> {
        let mut t = Self::default();
        if let Some(v) = env_f64("ROLLGATE_DRIFT_NA_DELTA")? {
            t.na_delta = v;
        }
        if let Some(v) = env_f64("ROLLGATE_DRIFT_OUTLIER_DELTA")? {
            t.outlier_delta = v;
        }
        if let Some(v) = env_f64("ROLLGATE_DRIFT_IQR_RATIO")? {
            t.iqr_ratio = v;
        }
        t.validate()?;
        Ok(t)
    }

    pub fn validate(&self) -> Result<()> {
        if self.na_delta < 0.0 || self.outlier_delta < 0.0 {
            return Err(Error::config("drift", "deltas must be non-negative"));
        }
        if self.iqr_ratio < 1.0 {
            return Err(Error::config("iqr_ratio", format!("{} < 1", self.iqr_ratio)));
        }
        Ok(())
    }
}

/// Per-column data-quality snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureSummary {
    pub na_rate: BTreeMap<String, f64>,
    pub outlier_rate: BTreeMap<String, f64>,
    /// Interquartile range of the target column, if one was named and had data.
    pub target_iqr: Option<f64>,
}

impl FeatureSummary {
    /// Summarize raw numeric columns. Non-finite cells count as NA; outliers
    /// are finite values outside the `1.5 * IQR` fences.
    pub fn from_columns(columns: &BTreeMap<String, Vec<f64>>, target: Option<&str>) -> Self {
        let mut s = Self::default();
        for (name, col) in columns {
            let mut finite: Vec<f64> = col.iter().copied().filter(|x| x.is_finite()).collect();
            finite.sort_by(f64::total_cmp);
            let na = if col.is_empty() {
                0.0
            } else {
                (col.len() - finite.len()) as f64 / col.len() as f64
            };
            s.na_rate.insert(name.clone(), na);
            s.outlier_rate.insert(name.clone(), outlier_rate(&finite));
            if target == Some(name.as_str()) {
                s.target_iqr = iqr(&finite);
            }
        }
        s
    }
}

/// Linear-interpolation quantile of sorted data.
fn quantile_sorted(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

fn iqr(sorted: &[f64]) -> Option<f64> {
    Some(quantile_sorted(sorted, 0.75)? - quantile_sorted(sorted, 0.25)?)
}

fn outlier_rate(sorted: &[f64]) -> f64 {
    let (Some(q1), Some(q3)) = (quantile_sorted(sorted, 0.25), quantile_sorted(sorted, 0.75)) else {
        return 0.0;
    };
    let fence = 1.5 * (q3 - q1);
    let (lo, hi) = (q1 - fence, q3 + fence);
    sorted.iter().filter(|&&x| x < lo || x > hi).count() as f64 / sorted.len() as f64
}

/// Which statistic drifted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftKind {
    NaRate,
    OutlierRate,
    TargetIqr,
}

impl DriftKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NaRate => "na_rate",
            Self::OutlierRate => "outlier_rate",
            Self::TargetIqr => "target_iqr",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftFinding {
    pub feature: String,
    pub kind: DriftKind,
    pub baseline: f64,
    pub current: f64,
}

impl DriftFinding {
    #[must_use]
    pub fn detail(&self) -> String {
        format!(
            "{} baseline={:.4} current={:.4}",
            self.kind.as_str(),
            self.baseline,
            self.current
        )
    }
}

/// Drift comparison output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriftDecision {
    pub findings: Vec<DriftFinding>,
    /// Columns present in both snapshots.
    pub compared: usize,
    /// No baseline existed; the current snapshot became the baseline.
    pub bootstrapped: bool,
}

impl DriftDecision {
    #[must_use]
    pub fn drifted(&self) -> bool {
        !self.findings.is_empty()
    }

    /// `Warn` when anything drifted, else `Ok`.
    #[must_use]
    pub fn to_decision(&self) -> Decision {
        let status = if self.drifted() { Status::Warn } else { Status::Ok };
        let mut d = Decision::new(DecisionSource::Gate, status)
            .label("check", "drift")
            .value("drift_findings", self.findings.len() as f64)
            .value("drift_compared", self.compared as f64);
        if self.bootstrapped {
            d = d.note(DecisionNote::BaselineBootstrapped {
                what: "feature_summary".into(),
            });
        }
        for f in &self.findings {
            d = d.note(DecisionNote::Drift {
                feature: f.feature.clone(),
                detail: f.detail(),
            });
        }
        d
    }
}

/// Ratio `max / min` of two spreads; `1` when both are zero, infinite when one is.
fn spread_ratio(a: f64, b: f64) -> f64 {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    if hi <= 0.0 {
        1.0
    } else if lo <= 0.0 {
        f64::INFINITY
    } else {
        hi / lo
    }
}

/// Compare two snapshots column by column. Columns missing from either side are skipped.
#[must_use]
pub fn compare(baseline: &FeatureSummary, current: &FeatureSummary, tol: &DriftTolerance) -> DriftDecision {
    let mut out = DriftDecision::default();
    for (col, &cur_na) in &current.na_rate {
        let Some(&base_na) = baseline.na_rate.get(col) else {
            continue;
        };
        out.compared += 1;
        if (cur_na - base_na).abs() > tol.na_delta {
            out.findings.push(DriftFinding {
                feature: col.clone(),
                kind: DriftKind::NaRate,
                baseline: base_na,
                current: cur_na,
            });
        }
        if let (Some(&b), Some(&c)) = (baseline.outlier_rate.get(col), current.outlier_rate.get(col)) {
            if (c - b).abs() > tol.outlier_delta {
                out.findings.push(DriftFinding {
                    feature: col.clone(),
                    kind: DriftKind::OutlierRate,
                    baseline: b,
                    current: c,
                });
            }
        }
    }
    if let (Some(b), Some(c)) = (baseline.target_iqr, current.target_iqr) {
        if spread_ratio(b, c) > tol.iqr_ratio {
            out.findings.push(DriftFinding {
                feature: "target".into(),
                kind: DriftKind::TargetIqr,
                baseline: b,
                current: c,
            });
        }
    }
    for f in &out.findings {
        warn!(feature = %f.feature, kind = f.kind.as_str(), baseline = f.baseline, current = f.current, "drift detected");
    }
    out
}

/// Compare `current` against the baseline stored at `path`, creating the
/// baseline from `current` when none exists.
pub fn check_against_baseline(
    path: &Path,
    current: &FeatureSummary,
    tol: &DriftTolerance,
) -> Result<DriftDecision> {
    match store::load_json::<FeatureSummary>(path)? {
        Some(baseline) => Ok(compare(&baseline, current, tol)),
        None => {
            store::save_json(path, current)?;
            info!(path = %path.display(), "drift baseline bootstrapped");
            Ok(DriftDecision {
                findings: Vec::new(),
                compared: current.na_rate.len(),
                bootstrapped: true,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(pairs: &[(&str, Vec<f64>)]) -> BTreeMap<String, Vec<f64>> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn summary_counts_na_and_outliers() {
        let mut x: Vec<f64> = (0..20).map(f64::from).collect();
        x.push(f64::NAN);
        x.push(1000.0);
        let s = FeatureSummary::from_columns(&cols(&[("x", x)]), Some("x"));
        assert!((s.na_rate["x"] - 1.0 / 22.0).abs() < 1e-12);
        assert!((s.outlier_rate["x"] - 1.0 / 21.0).abs() < 1e-12);
        assert!(s.target_iqr.unwrap() > 0.0);
    }

    #[test]
    fn identical_snapshots_do_not_drift() {
        let s = FeatureSummary::from_columns(&cols(&[("a", vec![1.0, 2.0, 3.0, 4.0])]), Some("a"));
        let d = compare(&s, &s, &DriftTolerance::default());
        assert!(!d.drifted());
        assert_eq!(d.compared, 1);
        assert_eq!(d.to_decision().exit_code(), 0);
    }

    #[test]
    fn na_and_iqr_drift_are_flagged() {
        let base = FeatureSummary {
            na_rate: [("a".to_string(), 0.01)].into(),
            outlier_rate: [("a".to_string(), 0.02)].into(),
            target_iqr: Some(1.0),
        };
        let cur = FeatureSummary {
            na_rate: [("a".to_string(), 0.05)].into(),
            outlier_rate: [("a".to_string(), 0.03)].into(),
            target_iqr: Some(1.2),
        };
        let d = compare(&base, &cur, &DriftTolerance::default());
        let kinds: Vec<DriftKind> = d.findings.iter().map(|f| f.kind).collect();
        assert_eq!(kinds, vec![DriftKind::NaRate, DriftKind::TargetIqr]);
        assert_eq!(d.to_decision().exit_code(), 2);
    }

    #[test]
    fn collapsed_spread_is_drift() {
        assert_eq!(spread_ratio(0.0, 0.0), 1.0);
        assert!(spread_ratio(0.0, 0.5).is_infinite());
        assert!((spread_ratio(2.0, 1.0) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn missing_baseline_bootstraps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drift_baseline.json");
        let cur = FeatureSummary::from_columns(&cols(&[("a", vec![1.0, 2.0])]), None);
        let first = check_against_baseline(&path, &cur, &DriftTolerance::default()).unwrap();
        assert!(first.bootstrapped);
        assert!(path.exists());
        let second = check_against_baseline(&path, &cur, &DriftTolerance::default()).unwrap();
        assert!(!second.bootstrapped);
        assert!(!second.drifted());
    }
}
