//! P-value distribution health.
//!
//! Under a well-calibrated test the p-values a pipeline emits should look like
//! `Uniform(0, 1)`: no pile-ups, no repeated values, no serial structure. This
//! module audits a raw sample log over a set of trailing windows and reports
//! the statistics as gauges. Nothing here is pass/fail; alerting belongs to
//! whoever scrapes the gauges.
//!
//! Windows are derived from the raw log on every run and never stored.
//! A statistic with too few samples is `None` (emitted as `NaN`), never zero.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::env_u64;
use crate::decision::{Decision, DecisionNote, DecisionSource, Status};
use crate::error::{Error, Result};
use crate::exposition::Exposition;
use crate::stats::{
    binned_entropy, clamp_p, ks_uniform, lag1_autocorrelation, runs_test, unique_ratio,
};

/// One observed p-value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PValueSample {
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl PValueSample {
    pub fn new(value: f64, timestamp: DateTime<Utc>) -> Self {
        Self { value, timestamp }
    }
}

/// A trailing window `(now - span, now]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthWindow {
    pub label: String,
    #[serde(with = "crate::config::secs")]
    pub span: Duration,
}

impl HealthWindow {
    pub fn new(label: impl Into<String>, span: Duration) -> Self {
        Self {
            label: label.into(),
            span,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthConfig {
    pub windows: Vec<HealthWindow>,
    /// Decimal places used by the unique-value ratio.
    pub precision: u32,
    /// Equal-width bins on `[0, 1]` for the entropy.
    pub bins: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            windows: vec![
                HealthWindow::new("2h", Duration::from_secs(2 * 3600)),
                HealthWindow::new("24h", Duration::from_secs(24 * 3600)),
            ],
            precision: 8,
            bins: 10,
        }
    }
}

impl HealthConfig {
    /// Defaults overlaid with `ROLLGATE_HEALTH_PRECISION`.
    pub fn from_env() -> Result<Self> {
        let mut c = Self::default();
        if let Some(p) = env_u64("ROLLGATE_HEALTH_PRECISION")? {
            if p > 15 {
                return Err(Error::config("ROLLGATE_HEALTH_PRECISION", "must be <= 15"));
            }
            c.precision = p as u32;
        }
        Ok(c)
    }
}

/// Statistics for one window. `None` means "not enough samples".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowReport {
    pub label: String,
    pub n: usize,
    pub ks_statistic: Option<f64>,
    pub ks_p_value: Option<f64>,
    pub unique_ratio: Option<f64>,
    pub entropy: Option<f64>,
    pub autocorrelation: Option<f64>,
    pub runs_z: Option<f64>,
    pub runs_p_value: Option<f64>,
}

impl WindowReport {
    fn undefined(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.ks_statistic.is_none() {
            out.push("ks");
        }
        if self.unique_ratio.is_none() {
            out.push("unique_ratio");
        }
        if self.entropy.is_none() {
            out.push("entropy");
        }
        if self.autocorrelation.is_none() {
            out.push("autocorrelation");
        }
        if self.runs_z.is_none() {
            out.push("runs");
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,
    pub windows: Vec<WindowReport>,
}

impl HealthReport {
    /// One gauge family per statistic, one sample per window.
    #[must_use]
    pub fn to_exposition(&self) -> Exposition {
        let ts = self.generated_at.timestamp_millis();
        let mut e = Exposition::new();
        for w in &self.windows {
            let l = [("window", w.label.as_str())];
            e.gauge("rollgate_pvalue_count", "P-values in window")
                .set_at(&l, Some(w.n as f64), ts);
            e.gauge("rollgate_pvalue_ks_stat", "KS statistic vs Uniform(0,1)")
                .set_at(&l, w.ks_statistic, ts);
            e.gauge(
                "rollgate_pvalue_ks_pvalue",
                "KS asymptotic p-value (Stephens-corrected; approximate)",
            )
            .set_at(&l, w.ks_p_value, ts);
            e.gauge("rollgate_pvalue_unique_ratio", "Distinct p-values after rounding")
                .set_at(&l, w.unique_ratio, ts);
            e.gauge("rollgate_pvalue_entropy", "Binned Shannon entropy (nats)")
                .set_at(&l, w.entropy, ts);
            e.gauge("rollgate_pvalue_autocorr_lag1", "Lag-1 autocorrelation")
                .set_at(&l, w.autocorrelation, ts);
            e.gauge("rollgate_pvalue_runs_z", "Runs test z-score around the median")
                .set_at(&l, w.runs_z, ts);
            e.gauge(
                "rollgate_pvalue_runs_pvalue",
                "Runs test two-sided p-value (normal approximation)",
            )
            .set_at(&l, w.runs_p_value, ts);
        }
        e
    }

    /// Always `Ok`: the checker reports, it does not judge.
    #[must_use]
    pub fn to_decision(&self) -> Decision {
        let mut d = Decision::new(DecisionSource::Health, Status::Ok)
            .value("windows", self.windows.len() as f64);
        for w in &self.windows {
            d = d
                .value(&format!("n_{}", w.label), w.n as f64)
                .value(&format!("ks_p_{}", w.label), w.ks_p_value.unwrap_or(f64::NAN))
                .value(
                    &format!("unique_{}", w.label),
                    w.unique_ratio.unwrap_or(f64::NAN),
                );
            for stat in w.undefined() {
                d = d.note(DecisionNote::InsufficientData {
                    statistic: format!("{stat}@{}", w.label),
                    n: w.n,
                });
            }
        }
        d
    }
}

/// Audits p-value logs against the configured windows.
#[derive(Debug, Clone, Default)]
pub struct DistributionHealthChecker {
    cfg: HealthConfig,
}

impl DistributionHealthChecker {
    pub fn new(cfg: HealthConfig) -> Self {
        Self { cfg }
    }

    #[must_use]
    pub fn config(&self) -> &HealthConfig {
        &self.cfg
    }

    /// Statistics for each configured window ending at `now`.
    #[must_use]
    pub fn check(&self, samples: &[PValueSample], now: DateTime<Utc>) -> HealthReport {
        let mut ordered: Vec<&PValueSample> = samples.iter().collect();
        ordered.sort_by_key(|s| s.timestamp);

        let windows = self
            .cfg
            .windows
            .iter()
            .map(|w| {
                let start = chrono::Duration::from_std(w.span)
                    .ok()
                    .and_then(|d| now.checked_sub_signed(d));
                let values: Vec<f64> = ordered
                    .iter()
                    .filter(|s| s.timestamp <= now && start.map_or(true, |st| s.timestamp > st))
                    .map(|s| s.value)
                    .collect();
                self.check_values(&w.label, &values)
            })
            .collect();

        HealthReport {
            generated_at: now,
            windows,
        }
    }

    /// Statistics for an already-selected, time-ordered set of values.
    #[must_use]
    pub fn check_values(&self, label: &str, values: &[f64]) -> WindowReport {
        let v: Vec<f64> = values.iter().map(|&x| clamp_p(x)).collect();
        let ks = ks_uniform(&v);
        let runs = runs_test(&v);
        let report = WindowReport {
            label: label.to_string(),
            n: v.len(),
            ks_statistic: ks.map(|k| k.statistic),
            ks_p_value: ks.map(|k| k.p_value),
            unique_ratio: unique_ratio(&v, self.cfg.precision),
            entropy: binned_entropy(&v, self.cfg.bins),
            autocorrelation: lag1_autocorrelation(&v),
            runs_z: runs.map(|r| r.z),
            runs_p_value: runs.map(|r| r.p_value),
        };
        debug!(
            window = label,
            n = report.n,
            ks_p = ?report.ks_p_value,
            unique_ratio = ?report.unique_ratio,
            "p-value window audited"
        );
        report
    }
}

/// Read a JSON-lines sample log (`{"value": .., "timestamp": ..}` per line).
///
/// A missing log is empty. Blank lines are skipped; an undecodable line is a
/// [`Error::MalformedState`] naming the line.
pub fn read_sample_log(path: &Path) -> Result<Vec<PValueSample>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "p-value log missing; treating as empty");
            return Ok(Vec::new());
        }
        Err(e) => return Err(Error::io("open", path, e)),
    };
    let mut out = Vec::new();
    for (i, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| Error::io("read", path, e))?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let s: PValueSample = serde_json::from_str(line).map_err(|e| Error::MalformedState {
            path: path.to_path_buf(),
            reason: format!("line {}: {e}", i + 1),
        })?;
        if !s.value.is_finite() {
            return Err(Error::MalformedState {
                path: path.to_path_buf(),
                reason: format!("line {}: non-finite p-value", i + 1),
            });
        }
        out.push(s);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::hours(h)
    }

    #[test]
    fn constant_values_look_unhealthy() {
        let c = DistributionHealthChecker::default();
        let r = c.check_values("all", &vec![0.5; 500]);
        assert!(r.ks_p_value.unwrap() < 1e-6);
        assert!(r.unique_ratio.unwrap() < 0.01);
        assert!(r.autocorrelation.is_none());
        assert!(r.runs_z.is_none());
    }

    #[test]
    fn too_few_samples_are_undefined_not_zero() {
        let c = DistributionHealthChecker::default();
        let r = c.check_values("w", &[0.3]);
        assert_eq!(r.n, 1);
        assert!(r.ks_statistic.is_none());
        assert!(r.unique_ratio.is_none());
        assert!(r.entropy.is_none());

        let r2 = c.check_values("w", &[0.3, 0.7]);
        assert!(r2.unique_ratio.is_some());
        assert!(r2.entropy.is_some());
        assert!(r2.ks_statistic.is_none());
    }

    #[test]
    fn windows_select_trailing_samples() {
        let now = at(48);
        let samples: Vec<PValueSample> = (0..48)
            .map(|h| PValueSample::new((h as f64 + 0.5) / 48.0, at(h + 1)))
            .collect();
        let r = DistributionHealthChecker::default().check(&samples, now);
        assert_eq!(r.windows[0].label, "2h");
        assert_eq!(r.windows[0].n, 2);
        assert_eq!(r.windows[1].n, 24);
    }

    #[test]
    fn exposition_has_nan_for_undefined() {
        let now = at(10);
        let r = DistributionHealthChecker::default().check(&[PValueSample::new(0.2, now)], now);
        let text = r.to_exposition().render();
        assert!(text.contains("rollgate_pvalue_ks_stat{window=\"2h\"} NaN"));
        assert!(text.contains("# TYPE rollgate_pvalue_entropy gauge"));
        let d = r.to_decision();
        assert_eq!(d.status, Status::Ok);
        assert!(d
            .notes
            .iter()
            .any(|n| matches!(n, DecisionNote::InsufficientData { n: 1, .. })));
    }

    #[test]
    fn sample_log_round_trip_and_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pvalues.jsonl");
        assert!(read_sample_log(&path).unwrap().is_empty());

        std::fs::write(
            &path,
            "{\"value\":0.25,\"timestamp\":\"2026-01-01T00:00:00Z\"}\n\n\
             {\"value\":0.75,\"timestamp\":\"2026-01-01T01:00:00Z\"}\n",
        )
        .unwrap();
        let s = read_sample_log(&path).unwrap();
        assert_eq!(s.len(), 2);
        assert_eq!(s[1].value, 0.75);

        std::fs::write(&path, "{\"value\":0.25}\n").unwrap();
        let err = read_sample_log(&path).unwrap_err();
        assert!(err.to_string().contains("line 1"));
        assert_eq!(err.exit_code(), 3);
    }
}
