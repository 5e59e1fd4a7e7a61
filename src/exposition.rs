//! Plain-text gauge exposition.
//!
//! ```text
//! # HELP <name> <description>
//! # TYPE <name> gauge
//! <name>{label="value",...} <number> [<timestamp_ms>]
//! ```
//!
//! Written once per cycle (atomically), read by a scraper. Undefined values
//! are emitted as `NaN` so "not enough data" stays distinguishable from zero.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use crate::error::Result;
use crate::store;

/// One labelled sample of a gauge.
#[derive(Debug, Clone, PartialEq)]
pub struct GaugeSample {
    pub labels: Vec<(String, String)>,
    pub value: f64,
    pub timestamp_ms: Option<i64>,
}

/// A gauge family.
#[derive(Debug, Clone, PartialEq)]
pub struct Gauge {
    pub name: String,
    pub help: String,
    pub samples: Vec<GaugeSample>,
}

impl Gauge {
    /// Append a sample. `None` is written as `NaN`.
    pub fn set(&mut self, labels: &[(&str, &str)], value: Option<f64>) -> &mut Self {
        self.samples.push(GaugeSample {
            labels: labels
                .iter()
                .map(|(k, v)| (sanitize_name(k), (*v).to_string()))
                .collect(),
            value: value.unwrap_or(f64::NAN),
            timestamp_ms: None,
        });
        self
    }

    /// Append a sample carrying an explicit timestamp.
    pub fn set_at(&mut self, labels: &[(&str, &str)], value: Option<f64>, timestamp_ms: i64) -> &mut Self {
        self.set(labels, value);
        if let Some(last) = self.samples.last_mut() {
            last.timestamp_ms = Some(timestamp_ms);
        }
        self
    }
}

/// A set of gauge families rendered together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Exposition {
    gauges: BTreeMap<String, Gauge>,
}

impl Exposition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the gauge family `name`.
    pub fn gauge(&mut self, name: &str, help: &str) -> &mut Gauge {
        let name = sanitize_name(name);
        self.gauges.entry(name.clone()).or_insert_with(|| Gauge {
            name,
            help: help.replace('\n', " "),
            samples: Vec::new(),
        })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.gauges.is_empty()
    }

    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for g in self.gauges.values() {
            let _ = writeln!(out, "# HELP {} {}", g.name, g.help);
            let _ = writeln!(out, "# TYPE {} gauge", g.name);
            for s in &g.samples {
                out.push_str(&g.name);
                if !s.labels.is_empty() {
                    out.push('{');
                    for (i, (k, v)) in s.labels.iter().enumerate() {
                        if i > 0 {
                            out.push(',');
                        }
                        let _ = write!(out, "{k}=\"{}\"", escape_label(v));
                    }
                    out.push('}');
                }
                let _ = write!(out, " {}", format_value(s.value));
                if let Some(ts) = s.timestamp_ms {
                    let _ = write!(out, " {ts}");
                }
                out.push('\n');
            }
        }
        out
    }

    /// Render and commit atomically to `path`.
    pub fn write(&self, path: &Path) -> Result<()> {
        store::write_atomic(path, self.render().as_bytes())
    }
}

fn sanitize_name(name: &str) -> String {
    let mut s: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == ':' { c } else { '_' })
        .collect();
    if s.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        s.insert(0, '_');
    }
    s
}

fn escape_label(v: &str) -> String {
    v.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

fn format_value(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v == f64::INFINITY {
        "+Inf".to_string()
    } else if v == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        format!("{v}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_help_type_and_labels() {
        let mut e = Exposition::new();
        e.gauge("pvalue_ks_stat", "KS statistic vs uniform")
            .set(&[("window", "2h")], Some(0.25))
            .set(&[("window", "24h")], None);
        let text = e.render();
        assert_eq!(
            text,
            "# HELP pvalue_ks_stat KS statistic vs uniform\n\
             # TYPE pvalue_ks_stat gauge\n\
             pvalue_ks_stat{window=\"2h\"} 0.25\n\
             pvalue_ks_stat{window=\"24h\"} NaN\n"
        );
    }

    #[test]
    fn timestamps_and_escaping() {
        let mut e = Exposition::new();
        e.gauge("x", "h").set_at(&[("arm", "a\"b")], Some(1.0), 1_700_000_000_000);
        assert!(e.render().contains("x{arm=\"a\\\"b\"} 1 1700000000000\n"));
    }

    #[test]
    fn names_are_sanitized() {
        let mut e = Exposition::new();
        e.gauge("9bad-name", "h").set(&[], Some(2.0));
        assert!(e.render().contains("_9bad_name 2\n"));
    }
}
