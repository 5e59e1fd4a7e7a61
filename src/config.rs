//! Environment-variable overrides.
//!
//! Each component config has a `Default` carrying the documented defaults and a
//! `from_env()` that overlays `ROLLGATE_*` variables. An unset variable keeps the
//! default; a set but unparseable one is an [`Error::InvalidConfig`].

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bandit::BanditConfig;
use crate::bayes::BayesConfig;
use crate::canary::CanaryThresholds;
use crate::drift::DriftTolerance;
use crate::error::{Error, Result};
use crate::health::HealthConfig;
use crate::power::PowerPlanner;
use crate::rollback::RollbackConfig;
use crate::runner::DEFAULT_COMMAND_TIMEOUT;
use crate::sprt::SprtConfig;

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| Error::config(name, format!("{raw:?}: {e}"))),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(env::VarError::NotUnicode(_)) => Err(Error::config(name, "not valid unicode")),
    }
}

/// Read an optional finite `f64` override.
pub fn env_f64(name: &str) -> Result<Option<f64>> {
    match env_parse::<f64>(name)? {
        Some(v) if !v.is_finite() => Err(Error::config(name, "must be finite")),
        other => Ok(other),
    }
}

/// Read an optional `u64` override.
pub fn env_u64(name: &str) -> Result<Option<u64>> {
    env_parse::<u64>(name)
}

/// Read an optional whole-seconds duration override.
pub fn env_secs(name: &str) -> Result<Option<Duration>> {
    Ok(env_u64(name)?.map(Duration::from_secs))
}

/// Every component's configuration, as used by the `rollgate` binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutConfig {
    pub bandit: BanditConfig,
    pub sprt: SprtConfig,
    pub bayes: BayesConfig,
    pub health: HealthConfig,
    pub power: PowerPlanner,
    pub canary: CanaryThresholds,
    pub drift: DriftTolerance,
    pub rollback: RollbackConfig,
    /// Bound on any external command (canary evaluator, rollback scripts).
    #[serde(with = "secs")]
    pub command_timeout: Duration,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            bandit: BanditConfig::default(),
            sprt: SprtConfig::default(),
            bayes: BayesConfig::default(),
            health: HealthConfig::default(),
            power: PowerPlanner::default(),
            canary: CanaryThresholds::default(),
            drift: DriftTolerance::default(),
            rollback: RollbackConfig::default(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

impl RolloutConfig {
    /// Defaults overlaid with every `ROLLGATE_*` override.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            bandit: BanditConfig::from_env()?,
            sprt: SprtConfig::from_env()?,
            bayes: BayesConfig::from_env()?,
            health: HealthConfig::from_env()?,
            power: PowerPlanner::from_env()?,
            canary: CanaryThresholds::from_env()?,
            drift: DriftTolerance::from_env()?,
            rollback: RollbackConfig::from_env()?,
            command_timeout: env_secs("ROLLGATE_COMMAND_TIMEOUT_SECS")?
                .unwrap_or(DEFAULT_COMMAND_TIMEOUT),
        })
    }
}

/// Serde adapter storing a `Duration` as whole seconds.
pub(crate) mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test uses its own variable name; the process environment is shared
    // across test threads.

    #[test]
    fn unset_variable_is_none() {
        assert_eq!(env_f64("ROLLGATE_TEST_UNSET_F64").unwrap(), None);
    }

    #[test]
    fn unparseable_variable_is_an_error() {
        env::set_var("ROLLGATE_TEST_BAD_F64", "zero point one");
        let err = env_f64("ROLLGATE_TEST_BAD_F64").unwrap_err();
        assert!(err.to_string().contains("ROLLGATE_TEST_BAD_F64"));
        env::remove_var("ROLLGATE_TEST_BAD_F64");
    }

    #[test]
    fn non_finite_is_rejected() {
        env::set_var("ROLLGATE_TEST_INF_F64", "inf");
        assert!(env_f64("ROLLGATE_TEST_INF_F64").is_err());
        env::remove_var("ROLLGATE_TEST_INF_F64");
    }

    #[test]
    fn seconds_parse() {
        env::set_var("ROLLGATE_TEST_SECS", "42");
        assert_eq!(
            env_secs("ROLLGATE_TEST_SECS").unwrap(),
            Some(Duration::from_secs(42))
        );
        env::remove_var("ROLLGATE_TEST_SECS");
    }

    #[test]
    fn defaults_match_documented_values() {
        let c = RolloutConfig::default();
        assert_eq!(c.bandit.min_explore, 0.1);
        assert_eq!(c.sprt.p0, 0.6);
        assert_eq!(c.bayes.declare_prob, 0.8);
        assert_eq!(c.drift.na_delta, 0.02);
        assert_eq!(c.rollback.duration, Duration::from_secs(300));
        assert_eq!(c.command_timeout, Duration::from_secs(300));
    }
}
