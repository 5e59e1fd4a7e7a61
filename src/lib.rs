//! `rollgate`: statistical decisions for safe rollouts.
//!
//! A new variant (model version, service build, config) is rolled out in
//! stages. At each stage automation needs a defensible answer to one of:
//!
//! - how much traffic should the candidate get? ([`BanditRouter`])
//! - is the evidence strong enough to stop the experiment? ([`SequentialTester`],
//!   [`BayesianTracker`], with [`PowerPlanner`] saying when to trust them)
//! - are the p-values we are basing this on even valid? ([`DistributionHealthChecker`])
//! - may this candidate be promoted? ([`evaluate_gate`], [`check_canary`],
//!   [`drift::check_against_baseline`], [`BundleStore::promote`])
//! - should we roll back right now? ([`RollbackMonitor`])
//!
//! Every component is a step function over small persisted state:
//! `(state, new observations) -> (state', Decision)`. State files are JSON and
//! committed atomically ([`store`]); a missing file is a fresh start, a corrupt
//! one is an error. Each step ends in a [`Decision`], which renders as one
//! machine-parseable line and maps onto the exit-code convention
//! (`0` ok, `1` fail, `2` warn, `3` hard failure).
//!
//! **Design constraints:**
//! - **No globals**: components own their config and RNG; callers wire them.
//! - **Undefined is not zero**: statistics without enough samples are `None`
//!   and render as `NaN`.
//! - **Violations are values**: a failed gate is a [`GateOutcome`], not an `Err`.
//! - **External effects behind traits**: [`CommandRunner`] for scripts,
//!   [`Notifier`] for operator messages, [`SignalSource`] for live signals.
//!
//! **Non-goals:**
//! - Not an experimentation platform (no UI, no experiment catalog).
//! - Not a training pipeline: metrics arrive from outside.
//!
//! # Approximations
//!
//! The KS p-value uses the asymptotic Kolmogorov distribution with Stephens'
//! small-sample correction, and the runs test uses its normal approximation.
//! Neither uses the exact small-sample distribution; both are reported as
//! diagnostics, never as pass/fail.

#![forbid(unsafe_code)]

mod error;
pub use error::{Error, Result};

mod decision;
pub use decision::*;

pub mod config;
pub use config::RolloutConfig;

pub mod stats;
pub mod store;

mod runner;
pub use runner::*;

pub mod exposition;
pub use exposition::Exposition;

mod power;
pub use power::*;

mod bandit;
pub use bandit::*;

mod sprt;
pub use sprt::*;

mod bayes;
pub use bayes::*;

mod health;
pub use health::*;

mod gate;
pub use gate::*;

mod canary;
pub use canary::*;

pub mod drift;
pub use drift::{DriftDecision, DriftTolerance, FeatureSummary};

mod bundle;
pub use bundle::*;

mod rollback;
pub use rollback::*;
