//! Sustained-breach rollback watcher.
//!
//! The condition is met when `good_ratio < 1.0` and `burn_rate > burn_threshold`
//! at the same time. State machine per [`RollbackMonitor::step`]:
//!
//! - not started -> started: first snapshot meeting the condition
//! - started -> not started: condition clears before `duration` elapsed
//! - started -> triggered: condition held continuously for `duration`
//!
//! Triggering writes the freeze marker *before* running anything. While the
//! marker exists every step is a no-op, so a trigger happens once per freeze
//! no matter how often the monitor is invoked. An operator lifts the freeze
//! with [`RollbackMonitor::clear_freeze`].

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::{env_f64, env_secs, env_u64};
use crate::decision::{Decision, DecisionNote, DecisionSource, Status};
use crate::error::{Error, Result};
use crate::runner::{CommandRunner, CommandSpec, Notification, Notifier, DEFAULT_COMMAND_TIMEOUT};
use crate::store;

const STOP_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackConfig {
    /// Burn rate above which (with `good_ratio < 1`) the condition is met.
    pub burn_threshold: f64,
    /// How long the condition must hold before triggering.
    #[serde(with = "crate::config::secs")]
    pub duration: Duration,
    /// Poll interval of [`RollbackMonitor::run`].
    #[serde(with = "crate::config::secs")]
    pub interval: Duration,
    pub rollback_cmd: Option<CommandSpec>,
    /// Tried once when the rollback command fails.
    pub fallback_cmd: Option<CommandSpec>,
    pub freeze_marker: PathBuf,
    pub state_path: PathBuf,
    #[serde(with = "crate::config::secs")]
    pub command_timeout: Duration,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            burn_threshold: 0.05,
            duration: Duration::from_secs(5 * 60),
            interval: Duration::from_secs(60),
            rollback_cmd: None,
            fallback_cmd: None,
            freeze_marker: PathBuf::from("rollback.freeze"),
            state_path: PathBuf::from("rollback_state.json"),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

impl RollbackConfig {
    /// Defaults overlaid with `ROLLGATE_ROLLBACK_*` and `ROLLGATE_COMMAND_TIMEOUT_SECS`.
    pub fn from_env() -> Result<Self> {
        let mut c = Self::default();
        if let Some(v) = env_f64("ROLLGATE_ROLLBACK_BURN_RATE")? {
            c.burn_threshold = v;
        }
        if let Some(m) = env_u64("ROLLGATE_ROLLBACK_DURATION_MINUTES")? {
            c.duration = Duration::from_secs(m.saturating_mul(60));
        }
        if let Some(d) = env_secs("ROLLGATE_ROLLBACK_INTERVAL_SECS")? {
            c.interval = d;
        }
        if let Some(d) = env_secs("ROLLGATE_COMMAND_TIMEOUT_SECS")? {
            c.command_timeout = d;
        }
        if let Ok(line) = std::env::var("ROLLGATE_ROLLBACK_CMD") {
            c.rollback_cmd = CommandSpec::parse(&line);
        }
        if let Ok(line) = std::env::var("ROLLGATE_ROLLBACK_FALLBACK_CMD") {
            c.fallback_cmd = CommandSpec::parse(&line);
        }
        if c.interval.is_zero() {
            return Err(Error::config("ROLLGATE_ROLLBACK_INTERVAL_SECS", "must be > 0"));
        }
        Ok(c)
    }
}

/// Live signals at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// Fraction of recent checks that were good, in `[0, 1]`.
    pub good_ratio: f64,
    /// Fraction of the error budget burned over the trailing window.
    pub burn_rate: f64,
}

impl HealthSnapshot {
    #[must_use]
    pub fn condition_met(&self, burn_threshold: f64) -> bool {
        self.good_ratio < 1.0 && self.burn_rate > burn_threshold
    }
}

/// Where snapshots come from.
pub trait SignalSource {
    fn snapshot(&mut self) -> Result<HealthSnapshot>;
}

/// Reads a snapshot JSON object written by an external monitor.
#[derive(Debug, Clone)]
pub struct JsonFileSignal {
    path: PathBuf,
}

impl JsonFileSignal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SignalSource for JsonFileSignal {
    fn snapshot(&mut self) -> Result<HealthSnapshot> {
        store::load_json(&self.path)?.ok_or_else(|| Error::MalformedState {
            path: self.path.clone(),
            reason: "signal file missing".into(),
        })
    }
}

/// Persisted condition tracking.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RollbackState {
    pub condition_start_time: Option<DateTime<Utc>>,
    pub last_snapshot: Option<HealthSnapshot>,
    #[serde(default)]
    pub last_triggered: Option<DateTime<Utc>>,
}

/// Content of the freeze marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreezeMarker {
    pub triggered_at: DateTime<Utc>,
    pub reason: String,
}

/// What one step did.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum StepOutcome {
    /// Condition not met.
    Clear,
    /// Condition met, not yet for long enough.
    Pending { since: DateTime<Utc>, elapsed_secs: i64 },
    /// Rollback was triggered on this step.
    Triggered { succeeded: bool, via_fallback: bool },
    /// Freeze marker present; nothing was done.
    Frozen,
}

impl StepOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clear => "clear",
            Self::Pending { .. } => "pending",
            Self::Triggered { .. } => "triggered",
            Self::Frozen => "frozen",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RollbackMonitor {
    cfg: RollbackConfig,
    state: RollbackState,
}

impl RollbackMonitor {
    pub fn new(cfg: RollbackConfig) -> Self {
        Self {
            cfg,
            state: RollbackState::default(),
        }
    }

    /// Resume from `cfg.state_path` (missing file starts fresh).
    pub fn load(cfg: RollbackConfig) -> Result<Self> {
        let state = store::load_or_default(&cfg.state_path)?;
        Ok(Self { cfg, state })
    }

    #[must_use]
    pub fn state(&self) -> &RollbackState {
        &self.state
    }

    #[must_use]
    pub fn config(&self) -> &RollbackConfig {
        &self.cfg
    }

    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.cfg.freeze_marker.exists()
    }

    /// Remove the freeze marker. Returns whether one was present.
    pub fn clear_freeze(&self) -> Result<bool> {
        clear_freeze_marker(&self.cfg.freeze_marker)
    }

    fn persist(&self) -> Result<()> {
        store::save_json(&self.cfg.state_path, &self.state)
    }

    /// Advance the state machine with one snapshot taken at `now`.
    pub fn step<R, N>(
        &mut self,
        now: DateTime<Utc>,
        snapshot: HealthSnapshot,
        runner: &mut R,
        notifier: &mut N,
    ) -> Result<StepOutcome>
    where
        R: CommandRunner + ?Sized,
        N: Notifier + ?Sized,
    {
        self.state.last_snapshot = Some(snapshot);

        if self.is_frozen() {
            debug!(marker = %self.cfg.freeze_marker.display(), "freeze marker present; skipping");
            self.persist()?;
            return Ok(StepOutcome::Frozen);
        }

        if !snapshot.condition_met(self.cfg.burn_threshold) {
            if let Some(since) = self.state.condition_start_time.take() {
                info!(%since, "rollback condition cleared before duration");
            }
            self.persist()?;
            return Ok(StepOutcome::Clear);
        }

        let since = *self.state.condition_start_time.get_or_insert_with(|| {
            warn!(
                good_ratio = snapshot.good_ratio,
                burn_rate = snapshot.burn_rate,
                "rollback condition started"
            );
            now
        });
        let elapsed = now.signed_duration_since(since);
        let sustained = chrono::Duration::from_std(self.cfg.duration).map_or(false, |d| elapsed >= d);
        if !sustained {
            self.persist()?;
            return Ok(StepOutcome::Pending {
                since,
                elapsed_secs: elapsed.num_seconds(),
            });
        }

        let reason = format!(
            "good_ratio={:.4} burn_rate={:.4} sustained {}s",
            snapshot.good_ratio,
            snapshot.burn_rate,
            elapsed.num_seconds()
        );
        store::save_json(
            &self.cfg.freeze_marker,
            &FreezeMarker {
                triggered_at: now,
                reason: reason.clone(),
            },
        )?;
        self.state.condition_start_time = None;
        self.state.last_triggered = Some(now);
        self.persist()?;

        error!(%reason, "rollback triggered");
        notifier.notify(&Notification::RollbackTriggered { reason });
        let outcome = self.execute(runner, notifier);
        Ok(outcome)
    }

    fn execute<R, N>(&self, runner: &mut R, notifier: &mut N) -> StepOutcome
    where
        R: CommandRunner + ?Sized,
        N: Notifier + ?Sized,
    {
        if self.attempt(self.cfg.rollback_cmd.as_ref(), runner, "rollback") {
            notifier.notify(&Notification::RollbackSucceeded { via_fallback: false });
            return StepOutcome::Triggered {
                succeeded: true,
                via_fallback: false,
            };
        }
        if self.attempt(self.cfg.fallback_cmd.as_ref(), runner, "fallback") {
            notifier.notify(&Notification::RollbackSucceeded { via_fallback: true });
            return StepOutcome::Triggered {
                succeeded: true,
                via_fallback: true,
            };
        }
        error!("rollback and fallback both failed");
        notifier.notify(&Notification::RollbackFailed {
            detail: "rollback and fallback both failed".into(),
        });
        StepOutcome::Triggered {
            succeeded: false,
            via_fallback: true,
        }
    }

    fn attempt<R>(&self, spec: Option<&CommandSpec>, runner: &mut R, what: &str) -> bool
    where
        R: CommandRunner + ?Sized,
    {
        let Some(spec) = spec else {
            warn!(what, "no command configured");
            return false;
        };
        match runner.run(spec, self.cfg.command_timeout) {
            Ok(out) if out.success() => {
                info!(what, program = %spec.program, "rollback procedure succeeded");
                true
            }
            Ok(out) => {
                warn!(
                    what,
                    program = %spec.program,
                    kind = out.failure_kind(),
                    stderr_tail = out.stderr_tail(),
                    stdout_tail = out.stdout_tail(),
                    "rollback procedure failed"
                );
                false
            }
            Err(e) => {
                warn!(what, program = %spec.program, error = %e, "rollback procedure could not start");
                false
            }
        }
    }

    /// Poll `source` every `interval` until `stop` is set. A cycle in flight
    /// always completes; signal read failures skip the cycle.
    pub fn run<S, R, N>(
        &mut self,
        source: &mut S,
        runner: &mut R,
        notifier: &mut N,
        stop: &AtomicBool,
    ) -> Result<()>
    where
        S: SignalSource + ?Sized,
        R: CommandRunner + ?Sized,
        N: Notifier + ?Sized,
    {
        info!(interval_secs = self.cfg.interval.as_secs(), "rollback monitor started");
        while !stop.load(Ordering::SeqCst) {
            match source.snapshot() {
                Ok(s) => {
                    let out = self.step(Utc::now(), s, runner, notifier)?;
                    debug!(phase = out.as_str(), "rollback cycle done");
                }
                Err(e) => warn!(error = %e, "signal read failed; skipping cycle"),
            }
            sleep_unless_stopped(self.cfg.interval, stop);
        }
        info!("rollback monitor stopped");
        Ok(())
    }

    #[must_use]
    pub fn to_decision(&self, outcome: &StepOutcome) -> Decision {
        let status = match outcome {
            StepOutcome::Clear | StepOutcome::Frozen => Status::Ok,
            StepOutcome::Pending { .. } => Status::Warn,
            StepOutcome::Triggered { succeeded: true, .. } => Status::Ok,
            StepOutcome::Triggered { succeeded: false, .. } => Status::Fail,
        };
        let mut d = Decision::new(DecisionSource::Rollback, status)
            .label("phase", outcome.as_str())
            .value("burn_threshold", self.cfg.burn_threshold);
        if let Some(s) = self.state.last_snapshot {
            d = d.value("good_ratio", s.good_ratio).value("burn_rate", s.burn_rate);
        }
        match *outcome {
            StepOutcome::Pending { elapsed_secs, .. } => {
                d = d.value("elapsed_secs", elapsed_secs as f64);
            }
            StepOutcome::Triggered {
                succeeded,
                via_fallback,
            } => {
                d = d.label("via_fallback", via_fallback.to_string());
                if !succeeded {
                    d = d.note(DecisionNote::CommandFailed {
                        program: "rollback+fallback".into(),
                        kind: "failed".into(),
                    });
                }
            }
            StepOutcome::Frozen => d = d.note(DecisionNote::FrozenNoop),
            StepOutcome::Clear => {}
        }
        d
    }
}

/// Remove a freeze marker. Returns whether one was present.
pub fn clear_freeze_marker(path: &Path) -> Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            info!(marker = %path.display(), "freeze cleared");
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::io("remove_freeze", path, e)),
    }
}

fn sleep_unless_stopped(total: Duration, stop: &AtomicBool) {
    let mut left = total;
    while !left.is_zero() && !stop.load(Ordering::SeqCst) {
        let nap = left.min(STOP_POLL);
        thread::sleep(nap);
        left = left.saturating_sub(nap);
    }
}
