//! `rollgate` command-line front end.
//!
//! Each subcommand runs one engine step, prints a single summary line on
//! stdout and exits with the decision's code (`0` ok, `1` fail, `2` warn,
//! `3` hard failure). Logs go to stderr, filtered by `RUST_LOG`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use rollgate::drift::{self, DriftTolerance, FeatureSummary};
use rollgate::{
    check_canary, evaluate_gate, fetch_metrics, read_sample_log, store, ArmCounts, BanditRouter,
    BayesianTracker, BundleStore, CanaryMetrics, CommandSpec, Decision, DecisionSource,
    DistributionHealthChecker, Error, GateMetrics, GateThresholds, JsonFileSignal, LogNotifier,
    Notification, Notifier, ProcessRunner, Result, RollbackMonitor, RolloutConfig,
    SequentialTester, SignalSource, Status,
};

#[derive(Parser)]
#[command(name = "rollgate")]
#[command(version, about = "Statistical safe-rollout decisions", long_about = None)]
struct Cli {
    /// Write the full decision as JSON to this path
    #[arg(long, global = true)]
    report: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute a Thompson-sampling traffic split
    Allocate {
        /// Arm ids, comma-separated
        #[arg(long, value_delimiter = ',', required = true)]
        arms: Vec<String>,
        /// JSON map of arm id to {"success": n, "fail": n}
        #[arg(long)]
        counts: Option<PathBuf>,
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
    /// Feed outcomes into the sequential probability ratio test
    Sprt {
        #[arg(long, default_value = "sprt_state.json")]
        state: PathBuf,
        #[arg(long, default_value_t = 0)]
        green: u64,
        #[arg(long, default_value_t = 0)]
        total: u64,
        /// Effect size used to flag underpowered verdicts
        #[arg(long, default_value_t = 0.05)]
        effect: f64,
        /// Discard the persisted counts before applying this batch
        #[arg(long)]
        reset: bool,
    },
    /// Feed outcomes into the Bayesian progress tracker
    Bayes {
        #[arg(long, default_value = "bayes_state.json")]
        state: PathBuf,
        #[arg(long, default_value_t = 0)]
        green: u64,
        #[arg(long, default_value_t = 0)]
        total: u64,
    },
    /// Audit a p-value log and write gauges
    Health {
        /// JSON-lines log of {"value", "timestamp"}
        #[arg(long)]
        log: PathBuf,
        /// Exposition file to (atomically) rewrite
        #[arg(long)]
        metrics: Option<PathBuf>,
        /// Evaluate windows as of this RFC 3339 instant instead of now
        #[arg(long)]
        now: Option<DateTime<Utc>>,
    },
    /// Print the sample-size table
    Power {
        /// Effect sizes, comma-separated (overrides ROLLGATE_POWER_EFFECTS)
        #[arg(long, value_delimiter = ',')]
        effects: Vec<f64>,
    },
    /// Evaluate a candidate and promote it on pass
    Gate {
        /// Candidate GateMetrics JSON
        #[arg(long)]
        metrics: PathBuf,
        /// Promotion root (bundles and pointers)
        #[arg(long)]
        root: PathBuf,
        /// GateThresholds JSON; documented defaults when absent
        #[arg(long)]
        thresholds: Option<PathBuf>,
        /// Artifact to include in the bundle (repeatable)
        #[arg(long = "artifact")]
        artifacts: Vec<PathBuf>,
        /// Canary evaluator command line; prints {"r2", "mse"} on stdout
        #[arg(long)]
        canary_cmd: Option<String>,
        #[arg(long, default_value = "canary_baseline.json")]
        canary_baseline: PathBuf,
        /// JSON map of column name to values (null = NA)
        #[arg(long)]
        drift_columns: Option<PathBuf>,
        /// Column whose IQR is tracked
        #[arg(long)]
        drift_target: Option<String>,
        #[arg(long, default_value = "drift_baseline.json")]
        drift_baseline: PathBuf,
        /// Evaluate only; never write a bundle
        #[arg(long)]
        dry_run: bool,
    },
    /// Run the rollback monitor
    Rollback {
        /// JSON snapshot {"good_ratio", "burn_rate"} maintained by the live monitor
        #[arg(long)]
        signal: PathBuf,
        /// Keep polling until Ctrl-C instead of running one step
        #[arg(long)]
        watch: bool,
        /// Remove the freeze marker and exit
        #[arg(long)]
        clear_freeze: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let outcome = RolloutConfig::from_env().and_then(|cfg| dispatch(&cli, cfg));
    match outcome {
        Ok(decision) => {
            if let Some(path) = &cli.report {
                if let Err(e) = store::save_json(path, &decision) {
                    return fail(&e);
                }
            }
            println!("{}", decision.summary_line());
            ExitCode::from(decision.exit_code() as u8)
        }
        Err(e) => fail(&e),
    }
}

fn fail(e: &Error) -> ExitCode {
    error!(error = %e, "rollgate step failed");
    println!(
        "status=error exit={} error={}",
        e.exit_code(),
        e.to_string().replace(char::is_whitespace, "_")
    );
    ExitCode::from(e.exit_code() as u8)
}

fn dispatch(cli: &Cli, cfg: RolloutConfig) -> Result<Decision> {
    match &cli.command {
        Commands::Allocate { arms, counts, seed } => {
            let counts: BTreeMap<String, ArmCounts> = match counts {
                Some(p) => store::load_or_default(p)?,
                None => BTreeMap::new(),
            };
            let mut router = BanditRouter::with_seed(cfg.bandit, *seed);
            Ok(router.allocate(arms, &counts)?.to_decision())
        }
        Commands::Sprt {
            state,
            green,
            total,
            effect,
            reset,
        } => {
            let mut tester = SequentialTester::load(cfg.sprt, state)?;
            if *reset {
                tester.reset();
            }
            tester.observe_batch(*green, *total)?;
            tester.save(state)?;
            let required = cfg.power.plan(*effect)?.n_per_group;
            Ok(tester.to_decision_with_plan(required))
        }
        Commands::Bayes {
            state,
            green,
            total,
        } => {
            let mut tracker = BayesianTracker::load(cfg.bayes, state)?;
            tracker.observe_counts(*green, *total)?;
            tracker.save(state)?;
            Ok(tracker.to_decision())
        }
        Commands::Health { log, metrics, now } => {
            let samples = read_sample_log(log)?;
            let checker = DistributionHealthChecker::new(cfg.health);
            let report = checker.check(&samples, now.unwrap_or_else(Utc::now));
            if let Some(path) = metrics {
                report.to_exposition().write(path)?;
            }
            Ok(report.to_decision())
        }
        Commands::Power { effects } => {
            let mut planner = cfg.power;
            if !effects.is_empty() {
                planner.effect_sizes = effects.clone();
            }
            planner.to_decision()
        }
        Commands::Gate {
            metrics,
            root,
            thresholds,
            artifacts,
            canary_cmd,
            canary_baseline,
            drift_columns,
            drift_target,
            drift_baseline,
            dry_run,
        } => {
            let metrics: GateMetrics = require_json(metrics)?;
            let thresholds: GateThresholds = match thresholds {
                Some(p) => require_json(p)?,
                None => GateThresholds::default(),
            };
            let bundles = BundleStore::new(root);
            let baseline = bundles.stable_baseline()?;
            let gate = evaluate_gate(&metrics, &thresholds.absolute, baseline, &thresholds.relative);
            if !gate.pass {
                return Ok(gate.to_decision());
            }

            if let Some(line) = canary_cmd {
                let spec = CommandSpec::parse(line)
                    .ok_or_else(|| Error::config("canary_cmd", "empty command line"))?;
                let candidate: CanaryMetrics =
                    fetch_metrics(&mut ProcessRunner, &spec, cfg.command_timeout)?;
                let canary = check_canary(canary_baseline, &candidate, &cfg.canary)?;
                if !canary.pass {
                    return Ok(canary.to_decision());
                }
            }

            let drifted = match drift_columns {
                Some(p) => Some(check_drift(p, drift_target.as_deref(), drift_baseline, &cfg.drift)?),
                None => None,
            };

            let mut notifier = LogNotifier;
            let mut d = gate.to_decision();
            if !*dry_run {
                let manifest = bundles.promote(artifacts, &gate, Utc::now())?;
                notifier.notify(&Notification::Promoted {
                    tag: manifest.tag.clone(),
                    gate_reason: gate.reason.as_str().into(),
                });
                d = manifest.annotate(d);
            }
            if let Some(dr) = drifted.filter(|dr| dr.drifted()) {
                let detail: Vec<String> = dr
                    .findings
                    .iter()
                    .map(|f| format!("{}: {}", f.feature, f.detail()))
                    .collect();
                notifier.notify(&Notification::DriftDetected {
                    detail: detail.join("; "),
                });
                d.status = Status::Warn;
                for n in dr.to_decision().notes {
                    d = d.note(n);
                }
            }
            Ok(d)
        }
        Commands::Rollback {
            signal,
            watch,
            clear_freeze,
        } => {
            let mut monitor = RollbackMonitor::load(cfg.rollback)?;
            if *clear_freeze {
                let removed = monitor.clear_freeze()?;
                return Ok(Decision::new(DecisionSource::Rollback, Status::Ok)
                    .label("phase", "freeze_cleared")
                    .value("removed", if removed { 1.0 } else { 0.0 }));
            }
            let mut source = JsonFileSignal::new(signal);
            let mut notifier = LogNotifier;
            if *watch {
                let stop = Arc::new(AtomicBool::new(false));
                install_ctrl_c(Arc::clone(&stop))?;
                monitor.run(&mut source, &mut ProcessRunner, &mut notifier, &stop)?;
                let phase = if monitor.is_frozen() { "frozen" } else { "stopped" };
                return Ok(Decision::new(DecisionSource::Rollback, Status::Ok).label("phase", phase));
            }
            let snapshot = source.snapshot()?;
            let out = monitor.step(Utc::now(), snapshot, &mut ProcessRunner, &mut notifier)?;
            Ok(monitor.to_decision(&out))
        }
    }
}

/// Load a JSON input that must exist.
fn require_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    store::load_json(path)?.ok_or_else(|| Error::MalformedState {
        path: path.to_path_buf(),
        reason: "file not found".into(),
    })
}

fn check_drift(
    columns: &Path,
    target: Option<&str>,
    baseline: &Path,
    tol: &DriftTolerance,
) -> Result<drift::DriftDecision> {
    let raw: BTreeMap<String, Vec<Option<f64>>> = require_json(columns)?;
    let cols: BTreeMap<String, Vec<f64>> = raw
        .into_iter()
        .map(|(k, v)| (k, v.into_iter().map(|x| x.unwrap_or(f64::NAN)).collect()))
        .collect();
    let current = FeatureSummary::from_columns(&cols, target);
    let out = drift::check_against_baseline(baseline, &current, tol)?;
    if out.bootstrapped {
        info!(path = %baseline.display(), "drift baseline created from this run");
    }
    Ok(out)
}

/// Set `stop` on Ctrl-C. The watch loop finishes its current cycle first.
fn install_ctrl_c(stop: Arc<AtomicBool>) -> Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::io("signal_runtime", PathBuf::from("<ctrl-c>"), e))?;
    std::thread::spawn(move || {
        rt.block_on(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received; finishing current cycle");
                stop.store(true, Ordering::SeqCst);
            }
        });
    });
    Ok(())
}
