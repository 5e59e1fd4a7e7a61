//! External command and notification seams.
//!
//! Core logic never shells out directly: canary evaluators and rollback scripts
//! run through a [`CommandRunner`] returning a typed [`CommandOutput`], and
//! operator notifications go through a [`Notifier`]. Tests substitute
//! in-memory implementations of both.

use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Default bound on any external command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// How long to keep collecting output once the deadline has passed.
const OUTPUT_GRACE: Duration = Duration::from_millis(200);
const TAIL_BYTES: usize = 2048;

/// A program invocation. Arguments are passed verbatim (no shell).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    #[must_use]
    pub fn arg(mut self, a: impl Into<String>) -> Self {
        self.args.push(a.into());
        self
    }

    /// Parse a whitespace-separated command line (no quoting rules).
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let program = parts.next()?;
        Some(Self {
            program: program.to_string(),
            args: parts.map(str::to_string).collect(),
            cwd: None,
        })
    }
}

/// What happened when a command ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// `None` when killed by a signal or by the timeout.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// The command exceeded its time bound and was killed.
    pub timed_out: bool,
}

impl CommandOutput {
    /// Exited on its own with status 0.
    #[must_use]
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// Short, log-friendly failure description.
    #[must_use]
    pub fn failure_kind(&self) -> &'static str {
        if self.timed_out {
            "timeout"
        } else if self.exit_code.is_none() {
            "signal"
        } else if self.exit_code == Some(0) {
            "ok"
        } else {
            "nonzero_exit"
        }
    }

    /// Last bytes of stderr for logs.
    #[must_use]
    pub fn stderr_tail(&self) -> &str {
        tail(&self.stderr, TAIL_BYTES)
    }

    /// Last bytes of stdout for logs.
    #[must_use]
    pub fn stdout_tail(&self) -> &str {
        tail(&self.stdout, TAIL_BYTES)
    }
}

fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

/// Runs external programs with a time bound.
///
/// `Err` means the program could not be started; a program that ran and failed
/// (or timed out) is an `Ok` with the failure recorded in [`CommandOutput`].
pub trait CommandRunner {
    fn run(&mut self, spec: &CommandSpec, timeout: Duration) -> Result<CommandOutput>;
}

/// [`CommandRunner`] backed by `std::process`.
///
/// On unix the program leads its own process group, and a timeout kills the
/// whole group so forked helpers cannot outlive the bound.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(&mut self, spec: &CommandSpec, timeout: Duration) -> Result<CommandOutput> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        let mut child = cmd.spawn().map_err(|source| Error::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        // Drain pipes on their own threads so a chatty child cannot block on a full pipe.
        let out_rx = drain(child.stdout.take(), &spec.program, "stdout");
        let err_rx = drain(child.stderr.take(), &spec.program, "stderr");

        let started = Instant::now();
        let deadline = started + timeout;
        let (exit_code, timed_out) = wait_bounded(&mut child, deadline, &spec.program)?;

        let stdout = collect(&out_rx, deadline, &spec.program, "stdout");
        let stderr = collect(&err_rx, deadline, &spec.program, "stderr");
        let out = CommandOutput {
            exit_code,
            stdout,
            stderr,
            timed_out,
        };
        info!(
            program = %spec.program,
            exit_code = ?out.exit_code,
            timed_out = out.timed_out,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "external command finished"
        );
        if !out.success() {
            warn!(
                program = %spec.program,
                kind = out.failure_kind(),
                stderr_tail = out.stderr_tail(),
                "external command failed"
            );
        }
        Ok(out)
    }
}

fn drain<R: Read + Send + 'static>(
    pipe: Option<R>,
    program: &str,
    stream: &'static str,
) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel();
    let program = program.to_string();
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut p) = pipe {
            if let Err(e) = p.read_to_end(&mut buf) {
                warn!(program = %program, stream, error = %e, "output truncated");
            }
        }
        // The receiver is gone once the caller stopped waiting.
        tx.send(String::from_utf8_lossy(&buf).into_owned()).ok();
    });
    rx
}

/// Output read so far, waiting no later than the deadline (plus a short grace).
fn collect(rx: &mpsc::Receiver<String>, deadline: Instant, program: &str, stream: &str) -> String {
    let wait = deadline
        .saturating_duration_since(Instant::now())
        .max(OUTPUT_GRACE);
    match rx.recv_timeout(wait) {
        Ok(s) => s,
        Err(_) => {
            warn!(program, stream, "output still open past deadline, discarded");
            String::new()
        }
    }
}

fn wait_bounded(child: &mut Child, deadline: Instant, program: &str) -> Result<(Option<i32>, bool)> {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok((status.code(), false)),
            Ok(None) if Instant::now() >= deadline => {
                kill_tree(child, program);
                return Ok((None, true));
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                kill_tree(child, program);
                return Err(Error::io("wait_child", PathBuf::from(program), e));
            }
        }
    }
}

/// Kill the child and, on unix, every process in its group; then reap it.
fn kill_tree(child: &mut Child, program: &str) {
    #[cfg(unix)]
    {
        let group = format!("-{}", child.id());
        let status = Command::new("kill")
            .args(["-KILL", "--", &group])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match status {
            Ok(s) if s.success() => debug!(program, pgid = child.id(), "killed process group"),
            Ok(s) => warn!(program, pgid = child.id(), status = ?s.code(), "process group kill failed"),
            Err(e) => warn!(program, error = %e, "could not run kill"),
        }
    }
    if let Err(e) = child.kill() {
        debug!(program, error = %e, "child already gone");
    }
    if let Err(e) = child.wait() {
        warn!(program, error = %e, "could not reap child");
    }
}

/// Events worth telling an operator about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    RollbackTriggered { reason: String },
    RollbackSucceeded { via_fallback: bool },
    RollbackFailed { detail: String },
    Promoted { tag: String, gate_reason: String },
    DriftDetected { detail: String },
}

/// Pluggable notification channel. Delivery is best effort.
pub trait Notifier {
    fn notify(&mut self, n: &Notification);
}

/// Notifier that only writes a structured log line.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&mut self, n: &Notification) {
        match n {
            Notification::RollbackFailed { .. } => warn!(notification = ?n, "operator notification"),
            _ => info!(notification = ?n, "operator notification"),
        }
    }
}
