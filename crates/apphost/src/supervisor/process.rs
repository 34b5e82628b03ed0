//! Process supervision for hosted instances.
//!
//! Each child runs in its own process group with stdout/stderr piped into the
//! instance log sink. A watcher task owns the `Child`, reaps it and publishes an
//! [`ExitReport`] on a watch channel, so every clone of a [`ProcessHandle`] can
//! observe the exit without polling.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};

use super::logs::LogSink;
use crate::error::{HostError, HostResult};

/// Supervisor tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// How long a fresh child gets to accept connections on its port.
    pub ready_timeout_ms: u64,
    /// Treat a child that is alive but not listening at the deadline as failed.
    pub require_ready: bool,
    /// Launch attempts per start request before giving up.
    pub startup_attempts: u32,
    /// Grace period between SIGTERM and SIGKILL.
    pub stop_grace_ms: u64,
    /// Interval of the periodic health sweep.
    pub health_interval_ms: u64,
    /// Output lines kept in memory for exit diagnostics.
    pub tail_lines: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            ready_timeout_ms: 3000,
            require_ready: false,
            startup_attempts: 3,
            stop_grace_ms: 10_000,
            health_interval_ms: 5000,
            tail_lines: 20,
        }
    }
}

impl SupervisorConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms.max(10))
    }
}

/// Everything needed to launch one instance process.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    /// Label used in log lines (usually the instance key).
    pub label: String,
    pub program: String,
    pub args: Vec<String>,
    /// Prepared checkout the process runs in.
    pub working_dir: PathBuf,
    pub env: HashMap<String, String>,
    /// Leased port the process must bind.
    pub port: u16,
    /// Virtualenv `activate` script sourced before exec'ing the program.
    pub activator: Option<PathBuf>,
    pub log_path: PathBuf,
}

/// How a process ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExitReport {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    /// Last lines of output before the exit.
    pub tail: Vec<String>,
}

impl ExitReport {
    fn from_status(status: std::io::Result<ExitStatus>, tail: Vec<String>) -> Self {
        match status {
            Ok(status) => {
                #[cfg(unix)]
                let signal = {
                    use std::os::unix::process::ExitStatusExt;
                    status.signal()
                };
                #[cfg(not(unix))]
                let signal = None;
                Self {
                    exit_code: status.code(),
                    signal,
                    tail,
                }
            }
            Err(e) => {
                warn!("Error waiting for process: {:?}", e);
                Self {
                    exit_code: None,
                    signal: None,
                    tail,
                }
            }
        }
    }

    /// Human-readable status, e.g. "exited with code 1".
    pub fn status_text(&self) -> String {
        match (self.exit_code, self.signal) {
            (Some(code), _) => format!("exited with code {}", code),
            (None, Some(sig)) => {
                let sig_name = match sig {
                    9 => "SIGKILL",
                    15 => "SIGTERM",
                    11 => "SIGSEGV",
                    6 => "SIGABRT",
                    _ => "",
                };
                if sig_name.is_empty() {
                    format!("killed by signal {}", sig)
                } else {
                    format!("killed by {} (signal {})", sig_name, sig)
                }
            }
            (None, None) => "exited (unknown status)".to_string(),
        }
    }

    /// Status plus the captured output tail, for `last_error`.
    pub fn describe(&self) -> String {
        if self.tail.is_empty() {
            self.status_text()
        } else {
            format!("{}\n{}", self.status_text(), self.tail.join("\n"))
        }
    }
}

/// Liveness as seen by a health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Alive,
    Dead,
}

struct HandleInner {
    pid: u32,
    port: u16,
    label: String,
    started_at: DateTime<Utc>,
    exit: watch::Receiver<Option<ExitReport>>,
    logs: LogSink,
}

/// Shared reference to a supervised process.
///
/// Clones observe the same process; the OS child itself is owned by the
/// watcher task that reaps it.
#[derive(Clone)]
pub struct ProcessHandle {
    inner: Arc<HandleInner>,
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.inner.pid)
            .field("port", &self.inner.port)
            .field("label", &self.inner.label)
            .finish()
    }
}

impl PartialEq for ProcessHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for ProcessHandle {}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.inner.pid
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    pub fn logs(&self) -> &LogSink {
        &self.inner.logs
    }

    /// Exit report if the process has been reaped.
    pub fn exit_report(&self) -> Option<ExitReport> {
        self.inner.exit.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.exit_report().is_none()
    }

    /// Wait until the OS confirms the process has exited.
    pub async fn wait(&self) -> ExitReport {
        let mut rx = self.inner.exit.clone();
        loop {
            if let Some(report) = rx.borrow_and_update().clone() {
                return report;
            }
            if rx.changed().await.is_err() {
                // Watcher gone without a report; the child was dropped with it.
                return rx.borrow().clone().unwrap_or(ExitReport {
                    exit_code: None,
                    signal: None,
                    tail: Vec::new(),
                });
            }
        }
    }

    /// Signal the whole process group. Returns false if the process is gone.
    fn signal(&self, signal: libc::c_int) -> bool {
        if !self.is_running() {
            return false;
        }
        let pid = self.inner.pid as libc::pid_t;
        // SAFETY: kill(2) has no memory-safety preconditions. The child is not reaped
        // yet (no exit report), so the pid still refers to it.
        unsafe {
            if libc::kill(-pid, signal) == 0 {
                return true;
            }
            libc::kill(pid, signal) == 0
        }
    }
}

/// Signal the process group led by `pid`. False if no member was left.
fn kill_group(pid: u32, signal: libc::c_int) -> bool {
    // SAFETY: kill(2) has no memory-safety preconditions. A pgid is not reused
    // while any member of the group is alive.
    unsafe { libc::kill(-(pid as libc::pid_t), signal) == 0 }
}

/// Check whether a pid still exists (zombies included).
fn pid_exists(pid: u32) -> bool {
    // SAFETY: signal 0 only performs the existence and permission check.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

enum Readiness {
    Ready,
    Exited(ExitReport),
    TimedOut,
}

/// Starts, stops and health-checks instance processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessSupervisor {
    config: SupervisorConfig,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Launch a process bound to `spec.port` and wait for it to come up.
    ///
    /// Fails synchronously with `SpawnFailed` when the working directory or the
    /// activator is missing, when the program cannot be executed, or when every
    /// launch attempt died or never became ready. A failed attempt is always
    /// reaped before returning, so the caller may release the port right away.
    pub async fn start(&self, spec: &SpawnSpec) -> HostResult<ProcessHandle> {
        if !spec.working_dir.is_dir() {
            return Err(HostError::SpawnFailed(format!(
                "working directory {} does not exist",
                spec.working_dir.display()
            )));
        }
        if let Some(ref activator) = spec.activator {
            if !activator.is_file() {
                return Err(HostError::SpawnFailed(format!(
                    "venv activator {} not found",
                    activator.display()
                )));
            }
        }

        let attempts = self.config.startup_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let handle = self.launch(spec).await?;
            handle
                .logs()
                .note(&format!(
                    "Starting {} on port {} (pid {}, attempt {}/{})",
                    spec.program, spec.port, handle.pid(), attempt, attempts
                ))
                .await;

            match self.wait_ready(&handle).await {
                Readiness::Ready => {
                    info!(
                        "{} started with PID {} on port {}",
                        spec.label,
                        handle.pid(),
                        spec.port
                    );
                    return Ok(handle);
                }
                Readiness::Exited(report) => {
                    warn!(
                        "{} attempt {}/{} failed: {}",
                        spec.label,
                        attempt,
                        attempts,
                        report.status_text()
                    );
                    last_error = report.describe();
                }
                Readiness::TimedOut => {
                    warn!(
                        "{} attempt {}/{} did not become ready on port {}",
                        spec.label, attempt, attempts, spec.port
                    );
                    self.stop(&handle, self.config.stop_grace()).await;
                    last_error = format!(
                        "process did not accept connections on port {} within {}ms",
                        spec.port, self.config.ready_timeout_ms
                    );
                }
            }
        }

        Err(HostError::SpawnFailed(last_error))
    }

    async fn launch(&self, spec: &SpawnSpec) -> HostResult<ProcessHandle> {
        let mut cmd = match spec.activator {
            Some(ref activator) => {
                debug!(
                    "Spawning {} via activator {}: {:?}",
                    spec.program,
                    activator.display(),
                    spec.args
                );
                let mut cmd = Command::new("sh");
                cmd.arg("-c")
                    .arg(". \"$0\" && exec \"$@\"")
                    .arg(activator)
                    .arg(&spec.program)
                    .args(&spec.args);
                cmd
            }
            None => {
                debug!("Spawning {}: {:?}", spec.program, spec.args);
                let mut cmd = Command::new(&spec.program);
                cmd.args(&spec.args);
                cmd
            }
        };

        cmd.current_dir(&spec.working_dir)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| HostError::SpawnFailed(format!("spawning {}: {}", spec.program, e)))?;

        let Some(pid) = child.id() else {
            return Err(HostError::SpawnFailed(format!(
                "{} exited before a pid was assigned",
                spec.program
            )));
        };

        let logs = LogSink::new(&spec.log_path, &spec.label, self.config.tail_lines);

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, logs.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, logs.clone()));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let watcher_logs = logs.clone();
        let label = spec.label.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            // The leader is gone; take down anything it left behind in its group.
            if kill_group(pid, libc::SIGKILL) {
                debug!("{} (PID {}) left processes behind, killed its group", label, pid);
            }
            // Grandchildren may keep the pipes open; don't let them hold up the report.
            let _ = timeout(Duration::from_millis(500), async {
                for reader in readers {
                    let _ = reader.await;
                }
            })
            .await;

            let report = ExitReport::from_status(status, watcher_logs.recent().await);
            debug!("{} (PID {}) {}", label, pid, report.status_text());
            watcher_logs
                .note(&format!("Process exited: {}", report.status_text()))
                .await;
            exit_tx.send_replace(Some(report));
        });

        Ok(ProcessHandle {
            inner: Arc::new(HandleInner {
                pid,
                port: spec.port,
                label: spec.label.clone(),
                started_at: Utc::now(),
                exit: exit_rx,
                logs,
            }),
        })
    }

    async fn wait_ready(&self, handle: &ProcessHandle) -> Readiness {
        let deadline = Instant::now() + self.config.ready_timeout();

        loop {
            if let Some(report) = handle.exit_report() {
                return Readiness::Exited(report);
            }

            if TcpStream::connect(("127.0.0.1", handle.port())).await.is_ok() {
                return Readiness::Ready;
            }

            let now = Instant::now();
            if now >= deadline {
                return if self.config.require_ready {
                    Readiness::TimedOut
                } else {
                    Readiness::Ready
                };
            }

            let pause = (deadline - now).min(Duration::from_millis(100));
            tokio::select! {
                report = handle.wait() => return Readiness::Exited(report),
                _ = sleep(pause) => {}
            }
        }
    }

    /// Stop a process: SIGTERM, wait up to `grace`, then SIGKILL.
    ///
    /// Returns once the process has been reaped.
    pub async fn stop(&self, handle: &ProcessHandle, grace: Duration) -> ExitReport {
        if let Some(report) = handle.exit_report() {
            return report;
        }

        debug!("Sending SIGTERM to {} (PID {})", handle.inner.label, handle.pid());
        handle.signal(libc::SIGTERM);

        match timeout(grace, handle.wait()).await {
            Ok(report) => report,
            Err(_) => {
                warn!(
                    "{} (PID {}) did not exit within {:?}, killing",
                    handle.inner.label,
                    handle.pid(),
                    grace
                );
                handle.signal(libc::SIGKILL);
                handle.wait().await
            }
        }
    }

    /// Non-blocking liveness check; safe to call while a stop is in progress.
    pub fn health_check(&self, handle: &ProcessHandle) -> Health {
        if handle.is_running() && pid_exists(handle.pid()) {
            Health::Alive
        } else {
            Health::Dead
        }
    }
}

fn spawn_reader<R>(stream: R, logs: LogSink) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    logs.write_line(&line).await;
                }
            }
        }
    })
}
