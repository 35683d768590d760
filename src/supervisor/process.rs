//! Process Handle - child process spawning with stdio capture
//!
//! Every process-backed extension owns at most one [`ProcessHandle`]:
//! - stdout/stderr are captured into a bounded ring buffer (oldest lines dropped first)
//! - a broadcast channel streams lines to live subscribers
//! - a watch channel flips to `false` once the child exits
//! - termination is graceful first (SIGTERM), forced after the grace period

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::sync::{broadcast, watch, Mutex};

use crate::utils::current_timestamp;

/// Default number of captured lines per process.
pub const DEFAULT_LOG_BUFFER: usize = 2_000;

/// 강제 종료 후 프로세스 소멸을 기다리는 시간
const KILL_SETTLE: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("failed to spawn '{program}': {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("process {pid} not found")]
    NotFound { pid: u32 },
    #[error("failed to terminate process {pid}: {reason}")]
    TerminationFailed { pid: u32, reason: String },
    #[error("'{0}' is already running")]
    AlreadyRunning(String),
}

// ─── Log Types ───────────────────────────────────────────────

/// A single captured line of child output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    /// Sequential ID for polling with [`ProcessHandle::lines_since`]
    pub id: u64,
    pub timestamp: u64,
    pub source: LogSource,
    pub content: String,
    pub level: LogLevel,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Stdout,
    Stderr,
    /// Messages from the supervisor itself (start/exit)
    System,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Debug,
}

// ─── Log Buffer ──────────────────────────────────────────────

struct LogBuffer {
    lines: VecDeque<LogLine>,
    next_id: u64,
    max_size: usize,
}

impl LogBuffer {
    fn with_capacity(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            lines: VecDeque::with_capacity(max_size.min(DEFAULT_LOG_BUFFER)),
            next_id: 0,
            max_size,
        }
    }

    fn push(&mut self, source: LogSource, content: String, level: LogLevel) -> LogLine {
        let line = LogLine {
            id: self.next_id,
            timestamp: current_timestamp(),
            source,
            content,
            level,
        };
        self.next_id += 1;

        if self.lines.len() >= self.max_size {
            self.lines.pop_front();
        }
        self.lines.push_back(line.clone());
        line
    }

    fn get_since(&self, since_id: u64) -> Vec<LogLine> {
        self.lines.iter().filter(|l| l.id > since_id).cloned().collect()
    }

    fn get_recent(&self, count: usize) -> Vec<LogLine> {
        self.lines.iter().rev().take(count).rev().cloned().collect()
    }
}

// ─── Spec ────────────────────────────────────────────────────

/// What to launch. Built with chained setters:
///
/// ```
/// use extvisor::supervisor::process::ProcessSpec;
/// let spec = ProcessSpec::new("srs", "SR-Server.exe")
///     .arg("-cfg=C:\\DCS\\srs.cfg")
///     .cwd("C:\\Program Files\\DCS-SimpleRadio-Standalone");
/// assert_eq!(spec.get_args().len(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    label: String,
    program: PathBuf,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: Vec<(String, String)>,
    log_pattern: Option<String>,
    buffer_lines: usize,
    echo: bool,
}

impl ProcessSpec {
    pub fn new(label: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            label: label.into(),
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            log_pattern: None,
            buffer_lines: DEFAULT_LOG_BUFFER,
            echo: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Regex with a named `level` group (INFO, WARN, ERROR, DEBUG ...).
    pub fn log_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.log_pattern = Some(pattern.into());
        self
    }

    pub fn buffer_lines(mut self, lines: usize) -> Self {
        self.buffer_lines = lines;
        self
    }

    /// 자식 출력을 tracing으로도 흘려보냄 (익스텐션 `debug` 옵션)
    pub fn echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }
}

// ─── Process Handle ──────────────────────────────────────────

/// A running (or exited) child process.
pub struct ProcessHandle {
    label: String,
    pid: u32,
    log_buffer: Arc<Mutex<LogBuffer>>,
    log_broadcast: broadcast::Sender<LogLine>,
    running_rx: watch::Receiver<bool>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("label", &self.label)
            .field("pid", &self.pid)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl ProcessHandle {
    /// Spawn the process described by `spec` and start capturing its output.
    pub async fn spawn(spec: &ProcessSpec) -> Result<Self, ProcessError> {
        let program = spec.program.to_string_lossy().to_string();
        let mut cmd = TokioCommand::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(false);
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        // Windows: hide console window
        crate::utils::apply_creation_flags(&mut cmd);

        let mut child = cmd.spawn().map_err(|e| ProcessError::SpawnFailed {
            program: program.clone(),
            source: e,
        })?;
        let pid = child.id().ok_or(ProcessError::NotFound { pid: 0 })?;

        let (log_tx, _) = broadcast::channel::<LogLine>(2048);
        let (running_tx, running_rx) = watch::channel(true);
        let log_buffer = Arc::new(Mutex::new(LogBuffer::with_capacity(spec.buffer_lines)));

        let log_regex = spec.log_pattern.as_deref().and_then(|pat| match Regex::new(pat) {
            Ok(re) => Some(Arc::new(re)),
            Err(e) => {
                tracing::warn!("Invalid log_pattern '{}': {}, falling back to default", pat, e);
                None
            }
        });

        // ── stdout / stderr readers ──────────────────────────
        if let Some(stdout) = child.stdout.take() {
            let buf = log_buffer.clone();
            let bc = log_tx.clone();
            let re = log_regex.clone();
            let label = spec.echo.then(|| spec.label.clone());
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(label) = &label {
                        tracing::debug!("[{}] {}", label, line);
                    }
                    let level = parse_log_level(&line, re.as_deref());
                    let log_line = buf.lock().await.push(LogSource::Stdout, line, level);
                    let _ = bc.send(log_line);
                }
            });
        }

        if let Some(stderr) = child.stderr.take() {
            let buf = log_buffer.clone();
            let bc = log_tx.clone();
            let re = log_regex;
            let label = spec.echo.then(|| spec.label.clone());
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(label) = &label {
                        tracing::debug!("[{}] stderr: {}", label, line);
                    }
                    let level = parse_log_level(&line, re.as_deref());
                    // stderr lines default to at least Warn
                    let effective = if level == LogLevel::Info { LogLevel::Warn } else { level };
                    let log_line = buf.lock().await.push(LogSource::Stderr, line, effective);
                    let _ = bc.send(log_line);
                }
            });
        }

        // ── process waiter ───────────────────────────────────
        {
            let buf = log_buffer.clone();
            let bc = log_tx.clone();
            let label = spec.label.clone();
            tokio::spawn(async move {
                let exit_msg = match child.wait().await {
                    Ok(status) => format!("'{}' exited with {}", label, status),
                    Err(e) => format!("Failed to wait for '{}': {}", label, e),
                };
                tracing::info!("{}", exit_msg);
                let log_line = buf.lock().await.push(LogSource::System, exit_msg, LogLevel::Info);
                let _ = bc.send(log_line);
                let _ = running_tx.send(false);
            });
        }

        {
            let msg = format!("'{}' started with PID {}", spec.label, pid);
            tracing::info!("{}", msg);
            let log_line = log_buffer.lock().await.push(LogSource::System, msg, LogLevel::Info);
            let _ = log_tx.send(log_line);
        }

        Ok(Self {
            label: spec.label.clone(),
            pid,
            log_buffer,
            log_broadcast: log_tx,
            running_rx,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether the child has not exited yet.
    pub fn is_alive(&self) -> bool {
        *self.running_rx.borrow()
    }

    /// Wait until the child exits.
    pub async fn wait_for_exit(&self) {
        let mut rx = self.running_rx.clone();
        while *rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Graceful stop: SIGTERM, then force-kill once `grace` elapses.
    pub async fn terminate(&self, grace: Duration) -> Result<(), ProcessError> {
        if !self.is_alive() {
            return Ok(());
        }
        tracing::info!("Stopping '{}' (pid: {})", self.label, self.pid);

        if let Err(e) = send_signal(self.pid, false) {
            tracing::warn!("Graceful stop of '{}' failed: {}", self.label, e);
        } else if tokio::time::timeout(grace, self.wait_for_exit()).await.is_ok() {
            return Ok(());
        }

        tracing::warn!("'{}' did not exit within {:?}, killing", self.label, grace);
        self.kill().await
    }

    /// Immediate force-kill.
    pub async fn kill(&self) -> Result<(), ProcessError> {
        if !self.is_alive() {
            return Ok(());
        }
        send_signal(self.pid, true)?;
        if tokio::time::timeout(KILL_SETTLE, self.wait_for_exit()).await.is_err() {
            return Err(ProcessError::TerminationFailed {
                pid: self.pid,
                reason: "process still alive after kill".to_string(),
            });
        }
        Ok(())
    }

    /// All captured lines with `id > since_id`.
    pub async fn lines_since(&self, since_id: u64) -> Vec<LogLine> {
        self.log_buffer.lock().await.get_since(since_id)
    }

    /// The most recent `count` captured lines.
    pub async fn recent(&self, count: usize) -> Vec<LogLine> {
        self.log_buffer.lock().await.get_recent(count)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogLine> {
        self.log_broadcast.subscribe()
    }
}

// ─── Signals ─────────────────────────────────────────────────

/// Send a stop signal to `pid` (크로스 플랫폼).
/// `force = false` → SIGTERM, `force = true` → SIGKILL. Windows always terminates.
pub fn send_signal(pid: u32, force: bool) -> Result<(), ProcessError> {
    #[cfg(target_os = "windows")]
    {
        use winapi::um::handleapi::CloseHandle;
        use winapi::um::processthreadsapi::{OpenProcess, TerminateProcess};
        use winapi::um::winnt::PROCESS_TERMINATE;

        let _ = force;
        unsafe {
            let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
            if handle.is_null() {
                return Err(ProcessError::NotFound { pid });
            }
            let result = TerminateProcess(handle, 1);
            CloseHandle(handle);
            if result == 0 {
                return Err(ProcessError::TerminationFailed {
                    pid,
                    reason: "TerminateProcess failed".to_string(),
                });
            }
        }
    }

    #[cfg(not(target_os = "windows"))]
    {
        use nix::errno::Errno;
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
        match signal::kill(Pid::from_raw(pid as i32), signal) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return Err(ProcessError::NotFound { pid }),
            Err(e) => {
                return Err(ProcessError::TerminationFailed {
                    pid,
                    reason: format!("Failed to send signal: {}", e),
                })
            }
        }
    }

    Ok(())
}

/// Force-kill a process by PID. Used for strays not owned by a handle.
pub fn force_kill_pid(pid: u32) -> Result<(), ProcessError> {
    #[cfg(target_os = "windows")]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        std::process::Command::new("taskkill")
            .args(["/F", "/PID", &pid.to_string()])
            .creation_flags(CREATE_NO_WINDOW)
            .output()
            .map_err(|e| ProcessError::TerminationFailed {
                pid,
                reason: e.to_string(),
            })?;
        Ok(())
    }
    #[cfg(not(target_os = "windows"))]
    {
        send_signal(pid, true)
    }
}

// ─── Helpers ─────────────────────────────────────────────────

/// Parse the log level from a line with an optional `(?P<level>...)` pattern.
/// Defaults to Info.
fn parse_log_level(line: &str, pattern: Option<&Regex>) -> LogLevel {
    if let Some(re) = pattern {
        if let Some(level_match) = re.captures(line).and_then(|caps| caps.name("level")) {
            return match level_match.as_str().to_uppercase().as_str() {
                "ERROR" | "FATAL" => LogLevel::Error,
                "WARN" | "WARNING" => LogLevel::Warn,
                "DEBUG" | "TRACE" => LogLevel::Debug,
                _ => LogLevel::Info,
            };
        }
    }
    LogLevel::Info
}

// ─── Tests ───────────────────────────────────────────────────
