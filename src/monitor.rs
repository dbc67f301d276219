//! Local process monitoring.
//!
//! Finds the database process under `/proc` and reports whether it is
//! running, frozen (`SIGSTOP`), a zombie or gone. [`LivenessTracker`]
//! measures how long something has been unreachable, which drives the
//! failure detection window.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// State of a watched process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Running,
    /// Stopped by a signal or a tracer.
    Stopped,
    Zombie,
    Missing,
}

impl ProcessState {
    /// Whether the process can serve requests.
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Running)
    }

    /// Map the state letter from `/proc/<pid>/stat`.
    pub fn from_stat_code(code: char) -> Self {
        match code {
            'T' | 't' => ProcessState::Stopped,
            'Z' => ProcessState::Zombie,
            'X' | 'x' => ProcessState::Missing,
            _ => ProcessState::Running,
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessState::Running => write!(f, "running"),
            ProcessState::Stopped => write!(f, "stopped"),
            ProcessState::Zombie => write!(f, "zombie"),
            ProcessState::Missing => write!(f, "missing"),
        }
    }
}

/// Source of process state.
pub trait ProcessProbe: Send + Sync {
    fn probe(&self) -> ProcessState;
}

/// Probe that scans a proc filesystem for a process by name.
#[derive(Debug, Clone)]
pub struct ProcfsProbe {
    proc_root: PathBuf,
    process_name: String,
}

impl ProcfsProbe {
    pub fn new(proc_root: impl Into<PathBuf>, process_name: impl Into<String>) -> Self {
        Self {
            proc_root: proc_root.into(),
            process_name: process_name.into(),
        }
    }

    fn matches(&self, cmdline: &[u8]) -> bool {
        let argv0 = cmdline.split(|b| *b == 0).next().unwrap_or_default();
        let argv0 = String::from_utf8_lossy(argv0);
        let argv0 = argv0.trim();
        if argv0.is_empty() {
            return false;
        }
        let basename = Path::new(argv0)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        argv0 == self.process_name || basename == self.process_name
    }

    /// Lowest pid whose argv[0] matches the process name.
    pub fn find_pid(&self) -> Option<u32> {
        let entries = match fs::read_dir(&self.proc_root) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(root = %self.proc_root.display(), error = %e, "Cannot read proc filesystem");
                return None;
            }
        };
        entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
            .filter(|pid| {
                fs::read(self.proc_root.join(pid.to_string()).join("cmdline"))
                    .is_ok_and(|cmdline| self.matches(&cmdline))
            })
            .min()
    }

    fn read_state(&self, pid: u32) -> ProcessState {
        let stat = match fs::read_to_string(self.proc_root.join(pid.to_string()).join("stat")) {
            Ok(stat) => stat,
            // Exited between the scan and the read
            Err(_) => return ProcessState::Missing,
        };
        // The command name may contain spaces and parentheses
        stat.rfind(')')
            .and_then(|idx| stat.get(idx + 1..))
            .and_then(|rest| rest.trim_start().chars().next())
            .map(ProcessState::from_stat_code)
            .unwrap_or(ProcessState::Missing)
    }
}

impl ProcessProbe for ProcfsProbe {
    fn probe(&self) -> ProcessState {
        match self.find_pid() {
            Some(pid) => self.read_state(pid),
            None => ProcessState::Missing,
        }
    }
}

/// Tracks how long a target has gone without a healthy observation.
#[derive(Debug, Clone)]
pub struct LivenessTracker {
    started: Instant,
    last_seen: Option<Instant>,
}

impl LivenessTracker {
    pub fn new(now: Instant) -> Self {
        Self {
            started: now,
            last_seen: None,
        }
    }

    pub fn record_healthy(&mut self, now: Instant) {
        self.last_seen = Some(now);
    }

    /// Forget history, as if tracking started at `now`.
    pub fn reset(&mut self, now: Instant) {
        self.started = now;
        self.last_seen = None;
    }

    /// Time since the last healthy observation (or since tracking started).
    pub fn unreachable_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen.unwrap_or(self.started))
    }

    pub fn exceeded(&self, now: Instant, window: Duration) -> bool {
        self.unreachable_for(now) > window
    }
}

/// Watches the local database process.
pub struct ProcessMonitor {
    probe: Arc<dyn ProcessProbe>,
    last_state: Option<ProcessState>,
    liveness: LivenessTracker,
}

impl ProcessMonitor {
    pub fn new(probe: Arc<dyn ProcessProbe>) -> Self {
        Self {
            probe,
            last_state: None,
            liveness: LivenessTracker::new(Instant::now()),
        }
    }

    /// Probe the process, logging state changes.
    pub fn check(&mut self) -> ProcessState {
        let now = Instant::now();
        let state = self.probe.probe();
        if state.is_running() {
            self.liveness.record_healthy(now);
        }
        if self.last_state != Some(state) {
            match (self.last_state, state) {
                (_, ProcessState::Running) => info!(state = %state, "Database process running"),
                (None, _) => debug!(state = %state, "Database process initial state"),
                _ => warn!(
                    previous = ?self.last_state,
                    state = %state,
                    "Database process state changed"
                ),
            }
            self.last_state = Some(state);
        }
        state
    }

    pub fn last_state(&self) -> Option<ProcessState> {
        self.last_state
    }

    /// How long the database has not been seen running.
    pub fn down_for(&self) -> Duration {
        self.liveness.unreachable_for(Instant::now())
    }
}
