//! Process handle owned by the launcher for each spawned stage.

use std::path::PathBuf;
use std::process::ExitStatus;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Child;
use tracing::{debug, warn};

/// Lifecycle state of a spawned process.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    /// Spawn requested.
    Launching,
    /// OS process exists.
    Running,
    /// Readiness observed.
    Ready,
    /// Exited cleanly or terminated by the supervisor.
    Stopped,
    /// Exited unexpectedly or never became ready.
    Failed,
}

impl ProcessState {
    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Launching, Self::Running | Self::Failed)
                | (Self::Running, Self::Ready | Self::Stopped | Self::Failed)
                | (Self::Ready, Self::Stopped | Self::Failed)
        )
    }

    /// Whether the process is still expected to be alive.
    #[must_use]
    pub fn is_live(self) -> bool {
        matches!(self, Self::Launching | Self::Running | Self::Ready)
    }
}

/// A spawned stage process.
///
/// The `child` is spawned with `kill_on_drop(true)`, so dropping the handle
/// never leaves an orphan behind.
#[derive(Debug)]
pub struct ProcessHandle {
    /// Stage this process belongs to.
    pub stage_name: String,
    /// Startup-order index of the stage.
    pub order: usize,
    /// OS process ID captured at spawn time.
    pub pid: Option<u32>,
    /// Spawn timestamp.
    pub started_at: DateTime<Utc>,
    /// The stage forks a daemon and exits.
    pub detaches: bool,
    /// PID file of the forked daemon, if any.
    pub pid_file: Option<PathBuf>,
    state: ProcessState,
    child: Child,
}

impl ProcessHandle {
    /// Wrap a freshly spawned child. The handle starts in `Running`.
    #[must_use]
    pub fn new(stage_name: String, order: usize, child: Child) -> Self {
        let mut handle = Self {
            stage_name,
            order,
            pid: child.id(),
            started_at: Utc::now(),
            detaches: false,
            pid_file: None,
            state: ProcessState::Launching,
            child,
        };
        handle.transition(ProcessState::Running);
        handle
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Apply a transition; returns `false` and leaves the state untouched
    /// when the transition is not permitted.
    pub fn transition(&mut self, next: ProcessState) -> bool {
        if self.state.can_transition_to(next) {
            debug!(stage = %self.stage_name, from = ?self.state, to = ?next, "process transition");
            self.state = next;
            true
        } else {
            false
        }
    }

    /// Non-blocking check for process exit.
    pub fn poll_exit(&mut self) -> Option<ExitStatus> {
        match self.child.try_wait() {
            Ok(status) => status,
            Err(err) => {
                warn!(stage = %self.stage_name, %err, "failed to poll child process status");
                None
            }
        }
    }

    /// Whether the direct child exited cleanly on a detaching stage.
    pub fn has_detached(&mut self) -> bool {
        self.detaches && self.poll_exit().is_some_and(|status| status.success())
    }

    /// PID of the daemon a detaching stage left behind, read from its PID file.
    #[must_use]
    pub fn daemon_pid(&self) -> Option<u32> {
        let path = self.pid_file.as_ref()?;
        let raw = std::fs::read_to_string(path).ok()?;
        raw.trim().parse().ok()
    }

    /// Mutable access to the OS child for signalling and waiting.
    pub fn child_mut(&mut self) -> &mut Child {
        &mut self.child
    }

    /// Serializable view of the handle.
    #[must_use]
    pub fn snapshot(&self) -> ProcessSnapshot {
        ProcessSnapshot {
            stage_name: self.stage_name.clone(),
            pid: self.pid,
            started_at: self.started_at,
            state: self.state,
        }
    }
}

/// Serializable snapshot of a [`ProcessHandle`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessSnapshot {
    /// Stage name.
    pub stage_name: String,
    /// OS process ID.
    pub pid: Option<u32>,
    /// Spawn timestamp.
    pub started_at: DateTime<Utc>,
    /// Lifecycle state at snapshot time.
    pub state: ProcessState,
}

/// Human-readable description of a child exit status.
#[must_use]
pub fn describe_exit(status: Option<ExitStatus>) -> String {
    status.map_or_else(
        || "status unknown".to_owned(),
        |s| {
            if s.success() {
                "exited normally (code 0)".to_owned()
            } else {
                s.code().map_or_else(
                    || "terminated by signal".to_owned(),
                    |c| format!("exited with code {c}"),
                )
            }
        },
    )
}
