//! Stage definition, readiness descriptors and the per-stage state machine.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// What the supervisor does when a stage fails to become ready.
///
/// Passed as `--policy` on the command line or `failure_policy` in the
/// configuration file. Defaults to [`FailurePolicy::FailFast`].
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Halt the sequence at the first stage that does not become ready.
    #[default]
    FailFast,
    /// Log the failure and keep launching the remaining stages.
    BestEffort,
}

/// Externally observable signal that a stage finished initializing.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReadinessCheck {
    /// Ready as soon as the process is running.
    #[default]
    None,
    /// Ready after a fixed delay.
    Delay {
        /// Delay in milliseconds.
        millis: u64,
    },
    /// Ready once a TCP connection to `host:port` succeeds.
    Tcp {
        /// Host to connect to.
        #[serde(default = "default_tcp_host")]
        host: String,
        /// Port to connect to.
        port: u16,
    },
    /// Ready once the file exists and is non-empty.
    File {
        /// Path to watch.
        path: PathBuf,
    },
    /// Ready once a line of stdout or stderr matches the pattern.
    LogLine {
        /// Regular expression matched against each output line.
        pattern: String,
    },
}

fn default_tcp_host() -> String {
    "127.0.0.1".into()
}

impl Display for ReadinessCheck {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "process running"),
            Self::Delay { millis } => write!(f, "fixed delay of {millis}ms"),
            Self::Tcp { host, port } => write!(f, "tcp connect to {host}:{port}"),
            Self::File { path } => write!(f, "non-empty file {}", path.display()),
            Self::LogLine { pattern } => write!(f, "output line matching /{pattern}/"),
        }
    }
}

fn default_readiness_timeout_ms() -> u64 {
    15_000
}

/// One supervised child process and its readiness contract.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Stage {
    /// Unique stage name.
    pub name: String,
    /// Executable path or name resolved through `PATH`.
    pub command: String,
    /// Arguments passed to the executable.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory for the child; inherits the supervisor's when unset.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables for the child.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Readiness descriptor polled after launch.
    #[serde(default)]
    pub readiness: ReadinessCheck,
    /// Upper bound on the time spent waiting for readiness.
    #[serde(default = "default_readiness_timeout_ms")]
    pub readiness_timeout_ms: u64,
    /// Explicit startup order; defaults to the position in the file.
    #[serde(default)]
    pub order: Option<u32>,
    /// Earlier stages that must be ready for this stage to launch.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// The process forks a daemon and exits; a clean early exit is expected.
    #[serde(default)]
    pub detaches: bool,
    /// PID file written by a detaching daemon, used for monitoring and
    /// termination once the direct child has exited.
    #[serde(default)]
    pub pid_file: Option<PathBuf>,
    /// Zero-based startup-order index, assigned during config validation.
    #[serde(skip)]
    pub index: usize,
}

impl Stage {
    /// Readiness timeout as a [`Duration`].
    #[must_use]
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }
}

/// Ordering-controller state for a single stage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    /// Not launched yet.
    Pending,
    /// Spawn in progress.
    Launching,
    /// Process running; readiness is being polled.
    AwaitingReady,
    /// Readiness observed.
    Ready,
    /// Launch failed, readiness timed out, or the process exited early.
    Failed,
    /// Not launched because a declared dependency did not become ready.
    Skipped,
}

impl StageState {
    /// Determine whether a transition is permitted.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Launching | Self::Skipped)
                | (Self::Launching, Self::AwaitingReady | Self::Failed)
                | (Self::AwaitingReady, Self::Ready | Self::Failed)
        )
    }

    /// Whether the stage has left the sequence for good.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ready | Self::Failed | Self::Skipped)
    }
}
