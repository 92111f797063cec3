//! Supervision session: every process handle and stage state for one
//! `start` invocation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use super::process::{describe_exit, ProcessHandle, ProcessSnapshot, ProcessState};
use super::stage::StageState;

/// Session shared between the supervisor task, the child monitor and the
/// IPC server.
pub type SharedSession = Arc<Mutex<SupervisionSession>>;

/// Overall state of a supervision session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Stages are still being launched.
    InProgress,
    /// Every stage became ready.
    Completed,
    /// At least one stage failed or was skipped.
    Failed,
    /// Shutdown requested; children are being terminated.
    Terminating,
    /// All children terminated.
    Terminated,
}

/// Per-stage status entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageStatus {
    /// Stage name.
    pub name: String,
    /// Current controller state.
    pub state: StageState,
    /// Failure or skip reason.
    pub detail: Option<String>,
}

/// One recorded stage transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransitionRecord {
    /// Stage name.
    pub stage: String,
    /// State before the transition.
    pub from: StageState,
    /// State after the transition.
    pub to: StageState,
    /// When the transition happened.
    pub at: DateTime<Utc>,
}

/// The set of all process handles and stage states for one invocation.
#[derive(Debug)]
pub struct SupervisionSession {
    /// Unique session identifier.
    pub id: String,
    /// Session start timestamp.
    pub started_at: DateTime<Utc>,
    state: SessionState,
    stages: Vec<StageStatus>,
    handles: Vec<ProcessHandle>,
    /// Last view of handles taken out for termination.
    taken: Vec<ProcessSnapshot>,
    history: Vec<TransitionRecord>,
}

impl SupervisionSession {
    /// Create a session with every stage `Pending`, in startup order.
    #[must_use]
    pub fn new<I, S>(stage_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            state: SessionState::InProgress,
            stages: stage_names
                .into_iter()
                .map(|name| StageStatus {
                    name: name.into(),
                    state: StageState::Pending,
                    detail: None,
                })
                .collect(),
            handles: Vec::new(),
            taken: Vec::new(),
            history: Vec::new(),
        }
    }

    /// Wrap the session for sharing.
    #[must_use]
    pub fn shared(self) -> SharedSession {
        Arc::new(Mutex::new(self))
    }

    /// Overall session state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Replace the overall session state.
    pub fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    /// Current state of a stage, if the stage is known.
    #[must_use]
    pub fn stage_state(&self, name: &str) -> Option<StageState> {
        self.stages.iter().find(|s| s.name == name).map(|s| s.state)
    }

    /// Per-stage status entries in startup order.
    #[must_use]
    pub fn stages(&self) -> &[StageStatus] {
        &self.stages
    }

    /// Recorded stage transitions in the order they happened.
    #[must_use]
    pub fn history(&self) -> &[TransitionRecord] {
        &self.history
    }

    /// Move a stage to `next`, recording the transition.
    ///
    /// Returns `false` when the stage is unknown or the transition is not
    /// permitted; the session is left unchanged in that case.
    pub fn transition_stage(
        &mut self,
        name: &str,
        next: StageState,
        detail: Option<String>,
    ) -> bool {
        let Some(entry) = self.stages.iter_mut().find(|s| s.name == name) else {
            warn!(stage = name, "transition requested for unknown stage");
            return false;
        };
        if !entry.state.can_transition_to(next) {
            warn!(stage = name, from = ?entry.state, to = ?next, "rejected stage transition");
            return false;
        }
        self.history.push(TransitionRecord {
            stage: name.to_owned(),
            from: entry.state,
            to: next,
            at: Utc::now(),
        });
        entry.state = next;
        if detail.is_some() {
            entry.detail = detail;
        }
        true
    }

    /// Track a newly spawned process.
    pub fn push_handle(&mut self, handle: ProcessHandle) {
        self.handles.push(handle);
    }

    /// Tracked process for a stage.
    pub fn handle_mut(&mut self, stage: &str) -> Option<&mut ProcessHandle> {
        self.handles.iter_mut().find(|h| h.stage_name == stage)
    }

    /// Mutable access to all tracked processes.
    pub fn handles_mut(&mut self) -> &mut [ProcessHandle] {
        &mut self.handles
    }

    /// Take every handle out of the session so they can be awaited without
    /// holding the session lock.
    ///
    /// Until [`Self::restore_handles`], snapshots keep listing the taken
    /// processes as they were when taken.
    pub fn take_handles(&mut self) -> Vec<ProcessHandle> {
        self.taken = self.handles.iter().map(ProcessHandle::snapshot).collect();
        std::mem::take(&mut self.handles)
    }

    /// Put handles back after termination.
    pub fn restore_handles(&mut self, handles: Vec<ProcessHandle>) {
        self.taken.clear();
        self.handles = handles;
        self.handles.sort_by_key(|h| h.order);
    }

    /// Check whether a stage's process exited in a way that rules out
    /// readiness. Returns the exit description when it did.
    ///
    /// A clean exit of a detaching stage is expected and reported as `None`.
    pub fn early_exit(&mut self, stage: &str) -> Option<String> {
        let handle = self.handle_mut(stage)?;
        let status = handle.poll_exit()?;
        if handle.detaches && status.success() {
            return None;
        }
        handle.transition(ProcessState::Failed);
        Some(describe_exit(Some(status)))
    }

    /// Serializable view of the session.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            started_at: self.started_at,
            state: self.state,
            stages: self.stages.clone(),
            processes: self
                .handles
                .iter()
                .map(ProcessHandle::snapshot)
                .chain(self.taken.iter().cloned())
                .collect(),
        }
    }
}

/// Serializable snapshot of a [`SupervisionSession`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Session identifier.
    pub id: String,
    /// Session start timestamp.
    pub started_at: DateTime<Utc>,
    /// Overall state.
    pub state: SessionState,
    /// Per-stage states.
    pub stages: Vec<StageStatus>,
    /// Tracked processes.
    pub processes: Vec<ProcessSnapshot>,
}
