//! Ordering controller.
//!
//! Drives every stage through `Pending → Launching → AwaitingReady →
//! Ready | Failed` in startup order. Stage N+1 is launched only after
//! stage N is ready, or after its readiness failed under the best-effort
//! policy. Every transition is recorded in the shared session.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use super::launcher;
use super::prober::{ProbeOutcome, ReadinessProber};
use crate::config::GlobalConfig;
use crate::models::process::ProcessState;
use crate::models::session::{SessionState, SharedSession};
use crate::models::stage::{FailurePolicy, Stage, StageState};
use crate::Result;

/// Sequences stage launches against a shared session.
#[derive(Debug)]
pub struct OrderingController {
    stages: Vec<Stage>,
    policy: FailurePolicy,
    prober: ReadinessProber,
    session: SharedSession,
    cancel: CancellationToken,
}

impl OrderingController {
    /// Build a controller over stages already sorted into startup order.
    #[must_use]
    pub fn new(
        stages: Vec<Stage>,
        policy: FailurePolicy,
        prober: ReadinessProber,
        session: SharedSession,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            stages,
            policy,
            prober,
            session,
            cancel,
        }
    }

    /// Build a controller from validated configuration.
    #[must_use]
    pub fn from_config(
        config: &GlobalConfig,
        session: SharedSession,
        cancel: CancellationToken,
    ) -> Self {
        let prober = ReadinessProber::new(config.poll_interval(), cancel.clone());
        Self::new(
            config.stages.clone(),
            config.failure_policy,
            prober,
            session,
            cancel,
        )
    }

    /// Run the whole sequence.
    ///
    /// Returns the session state the sequence ended in: `Completed`,
    /// `Failed`, or `Terminating` when shutdown interrupted it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Launch` when a stage cannot be spawned; the
    /// sequence halts regardless of policy.
    pub async fn run(&self) -> Result<SessionState> {
        let mut unready: Vec<&str> = Vec::new();

        for stage in &self.stages {
            if self.cancel.is_cancelled() {
                return Ok(self.interrupt(None).await);
            }

            if let Some(dep) = stage
                .depends_on
                .iter()
                .find(|dep| unready.contains(&dep.as_str()))
            {
                let reason = format!("dependency '{dep}' did not become ready");
                warn!(stage = %stage.name, %reason, "skipping stage");
                self.transition(&stage.name, StageState::Skipped, Some(reason))
                    .await;
                unready.push(&stage.name);
                continue;
            }

            let span = info_span!("stage", name = %stage.name, index = stage.index);
            match self.run_stage(stage).instrument(span).await? {
                StageResult::Ready => {}
                StageResult::Cancelled => return Ok(self.interrupt(Some(&stage.name)).await),
                StageResult::Failed(reason) => match self.policy {
                    FailurePolicy::FailFast => {
                        error!(stage = %stage.name, %reason, "stage failed; halting sequence");
                        self.session.lock().await.set_state(SessionState::Failed);
                        return Ok(SessionState::Failed);
                    }
                    FailurePolicy::BestEffort => {
                        warn!(stage = %stage.name, %reason, "stage failed; continuing with remaining stages");
                        unready.push(&stage.name);
                    }
                },
            }
        }

        let outcome = if unready.is_empty() {
            SessionState::Completed
        } else {
            SessionState::Failed
        };
        self.session.lock().await.set_state(outcome);
        info!(state = ?outcome, "stage sequence finished");
        Ok(outcome)
    }

    async fn run_stage(&self, stage: &Stage) -> Result<StageResult> {
        self.transition(&stage.name, StageState::Launching, None).await;

        let launched = match launcher::launch(stage) {
            Ok(launched) => launched,
            Err(err) => {
                error!(%err, "stage launch failed");
                self.transition(&stage.name, StageState::Failed, Some(err.to_string()))
                    .await;
                self.session.lock().await.set_state(SessionState::Failed);
                return Err(err);
            }
        };
        let log_signal = launched.log_signal;
        self.session.lock().await.push_handle(launched.handle);

        self.transition(&stage.name, StageState::AwaitingReady, None)
            .await;
        info!(check = %stage.readiness, timeout_ms = stage.readiness_timeout_ms, "awaiting readiness");

        let session = Arc::clone(&self.session);
        let name = stage.name.clone();
        let outcome = self
            .prober
            .await_ready(&stage.readiness, &log_signal, stage.readiness_timeout(), || {
                let session = Arc::clone(&session);
                let name = name.clone();
                async move { session.lock().await.early_exit(&name) }
            })
            .await;

        let result = match outcome {
            ProbeOutcome::Ready { elapsed } => {
                {
                    let mut session = self.session.lock().await;
                    if let Some(handle) = session.handle_mut(&stage.name) {
                        handle.transition(ProcessState::Ready);
                    }
                }
                self.transition(&stage.name, StageState::Ready, None).await;
                info!(elapsed_ms = elapsed.as_millis(), "stage ready");
                StageResult::Ready
            }
            ProbeOutcome::TimedOut { elapsed } => {
                let reason = format!(
                    "readiness timed out after {}ms waiting for {}",
                    elapsed.as_millis(),
                    stage.readiness
                );
                {
                    // Still running; terminated with the rest on shutdown.
                    let mut session = self.session.lock().await;
                    if let Some(handle) = session.handle_mut(&stage.name) {
                        handle.transition(ProcessState::Failed);
                    }
                }
                self.transition(&stage.name, StageState::Failed, Some(reason.clone()))
                    .await;
                StageResult::Failed(reason)
            }
            ProbeOutcome::Exited { status } => {
                let reason = format!("process {status} before becoming ready");
                self.transition(&stage.name, StageState::Failed, Some(reason.clone()))
                    .await;
                StageResult::Failed(reason)
            }
            ProbeOutcome::Cancelled => StageResult::Cancelled,
        };
        Ok(result)
    }

    /// Record shutdown during the sequence. The in-flight stage, if any,
    /// is marked failed.
    async fn interrupt(&self, in_flight: Option<&str>) -> SessionState {
        let mut session = self.session.lock().await;
        if let Some(name) = in_flight {
            if session
                .stage_state(name)
                .is_some_and(|state| !state.is_terminal())
            {
                session.transition_stage(
                    name,
                    StageState::Failed,
                    Some("interrupted by shutdown".into()),
                );
            }
        }
        session.set_state(SessionState::Terminating);
        warn!("stage sequence interrupted by shutdown");
        SessionState::Terminating
    }

    async fn transition(&self, name: &str, next: StageState, detail: Option<String>) {
        self.session
            .lock()
            .await
            .transition_stage(name, next, detail);
    }
}

enum StageResult {
    Ready,
    Failed(String),
    Cancelled,
}
