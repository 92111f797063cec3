//! Supervisor wiring for `stagehand start`.
//!
//! Removes stale paths, runs the ordering controller, monitors the
//! children once the sequence is done, and terminates everything on
//! shutdown. Shutdown arrives through the shared `CancellationToken`,
//! cancelled by a signal handler or by the IPC `stop` command.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use super::child_monitor::spawn_child_monitor;
use super::cleanup::{self, TerminationReport};
use super::controller::OrderingController;
use crate::config::GlobalConfig;
use crate::models::session::{SessionState, SharedSession, SupervisionSession};
use crate::models::stage::{FailurePolicy, StageState};
use crate::{AppError, Result};

/// One supervision session driven from start to shutdown.
#[derive(Debug)]
pub struct Supervisor {
    config: Arc<GlobalConfig>,
    session: SharedSession,
    cancel: CancellationToken,
}

impl Supervisor {
    /// Build a supervisor with a fresh session over the configured stages.
    #[must_use]
    pub fn new(config: Arc<GlobalConfig>, cancel: CancellationToken) -> Self {
        let session =
            SupervisionSession::new(config.stages.iter().map(|s| s.name.clone())).shared();
        Self {
            config,
            session,
            cancel,
        }
    }

    /// Shared session, for the IPC server and for inspection.
    #[must_use]
    pub fn session(&self) -> SharedSession {
        Arc::clone(&self.session)
    }

    /// Run the full sequence and supervise until shutdown.
    ///
    /// Returns `Ok(())` only when every stage became ready and the children
    /// were shut down on request.
    ///
    /// # Errors
    ///
    /// - `AppError::Io` / `AppError::Config`: stale path cleanup failed.
    /// - `AppError::Launch`: a stage could not be spawned.
    /// - `AppError::Readiness`: one or more stages failed or were skipped.
    /// - `AppError::Shutdown`: shutdown interrupted the sequence.
    ///
    /// Every tracked child is terminated before any of these is returned.
    pub async fn run(&self) -> Result<()> {
        let session_id = self.session.lock().await.id.clone();
        let span = info_span!("supervisor", session_id = %session_id);
        async move {
            cleanup::remove_stale_paths(&self.config.stale_paths)?;

            let controller = OrderingController::from_config(
                &self.config,
                Arc::clone(&self.session),
                self.cancel.clone(),
            );
            let outcome = match controller.run().await {
                Ok(outcome) => outcome,
                Err(err) => {
                    self.shutdown().await;
                    return Err(err);
                }
            };

            let keep_running = match outcome {
                SessionState::Completed => true,
                SessionState::Failed => self.config.failure_policy == FailurePolicy::BestEffort,
                _ => false,
            };

            if keep_running {
                info!(state = ?outcome, "supervising stage processes until shutdown");
                let monitor = spawn_child_monitor(
                    Arc::clone(&self.session),
                    self.config.monitor_interval(),
                    self.cancel.clone(),
                );
                self.cancel.cancelled().await;
                if let Err(err) = monitor.await {
                    warn!(%err, "child monitor task failed");
                }
            }

            self.shutdown().await;

            match outcome {
                SessionState::Completed => Ok(()),
                SessionState::Failed => Err(AppError::Readiness(self.failure_summary().await)),
                _ => Err(AppError::Shutdown(
                    "interrupted before all stages were ready".into(),
                )),
            }
        }
        .instrument(span)
        .await
    }

    /// Terminate every tracked process and mark the session terminated.
    pub async fn shutdown(&self) -> TerminationReport {
        let mut handles = {
            let mut session = self.session.lock().await;
            session.set_state(SessionState::Terminating);
            session.take_handles()
        };

        let report = cleanup::terminate_all(&mut handles, self.config.grace_period()).await;

        let mut session = self.session.lock().await;
        session.restore_handles(handles);
        session.set_state(SessionState::Terminated);
        report
    }

    async fn failure_summary(&self) -> String {
        let session = self.session.lock().await;
        let failed: Vec<String> = session
            .stages()
            .iter()
            .filter(|s| matches!(s.state, StageState::Failed | StageState::Skipped))
            .map(|s| match &s.detail {
                Some(detail) => format!("{}: {detail}", s.name),
                None => format!("{}: {:?}", s.name, s.state),
            })
            .collect();
        if failed.is_empty() {
            "stage sequence failed".into()
        } else {
            failed.join("; ")
        }
    }
}
