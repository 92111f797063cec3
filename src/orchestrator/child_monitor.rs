//! Child process monitor: detects unexpected stage process exits.
//!
//! Once the stage sequence has finished, periodically polls every live
//! process in the session. A process that exited on its own is marked
//! `Stopped` (exit code 0) or `Failed` (anything else). Detached stages are
//! checked through the PID in their PID file.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::models::process::{describe_exit, ProcessHandle, ProcessState};
use crate::models::session::SharedSession;
use crate::pidfile::process_alive;

/// Spawn a background task that watches tracked processes for unexpected
/// exits.
///
/// The task polls at `interval` until the `CancellationToken` fires.
#[must_use]
pub fn spawn_child_monitor(
    session: SharedSession,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(
        async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("child process monitor shutting down");
                        break;
                    }
                    () = tokio::time::sleep(interval) => {}
                }

                poll_children(&session).await;
            }
        }
        .instrument(info_span!("child_monitor")),
    )
}

/// Check every live process once. Returns the stages found to have exited.
pub async fn poll_children(session: &SharedSession) -> Vec<String> {
    let mut guard = session.lock().await;
    let mut exited = Vec::new();

    for handle in guard.handles_mut() {
        if !handle.state().is_live() {
            continue;
        }
        if let Some((next, status_text)) = check_handle(handle) {
            warn!(stage = %handle.stage_name, status = %status_text, "stage process exited unexpectedly");
            handle.transition(next);
            exited.push(handle.stage_name.clone());
        }
    }

    exited
}

fn check_handle(handle: &mut ProcessHandle) -> Option<(ProcessState, String)> {
    if handle.has_detached() {
        return match handle.daemon_pid() {
            Some(pid) if !process_alive(pid) => Some((
                ProcessState::Failed,
                format!("daemon pid {pid} is gone"),
            )),
            _ => None,
        };
    }

    let status = handle.poll_exit()?;
    let next = if status.success() {
        ProcessState::Stopped
    } else {
        ProcessState::Failed
    };
    Some((next, describe_exit(Some(status))))
}
