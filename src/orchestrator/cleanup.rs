//! Cleanup coordinator.
//!
//! Removes stale state files before the first stage launches, and
//! terminates every tracked process in reverse startup order on shutdown.
//! Children get SIGTERM first and share a single grace deadline; whatever
//! is still alive at the deadline is killed.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::models::process::{ProcessHandle, ProcessState};
use crate::{AppError, Result};

/// Interval between liveness checks on a detached daemon's PID.
const DAEMON_POLL: Duration = Duration::from_millis(50);

/// Remove every file matching the configured glob patterns.
///
/// Missing paths are not errors, so running this twice is a no-op the
/// second time. Directories are left alone.
///
/// # Errors
///
/// Returns `AppError::Config` for an invalid pattern and `AppError::Io`
/// when a matching file cannot be removed.
pub fn remove_stale_paths(patterns: &[String]) -> Result<Vec<PathBuf>> {
    let _span = info_span!("stale_cleanup").entered();
    let mut removed = Vec::new();

    for pattern in patterns {
        for entry in glob::glob(pattern)? {
            let path = match entry {
                Ok(path) => path,
                Err(err) => {
                    warn!(%pattern, %err, "unreadable path while expanding pattern");
                    continue;
                }
            };
            if path.is_dir() {
                warn!(path = %path.display(), "stale path is a directory; leaving it in place");
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    info!(path = %path.display(), "removed stale path");
                    removed.push(path);
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(AppError::Io(format!(
                        "failed to remove stale path {}: {err}",
                        path.display()
                    )));
                }
            }
        }
    }

    Ok(removed)
}

/// Summary of a termination pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TerminationReport {
    /// Stage names in the order they were stopped.
    pub stopped: Vec<String>,
    /// Processes that exited within the grace period.
    pub graceful: usize,
    /// Processes that had to be killed.
    pub forced: usize,
}

/// Terminate every handle in reverse startup order.
///
/// All handles share one deadline of `now + grace`; each handle ends in
/// `Stopped` unless it had already failed.
pub async fn terminate_all(handles: &mut [ProcessHandle], grace: Duration) -> TerminationReport {
    let span = info_span!("terminate_all", count = handles.len(), grace_ms = grace.as_millis());
    async move {
        let deadline = Instant::now() + grace;
        let mut report = TerminationReport::default();

        handles.sort_by_key(|h| std::cmp::Reverse(h.order));
        for handle in handles.iter_mut() {
            let forced = if handle.has_detached() {
                terminate_daemon(handle, deadline).await
            } else {
                terminate_child(handle, deadline).await
            };
            match forced {
                Some(true) => report.forced += 1,
                Some(false) => report.graceful += 1,
                None => {}
            }
            handle.transition(ProcessState::Stopped);
            report.stopped.push(handle.stage_name.clone());
        }

        info!(
            graceful = report.graceful,
            forced = report.forced,
            "tracked processes terminated"
        );
        report
    }
    .instrument(span)
    .await
}

/// Stop a direct child. Returns `Some(forced)` when a live process was
/// terminated and `None` when it had already exited.
async fn terminate_child(handle: &mut ProcessHandle, deadline: Instant) -> Option<bool> {
    if let Some(status) = handle.poll_exit() {
        debug!(stage = %handle.stage_name, ?status, "process already exited");
        return None;
    }

    request_stop(handle);

    let stage = handle.stage_name.clone();
    let child = handle.child_mut();
    match tokio::time::timeout_at(deadline, child.wait()).await {
        Ok(Ok(status)) => {
            info!(stage = %stage, ?status, "process exited after SIGTERM");
            Some(false)
        }
        Ok(Err(err)) => {
            warn!(stage = %stage, %err, "failed to wait for process");
            Some(false)
        }
        Err(_) => {
            warn!(stage = %stage, "grace period elapsed; killing process");
            if let Err(err) = child.kill().await {
                warn!(stage = %stage, %err, "failed to kill process");
            }
            Some(true)
        }
    }
}

#[cfg(unix)]
fn request_stop(handle: &mut ProcessHandle) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = handle.pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        warn!(stage = %handle.stage_name, pid, %err, "failed to send SIGTERM");
    }
}

#[cfg(not(unix))]
fn request_stop(handle: &mut ProcessHandle) {
    if let Err(err) = handle.child_mut().start_kill() {
        warn!(stage = %handle.stage_name, %err, "failed to stop process");
    }
}

/// Stop the daemon a detaching stage left behind, located through its PID
/// file.
#[cfg(unix)]
async fn terminate_daemon(handle: &mut ProcessHandle, deadline: Instant) -> Option<bool> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = handle.daemon_pid().and_then(|pid| i32::try_from(pid).ok()) else {
        warn!(stage = %handle.stage_name, "detached stage has no readable pid file; nothing to stop");
        return None;
    };
    let pid = Pid::from_raw(pid);
    if kill(pid, None).is_err() {
        return None;
    }
    if let Err(err) = kill(pid, Signal::SIGTERM) {
        warn!(stage = %handle.stage_name, %pid, %err, "failed to send SIGTERM to daemon");
    }

    while Instant::now() < deadline {
        if kill(pid, None).is_err() {
            info!(stage = %handle.stage_name, %pid, "daemon exited after SIGTERM");
            return Some(false);
        }
        tokio::time::sleep(DAEMON_POLL).await;
    }

    warn!(stage = %handle.stage_name, %pid, "grace period elapsed; killing daemon");
    if let Err(err) = kill(pid, Signal::SIGKILL) {
        warn!(stage = %handle.stage_name, %pid, %err, "failed to kill daemon");
    }
    Some(true)
}

#[cfg(not(unix))]
async fn terminate_daemon(handle: &mut ProcessHandle, _deadline: Instant) -> Option<bool> {
    warn!(stage = %handle.stage_name, "detached daemons can only be signalled on unix");
    None
}
