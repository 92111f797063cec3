//! Supervisor PID file.
//!
//! Keeps two supervisors from running against the same state directory
//! and lets `stagehand stop` signal the supervisor when the control
//! socket is unreachable.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::{AppError, Result};

/// PID file owned by a running supervisor; removed on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Write the current process ID to `path`.
    ///
    /// A leftover file naming a dead process is replaced.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if another live supervisor owns the file,
    /// or `AppError::Io` if the file cannot be written.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(pid) = read_pid(&path)? {
            if process_alive(pid) {
                return Err(AppError::Config(format!(
                    "supervisor already running with pid {pid} ({})",
                    path.display()
                )));
            }
            warn!(pid, file = %path.display(), "replacing stale pid file");
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                AppError::Io(format!("failed to create {}: {err}", parent.display()))
            })?;
        }

        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let write_err =
            |err: io::Error| AppError::Io(format!("failed to write {}: {err}", path.display()));
        let mut file = options.open(&path).map_err(write_err)?;
        writeln!(file, "{}", std::process::id()).map_err(write_err)?;
        file.sync_all().map_err(write_err)?;

        info!(pid = std::process::id(), file = %path.display(), "pid file written");
        Ok(Self { path })
    }

    /// Location of the PID file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Err(error) if error.kind() != io::ErrorKind::NotFound => {
                warn!(file = %self.path.display(), %error, "failed to remove pid file");
            }
            _ => {}
        }
    }
}

/// Read the PID recorded in `path`, if the file exists.
///
/// # Errors
///
/// Returns `AppError::Io` if the file exists but cannot be read or parsed.
pub fn read_pid(path: &Path) -> Result<Option<u32>> {
    match fs::read_to_string(path) {
        Ok(raw) => raw.trim().parse().map(Some).map_err(|err| {
            AppError::Io(format!("malformed pid file {}: {err}", path.display()))
        }),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(AppError::Io(format!(
            "failed to read {}: {err}",
            path.display()
        ))),
    }
}

/// Send SIGTERM to the supervisor recorded in `path`.
///
/// # Errors
///
/// Returns `AppError::Shutdown` when no live supervisor is recorded or the
/// signal cannot be delivered.
#[cfg(unix)]
pub fn signal_supervisor(path: &Path) -> Result<u32> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = read_pid(path)?
        .ok_or_else(|| AppError::Shutdown(format!("no pid file at {}", path.display())))?;
    let raw = i32::try_from(pid)
        .map_err(|_| AppError::Shutdown(format!("pid {pid} out of range")))?;
    kill(Pid::from_raw(raw), Signal::SIGTERM)
        .map_err(|err| AppError::Shutdown(format!("failed to signal pid {pid}: {err}")))?;
    Ok(pid)
}

/// Signalling by PID is only supported on unix.
///
/// # Errors
///
/// Always returns `AppError::Shutdown`.
#[cfg(not(unix))]
pub fn signal_supervisor(path: &Path) -> Result<u32> {
    Err(AppError::Shutdown(format!(
        "cannot signal supervisor from {} on this platform",
        path.display()
    )))
}

/// Whether a process with `pid` exists.
#[cfg(unix)]
#[must_use]
pub fn process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    i32::try_from(pid).is_ok_and(|pid| kill(Pid::from_raw(pid), None).is_ok())
}

/// Liveness cannot be checked off unix; assume alive.
#[cfg(not(unix))]
#[must_use]
pub fn process_alive(_pid: u32) -> bool {
    true
}
