//! Shared-secret token for the control socket.
//!
//! The local socket lives in the abstract namespace on Linux, where file
//! permissions do not apply. `start` writes a random token to a 0600 file
//! in the state directory; `stop` and `status` read it back and send it
//! with every request, so only users able to read that file can control
//! the supervisor.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{AppError, Result};

/// Token issued by a running supervisor; its file is removed on drop.
#[derive(Debug)]
pub struct AuthToken {
    path: PathBuf,
    value: String,
}

impl AuthToken {
    /// Generate a fresh token and write it to `path` with mode 0600.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the file cannot be written.
    pub fn issue(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let value = uuid::Uuid::new_v4().to_string();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                AppError::Io(format!("failed to create {}: {err}", parent.display()))
            })?;
        }

        // Drop any previous file first so the mode below applies.
        match fs::remove_file(&path) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => {
                return Err(AppError::Io(format!(
                    "failed to replace {}: {err}",
                    path.display()
                )));
            }
            _ => {}
        }

        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let write_err =
            |err: io::Error| AppError::Io(format!("failed to write {}: {err}", path.display()));
        let mut file = options.open(&path).map_err(write_err)?;
        writeln!(file, "{value}").map_err(write_err)?;
        file.sync_all().map_err(write_err)?;

        debug!(file = %path.display(), "ipc auth token written");
        Ok(Self { path, value })
    }

    /// The secret itself.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }
}

impl Drop for AuthToken {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Err(error) if error.kind() != io::ErrorKind::NotFound => {
                warn!(file = %self.path.display(), %error, "failed to remove ipc token file");
            }
            _ => {}
        }
    }
}

/// Read the token a running supervisor wrote to `path`.
///
/// # Errors
///
/// Returns `AppError::Ipc` if the file is missing, unreadable, or empty.
pub fn read_token(path: &Path) -> Result<String> {
    let raw = fs::read_to_string(path).map_err(|err| {
        AppError::Ipc(format!("cannot read ipc token {}: {err}", path.display()))
    })?;
    let token = raw.trim();
    if token.is_empty() {
        return Err(AppError::Ipc(format!(
            "ipc token file {} is empty",
            path.display()
        )));
    }
    Ok(token.to_owned())
}
