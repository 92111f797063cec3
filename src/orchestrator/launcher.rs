//! Stage process launcher.
//!
//! Spawns each stage's command as an independent OS process with
//! `kill_on_drop(true)` so the supervisor never leaves orphans behind.
//! Stdout and stderr are piped and forwarded line by line to the log
//! through [`OutputLineCodec`]; for `log_line` readiness every line is
//! also matched against the stage's pattern.

use std::io::ErrorKind;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use regex::Regex;
use tokio::io::AsyncRead;
use tokio::process::Command;
use tokio_util::codec::FramedRead;
use tracing::{info, info_span, warn};

use super::codec::OutputLineCodec;
use crate::models::process::ProcessHandle;
use crate::models::stage::{ReadinessCheck, Stage};
use crate::{AppError, Result};

/// Log target for forwarded child output.
pub const CHILD_TARGET: &str = "stagehand::child";

/// Flag raised by the output forwarders once a line matches the stage's
/// `log_line` pattern.
#[derive(Debug, Clone, Default)]
pub struct LogSignal(Arc<AtomicBool>);

impl LogSignal {
    /// Whether a matching line has been seen.
    #[must_use]
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Record a matching line.
    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// A freshly spawned stage process.
#[derive(Debug)]
pub struct Launched {
    /// Handle in `Running` state.
    pub handle: ProcessHandle,
    /// Raised when the stage's output matches its `log_line` pattern.
    pub log_signal: LogSignal,
}

/// Spawn a stage's command. Does not wait for readiness.
///
/// # Errors
///
/// Returns `AppError::Launch` naming the stage when the executable is
/// missing, not executable, or the spawn fails for another reason, and
/// `AppError::Config` if the stage's `log_line` pattern does not compile.
pub fn launch(stage: &Stage) -> Result<Launched> {
    let span = info_span!("launch", stage = %stage.name, command = %stage.command);
    let _guard = span.enter();

    let matcher = match &stage.readiness {
        ReadinessCheck::LogLine { pattern } => Some(Regex::new(pattern).map_err(|err| {
            AppError::Config(format!("stage '{}' log_line pattern: {err}", stage.name))
        })?),
        _ => None,
    };

    let mut cmd = Command::new(&stage.command);
    cmd.args(&stage.args)
        .envs(&stage.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &stage.working_dir {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn().map_err(|err| {
        let reason = match err.kind() {
            ErrorKind::NotFound => "executable not found".to_owned(),
            ErrorKind::PermissionDenied => "permission denied".to_owned(),
            _ => format!("spawn failed: {err}"),
        };
        AppError::Launch(format!(
            "stage '{}': {reason} ({})",
            stage.name, stage.command
        ))
    })?;

    let log_signal = LogSignal::default();
    if let Some(stdout) = child.stdout.take() {
        forward_output(stdout, stage.name.clone(), "stdout", matcher.clone(), log_signal.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        forward_output(stderr, stage.name.clone(), "stderr", matcher, log_signal.clone());
    }

    let mut handle = ProcessHandle::new(stage.name.clone(), stage.index, child);
    handle.detaches = stage.detaches;
    handle.pid_file.clone_from(&stage.pid_file);

    info!(pid = handle.pid.unwrap_or(0), "stage process spawned");

    Ok(Launched { handle, log_signal })
}

/// Forward a child's output stream to the log until EOF.
///
/// The pipe is drained to the end whatever the child writes; closing it
/// early would kill the child with SIGPIPE on its next write.
fn forward_output<R>(
    reader: R,
    stage: String,
    stream: &'static str,
    matcher: Option<Regex>,
    signal: LogSignal,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut framed = FramedRead::new(reader, OutputLineCodec::new());
        while let Some(item) = framed.next().await {
            match item {
                Ok(line) => {
                    if line.truncated {
                        warn!(
                            target: CHILD_TARGET,
                            stage = %stage,
                            stream,
                            max_bytes = framed.decoder().max_length(),
                            "output line too long, tail discarded"
                        );
                    }
                    info!(target: CHILD_TARGET, stage = %stage, stream, "{}", line.text);
                    if matcher.as_ref().is_some_and(|re| re.is_match(&line.text)) {
                        signal.raise();
                    }
                }
                Err(err) => {
                    warn!(target: CHILD_TARGET, stage = %stage, stream, %err, "output read error");
                    break;
                }
            }
        }
    });
}
