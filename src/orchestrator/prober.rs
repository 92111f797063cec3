//! Readiness prober.
//!
//! Polls a stage's [`ReadinessCheck`] at a fixed interval until it holds,
//! the timeout elapses, the process exits, or shutdown is requested. The
//! cancellation token is observed between polls, so a shutdown signal is
//! never stuck behind a readiness wait.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::launcher::LogSignal;
use crate::models::stage::ReadinessCheck;

/// Default interval between readiness polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Lower bound for a single TCP connect attempt.
const MIN_CONNECT_ATTEMPT: Duration = Duration::from_millis(10);

/// Result of waiting for readiness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The check succeeded.
    Ready {
        /// Time from the start of probing to readiness.
        elapsed: Duration,
    },
    /// The timeout elapsed first.
    TimedOut {
        /// Time spent probing.
        elapsed: Duration,
    },
    /// The process exited before becoming ready.
    Exited {
        /// Description of the exit status.
        status: String,
    },
    /// Shutdown was requested while probing.
    Cancelled,
}

/// Polling parameters shared by every probe in a session.
#[derive(Debug, Clone)]
pub struct ReadinessProber {
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl ReadinessProber {
    /// Build a prober polling at `poll_interval` and observing `cancel`.
    #[must_use]
    pub fn new(poll_interval: Duration, cancel: CancellationToken) -> Self {
        Self {
            poll_interval,
            cancel,
        }
    }

    /// Poll `check` until it holds or `timeout` elapses.
    ///
    /// `exited` is consulted before every poll; returning `Some(status)`
    /// ends the wait with [`ProbeOutcome::Exited`].
    pub async fn await_ready<F, Fut>(
        &self,
        check: &ReadinessCheck,
        log_signal: &LogSignal,
        timeout: Duration,
        mut exited: F,
    ) -> ProbeOutcome
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Option<String>>,
    {
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            if self.cancel.is_cancelled() {
                return ProbeOutcome::Cancelled;
            }
            if let Some(status) = exited().await {
                return ProbeOutcome::Exited { status };
            }

            let now = Instant::now();
            let remaining = deadline.saturating_duration_since(now);
            if self.check_once(check, log_signal, started, remaining).await {
                let elapsed = started.elapsed();
                debug!(check = %check, elapsed_ms = elapsed.as_millis(), "readiness observed");
                return ProbeOutcome::Ready { elapsed };
            }

            let now = Instant::now();
            if now >= deadline {
                return ProbeOutcome::TimedOut {
                    elapsed: started.elapsed(),
                };
            }

            let nap = self.poll_interval.min(deadline - now);
            tokio::select! {
                () = self.cancel.cancelled() => return ProbeOutcome::Cancelled,
                () = tokio::time::sleep(nap) => {}
            }
        }
    }

    async fn check_once(
        &self,
        check: &ReadinessCheck,
        log_signal: &LogSignal,
        started: Instant,
        remaining: Duration,
    ) -> bool {
        match check {
            ReadinessCheck::None => true,
            ReadinessCheck::Delay { millis } => {
                started.elapsed() >= Duration::from_millis(*millis)
            }
            ReadinessCheck::Tcp { host, port } => {
                let attempt = self.poll_interval.min(remaining).max(MIN_CONNECT_ATTEMPT);
                match tokio::time::timeout(attempt, TcpStream::connect((host.as_str(), *port)))
                    .await
                {
                    Ok(Ok(_)) => true,
                    Ok(Err(err)) => {
                        trace!(%host, port, %err, "tcp probe refused");
                        false
                    }
                    Err(_) => false,
                }
            }
            ReadinessCheck::File { path } => tokio::fs::metadata(path)
                .await
                .is_ok_and(|meta| meta.is_file() && meta.len() > 0),
            ReadinessCheck::LogLine { .. } => log_signal.is_raised(),
        }
    }
}
