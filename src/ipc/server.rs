//! Local IPC server for `stagehand stop` and `stagehand status`.
//!
//! Listens on a named pipe (Windows) or Unix domain socket (Linux/macOS)
//! using the `interprocess` crate. Accepts line-delimited JSON commands
//! and answers from the shared supervision session.
//!
//! ## Protocol
//!
//! Request (one JSON object per line):
//! ```json
//! {"command": "status", "auth_token": "..."}
//! {"command": "stop", "auth_token": "..."}
//! ```
//!
//! Response (one JSON object per line):
//! ```json
//! {"ok": true, "data": { ... } }
//! {"ok": false, "error": "unknown command: restart"}
//! {"ok": false, "error": "unauthorized"}
//! ```
//!
//! When the server is started with a token, every request must carry it.

use interprocess::local_socket::{tokio::prelude::*, GenericNamespaced, ListenerOptions};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::models::session::SharedSession;
use crate::{AppError, Result};

/// Inbound IPC request.
#[derive(Debug, Deserialize)]
struct IpcRequest {
    /// Command verb.
    command: String,
    /// Shared secret issued by the supervisor.
    #[serde(default)]
    auth_token: Option<String>,
}

/// Outbound IPC response.
#[derive(Debug, Serialize)]
struct IpcResponse {
    /// Whether the command succeeded.
    ok: bool,
    /// Payload on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
    /// Error message on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl IpcResponse {
    fn success(data: serde_json::Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Spawn the IPC server task.
///
/// The `stop` command cancels `ct`, which is also what stops the server.
/// With `auth_token` set, requests without the matching token are
/// rejected as `unauthorized`.
///
/// # Errors
///
/// Returns `AppError::Ipc` if the listener cannot be created.
pub fn spawn_ipc_server(
    name: &str,
    session: SharedSession,
    ct: CancellationToken,
    auth_token: Option<String>,
) -> Result<tokio::task::JoinHandle<()>> {
    let name = name.to_owned();

    let listener_name = name
        .clone()
        .to_ns_name::<GenericNamespaced>()
        .map_err(|err| AppError::Ipc(format!("invalid ipc socket name '{name}': {err}")))?;

    let listener = ListenerOptions::new()
        .name(listener_name)
        .create_tokio()
        .map_err(|err| AppError::Ipc(format!("failed to create ipc listener: {err}")))?;

    info!(ipc_name = %name, "IPC server listening");

    let handle = tokio::spawn(async move {
        let span = info_span!("ipc_server", name = %name);
        async move {
            loop {
                tokio::select! {
                    () = ct.cancelled() => {
                        info!("IPC server shutting down");
                        break;
                    }
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok(stream) => {
                                tokio::spawn(handle_connection(
                                    stream,
                                    SharedSession::clone(&session),
                                    ct.clone(),
                                    auth_token.clone(),
                                ));
                            }
                            Err(err) => {
                                warn!(%err, "IPC accept failed");
                            }
                        }
                    }
                }
            }
        }
        .instrument(span)
        .await;
    });

    Ok(handle)
}

/// Handle a single IPC client connection.
async fn handle_connection(
    stream: interprocess::local_socket::tokio::Stream,
    session: SharedSession,
    ct: CancellationToken,
    auth_token: Option<String>,
) {
    let span = info_span!("ipc_conn");
    async move {
        let (reader, mut writer) = stream.split();
        let mut buf_reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            match buf_reader.read_line(&mut line).await {
                Ok(0) => break, // EOF
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }

                    let response = match serde_json::from_str::<IpcRequest>(trimmed) {
                        Ok(request) => {
                            dispatch_command(&request, &session, &ct, auth_token.as_deref())
                                .await
                        }
                        Err(err) => IpcResponse::error(format!("invalid json: {err}")),
                    };

                    let mut response_line = serde_json::to_string(&response).unwrap_or_else(|_| {
                        r#"{"ok":false,"error":"serialization failed"}"#.to_owned()
                    });
                    response_line.push('\n');

                    if let Err(err) = writer.write_all(response_line.as_bytes()).await {
                        warn!(%err, "failed to write ipc response");
                        break;
                    }
                }
                Err(err) => {
                    warn!(%err, "ipc read error");
                    break;
                }
            }
        }

        info!("IPC connection closed");
    }
    .instrument(span)
    .await;
}

/// Route an IPC command to the appropriate handler.
async fn dispatch_command(
    request: &IpcRequest,
    session: &SharedSession,
    ct: &CancellationToken,
    auth_token: Option<&str>,
) -> IpcResponse {
    let span = info_span!("ipc_command", command = %request.command);
    async move {
        if let Some(expected) = auth_token {
            if request.auth_token.as_deref() != Some(expected) {
                warn!(command = %request.command, "IPC request rejected: invalid auth token");
                return IpcResponse::error("unauthorized");
            }
        }

        match request.command.as_str() {
            "status" => handle_status(session).await,
            "stop" => handle_stop(session, ct).await,
            other => IpcResponse::error(format!("unknown command: {other}")),
        }
    }
    .instrument(span)
    .await
}

/// Report the current session snapshot.
async fn handle_status(session: &SharedSession) -> IpcResponse {
    let snapshot = session.lock().await.snapshot();
    match serde_json::to_value(&snapshot) {
        Ok(data) => IpcResponse::success(data),
        Err(err) => IpcResponse::error(format!("failed to serialize session: {err}")),
    }
}

/// Request shutdown of the supervisor.
async fn handle_stop(session: &SharedSession, ct: &CancellationToken) -> IpcResponse {
    let session_id = session.lock().await.id.clone();
    info!(session_id, "stop requested over IPC");
    ct.cancel();
    IpcResponse::success(serde_json::json!({ "session_id": session_id, "stopping": true }))
}
