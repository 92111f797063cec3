//! Blocking IPC client used by `stagehand stop` and `stagehand status`.

use std::io::{BufRead, BufReader, Write};

use interprocess::local_socket::{traits::Stream as _, GenericNamespaced, Stream, ToNsName};

use crate::{AppError, Result};

/// Connect to the IPC socket, send a JSON command, and read the response.
///
/// `auth_token` is added to the request as `"auth_token"` when given.
///
/// # Errors
///
/// Returns `AppError::Ipc` if the socket is unreachable or the exchange
/// fails.
pub fn send_command(
    ipc_name: &str,
    auth_token: Option<&str>,
    request: &serde_json::Value,
) -> Result<serde_json::Value> {
    let mut request = request.clone();
    if let (Some(token), Some(fields)) = (auth_token, request.as_object_mut()) {
        fields.insert("auth_token".into(), serde_json::Value::from(token));
    }

    let ipc_err = |err: std::io::Error| AppError::Ipc(format!("{ipc_name}: {err}"));

    let name = ipc_name
        .to_ns_name::<GenericNamespaced>()
        .map_err(ipc_err)?;
    let mut stream = Stream::connect(name).map_err(ipc_err)?;

    let mut request_line = serde_json::to_string(&request)
        .map_err(|err| AppError::Ipc(format!("failed to encode request: {err}")))?;
    request_line.push('\n');
    stream.write_all(request_line.as_bytes()).map_err(ipc_err)?;
    stream.flush().map_err(ipc_err)?;

    let mut reader = BufReader::new(&stream);
    let mut response_line = String::new();
    reader.read_line(&mut response_line).map_err(ipc_err)?;

    serde_json::from_str(response_line.trim())
        .map_err(|err| AppError::Ipc(format!("malformed response: {err}")))
}

/// Unwrap an `{"ok": ..., "data": ..., "error": ...}` response.
///
/// # Errors
///
/// Returns `AppError::Ipc` carrying the server's error message when `ok`
/// is not `true`.
pub fn into_data(response: serde_json::Value) -> Result<serde_json::Value> {
    let ok = response
        .get("ok")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false);
    if ok {
        Ok(response
            .get("data")
            .cloned()
            .unwrap_or(serde_json::Value::Null))
    } else {
        let message = response
            .get("error")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("unknown error");
        Err(AppError::Ipc(message.to_owned()))
    }
}
