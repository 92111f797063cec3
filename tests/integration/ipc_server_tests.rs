//! Control channel: `status` and `stop` over the local socket.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use stagehand::ipc::client::{into_data, send_command};
use stagehand::ipc::server::spawn_ipc_server;
use stagehand::models::session::{SharedSession, SupervisionSession};
use stagehand::models::stage::StageState;
use stagehand::AppError;

fn unique_name() -> String {
    format!("stagehand-test-{}", uuid::Uuid::new_v4())
}

const TOKEN: &str = "test-token";

async fn request_with(
    name: &str,
    token: Option<&str>,
    command: &str,
) -> stagehand::Result<serde_json::Value> {
    let name = name.to_owned();
    let token = token.map(str::to_owned);
    let body = serde_json::json!({ "command": command });
    tokio::task::spawn_blocking(move || send_command(&name, token.as_deref(), &body))
        .await
        .expect("client task joins")
}

async fn request(name: &str, command: &str) -> stagehand::Result<serde_json::Value> {
    request_with(name, Some(TOKEN), command).await
}

fn serve(
    name: &str,
    session: SharedSession,
    ct: &CancellationToken,
) -> tokio::task::JoinHandle<()> {
    spawn_ipc_server(name, session, ct.clone(), Some(TOKEN.to_owned())).expect("listen")
}

#[tokio::test(flavor = "multi_thread")]
async fn status_returns_session_snapshot() {
    let session: SharedSession = SupervisionSession::new(["driver", "upsd"]).shared();
    session
        .lock()
        .await
        .transition_stage("driver", StageState::Launching, None);
    let ct = CancellationToken::new();
    let name = unique_name();
    let server = serve(&name, SharedSession::clone(&session), &ct);

    let data = into_data(request(&name, "status").await.expect("status")).expect("ok");
    assert_eq!(data["state"], "in_progress");
    assert_eq!(data["stages"][0]["name"], "driver");
    assert_eq!(data["stages"][0]["state"], "launching");
    assert_eq!(data["stages"][1]["state"], "pending");

    ct.cancel();
    server.await.expect("server joins");
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_cancels_the_supervisor_token() {
    let session = SupervisionSession::new(["driver"]).shared();
    let session_id = session.lock().await.id.clone();
    let ct = CancellationToken::new();
    let name = unique_name();
    let server = serve(&name, session, &ct);

    let data = into_data(request(&name, "stop").await.expect("stop")).expect("ok");
    assert_eq!(data["stopping"], true);
    assert_eq!(data["session_id"], session_id.as_str());
    assert!(ct.is_cancelled());

    tokio::time::timeout(Duration::from_secs(1), server)
        .await
        .expect("server stops after stop")
        .expect("server joins");
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_command_is_rejected() {
    let session = SupervisionSession::new(["driver"]).shared();
    let ct = CancellationToken::new();
    let name = unique_name();
    let server = serve(&name, session, &ct);

    let response = request(&name, "restart").await.expect("response");
    match into_data(response) {
        Err(AppError::Ipc(msg)) => assert_eq!(msg, "unknown command: restart"),
        other => panic!("expected ipc error, got {other:?}"),
    }
    assert!(!ct.is_cancelled());

    ct.cancel();
    server.await.expect("server joins");
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_socket_is_an_ipc_error() {
    let result = request(&unique_name(), "status").await;
    assert!(matches!(result, Err(AppError::Ipc(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_without_token_is_unauthorized() {
    let session = SupervisionSession::new(["driver"]).shared();
    let ct = CancellationToken::new();
    let name = unique_name();
    let server = serve(&name, session, &ct);

    for token in [None, Some("wrong-token")] {
        let response = request_with(&name, token, "stop").await.expect("response");
        match into_data(response) {
            Err(AppError::Ipc(msg)) => assert_eq!(msg, "unauthorized"),
            other => panic!("expected unauthorized, got {other:?}"),
        }
    }
    assert!(!ct.is_cancelled(), "rejected stop must not cancel");

    ct.cancel();
    server.await.expect("server joins");
}

#[tokio::test(flavor = "multi_thread")]
async fn server_without_token_accepts_any_request() {
    let session = SupervisionSession::new(["driver"]).shared();
    let ct = CancellationToken::new();
    let name = unique_name();
    let server = spawn_ipc_server(&name, session, ct.clone(), None).expect("listen");

    let data = into_data(request_with(&name, None, "status").await.expect("status")).expect("ok");
    assert_eq!(data["stages"][0]["name"], "driver");

    ct.cancel();
    server.await.expect("server joins");
}
