//! Ordering controller behaviour against real child processes.

use std::time::{Duration, Instant};

use stagehand::models::process::ProcessState;
use stagehand::models::session::SessionState;
use stagehand::models::stage::{FailurePolicy, ReadinessCheck, StageState};
use stagehand::orchestrator::child_monitor::poll_children;
use stagehand::orchestrator::cleanup::{remove_stale_paths, terminate_all};
use stagehand::AppError;

use super::test_helpers::{controller, file_ready, sh_stage};

const GRACE: Duration = Duration::from_secs(2);

#[tokio::test]
async fn next_stage_launches_only_after_previous_is_ready() {
    let dir = tempfile::tempdir().expect("tempdir");
    let a_ready = dir.path().join("a.ready");
    let b_saw = dir.path().join("b.saw");

    let stages = vec![
        sh_stage(
            0,
            "driver",
            &format!("sleep 0.3; echo up > '{}'; exec sleep 30", a_ready.display()),
            file_ready(&a_ready),
            5_000,
        ),
        sh_stage(
            1,
            "upsd",
            &format!(
                "if [ -s '{a}' ]; then echo yes > '{b}'; else echo no > '{b}'; fi; exec sleep 30",
                a = a_ready.display(),
                b = b_saw.display()
            ),
            file_ready(&b_saw),
            5_000,
        ),
    ];
    let (controller, session, _cancel) = controller(stages, FailurePolicy::FailFast);

    let outcome = controller.run().await.expect("sequence runs");
    assert_eq!(outcome, SessionState::Completed);
    assert_eq!(std::fs::read_to_string(&b_saw).expect("b ran").trim(), "yes");

    let mut guard = session.lock().await;
    let history = guard.history().to_vec();
    let driver_ready = history
        .iter()
        .position(|r| r.stage == "driver" && r.to == StageState::Ready)
        .expect("driver ready recorded");
    let upsd_launch = history
        .iter()
        .position(|r| r.stage == "upsd" && r.to == StageState::Launching)
        .expect("upsd launch recorded");
    assert!(driver_ready < upsd_launch);
    assert_eq!(guard.state(), SessionState::Completed);

    let mut handles = guard.take_handles();
    drop(guard);
    terminate_all(&mut handles, GRACE).await;
}

#[tokio::test]
async fn fail_fast_halts_at_first_unready_stage() {
    let dir = tempfile::tempdir().expect("tempdir");
    let stages = vec![
        sh_stage(0, "driver", "exec sleep 30", file_ready(&dir.path().join("never")), 300),
        sh_stage(1, "upsd", "exec sleep 30", ReadinessCheck::None, 1_000),
    ];
    let (controller, session, _cancel) = controller(stages, FailurePolicy::FailFast);

    let started = Instant::now();
    let outcome = controller.run().await.expect("sequence runs");
    assert_eq!(outcome, SessionState::Failed);
    assert!(started.elapsed() < Duration::from_secs(2));

    let mut guard = session.lock().await;
    assert_eq!(guard.stage_state("driver"), Some(StageState::Failed));
    assert_eq!(guard.stage_state("upsd"), Some(StageState::Pending));
    let detail = guard.stages()[0].detail.clone().expect("failure detail");
    assert!(detail.contains("timed out"), "detail: {detail}");

    let mut handles = guard.take_handles();
    drop(guard);
    assert_eq!(handles.len(), 1);
    assert_eq!(handles[0].state(), ProcessState::Failed);
    let report = terminate_all(&mut handles, GRACE).await;
    assert_eq!(report.graceful, 1, "timed-out process is still terminated");
    assert_eq!(handles[0].state(), ProcessState::Failed);
}

#[tokio::test]
async fn best_effort_continues_and_skips_dependents() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut upsd = sh_stage(1, "upsd", "exec sleep 30", ReadinessCheck::None, 1_000);
    upsd.depends_on = vec!["driver".into()];
    let stages = vec![
        sh_stage(0, "driver", "exec sleep 30", file_ready(&dir.path().join("never")), 200),
        upsd,
        sh_stage(2, "logger", "exec sleep 30", ReadinessCheck::None, 1_000),
    ];
    let (controller, session, _cancel) = controller(stages, FailurePolicy::BestEffort);

    let outcome = controller.run().await.expect("sequence runs");
    assert_eq!(outcome, SessionState::Failed);

    let mut guard = session.lock().await;
    assert_eq!(guard.stage_state("driver"), Some(StageState::Failed));
    assert_eq!(guard.stage_state("upsd"), Some(StageState::Skipped));
    assert_eq!(guard.stage_state("logger"), Some(StageState::Ready));

    let processes = guard.snapshot().processes;
    assert_eq!(processes[0].stage_name, "driver");
    assert_eq!(processes[0].state, ProcessState::Failed);
    assert_eq!(processes[1].state, ProcessState::Ready);

    let mut handles = guard.take_handles();
    drop(guard);
    let launched: Vec<&str> = handles.iter().map(|h| h.stage_name.as_str()).collect();
    assert_eq!(launched, vec!["driver", "logger"]);
    terminate_all(&mut handles, GRACE).await;
}

#[tokio::test]
async fn launch_failure_halts_regardless_of_policy() {
    let mut missing = sh_stage(0, "driver", "", ReadinessCheck::None, 1_000);
    missing.command = "/nonexistent/stagehand-missing-binary".into();
    missing.args.clear();
    let stages = vec![
        missing,
        sh_stage(1, "upsd", "exec sleep 30", ReadinessCheck::None, 1_000),
    ];
    let (controller, session, _cancel) = controller(stages, FailurePolicy::BestEffort);

    match controller.run().await {
        Err(AppError::Launch(msg)) => {
            assert!(msg.contains("driver"), "msg: {msg}");
            assert!(msg.contains("executable not found"), "msg: {msg}");
        }
        other => panic!("expected launch error, got {other:?}"),
    }

    let guard = session.lock().await;
    assert_eq!(guard.state(), SessionState::Failed);
    assert_eq!(guard.stage_state("driver"), Some(StageState::Failed));
    assert_eq!(guard.stage_state("upsd"), Some(StageState::Pending));
}

#[tokio::test]
async fn early_exit_fails_the_stage() {
    let dir = tempfile::tempdir().expect("tempdir");
    let stages = vec![sh_stage(
        0,
        "driver",
        "exit 3",
        file_ready(&dir.path().join("never")),
        10_000,
    )];
    let (controller, session, _cancel) = controller(stages, FailurePolicy::FailFast);

    let started = Instant::now();
    let outcome = controller.run().await.expect("sequence runs");
    assert_eq!(outcome, SessionState::Failed);
    assert!(started.elapsed() < Duration::from_secs(5));

    let guard = session.lock().await;
    let detail = guard.stages()[0].detail.clone().expect("detail");
    assert!(detail.contains("exited with code 3"), "detail: {detail}");
}

#[tokio::test]
async fn detached_stage_may_exit_cleanly() {
    let dir = tempfile::tempdir().expect("tempdir");
    let pid_file = dir.path().join("daemon.pid");
    let mut daemon = sh_stage(
        0,
        "upsmon",
        &format!("sleep 30 & echo $! > '{}'", pid_file.display()),
        file_ready(&pid_file),
        5_000,
    );
    daemon.detaches = true;
    daemon.pid_file = Some(pid_file.clone());
    let (controller, session, _cancel) = controller(vec![daemon], FailurePolicy::FailFast);

    let outcome = controller.run().await.expect("sequence runs");
    assert_eq!(outcome, SessionState::Completed);

    let mut handles = session.lock().await.take_handles();
    let report = terminate_all(&mut handles, Duration::from_millis(500)).await;
    assert_eq!(report.stopped, vec!["upsmon".to_owned()]);
}

#[tokio::test]
async fn shutdown_interrupts_a_readiness_wait() {
    let dir = tempfile::tempdir().expect("tempdir");
    let stages = vec![
        sh_stage(0, "driver", "exec sleep 30", file_ready(&dir.path().join("never")), 60_000),
        sh_stage(1, "upsd", "exec sleep 30", ReadinessCheck::None, 1_000),
    ];
    let (controller, session, cancel) = controller(stages, FailurePolicy::FailFast);

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let outcome = controller.run().await.expect("sequence runs");
    assert_eq!(outcome, SessionState::Terminating);
    assert!(started.elapsed() < Duration::from_secs(2));

    let mut guard = session.lock().await;
    assert_eq!(guard.stage_state("driver"), Some(StageState::Failed));
    assert_eq!(
        guard.stages()[0].detail.as_deref(),
        Some("interrupted by shutdown")
    );
    assert_eq!(guard.stage_state("upsd"), Some(StageState::Pending));

    let mut handles = guard.take_handles();
    drop(guard);
    terminate_all(&mut handles, GRACE).await;
}

#[tokio::test]
async fn rerun_after_cleanup_repeats_transitions() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ready = dir.path().join("driver.ready");
    let patterns = vec![format!("{}/*.ready", dir.path().display())];

    let mut runs = Vec::new();
    for run in 0..2 {
        let removed = remove_stale_paths(&patterns).expect("cleanup");
        assert_eq!(removed.len(), run, "stale file from the previous run is removed");

        let stages = vec![
            sh_stage(
                0,
                "driver",
                &format!("sleep 0.1; echo up > '{}'; exec sleep 30", ready.display()),
                file_ready(&ready),
                5_000,
            ),
            sh_stage(1, "upsd", "exec sleep 30", ReadinessCheck::None, 1_000),
        ];
        let (controller, session, _cancel) = controller(stages, FailurePolicy::FailFast);
        assert_eq!(controller.run().await.expect("runs"), SessionState::Completed);

        let mut guard = session.lock().await;
        let transitions: Vec<(String, StageState, StageState)> = guard
            .history()
            .iter()
            .map(|r| (r.stage.clone(), r.from, r.to))
            .collect();
        runs.push(transitions);
        let mut handles = guard.take_handles();
        drop(guard);
        terminate_all(&mut handles, GRACE).await;
    }

    assert_eq!(runs[0], runs[1]);
    assert_eq!(runs[0].len(), 6);
}

#[tokio::test]
async fn non_utf8_output_keeps_the_stage_alive_and_readable() {
    let script = "printf 'caf\\351\\n'; sleep 0.2; echo 'Using subdriver'; \
                  while true; do printf '\\377\\n'; sleep 0.05; done";
    let stages = vec![sh_stage(
        0,
        "driver",
        script,
        ReadinessCheck::LogLine {
            pattern: "Using subdriver".to_owned(),
        },
        5_000,
    )];
    let (controller, session, _cancel) = controller(stages, FailurePolicy::FailFast);

    let outcome = controller.run().await.expect("sequence runs");
    assert_eq!(outcome, SessionState::Completed);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(poll_children(&session).await.is_empty(), "driver must keep running");

    let mut handles = session.lock().await.take_handles();
    let report = terminate_all(&mut handles, GRACE).await;
    assert_eq!(report.stopped, vec!["driver".to_owned()]);
}
