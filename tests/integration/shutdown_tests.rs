//! Termination of tracked processes on shutdown.

use std::time::{Duration, Instant};

use stagehand::models::process::{ProcessHandle, ProcessState};
use stagehand::models::stage::{FailurePolicy, ReadinessCheck};
use stagehand::orchestrator::cleanup::terminate_all;
use stagehand::orchestrator::launcher::launch;
use stagehand::pidfile::process_alive;

use super::test_helpers::{controller, sh_stage};

fn spawn(index: usize, name: &str, script: &str) -> ProcessHandle {
    launch(&sh_stage(index, name, script, ReadinessCheck::None, 1_000))
        .expect("launch")
        .handle
}

#[tokio::test]
async fn terminates_in_reverse_startup_order() {
    let mut handles = vec![
        spawn(0, "driver", "exec sleep 30"),
        spawn(1, "upsd", "exec sleep 30"),
        spawn(2, "upsmon", "exec sleep 30"),
    ];

    let report = terminate_all(&mut handles, Duration::from_secs(2)).await;

    assert_eq!(report.stopped, vec!["upsmon", "upsd", "driver"]);
    assert_eq!(report.graceful, 3);
    assert_eq!(report.forced, 0);
    for handle in &mut handles {
        assert_eq!(handle.state(), ProcessState::Stopped);
        assert!(handle.poll_exit().is_some());
    }
}

#[tokio::test]
async fn forces_children_that_ignore_sigterm() {
    let mut handles = vec![spawn(
        0,
        "stubborn",
        "trap '' TERM; while true; do sleep 0.1; done",
    )];
    // Give the shell time to install the trap.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let started = Instant::now();
    let report = terminate_all(&mut handles, Duration::from_millis(300)).await;

    assert_eq!(report.forced, 1);
    assert_eq!(report.graceful, 0);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(handles[0].poll_exit().is_some());
}

#[tokio::test]
async fn exited_children_are_not_signalled() {
    let mut handles = vec![spawn(0, "oneshot", "exit 0")];
    tokio::time::sleep(Duration::from_millis(300)).await;

    let report = terminate_all(&mut handles, Duration::from_secs(1)).await;

    assert_eq!(report.stopped, vec!["oneshot"]);
    assert_eq!(report.graceful + report.forced, 0);
    assert_eq!(handles[0].state(), ProcessState::Stopped);
}

#[tokio::test]
async fn no_tracked_child_survives_the_grace_period() {
    let stages = vec![
        sh_stage(0, "driver", "exec sleep 30", ReadinessCheck::None, 1_000),
        sh_stage(1, "upsd", "exec sleep 30", ReadinessCheck::None, 1_000),
        sh_stage(2, "upsmon", "exec sleep 30", ReadinessCheck::None, 1_000),
    ];
    let (controller, session, cancel) = controller(stages, FailurePolicy::FailFast);
    controller.run().await.expect("sequence runs");
    cancel.cancel();

    let mut handles = session.lock().await.take_handles();
    let pids: Vec<u32> = handles.iter().filter_map(|h| h.pid).collect();
    assert_eq!(pids.len(), 3);

    let grace = Duration::from_secs(1);
    let started = Instant::now();
    terminate_all(&mut handles, grace).await;
    assert!(started.elapsed() <= grace + Duration::from_millis(500));

    for pid in pids {
        assert!(!process_alive(pid), "pid {pid} survived shutdown");
    }
}
