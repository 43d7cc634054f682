//! Executor behavior under the wall clock: timeout escalation, OOM
//! classification, memory sampling and cancellation.

mod support;

use std::{
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use nimbus_common::{OutcomeStatus, Runtime, Signal};
use nimbus_executor::{ExecutionLimits, Executor, LaunchPlan, SlotLease};
use support::{ExecBehavior, FakeDaemon};
use tokio_util::sync::CancellationToken;

fn lease() -> SlotLease {
    SlotLease {
        container_id: "c0".into(),
        runtime: Runtime::Python,
        generation: 1,
        workspace: Some("/workspace-root/r1".into()),
    }
}

fn plan() -> LaunchPlan {
    LaunchPlan {
        argv: vec!["python".into(), "main.py".into()],
        workdir: "/workspace-root/r1".into(),
    }
}

fn limits(timeout_ms: u64, memory_mb: Option<u64>) -> ExecutionLimits {
    ExecutionLimits {
        timeout: Duration::from_millis(timeout_ms),
        memory_bytes: memory_mb.map(|mb| mb * 1024 * 1024),
        stream_cap: 64 * 1024,
    }
}

#[tokio::test(start_paused = true)]
async fn successful_run_reports_output_and_peak_memory() {
    let daemon = Arc::new(FakeDaemon::default());
    daemon
        .set_behavior(ExecBehavior {
            delay: Duration::from_millis(600),
            exit_code: 0,
            stdout: b"hello\n".to_vec(),
            ..Default::default()
        })
        .await;
    daemon.rss_bytes.store(7 * 1024 * 1024, Ordering::Relaxed);

    let executor = Executor::new(daemon.clone());
    let report = executor
        .run(&lease(), &plan(), &limits(5_000, Some(128)), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.status, OutcomeStatus::Succeeded);
    assert_eq!(report.exit_code, Some(0));
    assert_eq!(report.stdout, "hello\n");
    assert!(!report.dirty);
    // The 250ms sampler ran at least once during the 600ms execution.
    assert_eq!(report.peak_memory_bytes, Some(7 * 1024 * 1024));
    // The job's cgroup cap was applied before exec.
    let caps = daemon.memory_limits.lock().await;
    assert_eq!(caps.as_slice(), &[("c0".to_string(), 128 * 1024 * 1024)]);
}

#[tokio::test(start_paused = true)]
async fn deadline_escalates_term_then_kill_and_marks_dirty() {
    let daemon = Arc::new(FakeDaemon::default());
    daemon
        .set_behavior(ExecBehavior {
            delay: Duration::from_secs(60),
            ..Default::default()
        })
        .await;

    let executor = Executor::new(daemon.clone());
    let report = executor
        .run(&lease(), &plan(), &limits(1_000, None), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.status, OutcomeStatus::TimedOut);
    assert_eq!(report.exit_code, None);
    assert!(report.dirty);
    assert!(report.duration >= Duration::from_millis(1_000));

    let kills = daemon.kill_log.lock().await;
    assert_eq!(
        kills.as_slice(),
        &[
            ("c0".to_string(), Signal::Term),
            ("c0".to_string(), Signal::Kill)
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn process_finishing_in_the_grace_window_is_still_timed_out() {
    let daemon = Arc::new(FakeDaemon::default());
    // Finishes 200ms after the deadline, inside the 500ms TERM grace.
    daemon
        .set_behavior(ExecBehavior {
            delay: Duration::from_millis(1_200),
            exit_code: 0,
            stdout: b"late\n".to_vec(),
            ..Default::default()
        })
        .await;

    let executor = Executor::new(daemon.clone());
    let report = executor
        .run(&lease(), &plan(), &limits(1_000, None), &CancellationToken::new())
        .await
        .unwrap();

    // Even an exit 0 after the killer fired is reported TimedOut.
    assert_eq!(report.status, OutcomeStatus::TimedOut);
    assert_eq!(report.exit_code, None);
    assert!(report.dirty);
    // The salvaged output is still carried.
    assert_eq!(report.stdout, "late\n");
    // No SIGKILL needed: the process went down to the TERM.
    let kills = daemon.kill_log.lock().await;
    assert_eq!(kills.as_slice(), &[("c0".to_string(), Signal::Term)]);
}

#[tokio::test(start_paused = true)]
async fn oom_exit_under_a_cap_is_memory_exceeded() {
    let daemon = Arc::new(FakeDaemon::default());
    daemon
        .set_behavior(ExecBehavior {
            exit_code: 137,
            stderr: b"Killed\n".to_vec(),
            ..Default::default()
        })
        .await;

    let executor = Executor::new(daemon.clone());
    let report = executor
        .run(&lease(), &plan(), &limits(5_000, Some(64)), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.status, OutcomeStatus::MemoryExceeded);
    assert_eq!(report.exit_code, Some(137));
    assert!(!report.dirty);
}

#[tokio::test(start_paused = true)]
async fn cancellation_kills_and_reports_internal_error() {
    let daemon = Arc::new(FakeDaemon::default());
    daemon
        .set_behavior(ExecBehavior {
            delay: Duration::from_secs(60),
            ..Default::default()
        })
        .await;

    let cancel = CancellationToken::new();
    let executor = Executor::new(daemon.clone());

    let run = {
        let daemon_lease = lease();
        let plan = plan();
        let cancel = cancel.clone();
        async move { executor.run(&daemon_lease, &plan, &limits(60_000, None), &cancel).await }
    };
    let handle = tokio::spawn(run);
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.status, OutcomeStatus::InternalError);
    assert!(report.dirty);
    assert!(!daemon.kill_log.lock().await.is_empty());
}
