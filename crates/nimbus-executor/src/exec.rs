//! Runs a staged command inside a rented container under a wall-clock
//! deadline, with memory-cap enforcement and bounded output capture.
//!
//! Deadline escalation: SIGTERM at the deadline, SIGKILL after a short
//! grace window. A timed-out slot is always returned Dirty; a process that
//! beats the KILL but after the deadline is still reported `TimedOut`,
//! since the reaped status is not trustworthy at that point.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use nimbus_common::{
    CapturedStream, ContainerDaemon, DaemonError, ExecOutput, ExecRequest, OutcomeStatus, Signal,
};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{pool::SlotLease, stage::LaunchPlan};

/// Grace between SIGTERM and SIGKILL on deadline.
const KILL_GRACE: Duration = Duration::from_millis(500);
/// How long to wait for the exec stream to settle after SIGKILL.
const REAP_WINDOW: Duration = Duration::from_secs(2);
/// Memory sampling cadence while the job runs.
const STATS_INTERVAL: Duration = Duration::from_millis(250);
/// Exit code the kernel leaves behind when the cgroup OOM killer fires.
const OOM_EXIT_CODE: i64 = 137;

pub const TRUNCATION_MARKER: &str = "[... output truncated ...]\n";

#[derive(Debug, Clone)]
pub struct ExecutionLimits {
    pub timeout: Duration,
    pub memory_bytes: Option<u64>,
    pub stream_cap: usize,
}

/// What happened when the command ran.
#[derive(Debug, Clone)]
pub struct ExecReport {
    pub status: OutcomeStatus,
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub peak_memory_bytes: Option<u64>,
    /// True when the slot must not go back into the pool.
    pub dirty: bool,
}

pub struct Executor {
    daemon: Arc<dyn ContainerDaemon>,
}

impl Executor {
    pub fn new(daemon: Arc<dyn ContainerDaemon>) -> Self {
        Self { daemon }
    }

    #[instrument(skip(self, lease, plan, limits, cancel), fields(container_id = %lease.container_id))]
    pub async fn run(
        &self,
        lease: &SlotLease,
        plan: &LaunchPlan,
        limits: &ExecutionLimits,
        cancel: &CancellationToken,
    ) -> Result<ExecReport, DaemonError> {
        // Always applied, with 0 clearing whatever cap the slot's previous
        // tenant left behind.
        let limit = limits.memory_bytes.unwrap_or(0);
        self.daemon
            .set_memory_limit(&lease.container_id, limit)
            .await?;
        debug!(limit_bytes = limit, "memory cap applied");

        let peak = Arc::new(AtomicU64::new(0));
        let sampler_stop = CancellationToken::new();
        let sampler = {
            let daemon = Arc::clone(&self.daemon);
            let container_id = lease.container_id.clone();
            let peak = Arc::clone(&peak);
            let stop = sampler_stop.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = time::sleep(STATS_INTERVAL) => {
                            if let Ok(sample) = daemon.stats(&container_id).await {
                                peak.fetch_max(sample.rss_bytes, Ordering::Relaxed);
                            }
                        }
                    }
                }
            })
        };

        let request = ExecRequest::new(plan.argv.clone())
            .with_workdir(plan.workdir.clone())
            .with_stream_cap(limits.stream_cap);

        let started = time::Instant::now();
        let exec_fut = self.daemon.exec(&lease.container_id, request);
        tokio::pin!(exec_fut);

        let result = tokio::select! {
            res = &mut exec_fut => {
                match res {
                    Ok(output) => Ok(self.completed(output, limits)),
                    Err(e) => Err(e),
                }
            }
            _ = time::sleep(limits.timeout) => {
                Ok(self.deadline_exceeded(lease, exec_fut, started, OutcomeStatus::TimedOut).await)
            }
            _ = cancel.cancelled() => {
                info!("execution cancelled by shutdown");
                Ok(self.deadline_exceeded(lease, exec_fut, started, OutcomeStatus::InternalError).await)
            }
        };

        sampler_stop.cancel();
        let _ = sampler.await;

        result.map(|mut report| {
            let sampled = peak.load(Ordering::Relaxed);
            if sampled > 0 {
                report.peak_memory_bytes = Some(sampled);
            }
            report
        })
    }

    /// Normal completion: classify by exit code. A 137 under a memory cap
    /// is the cgroup OOM killer, not user intent.
    fn completed(&self, output: ExecOutput, limits: &ExecutionLimits) -> ExecReport {
        let status = classify_exit(output.exit_code, limits.memory_bytes.is_some());
        ExecReport {
            status,
            exit_code: Some(output.exit_code),
            stdout: render_stream(output.stdout),
            stderr: render_stream(output.stderr),
            duration: output.duration,
            peak_memory_bytes: None,
            dirty: false,
        }
    }

    /// Deadline or shutdown: TERM, grace, KILL, then salvage whatever
    /// output the stream still yields. The slot is Dirty regardless.
    async fn deadline_exceeded<F>(
        &self,
        lease: &SlotLease,
        mut exec_fut: std::pin::Pin<&mut F>,
        started: time::Instant,
        status: OutcomeStatus,
    ) -> ExecReport
    where
        F: std::future::Future<Output = Result<ExecOutput, DaemonError>>,
    {
        if let Err(e) = self.daemon.kill(&lease.container_id, Signal::Term).await {
            warn!(error = %e, "SIGTERM delivery failed");
        }

        let mut salvaged = match time::timeout(KILL_GRACE, &mut exec_fut).await {
            Ok(res) => res.ok(),
            Err(_) => {
                if let Err(e) = self.daemon.kill(&lease.container_id, Signal::Kill).await {
                    warn!(error = %e, "SIGKILL delivery failed");
                }
                match time::timeout(REAP_WINDOW, &mut exec_fut).await {
                    Ok(res) => res.ok(),
                    Err(_) => None,
                }
            }
        };

        let (stdout, stderr) = match salvaged.take() {
            Some(output) => (render_stream(output.stdout), render_stream(output.stderr)),
            None => (String::new(), String::new()),
        };

        info!(status = %status, "execution killed before completion");
        ExecReport {
            status,
            // The reaped status after a kill race is not the real one.
            exit_code: None,
            stdout,
            stderr,
            duration: started.elapsed(),
            peak_memory_bytes: None,
            dirty: true,
        }
    }
}

pub(crate) fn classify_exit(exit_code: i64, memory_capped: bool) -> OutcomeStatus {
    if exit_code == 0 {
        OutcomeStatus::Succeeded
    } else if exit_code == OOM_EXIT_CODE && memory_capped {
        OutcomeStatus::MemoryExceeded
    } else {
        OutcomeStatus::FailedNonZeroExit
    }
}

pub(crate) fn render_stream(stream: CapturedStream) -> String {
    let body = String::from_utf8_lossy(&stream.bytes);
    if stream.truncated {
        format!("{TRUNCATION_MARKER}{body}")
    } else {
        body.into_owned()
    }
}
