//! The dispatcher: long-polls the queue, bounds in-flight work with a
//! semaphore sized to the pool capacities, and drives every message through
//! `Staging → Acquiring → Executing → Binding → Publishing`.
//!
//! Settlement rules: user-visible failures are always published and the
//! message deleted; infrastructure failures leave the message alive so it
//! redelivers; a publish failure never deletes.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use nimbus_common::{
    memory_advice, AgentError, ContainerDaemon, DaemonError, ExecutionOutcome, JobRequest,
    MetricsSink, ObjectStore, OutcomeStatus, PoolError, QueueClient, QueueMessage,
    ResultEnvelope, ResultPublisher, RuntimeTable, StageError,
};
use nimbus_executor::{Disposition, ExecutionLimits, Executor, OutputBinder, Stager, WarmPool};
use tokio::{sync::Semaphore, task::JoinHandle, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;

const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Everything a job needs, constructed once at startup and threaded
/// explicitly. Components see only the capability traits, so tests swap in
/// fakes.
pub struct AgentContext {
    pub config: AgentConfig,
    pub table: Arc<RuntimeTable>,
    pub queue: Arc<dyn QueueClient>,
    pub store: Arc<dyn ObjectStore>,
    pub publisher: Arc<dyn ResultPublisher>,
    pub metrics: Arc<dyn MetricsSink>,
    pub daemon: Arc<dyn ContainerDaemon>,
    pub pool: Arc<WarmPool>,
    pub stager: Stager,
    pub binder: OutputBinder,
    pub executor: Executor,
}

/// Why the dispatcher stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    CleanShutdown,
    /// The container daemon went away; the process should exit 2.
    DaemonLost,
}

pub struct Dispatcher {
    ctx: Arc<AgentContext>,
    permits: Arc<Semaphore>,
    max_in_flight: usize,
    shutdown: CancellationToken,
    fatal: CancellationToken,
    in_flight: Arc<DashMap<String, Instant>>,
}

impl Dispatcher {
    pub fn new(ctx: Arc<AgentContext>, shutdown: CancellationToken) -> Self {
        let max_in_flight = ctx.config.max_in_flight();
        Self {
            ctx,
            permits: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            shutdown,
            fatal: CancellationToken::new(),
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// Single-threaded intake: receive, acquire a permit per message, spawn
    /// the job task. Runs until shutdown or a fatal daemon loss.
    pub async fn run(&self) -> ExitReason {
        info!(max_in_flight = self.max_in_flight, "dispatcher started");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.fatal.cancelled() => break,
                received = self.ctx.queue.receive() => match received {
                    Ok(messages) => {
                        if !messages.is_empty() {
                            debug!(count = messages.len(), "messages received");
                        }
                        for message in messages {
                            if !self.launch(message).await {
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "queue receive failed; backing off");
                        tokio::select! {
                            _ = self.shutdown.cancelled() => break,
                            _ = time::sleep(RECEIVE_ERROR_BACKOFF) => {}
                        }
                    }
                }
            }
        }

        self.drain().await;
        if self.fatal.is_cancelled() {
            ExitReason::DaemonLost
        } else {
            ExitReason::CleanShutdown
        }
    }

    /// Acquire a permit and spawn the per-job task. Returns false when the
    /// dispatcher should stop taking messages.
    async fn launch(&self, message: QueueMessage) -> bool {
        let permit = tokio::select! {
            permit = self.permits.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => return false,
            },
            _ = self.shutdown.cancelled() => return false,
            _ = self.fatal.cancelled() => return false,
        };

        let ctx = Arc::clone(&self.ctx);
        let cancel = self.shutdown.child_token();
        let fatal = self.fatal.clone();
        let in_flight = Arc::clone(&self.in_flight);
        tokio::spawn(async move {
            let _permit = permit;
            run_job(ctx, message, cancel, fatal, in_flight).await;
        });
        true
    }

    /// Give in-flight jobs a grace period equal to the largest configured
    /// timeout, then drain the pool. Unsettled messages redeliver.
    async fn drain(&self) {
        let grace = Duration::from_millis(self.ctx.config.docker.default_timeout_ms);
        info!(grace_ms = grace.as_millis() as u64, "draining in-flight jobs");

        let all_permits = self
            .permits
            .clone()
            .acquire_many_owned(self.max_in_flight as u32);
        if time::timeout(grace, all_permits).await.is_err() {
            let stuck: Vec<String> = self.in_flight.iter().map(|e| e.key().clone()).collect();
            warn!(
                ?stuck,
                "jobs still in flight after the grace period; their messages will redeliver"
            );
        }

        self.ctx.pool.shutdown().await;
        for stats in self.ctx.pool.snapshot() {
            info!(
                runtime = %stats.runtime,
                idle = stats.idle,
                rented = stats.rented,
                "pool state at shutdown"
            );
        }
    }
}

/// How a finished pipeline settles its queue message.
enum Settle {
    /// Publish the envelope; delete the message only if publishing works.
    Publish(ExecutionOutcome),
    /// Leave the message alone; the visibility timeout redelivers it.
    Redeliver(&'static str),
    /// Shutdown interrupted the job mid-flight; no publish, no delete.
    Abandon,
}

async fn run_job(
    ctx: Arc<AgentContext>,
    message: QueueMessage,
    cancel: CancellationToken,
    fatal: CancellationToken,
    in_flight: Arc<DashMap<String, Instant>>,
) {
    let started = Instant::now();

    let request: JobRequest = match serde_json::from_str(&message.body) {
        Ok(request) => request,
        Err(e) => {
            settle_malformed(&ctx, &message, &e).await;
            return;
        }
    };

    info!(
        request_id = %request.request_id,
        function_id = %request.function_id,
        runtime = %request.runtime,
        "job received"
    );
    in_flight.insert(request.request_id.clone(), started);

    let heartbeat_stop = CancellationToken::new();
    let heartbeat = spawn_heartbeat(
        Arc::clone(&ctx),
        message.receipt_handle.clone(),
        heartbeat_stop.clone(),
    );

    let settle = process(&ctx, &request, &cancel, &fatal, started).await;

    heartbeat_stop.cancel();
    let _ = heartbeat.await;
    in_flight.remove(&request.request_id);

    match settle {
        Settle::Publish(outcome) => {
            let status = outcome.status;
            let peak = outcome.peak_memory_bytes;
            let envelope =
                ResultEnvelope::from_outcome(&request.request_id, &request.function_id, outcome);
            match ctx.publisher.publish(&envelope).await {
                Ok(()) => {
                    ctx.metrics.record_exit(status).await;
                    if let Some(bytes) = peak {
                        ctx.metrics
                            .record_peak_memory(&request.function_id, request.runtime, bytes)
                            .await;
                    }
                    // Publication happens-before deletion, always.
                    if let Err(e) = ctx.queue.delete(&message.receipt_handle).await {
                        error!(
                            request_id = %request.request_id,
                            error = %e,
                            "failed to delete settled message; it will redeliver"
                        );
                    }
                    info!(
                        request_id = %request.request_id,
                        %status,
                        total_ms = started.elapsed().as_millis() as u64,
                        "job settled"
                    );
                }
                Err(e) => {
                    error!(
                        request_id = %request.request_id,
                        error = %e,
                        "publish failed after retries; leaving message for redelivery"
                    );
                }
            }
        }
        Settle::Redeliver(reason) => {
            info!(
                request_id = %request.request_id,
                reason,
                "message left for redelivery"
            );
        }
        Settle::Abandon => {
            debug!(
                request_id = %request.request_id,
                "job abandoned by shutdown; message will redeliver"
            );
        }
    }
}

/// The per-job pipeline. Every path that holds a slot returns it; every
/// failure is folded into a typed settlement.
async fn process(
    ctx: &Arc<AgentContext>,
    request: &JobRequest,
    cancel: &CancellationToken,
    fatal: &CancellationToken,
    started: Instant,
) -> Settle {
    if let Err(e) = request.validate() {
        return Settle::Publish(stage_failure(e, started));
    }

    // Staging starts before acquisition so a stuck download never burns a
    // container.
    let bundle = match ctx.stager.prepare(request, &ctx.table).await {
        Ok(bundle) => bundle,
        Err(e) => return Settle::Publish(stage_failure(e, started)),
    };
    if cancel.is_cancelled() {
        return Settle::Abandon;
    }

    let rent_deadline = time::Instant::now() + rent_wait(ctx);
    let mut lease = match ctx.pool.rent(request.runtime, rent_deadline).await {
        Ok(lease) => lease,
        Err(PoolError::Exhausted(_)) => return Settle::Redeliver("pool exhausted"),
        Err(PoolError::Draining) => return Settle::Redeliver("pool draining"),
        Err(PoolError::Daemon(e)) => return daemon_failure(fatal, e, started),
    };

    let plan = match ctx
        .stager
        .inject(ctx.daemon.as_ref(), &mut lease, &bundle)
        .await
    {
        Ok(plan) => plan,
        Err(AgentError::Daemon(e)) => {
            ctx.pool.put_back(lease, Disposition::Dirty).await;
            return daemon_failure(fatal, e, started);
        }
        Err(e) => {
            ctx.pool.put_back(lease, Disposition::Dirty).await;
            return Settle::Publish(ExecutionOutcome::failure(
                OutcomeStatus::InternalError,
                e.to_string(),
                elapsed_ms(started),
            ));
        }
    };

    let limits = ExecutionLimits {
        timeout: Duration::from_millis(
            request.effective_timeout_ms(ctx.config.docker.default_timeout_ms),
        ),
        memory_bytes: request.memory_mb.map(|mb| mb * 1024 * 1024),
        stream_cap: ctx.config.limits.stream_cap_bytes,
    };
    let report = match ctx.executor.run(&lease, &plan, &limits, cancel).await {
        Ok(report) => report,
        Err(e) => {
            ctx.pool.put_back(lease, Disposition::Dirty).await;
            return daemon_failure(fatal, e, started);
        }
    };
    if cancel.is_cancelled() {
        ctx.pool.put_back(lease, Disposition::Dirty).await;
        return Settle::Abandon;
    }

    // Outputs are harvested even after a non-zero exit; a killed container
    // (dirty slot) has nothing left to harvest.
    let outputs = if report.dirty {
        Vec::new()
    } else {
        ctx.binder
            .harvest(
                ctx.daemon.as_ref(),
                &lease.container_id,
                &request.request_id,
            )
            .await
    };

    let disposition = if report.dirty {
        Disposition::Dirty
    } else {
        Disposition::Clean
    };
    ctx.pool.put_back(lease, disposition).await;

    Settle::Publish(ExecutionOutcome {
        status: report.status,
        exit_code: report.exit_code,
        stdout: report.stdout,
        stderr: report.stderr,
        duration_ms: report.duration.as_millis() as u64,
        peak_memory_bytes: report.peak_memory_bytes,
        outputs,
        memory_advice: memory_advice(request.memory_mb, report.peak_memory_bytes),
    })
}

/// A body that does not parse as a job request. When the ids can still be
/// salvaged a typed failure goes out on the usual channel; otherwise the
/// message is deleted unpublished, since there is no channel to address.
/// Either way it must not loop forever.
async fn settle_malformed(
    ctx: &Arc<AgentContext>,
    message: &QueueMessage,
    parse_error: &serde_json::Error,
) {
    let ids = serde_json::from_str::<serde_json::Value>(&message.body)
        .ok()
        .and_then(|value| {
            let request_id = value.get("requestId")?.as_str()?.to_string();
            let function_id = value
                .get("functionId")
                .and_then(|f| f.as_str())
                .unwrap_or_default()
                .to_string();
            Some((request_id, function_id))
        });

    match ids {
        Some((request_id, function_id)) => {
            warn!(%request_id, error = %parse_error, "invalid job request; publishing failure");
            let outcome = ExecutionOutcome::failure(
                OutcomeStatus::StageError,
                StageError::new(
                    nimbus_common::StageErrorKind::InvalidRequest,
                    parse_error.to_string(),
                )
                .to_string(),
                0,
            );
            let envelope = ResultEnvelope::from_outcome(&request_id, &function_id, outcome);
            match ctx.publisher.publish(&envelope).await {
                Ok(()) => {
                    if let Err(e) = ctx.queue.delete(&message.receipt_handle).await {
                        error!(error = %e, "failed to delete invalid message");
                    }
                }
                Err(e) => {
                    error!(error = %e, "publish failed for invalid message; leaving for redelivery");
                }
            }
        }
        None => {
            error!(error = %parse_error, "unparseable message body; deleting");
            if let Err(e) = ctx.queue.delete(&message.receipt_handle).await {
                error!(error = %e, "failed to delete malformed message");
            }
        }
    }
}

fn stage_failure(error: StageError, started: Instant) -> ExecutionOutcome {
    ExecutionOutcome::failure(
        OutcomeStatus::StageError,
        error.to_string(),
        elapsed_ms(started),
    )
}

/// Non-fatal daemon errors become a published `InternalError` (terminal, to
/// avoid poison loops). A lost daemon flips the fatal flag and leaves the
/// message for another agent.
fn daemon_failure(fatal: &CancellationToken, error: DaemonError, started: Instant) -> Settle {
    if error.is_fatal() {
        error!(error = %error, "container daemon lost; stopping intake");
        fatal.cancel();
        return Settle::Redeliver("daemon unavailable");
    }
    Settle::Publish(ExecutionOutcome::failure(
        OutcomeStatus::InternalError,
        error.to_string(),
        elapsed_ms(started),
    ))
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// How long a job waits on a saturated pool before handing the message
/// back: half the visibility window, so redelivery stays ahead of the
/// heartbeat cadence.
fn rent_wait(ctx: &AgentContext) -> Duration {
    Duration::from_secs((ctx.config.sqs.visibility_timeout_seconds / 2).max(1))
}

/// Extends the message's visibility every `visibility / 3` while the job
/// runs, so long executions are not redelivered mid-flight.
fn spawn_heartbeat(
    ctx: Arc<AgentContext>,
    receipt_handle: String,
    stop: CancellationToken,
) -> JoinHandle<()> {
    let visibility = ctx.config.sqs.visibility_timeout_seconds;
    let interval = Duration::from_secs((visibility / 3).max(1));
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = time::sleep(interval) => {
                    if let Err(e) = ctx
                        .queue
                        .extend_visibility(&receipt_handle, visibility as u32)
                        .await
                    {
                        warn!(error = %e, "visibility extension failed");
                    }
                }
            }
        }
    })
}
