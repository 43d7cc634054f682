//! Narrow capability traits the agent's components are wired through.
//! Production implementations live in `nimbus-executor` (container daemon)
//! and `nimbus-agent` (AWS, Redis, CloudWatch); tests substitute
//! deterministic fakes.

use std::{path::Path, time::Duration};

use async_trait::async_trait;

use crate::{
    error::{DaemonError, PublishError, QueueError, StoreError},
    runtime::Runtime,
    types::{OutcomeStatus, ResultEnvelope},
};

/// One received queue message, paired with the handle needed to settle it.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub body: String,
    pub receipt_handle: String,
}

/// Inbound work queue: long-poll receive plus message settlement.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Long-poll for a batch of messages. An empty vec is a normal outcome.
    async fn receive(&self) -> Result<Vec<QueueMessage>, QueueError>;

    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError>;

    /// Push the message's visibility window out by `seconds`.
    async fn extend_visibility(&self, receipt_handle: &str, seconds: u32)
        -> Result<(), QueueError>;
}

/// Bundle download and artifact upload.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError>;

    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), StoreError>;
}

/// Result fanout on the bus.
#[async_trait]
pub trait ResultPublisher: Send + Sync {
    async fn publish(&self, envelope: &ResultEnvelope) -> Result<(), PublishError>;
}

/// Metrics sink. Implementations swallow their own failures; losing a data
/// point must never affect a job.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn record_peak_memory(&self, function_id: &str, runtime: Runtime, bytes: u64);

    async fn record_exit(&self, status: OutcomeStatus);
}

/// Signals the executor delivers on wall-clock escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Term => "SIGTERM",
            Signal::Kill => "SIGKILL",
        }
    }
}

/// A command to run inside an existing container.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub argv: Vec<String>,
    pub workdir: Option<String>,
    pub stdin: Option<Vec<u8>>,
    /// Per-stream capture cap in bytes; the daemon keeps the tail.
    pub stream_cap: usize,
}

impl ExecRequest {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            workdir: None,
            stdin: None,
            stream_cap: 64 * 1024,
        }
    }

    pub fn with_workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    pub fn with_stream_cap(mut self, cap: usize) -> Self {
        self.stream_cap = cap;
        self
    }
}

/// A captured output stream, bounded by the stream cap.
#[derive(Debug, Clone, Default)]
pub struct CapturedStream {
    /// The tail of the stream, at most `stream_cap` bytes.
    pub bytes: Vec<u8>,
    /// True when earlier bytes were dropped to honor the cap.
    pub truncated: bool,
}

/// Result of a completed in-container exec.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: CapturedStream,
    pub stderr: CapturedStream,
    pub duration: Duration,
}

/// A point-in-time memory reading for a container.
#[derive(Debug, Clone, Copy)]
pub struct MemorySample {
    pub rss_bytes: u64,
}

/// Thin contract over the container daemon. All operations address
/// containers by daemon id; slot bookkeeping stays in the warm pool.
#[async_trait]
pub trait ContainerDaemon: Send + Sync {
    /// Create a stopped container from `image` with a keep-alive entrypoint.
    /// Returns the daemon's container id.
    async fn create(&self, image: &str, name: &str) -> Result<String, DaemonError>;

    async fn start(&self, container_id: &str) -> Result<(), DaemonError>;

    async fn exec(&self, container_id: &str, req: ExecRequest) -> Result<ExecOutput, DaemonError>;

    /// Copy the contents of a host directory into `dst_path` inside the
    /// container. `dst_path` must already exist.
    async fn copy_in(
        &self,
        container_id: &str,
        src_dir: &Path,
        dst_path: &str,
    ) -> Result<(), DaemonError>;

    /// Copy `src_path` (a directory inside the container) into a host
    /// directory.
    async fn copy_out(
        &self,
        container_id: &str,
        src_path: &str,
        dst_dir: &Path,
    ) -> Result<(), DaemonError>;

    async fn stats(&self, container_id: &str) -> Result<MemorySample, DaemonError>;

    async fn kill(&self, container_id: &str, signal: Signal) -> Result<(), DaemonError>;

    async fn remove(&self, container_id: &str) -> Result<(), DaemonError>;

    /// Apply the job's cgroup memory cap to a running container. Idle pool
    /// containers carry no reservation; the cap lands at rent time. A
    /// `limit_bytes` of 0 clears any cap a previous tenant left behind.
    async fn set_memory_limit(&self, container_id: &str, limit_bytes: u64)
        -> Result<(), DaemonError>;

    /// Cheap daemon liveness probe.
    async fn ping(&self) -> Result<(), DaemonError>;
}
