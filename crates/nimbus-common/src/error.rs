use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runtime::Runtime;

/// Failures surfaced by the container daemon adapter.
///
/// Every adapter operation maps into one of these kinds. `Unavailable` is
/// special: it means the daemon itself is gone, which is fatal for the whole
/// agent rather than for a single job.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("container daemon unavailable: {0}")]
    Unavailable(String),

    #[error("image missing: {0}")]
    ImageMissing(String),

    #[error("daemon resources exhausted: {0}")]
    ResourceExhausted(String),

    #[error("daemon operation timed out: {0}")]
    Timeout(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl DaemonError {
    /// True when the agent should stop taking work and exit.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DaemonError::Unavailable(_))
    }
}

/// Classification of staging failures, carried into the result envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageErrorKind {
    /// The code bundle does not exist at the given locator.
    CodeMissing,
    /// The bundle exceeds the configured download cap.
    CodeOversized,
    /// Download failed for transport reasons.
    Transport,
    /// An archive entry resolves outside the scratch root or contains NUL.
    Traversal,
    /// Extraction would exceed the configured expansion cap.
    ExpansionLimit,
    /// The archive itself is unreadable.
    Archive,
    /// The bundle's entry files do not match the requested runtime.
    RuntimeMismatch,
    /// The job request failed intake validation.
    InvalidRequest,
}

/// Terminal staging failure. Always published and acknowledged; a bad bundle
/// will not get better on redelivery.
#[derive(Debug, Error)]
#[error("staging failed ({kind:?}): {detail}")]
pub struct StageError {
    pub kind: StageErrorKind,
    pub detail: String,
}

impl StageError {
    pub fn new(kind: StageErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

/// Failures renting or returning warm-pool slots.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("warm pool exhausted for runtime {0}")]
    Exhausted(Runtime),

    #[error("warm pool is draining")]
    Draining,

    #[error(transparent)]
    Daemon(#[from] DaemonError),
}

/// Queue transport failure (receive, delete, visibility change).
#[derive(Debug, Error)]
#[error("queue error: {0}")]
pub struct QueueError(pub String);

/// Object store failure. `NotFound` is distinguished so staging can report
/// a missing bundle rather than a transport fault.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("object store error: {0}")]
    Transport(String),
}

/// The bus rejected the result envelope after all retries. The message must
/// stay on the queue so the job is re-run.
#[derive(Debug, Error)]
#[error("publish failed: {0}")]
pub struct PublishError(pub String);

/// Top-level error union used at the binary boundary.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Stage(#[from] StageError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Daemon(#[from] DaemonError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error("internal error: {0}")]
    Internal(String),
}
