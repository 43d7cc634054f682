use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    error::{StageError, StageErrorKind},
    runtime::Runtime,
};

/// A job request as it arrives in a queue message body. Field names follow
/// the camelCase contract of the submitting tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    pub request_id: String,
    pub function_id: String,
    pub runtime: Runtime,
    pub s3_bucket: String,
    pub s3_key: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub memory_mb: Option<u64>,
}

impl JobRequest {
    /// Intake validation. Anything rejected here is published as a
    /// `StageError{invalid-request}` and acknowledged, since redelivery
    /// cannot fix a malformed request.
    pub fn validate(&self) -> Result<(), StageError> {
        if self.request_id.trim().is_empty() {
            return Err(StageError::new(
                StageErrorKind::InvalidRequest,
                "requestId is empty",
            ));
        }
        if self.s3_key.trim().is_empty() {
            return Err(StageError::new(
                StageErrorKind::InvalidRequest,
                "s3Key is empty",
            ));
        }
        if self.timeout_ms == Some(0) {
            return Err(StageError::new(
                StageErrorKind::InvalidRequest,
                "timeoutMs must be greater than zero",
            ));
        }
        Ok(())
    }

    /// The wall-clock budget, falling back to the runtime default.
    pub fn effective_timeout_ms(&self, default_ms: u64) -> u64 {
        self.timeout_ms.unwrap_or(default_ms)
    }
}

impl fmt::Display for JobRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "JobRequest(request_id: {}, function_id: {}, runtime: {}, bundle: s3://{}/{})",
            self.request_id, self.function_id, self.runtime, self.s3_bucket, self.s3_key
        )
    }
}

/// Terminal classification of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeStatus {
    Succeeded,
    FailedNonZeroExit,
    TimedOut,
    MemoryExceeded,
    StageError,
    InternalError,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Succeeded => "Succeeded",
            OutcomeStatus::FailedNonZeroExit => "FailedNonZeroExit",
            OutcomeStatus::TimedOut => "TimedOut",
            OutcomeStatus::MemoryExceeded => "MemoryExceeded",
            OutcomeStatus::StageError => "StageError",
            OutcomeStatus::InternalError => "InternalError",
        }
    }
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One harvested output file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputArtifact {
    /// Path relative to the job's `output/` directory.
    pub path: String,
    pub size_bytes: u64,
    /// Final storage locator, e.g. `s3://bucket/prefix/<request_id>/<path>`.
    pub locator: String,
}

/// Everything known about a finished job, before it is addressed to a
/// request. stdout/stderr are already truncated to the stream cap.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub status: OutcomeStatus,
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub peak_memory_bytes: Option<u64>,
    pub outputs: Vec<OutputArtifact>,
    pub memory_advice: Option<String>,
}

impl ExecutionOutcome {
    /// A failure that never ran user code (staging, internal faults).
    pub fn failure(status: OutcomeStatus, stderr: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            status,
            exit_code: None,
            stdout: String::new(),
            stderr: stderr.into(),
            duration_ms,
            peak_memory_bytes: None,
            outputs: Vec::new(),
            memory_advice: None,
        }
    }
}

/// The envelope published on the bus, one per received message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub request_id: String,
    pub function_id: String,
    pub status: OutcomeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peak_memory_bytes: Option<u64>,
    pub outputs: Vec<OutputArtifact>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_advice: Option<String>,
}

impl ResultEnvelope {
    pub fn from_outcome(request_id: &str, function_id: &str, outcome: ExecutionOutcome) -> Self {
        Self {
            request_id: request_id.to_string(),
            function_id: function_id.to_string(),
            status: outcome.status,
            exit_code: outcome.exit_code,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            duration_ms: outcome.duration_ms,
            peak_memory_bytes: outcome.peak_memory_bytes,
            outputs: outcome.outputs,
            memory_advice: outcome.memory_advice,
        }
    }
}

const MIB: u64 = 1024 * 1024;

/// Sizing hint comparing peak usage against the allocation the caller paid
/// for. Returns `None` when either side is unknown.
pub fn memory_advice(allocated_mb: Option<u64>, peak_bytes: Option<u64>) -> Option<String> {
    let allocated_mb = allocated_mb?;
    let peak = peak_bytes?;
    if allocated_mb == 0 {
        return None;
    }
    let allocated = allocated_mb * MIB;
    let peak_mb = peak / MIB;
    let ratio = peak as f64 / allocated as f64;

    let advice = if ratio < 0.3 {
        let recommended = (peak_mb * 3 / 2).max(1);
        format!(
            "peak usage {peak_mb} MiB is far below the {allocated_mb} MiB allocation; \
             {recommended} MiB would likely suffice"
        )
    } else if ratio < 0.7 {
        let recommended = (peak_mb * 13 / 10).max(1);
        format!(
            "allocation {allocated_mb} MiB has headroom over peak {peak_mb} MiB; \
             {recommended} MiB would still be comfortable"
        )
    } else if ratio <= 1.0 {
        format!("allocation {allocated_mb} MiB matches peak usage {peak_mb} MiB")
    } else {
        let recommended = (peak_mb * 12 / 10).max(allocated_mb + 1);
        format!(
            "peak usage {peak_mb} MiB exceeded the {allocated_mb} MiB allocation; \
             raise it to at least {recommended} MiB"
        )
    };
    Some(advice)
}
