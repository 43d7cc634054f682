//! Shared vocabulary of the Nimbus execution agent: the wire types carried
//! over the queue and the bus, the error taxonomy, the runtime descriptor
//! table and the capability traits the components are wired through.

pub mod error;
pub mod runtime;
pub mod traits;
pub mod types;

pub use error::{
    AgentError, DaemonError, PoolError, PublishError, QueueError, StageError, StageErrorKind,
    StoreError,
};
pub use runtime::{Runtime, RuntimeDescriptor, RuntimeImages, RuntimeTable};
pub use traits::{
    CapturedStream, ContainerDaemon, ExecOutput, ExecRequest, MemorySample, MetricsSink,
    ObjectStore, QueueClient, QueueMessage, ResultPublisher, Signal,
};
pub use types::{
    memory_advice, ExecutionOutcome, JobRequest, OutcomeStatus, OutputArtifact, ResultEnvelope,
};

/// Result alias used across the agent crates.
pub type Result<T, E = AgentError> = std::result::Result<T, E>;
