//! Execution engine of the Nimbus agent: a thin bollard adapter over the
//! container daemon, a per-runtime warm pool of idle containers, the
//! workspace stager, the deadline-enforcing executor and the output binder.

pub mod adapter;
pub mod exec;
pub mod outputs;
pub mod pool;
pub mod stage;

pub use adapter::DockerDaemon;
pub use exec::{ExecReport, ExecutionLimits, Executor};
pub use outputs::{OutputBinder, OutputConfig};
pub use pool::{Disposition, PoolSettings, PoolStats, SlotLease, SlotState, WarmPool};
pub use stage::{LaunchPlan, StageConfig, StagedBundle, Stager};
