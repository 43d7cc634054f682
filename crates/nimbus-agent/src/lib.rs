//! The Nimbus agent binary's wiring: configuration, AWS and Redis clients,
//! and the dispatcher that drives jobs from the queue through the
//! execution pipeline.

pub mod aws;
pub mod config;
pub mod dispatcher;
pub mod publish;

pub use config::AgentConfig;
pub use dispatcher::{AgentContext, Dispatcher, ExitReason};
