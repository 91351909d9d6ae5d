//! Cluster agent side of the dispatch protocol.

pub mod api;
pub mod runner;
pub mod testing;

pub use api::{DeploymentStream, DispatchApi, GrpcDispatchApi, LocalDispatchApi};
pub use runner::{AgentRunner, Applier, ApplyOutcome};
