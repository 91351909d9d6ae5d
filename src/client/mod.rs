//! Submitting side: send a deployment to the hub and follow it to the end.

pub mod api;
pub mod deployer;

pub use api::{DeployApi, GrpcDeployApi, LocalDeployApi, StatusStream};
pub use deployer::{is_transient, DeployError, Deployer, ExitCode, StatusCallback};
