//! Deployment requests, statuses and the state machine they move through.
//!
//! Domain types are kept separate from the generated protobuf types; [`convert`] maps between the
//! two at the gRPC boundary.

pub mod convert;
pub mod request;
pub mod status;

pub use request::{DeploymentRequest, Repository, ValidationError};
pub use status::{DeploymentState, DeploymentStatus};
