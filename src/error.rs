use thiserror::Error;
use tonic::Status;
use uuid::Uuid;

use crate::deployment::ValidationError;
use crate::hub::bus::BusError;
use crate::tls::TlsError;

#[derive(Error, Debug)]
pub enum HubError {
    #[error("Invalid deployment request: {0}")]
    Validation(#[from] ValidationError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Deployment not found: {0}")]
    DeploymentNotFound(Uuid),

    #[error("Deployment {0} already finished")]
    AlreadyFinished(Uuid),

    #[error("Deployment hub lost its in-memory state; queued deployments are inactive, reconnect")]
    StateLost,

    #[error("gRPC error: {0}")]
    GrpcError(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    TransportError(#[from] tonic::transport::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<BusError> for HubError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::AlreadyFinished(id) => HubError::AlreadyFinished(id),
            BusError::UnknownDeployment(id) => HubError::DeploymentNotFound(id),
        }
    }
}

impl From<HubError> for Status {
    fn from(err: HubError) -> Self {
        match err {
            HubError::Validation(e) => Status::invalid_argument(e.to_string()),
            HubError::InvalidArgument(msg) => Status::invalid_argument(msg),
            HubError::DeploymentNotFound(id) => {
                Status::not_found(format!("Deployment not found: {}", id))
            }
            HubError::AlreadyFinished(id) => {
                Status::failed_precondition(format!("Deployment {} already finished", id))
            }
            e @ HubError::StateLost => Status::unavailable(e.to_string()),
            HubError::GrpcError(status) => status,
            HubError::TransportError(e) => Status::unavailable(e.to_string()),
            HubError::Tls(e) => Status::internal(e.to_string()),
            HubError::Io(e) => Status::internal(e.to_string()),
            HubError::Internal(msg) => Status::internal(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, HubError>;
