use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio_stream::StreamExt;
use tonic::{Code, Status};
use uuid::Uuid;

use crate::client::api::DeployApi;
use crate::config::ClientConfig;
use crate::deployment::{DeploymentRequest, DeploymentState, DeploymentStatus, ValidationError};
use crate::telemetry;

/// Process exit codes of the deploy command. Scripts depend on these values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success = 0,
    DeploymentFailure = 1,
    DeploymentError = 2,
    DeploymentInactive = 3,
    NoDeployment = 4,
    Unavailable = 5,
    InvocationFailure = 6,
    InternalError = 7,
    Timeout = 9,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn for_status(status: &DeploymentStatus) -> Self {
        match status.state {
            DeploymentState::Success => ExitCode::Success,
            DeploymentState::Failure => ExitCode::DeploymentFailure,
            DeploymentState::Error => ExitCode::DeploymentError,
            DeploymentState::Inactive => ExitCode::DeploymentInactive,
            DeploymentState::Pending => ExitCode::Success,
        }
    }
}

fn describe(id: &Option<Uuid>) -> String {
    id.map(|id| id.to_string())
        .unwrap_or_else(|| "(no ID assigned)".to_string())
}

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("invalid deployment request: {0}")]
    Invalid(#[from] ValidationError),

    #[error("deployment request not accepted: {}", .0.message())]
    Rejected(Status),

    #[error("lost contact with the hub while following deployment {id}: {message}")]
    Unavailable { id: Uuid, message: String },

    #[error("deployment {} on {} ended in {}: {}", .0.request_id, .0.cluster, .0.state, .0.message)]
    Deployment(DeploymentStatus),

    #[error("timed out waiting for deployment {}", describe(.id))]
    Timeout { id: Option<Uuid> },
}

impl DeployError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            DeployError::Invalid(_) => ExitCode::InvocationFailure,
            DeployError::Rejected(status) if status.code() == Code::Internal => {
                ExitCode::InternalError
            }
            DeployError::Rejected(status) if status.code() == Code::Unavailable => {
                ExitCode::Unavailable
            }
            DeployError::Rejected(_) => ExitCode::NoDeployment,
            DeployError::Unavailable { .. } => ExitCode::Unavailable,
            DeployError::Deployment(status) => ExitCode::for_status(status),
            DeployError::Timeout { .. } => ExitCode::Timeout,
        }
    }
}

/// `unavailable` and `internal` are worth another try; everything else is final.
pub fn is_transient(status: &Status) -> bool {
    matches!(status.code(), Code::Unavailable | Code::Internal)
}

pub type StatusCallback = Arc<dyn Fn(&DeploymentStatus) + Send + Sync>;

/// Submits a deployment and optionally follows it to completion.
pub struct Deployer<A> {
    api: A,
    config: ClientConfig,
    on_status: Option<StatusCallback>,
}

impl<A: DeployApi> Deployer<A> {
    pub fn new(api: A, config: ClientConfig) -> Self {
        Self {
            api,
            config,
            on_status: None,
        }
    }

    /// Called with every status the deployer observes, in order.
    pub fn on_status(mut self, callback: StatusCallback) -> Self {
        self.on_status = Some(callback);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Run the whole pipeline under the configured timeout.
    ///
    /// Returns the last status: the terminal one when waiting, otherwise whatever submit
    /// returned. Failed and errored deployments come back as [`DeployError::Deployment`].
    pub async fn deploy(
        &self,
        mut request: DeploymentRequest,
    ) -> Result<DeploymentStatus, DeployError> {
        request.validate()?;
        if request.trace_parent.is_empty() {
            request.trace_parent = telemetry::new_trace_parent();
        }

        let mut assigned = request.id;
        let result =
            tokio::time::timeout(self.config.timeout, self.run(request, &mut assigned)).await;
        match result {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(
                    deployment_id = %describe(&assigned),
                    timeout = ?self.config.timeout,
                    "Timed out waiting for deployment"
                );
                Err(DeployError::Timeout { id: assigned })
            }
        }
    }

    async fn run(
        &self,
        mut request: DeploymentRequest,
        assigned: &mut Option<Uuid>,
    ) -> Result<DeploymentStatus, DeployError> {
        loop {
            let status = self.submit(&request).await?;
            request.id = Some(status.request_id);
            *assigned = request.id;

            tracing::info!(
                deployment_id = %status.request_id,
                cluster = %request.cluster,
                deadline = %request.deadline,
                trace_id = telemetry::trace_id(&request.trace_parent).unwrap_or(""),
                "Deployment request accepted"
            );
            self.observe(&status);

            if status.finished() {
                return outcome(status);
            }
            if !self.config.wait {
                return Ok(status);
            }

            let last = self.watch(status.request_id, &request.trace_parent).await?;
            if last.state == DeploymentState::Inactive {
                tracing::warn!(
                    deployment_id = %status.request_id,
                    "Hub lost track of the deployment, resubmitting"
                );
                continue;
            }
            return outcome(last);
        }
    }

    async fn submit(&self, request: &DeploymentRequest) -> Result<DeploymentStatus, DeployError> {
        self.with_retry("submit deployment", || self.api.deploy(request))
            .await
            .map_err(|status| {
                tracing::error!(
                    cluster = %request.cluster,
                    code = ?status.code(),
                    message = status.message(),
                    "Deployment request not accepted"
                );
                DeployError::Rejected(status)
            })
    }

    /// Follow `id` until the stream reports a terminal or `inactive` status.
    async fn watch(&self, id: Uuid, trace_parent: &str) -> Result<DeploymentStatus, DeployError> {
        let lost = |status: Status| {
            if is_transient(&status) {
                DeployError::Unavailable {
                    id,
                    message: status.message().to_string(),
                }
            } else {
                tracing::error!(
                    deployment_id = %id,
                    code = ?status.code(),
                    message = status.message(),
                    "Status stream rejected"
                );
                DeployError::Rejected(status)
            }
        };
        let mut retries = 0;

        loop {
            let mut stream = self
                .with_retry("watch deployment", || self.api.status(id, trace_parent))
                .await
                .map_err(lost)?;

            let interrupted = loop {
                match stream.next().await {
                    Some(Ok(status)) => {
                        self.observe(&status);
                        if status.state.ends_stream() {
                            return Ok(status);
                        }
                    }
                    Some(Err(status)) if is_transient(&status) => break status,
                    Some(Err(status)) => return Err(lost(status)),
                    None => {
                        break Status::unavailable(
                            "status stream ended before the deployment finished",
                        )
                    }
                }
            };

            if !self.config.retry.allows(retries) {
                return Err(lost(interrupted));
            }
            retries += 1;
            tracing::warn!(
                deployment_id = %id,
                error = interrupted.message(),
                retry_in = ?self.config.retry.interval,
                "Status stream interrupted, reconnecting"
            );
            tokio::time::sleep(self.config.retry.interval).await;
        }
    }

    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, Status>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Status>>,
    {
        let mut retries = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(status) if is_transient(&status) && self.config.retry.allows(retries) => {
                    retries += 1;
                    tracing::warn!(
                        operation = what,
                        code = ?status.code(),
                        error = status.message(),
                        retry_in = ?self.config.retry.interval,
                        "Transient hub error, retrying"
                    );
                    tokio::time::sleep(self.config.retry.interval).await;
                }
                Err(status) => return Err(status),
            }
        }
    }

    fn observe(&self, status: &DeploymentStatus) {
        tracing::info!(
            deployment_id = %status.request_id,
            state = %status.state,
            "{}",
            status.message
        );
        if let Some(callback) = &self.on_status {
            callback(status);
        }
    }
}

fn outcome(status: DeploymentStatus) -> Result<DeploymentStatus, DeployError> {
    match status.state {
        DeploymentState::Success => Ok(status),
        _ => {
            tracing::error!(
                deployment_id = %status.request_id,
                cluster = %status.cluster,
                state = %status.state,
                message = %status.message,
                "Deployment did not succeed"
            );
            Err(DeployError::Deployment(status))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_state() {
        let id = Uuid::new_v4();
        let failed = DeploymentStatus::new(id, DeploymentState::Failure, "boom");
        assert_eq!(
            DeployError::Deployment(failed).exit_code(),
            ExitCode::DeploymentFailure
        );
        let errored = DeploymentStatus::new(id, DeploymentState::Error, "boom");
        assert_eq!(DeployError::Deployment(errored).exit_code().code(), 2);
        assert_eq!(DeployError::Timeout { id: None }.exit_code().code(), 9);
    }

    #[test]
    fn rejected_codes() {
        let err = DeployError::Rejected(Status::unauthenticated("no"));
        assert_eq!(err.exit_code(), ExitCode::NoDeployment);
        let err = DeployError::Rejected(Status::internal("oops"));
        assert_eq!(err.exit_code(), ExitCode::InternalError);
        let err = DeployError::Rejected(Status::unavailable("connection refused"));
        assert_eq!(err.exit_code(), ExitCode::Unavailable);
        let err = DeployError::Invalid(ValidationError::TeamRequired);
        assert_eq!(err.exit_code(), ExitCode::InvocationFailure);
    }

    #[test]
    fn transient_classification() {
        assert!(is_transient(&Status::unavailable("x")));
        assert!(is_transient(&Status::internal("x")));
        assert!(!is_transient(&Status::unauthenticated("x")));
        assert!(!is_transient(&Status::invalid_argument("x")));
        assert!(!is_transient(&Status::deadline_exceeded("x")));
    }

    #[test]
    fn timeout_message_without_id() {
        let err = DeployError::Timeout { id: None };
        assert_eq!(
            err.to_string(),
            "timed out waiting for deployment (no ID assigned)"
        );
    }
}
