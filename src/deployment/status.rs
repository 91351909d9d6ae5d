use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::deployment::request::DeploymentRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentState {
    Pending,
    Success,
    Failure,
    Error,
    /// The hub lost in-flight memory of the request; the client has to resubmit it.
    Inactive,
}

impl DeploymentState {
    /// True for the terminal states that end a status stream.
    pub fn finished(&self) -> bool {
        matches!(
            self,
            DeploymentState::Success | DeploymentState::Failure | DeploymentState::Error
        )
    }

    /// True when a watcher should stop reading: terminal, or the hub forgot the request.
    pub fn ends_stream(&self) -> bool {
        self.finished() || *self == DeploymentState::Inactive
    }
}

impl std::fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeploymentState::Pending => write!(f, "pending"),
            DeploymentState::Success => write!(f, "success"),
            DeploymentState::Failure => write!(f, "failure"),
            DeploymentState::Error => write!(f, "error"),
            DeploymentState::Inactive => write!(f, "inactive"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentStatus {
    pub request_id: Uuid,
    pub state: DeploymentState,
    pub message: String,
    pub time: DateTime<Utc>,
    pub cluster: String,
    pub team: String,
    pub trace_parent: String,
}

impl DeploymentStatus {
    pub fn new(request_id: Uuid, state: DeploymentState, message: impl Into<String>) -> Self {
        Self {
            request_id,
            state,
            message: message.into(),
            time: Utc::now(),
            cluster: String::new(),
            team: String::new(),
            trace_parent: String::new(),
        }
    }

    /// Status for `request`, echoing its cluster, team and trace context.
    ///
    /// `request.id` must already be assigned; an unassigned request yields a nil ID.
    pub fn for_request(
        request: &DeploymentRequest,
        state: DeploymentState,
        message: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request.id.unwrap_or_else(Uuid::nil),
            state,
            message: message.into(),
            time: Utc::now(),
            cluster: request.cluster.clone(),
            team: request.team.clone(),
            trace_parent: request.trace_parent.clone(),
        }
    }

    /// Placeholder handed to watchers of an ID the hub has no record of.
    pub fn placeholder(request_id: Uuid) -> Self {
        Self::new(
            request_id,
            DeploymentState::Pending,
            "waiting for deployment request",
        )
    }

    pub fn inactive(request_id: Uuid, message: impl Into<String>) -> Self {
        Self::new(request_id, DeploymentState::Inactive, message)
    }

    pub fn with_trace_parent(mut self, trace_parent: impl Into<String>) -> Self {
        self.trace_parent = trace_parent.into();
        self
    }

    pub fn finished(&self) -> bool {
        self.state.finished()
    }
}
