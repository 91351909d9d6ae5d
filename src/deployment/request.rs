use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub owner: String,
    pub name: String,
}

impl Repository {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

/// Reasons a request is rejected before it reaches a queue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("cluster required")]
    ClusterRequired,

    #[error("team required")]
    TeamRequired,

    #[error("at least one Kubernetes resource is required to make sense of the deployment")]
    ResourceRequired,

    #[error("deadline {deadline} is not after submission time {time}")]
    DeadlineNotAfterSubmission {
        time: DateTime<Utc>,
        deadline: DateTime<Utc>,
    },
}

/// A finished deployment request, as handed over by resource preparation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRequest {
    /// Assigned by the hub on first acceptance and never changed afterwards.
    pub id: Option<Uuid>,
    pub cluster: String,
    pub team: String,
    pub repository: Repository,
    pub git_ref: String,
    pub github_environment: String,
    pub time: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    /// Rendered manifests; opaque to the hub.
    #[serde(skip)]
    pub payload: Vec<u8>,
    pub trace_parent: String,
}

impl DeploymentRequest {
    /// New unassigned request submitted now, expiring after `timeout`.
    pub fn new(
        cluster: impl Into<String>,
        team: impl Into<String>,
        payload: Vec<u8>,
        timeout: std::time::Duration,
    ) -> Self {
        let time = Utc::now();
        let timeout = Duration::from_std(timeout).unwrap_or_else(|_| Duration::minutes(10));
        Self {
            id: None,
            cluster: cluster.into(),
            team: team.into(),
            repository: Repository::default(),
            git_ref: String::new(),
            github_environment: String::new(),
            time,
            deadline: time + timeout,
            payload,
            trace_parent: String::new(),
        }
    }

    pub fn with_repository(mut self, repository: Repository) -> Self {
        self.repository = repository;
        self
    }

    pub fn with_git_ref(mut self, git_ref: impl Into<String>) -> Self {
        self.git_ref = git_ref.into();
        self
    }

    pub fn with_trace_parent(mut self, trace_parent: impl Into<String>) -> Self {
        self.trace_parent = trace_parent.into();
        self
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.cluster.trim().is_empty() {
            return Err(ValidationError::ClusterRequired);
        }
        if self.team.trim().is_empty() {
            return Err(ValidationError::TeamRequired);
        }
        if self.payload.is_empty() {
            return Err(ValidationError::ResourceRequired);
        }
        if self.deadline <= self.time {
            return Err(ValidationError::DeadlineNotAfterSubmission {
                time: self.time,
                deadline: self.deadline,
            });
        }
        Ok(())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.deadline
    }
}
