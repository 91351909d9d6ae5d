use chrono::{DateTime, Utc};
use tonic::Status;
use uuid::Uuid;

use crate::deployment::{DeploymentRequest, DeploymentState, DeploymentStatus, Repository};
use crate::proto;

pub fn state_to_proto(state: DeploymentState) -> proto::DeploymentState {
    match state {
        DeploymentState::Pending => proto::DeploymentState::Pending,
        DeploymentState::Success => proto::DeploymentState::Success,
        DeploymentState::Failure => proto::DeploymentState::Failure,
        DeploymentState::Error => proto::DeploymentState::Error,
        DeploymentState::Inactive => proto::DeploymentState::Inactive,
    }
}

pub fn state_from_proto(state: i32) -> Result<DeploymentState, Status> {
    match proto::DeploymentState::try_from(state) {
        Ok(proto::DeploymentState::Pending) => Ok(DeploymentState::Pending),
        Ok(proto::DeploymentState::Success) => Ok(DeploymentState::Success),
        Ok(proto::DeploymentState::Failure) => Ok(DeploymentState::Failure),
        Ok(proto::DeploymentState::Error) => Ok(DeploymentState::Error),
        Ok(proto::DeploymentState::Inactive) => Ok(DeploymentState::Inactive),
        Err(_) => Err(Status::invalid_argument(format!(
            "Unknown deployment state {}",
            state
        ))),
    }
}

pub fn parse_id(id: &str) -> Result<Uuid, Status> {
    Uuid::parse_str(id).map_err(|_| Status::invalid_argument("Invalid deployment ID"))
}

fn time_from_millis(ms: i64, field: &str) -> Result<DateTime<Utc>, Status> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| Status::invalid_argument(format!("Invalid {} timestamp", field)))
}

pub fn request_to_proto(req: &DeploymentRequest) -> proto::DeploymentRequest {
    proto::DeploymentRequest {
        id: req.id.map(|id| id.to_string()).unwrap_or_default(),
        time_ms: req.time.timestamp_millis(),
        deadline_ms: req.deadline.timestamp_millis(),
        cluster: req.cluster.clone(),
        team: req.team.clone(),
        repository: Some(proto::GithubRepository {
            owner: req.repository.owner.clone(),
            name: req.repository.name.clone(),
        }),
        git_ref_sha: req.git_ref.clone(),
        github_environment: req.github_environment.clone(),
        payload: req.payload.clone(),
        trace_parent: req.trace_parent.clone(),
    }
}

pub fn request_from_proto(req: proto::DeploymentRequest) -> Result<DeploymentRequest, Status> {
    let id = if req.id.is_empty() {
        None
    } else {
        Some(parse_id(&req.id)?)
    };
    let repository = req
        .repository
        .map(|r| Repository::new(r.owner, r.name))
        .unwrap_or_default();

    Ok(DeploymentRequest {
        id,
        cluster: req.cluster,
        team: req.team,
        repository,
        git_ref: req.git_ref_sha,
        github_environment: req.github_environment,
        time: time_from_millis(req.time_ms, "submission")?,
        deadline: time_from_millis(req.deadline_ms, "deadline")?,
        payload: req.payload,
        trace_parent: req.trace_parent,
    })
}

pub fn status_to_proto(status: &DeploymentStatus) -> proto::DeploymentStatus {
    proto::DeploymentStatus {
        request_id: status.request_id.to_string(),
        state: state_to_proto(status.state) as i32,
        message: status.message.clone(),
        time_ms: status.time.timestamp_millis(),
        cluster: status.cluster.clone(),
        team: status.team.clone(),
        trace_parent: status.trace_parent.clone(),
    }
}

pub fn status_from_proto(status: proto::DeploymentStatus) -> Result<DeploymentStatus, Status> {
    Ok(DeploymentStatus {
        request_id: parse_id(&status.request_id)?,
        state: state_from_proto(status.state)?,
        message: status.message,
        time: time_from_millis(status.time_ms, "status")?,
        cluster: status.cluster,
        team: status.team,
        trace_parent: status.trace_parent,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn unassigned_request_has_empty_id_on_the_wire() {
        let req = DeploymentRequest::new("dev", "aura", b"[]".to_vec(), Duration::from_secs(30));
        let wire = request_to_proto(&req);
        assert!(wire.id.is_empty());
        let back = request_from_proto(wire).unwrap();
        assert!(back.id.is_none());
        assert_eq!(back.cluster, "dev");
        assert_eq!(back.deadline.timestamp_millis(), req.deadline.timestamp_millis());
    }

    #[test]
    fn malformed_id_is_invalid_argument() {
        let mut wire = request_to_proto(&DeploymentRequest::new(
            "dev",
            "aura",
            b"[]".to_vec(),
            Duration::from_secs(30),
        ));
        wire.id = "not-a-uuid".to_string();
        let err = request_from_proto(wire).unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn unknown_state_is_rejected() {
        let err = state_from_proto(42).unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn status_keeps_state_and_trace() {
        let status = DeploymentStatus::new(Uuid::new_v4(), DeploymentState::Failure, "boom")
            .with_trace_parent("00-abc-def-01");
        let back = status_from_proto(status_to_proto(&status)).unwrap();
        assert_eq!(back.state, DeploymentState::Failure);
        assert_eq!(back.trace_parent, "00-abc-def-01");
        assert_eq!(back.request_id, status.request_id);
    }
}
