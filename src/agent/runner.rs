use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::agent::api::{DeploymentStream, DispatchApi};
use crate::config::AgentConfig;
use crate::deployment::{DeploymentRequest, DeploymentState, DeploymentStatus};
use crate::hub::ReportAck;
use crate::telemetry;

/// Terminal result of applying one deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    state: DeploymentState,
    message: String,
}

impl ApplyOutcome {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            state: DeploymentState::Success,
            message: message.into(),
        }
    }

    /// The manifests were rejected or the rollout failed.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            state: DeploymentState::Failure,
            message: message.into(),
        }
    }

    /// The agent could not complete the attempt.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            state: DeploymentState::Error,
            message: message.into(),
        }
    }

    pub fn state(&self) -> DeploymentState {
        self.state
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Applies a deployment's manifests to the cluster. Opaque to the hub.
#[async_trait]
pub trait Applier: Send + Sync {
    async fn apply(&self, request: &DeploymentRequest) -> ApplyOutcome;
}

/// Final statuses of recently applied deployments. The oldest entry goes first once full.
#[derive(Debug)]
struct FinishedCache {
    capacity: usize,
    order: VecDeque<Uuid>,
    statuses: HashMap<Uuid, DeploymentStatus>,
}

impl FinishedCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            statuses: HashMap::new(),
        }
    }

    fn get(&self, id: &Uuid) -> Option<&DeploymentStatus> {
        self.statuses.get(id)
    }

    fn insert(&mut self, status: DeploymentStatus) {
        let id = status.request_id;
        if self.statuses.insert(id, status).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.statuses.remove(&oldest);
            }
        }
    }
}

/// Dequeue loop of a cluster agent.
///
/// Reconnects at a fixed interval, reports `pending` before applying and the terminal status
/// after. Requests it recently finished are not applied again; the recorded result is
/// re-reported. A final report that does not reach the hub drops the stream, so the hub requeues
/// the request and the agent reports it again on redelivery.
pub struct AgentRunner<D, A> {
    api: D,
    applier: A,
    config: AgentConfig,
    finished: FinishedCache,
}

impl<D: DispatchApi, A: Applier> AgentRunner<D, A> {
    pub fn new(api: D, applier: A, config: AgentConfig) -> Self {
        Self {
            api,
            applier,
            finished: FinishedCache::new(config.finished_capacity),
            config,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub async fn run(&mut self, shutdown: CancellationToken) {
        while !shutdown.is_cancelled() {
            match self
                .api
                .deployments(&self.config.cluster, &self.config.agent_id)
                .await
            {
                Ok(stream) => {
                    tracing::info!(
                        cluster = %self.config.cluster,
                        agent_id = %self.config.agent_id,
                        "Connected to deployment hub"
                    );
                    if self.consume(stream, &shutdown).await {
                        break;
                    }
                }
                Err(status) => {
                    tracing::warn!(
                        cluster = %self.config.cluster,
                        code = ?status.code(),
                        error = status.message(),
                        "Failed to open deployment stream"
                    );
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.reconnect_interval) => {}
            }
        }
        tracing::info!(agent_id = %self.config.agent_id, "Agent stopped");
    }

    /// Handle requests until the stream ends. True when stopped by `shutdown`.
    async fn consume(
        &mut self,
        mut stream: DeploymentStream,
        shutdown: &CancellationToken,
    ) -> bool {
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => return true,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(request)) => {
                    if !self.handle(request).await {
                        return false;
                    }
                }
                Some(Err(status)) => {
                    tracing::warn!(
                        code = ?status.code(),
                        error = status.message(),
                        "Deployment stream failed, reconnecting"
                    );
                    return false;
                }
                None => {
                    tracing::warn!("Deployment stream closed by hub, reconnecting");
                    return false;
                }
            }
        }
    }

    /// Apply one request and report it. False when the final report did not reach the hub.
    async fn handle(&mut self, request: DeploymentRequest) -> bool {
        let Some(id) = request.id else {
            tracing::warn!(cluster = %request.cluster, "Ignoring deployment request without ID");
            return true;
        };

        if let Some(done) = self.finished.get(&id).cloned() {
            tracing::info!(
                deployment_id = %id,
                state = %done.state,
                "Deployment already finished, reporting again"
            );
            return self.report(&done).await.is_some();
        }

        let picked_up = DeploymentStatus::for_request(
            &request,
            DeploymentState::Pending,
            format!("deployment picked up by agent {}", self.config.agent_id),
        );
        if let Some(ack) = self.report(&picked_up).await {
            if !ack.continue_reporting {
                tracing::warn!(
                    deployment_id = %id,
                    "Hub does not expect this deployment, skipping"
                );
                return true;
            }
        }

        let outcome = self
            .applier
            .apply(&request)
            .instrument(telemetry::deployment_span(&request))
            .await;
        let status = DeploymentStatus::for_request(&request, outcome.state, outcome.message);
        tracing::info!(
            deployment_id = %id,
            cluster = %request.cluster,
            state = %status.state,
            "Deployment applied"
        );
        self.finished.insert(status.clone());
        self.report(&status).await.is_some()
    }

    async fn report(&self, status: &DeploymentStatus) -> Option<ReportAck> {
        match self.api.report_status(status).await {
            Ok(ack) => Some(ack),
            Err(e) => {
                tracing::warn!(
                    deployment_id = %status.request_id,
                    state = %status.state,
                    code = ?e.code(),
                    error = e.message(),
                    "Failed to report deployment status"
                );
                None
            }
        }
    }
}
