//! The dispatch hub: per-cluster work queues plus per-deployment status fan-out.
//!
//! All state is in memory and owned by a [`Hub`] value. [`Hub::reset`] drops it wholesale, which
//! is what a process restart looks like to connected clients and agents.

pub mod bus;
pub mod queue;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::HubConfig;
use crate::deployment::{DeploymentRequest, DeploymentState, DeploymentStatus};
use crate::error::{HubError, Result};
use crate::store::PersistenceSink;

use self::bus::{BusError, Opened, StatusBus, StatusSubscription};
use self::queue::{ClusterQueue, ClusterQueues};

pub use self::bus::Published;

const STATE_LOST_MESSAGE: &str = "deployment hub lost its in-memory state; resubmit the request";
const UNKNOWN_REPORT_MESSAGE: &str =
    "an agent reported on a deployment the hub does not know; resubmit";
const EXPIRED_MESSAGE: &str = "deadline exceeded before an agent picked it up";

/// Reply to an agent's status report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportAck {
    /// False once the hub expects no further reports for this deployment.
    pub continue_reporting: bool,
}

/// Which agent session holds a dispatched request.
#[derive(Debug)]
struct Claim {
    session: Uuid,
    released: Arc<Notify>,
}

/// One generation of hub memory. Replaced wholesale by [`Hub::reset`].
#[derive(Debug)]
struct HubState {
    epoch: Uuid,
    queues: ClusterQueues,
    bus: StatusBus,
    /// Dispatched requests the hub still expects a final report for, by deployment ID.
    claims: DashMap<Uuid, Claim>,
    lost: CancellationToken,
}

impl HubState {
    fn new(config: &HubConfig) -> Self {
        Self {
            epoch: Uuid::new_v4(),
            queues: ClusterQueues::new(),
            bus: StatusBus::new(config.unknown_id_grace),
            claims: DashMap::new(),
            lost: CancellationToken::new(),
        }
    }

    /// Forget the claim on `id` and let its session pull more work.
    fn release(&self, id: &Uuid) {
        if let Some((_, claim)) = self.claims.remove(id) {
            claim.released.notify_one();
        }
    }

    fn expire(&self, request: &DeploymentRequest, persistence: Option<&PersistenceSink>) {
        let status =
            DeploymentStatus::for_request(request, DeploymentState::Error, EXPIRED_MESSAGE);
        match self.bus.publish(status) {
            Ok(published) => {
                if let Some(sink) = persistence {
                    sink.status(&published.status);
                }
                tracing::warn!(
                    deployment_id = %published.status.request_id,
                    cluster = %request.cluster,
                    deadline = %request.deadline,
                    "Discarded expired deployment request"
                );
            }
            Err(e) => tracing::debug!(error = %e, "Expired request had no live topic"),
        }
    }
}

pub struct Hub {
    config: HubConfig,
    state: RwLock<Arc<HubState>>,
    persistence: Option<PersistenceSink>,
}

impl Hub {
    pub fn new(config: HubConfig) -> Self {
        let state = Arc::new(HubState::new(&config));
        Self {
            config,
            state: RwLock::new(state),
            persistence: None,
        }
    }

    /// Also hand every accepted request and published status to `sink`.
    pub fn with_persistence(config: HubConfig, sink: PersistenceSink) -> Self {
        Self {
            persistence: Some(sink),
            ..Self::new(config)
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn persistence(&self) -> Option<&PersistenceSink> {
        self.persistence.as_ref()
    }

    async fn current(&self) -> Arc<HubState> {
        self.state.read().await.clone()
    }

    /// Identifies the current generation of hub memory; changes on every reset.
    pub async fn epoch(&self) -> Uuid {
        self.current().await.epoch
    }

    /// Accept a request and queue it for its cluster.
    ///
    /// Returns the initial `pending` status. A request that already carries an ID keeps it; if
    /// that ID already finished, its terminal status is returned and nothing is queued.
    pub async fn submit(&self, mut request: DeploymentRequest) -> Result<DeploymentStatus> {
        request.validate()?;
        let state = self.current().await;
        let id = *request.id.get_or_insert_with(Uuid::new_v4);

        let pending = DeploymentStatus::for_request(
            &request,
            DeploymentState::Pending,
            format!("deployment request accepted and queued for cluster {}", request.cluster),
        );

        match state.bus.open(pending.clone()) {
            Opened::Existing(last) if last.finished() => {
                tracing::info!(
                    deployment_id = %id,
                    state = %last.state,
                    "Resubmitted deployment already finished, not queueing"
                );
                return Ok(last);
            }
            Opened::Existing(last) => {
                let queue = state.queues.get_or_create(&request.cluster);
                if queue.contains(&id) {
                    tracing::debug!(deployment_id = %id, "Resubmitted deployment still queued");
                } else if state.claims.contains_key(&id) {
                    tracing::debug!(deployment_id = %id, "Resubmitted deployment being applied");
                } else {
                    tracing::info!(
                        deployment_id = %id,
                        cluster = %request.cluster,
                        "Resubmitted deployment queued again"
                    );
                    queue.push_back(request);
                }
                return Ok(last);
            }
            Opened::Created => {}
        }

        if let Some(sink) = &self.persistence {
            sink.request(&request);
            sink.status(&pending);
        }

        tracing::info!(
            deployment_id = %id,
            cluster = %request.cluster,
            team = %request.team,
            repository = %request.repository.full_name(),
            trace_parent = %request.trace_parent,
            "Deployment request queued"
        );
        state.queues.get_or_create(&request.cluster).push_back(request);

        Ok(pending)
    }

    /// Open an agent session on `cluster`.
    pub async fn dequeue(&self, cluster: &str, agent_id: &str) -> AgentSession {
        let state = self.current().await;
        let queue = state.queues.get_or_create(cluster);
        tracing::info!(cluster, agent_id, "Agent connected");
        AgentSession {
            id: Uuid::new_v4(),
            state,
            queue,
            agent_id: agent_id.to_string(),
            claim: None,
            released: Arc::new(Notify::new()),
            persistence: self.persistence.clone(),
        }
    }

    pub async fn report_status(&self, status: DeploymentStatus) -> Result<ReportAck> {
        if status.state == DeploymentState::Inactive {
            return Err(HubError::InvalidArgument(
                "agents cannot report the inactive state".to_string(),
            ));
        }

        let state = self.current().await;
        let id = status.request_id;

        match state.bus.publish(status) {
            Ok(Published { status, finished }) => {
                if let Some(sink) = &self.persistence {
                    sink.status(&status);
                }
                if finished {
                    state.release(&id);
                    if let Some(queue) = state.queues.get(&status.cluster) {
                        queue.drain_where(|r| r.id == Some(id));
                    }
                    tracing::info!(
                        deployment_id = %id,
                        cluster = %status.cluster,
                        state = %status.state,
                        message = %status.message,
                        "Deployment finished"
                    );
                } else {
                    tracing::debug!(deployment_id = %id, state = %status.state, "Status reported");
                }
                Ok(ReportAck {
                    continue_reporting: !finished,
                })
            }
            Err(BusError::AlreadyFinished(_)) => {
                state.release(&id);
                tracing::warn!(deployment_id = %id, "Ignoring status for finished deployment");
                Ok(ReportAck {
                    continue_reporting: false,
                })
            }
            Err(BusError::UnknownDeployment(_)) => {
                state.release(&id);
                let told = state.bus.forget_placeholder(id, UNKNOWN_REPORT_MESSAGE);
                tracing::warn!(
                    deployment_id = %id,
                    watchers_told = told,
                    "Status reported for unknown deployment"
                );
                Ok(ReportAck {
                    continue_reporting: false,
                })
            }
        }
    }

    /// Watch a deployment. Unknown IDs get a placeholder `pending` first.
    pub async fn subscribe(&self, id: Uuid) -> StatusSubscription {
        self.current().await.bus.subscribe(id)
    }

    pub async fn last_status(&self, id: &Uuid) -> Option<DeploymentStatus> {
        self.current().await.bus.last(id)
    }

    pub async fn watcher_count(&self, id: &Uuid) -> usize {
        self.current().await.bus.watcher_count(id)
    }

    /// Pending requests per cluster, sorted by cluster name.
    pub async fn queue_depths(&self) -> Vec<(String, usize)> {
        self.current().await.queues.depths()
    }

    /// IDs waiting in `cluster`'s queue, head first.
    pub async fn pending_ids(&self, cluster: &str) -> Vec<Uuid> {
        self.current()
            .await
            .queues
            .get(cluster)
            .map(|q| q.pending_ids())
            .unwrap_or_default()
    }

    /// Forget everything, as a restart would.
    ///
    /// Live watchers get `inactive`, and agent sessions end with [`HubError::StateLost`].
    pub async fn reset(&self) {
        let fresh = Arc::new(HubState::new(&self.config));
        let old = {
            let mut state = self.state.write().await;
            std::mem::replace(&mut *state, fresh)
        };
        old.lost.cancel();
        let abandoned = old.bus.abandon_all(STATE_LOST_MESSAGE);
        tracing::warn!(
            old_epoch = %old.epoch,
            abandoned,
            "Hub state reset, in-flight deployments marked inactive"
        );
    }

    /// Expire overdue queued requests, then drop finished deployments older than the configured
    /// retention.
    pub async fn reap(&self) -> usize {
        self.reap_older_than(self.config.retention).await
    }

    pub async fn reap_older_than(&self, retention: Duration) -> usize {
        let state = self.current().await;
        let now = Utc::now();
        let mut expired = 0;
        for queue in state.queues.all() {
            for request in queue.drain_where(|r| r.is_expired(now)) {
                state.expire(&request, self.persistence.as_ref());
                expired += 1;
            }
        }

        let reaped = state.bus.reap(retention);
        if reaped > 0 || expired > 0 {
            tracing::debug!(reaped, expired, "Reaped deployment topics");
        }
        reaped
    }
}

/// An agent's claim on one cluster's queue.
///
/// A session holds at most one dispatched request at a time and only pulls the next one after
/// the hub has acknowledged a final report for it, so idle agents on the same cluster win the
/// queue head. Dropping the session puts an unreleased claim back at the queue head.
pub struct AgentSession {
    id: Uuid,
    state: Arc<HubState>,
    queue: Arc<ClusterQueue>,
    agent_id: String,
    claim: Option<DeploymentRequest>,
    released: Arc<Notify>,
    persistence: Option<PersistenceSink>,
}

impl AgentSession {
    /// Wait until the current claim is released, then for the next deliverable request.
    ///
    /// Cancel safe.
    pub async fn next(&mut self) -> Result<DeploymentRequest> {
        loop {
            if let Some(id) = self.claim.as_ref().and_then(|r| r.id) {
                if self.holds(&id) {
                    tokio::select! {
                        biased;
                        _ = self.state.lost.cancelled() => return Err(HubError::StateLost),
                        _ = self.released.notified() => {}
                    }
                    continue;
                }
                self.claim = None;
            }

            let request = tokio::select! {
                biased;
                _ = self.state.lost.cancelled() => return Err(HubError::StateLost),
                request = self.queue.pop() => request,
            };

            let Some(id) = request.id else {
                continue;
            };
            if self.state.bus.is_finished(&id) {
                tracing::debug!(deployment_id = %id, "Skipping finished deployment");
                continue;
            }
            if request.is_expired(Utc::now()) {
                self.state.expire(&request, self.persistence.as_ref());
                continue;
            }

            tracing::info!(
                deployment_id = %id,
                cluster = %request.cluster,
                agent_id = %self.agent_id,
                trace_parent = %request.trace_parent,
                "Deployment dispatched to agent"
            );
            let claim = Claim {
                session: self.id,
                released: self.released.clone(),
            };
            if let Some(previous) = self.state.claims.insert(id, claim) {
                previous.released.notify_one();
            }
            self.claim = Some(request.clone());
            return Ok(request);
        }
    }

    fn holds(&self, id: &Uuid) -> bool {
        self.state
            .claims
            .get(id)
            .map(|claim| claim.session == self.id)
            .unwrap_or(false)
    }

    /// The dispatched request still waiting for a final report, if any.
    pub fn claimed(&self) -> Option<Uuid> {
        self.claim
            .as_ref()
            .and_then(|r| r.id)
            .filter(|id| self.holds(id))
    }
}

impl Drop for AgentSession {
    fn drop(&mut self) {
        // After a reset the old queues are unreachable; clients resubmit instead.
        if self.state.lost.is_cancelled() {
            return;
        }
        let session = self.id;
        let unreleased = self.claim.take().filter(|request| {
            request
                .id
                .and_then(|id| {
                    self.state
                        .claims
                        .remove_if(&id, |_, claim| claim.session == session)
                })
                .is_some()
        });

        match unreleased {
            None => tracing::info!(
                cluster = %self.queue.cluster(),
                agent_id = %self.agent_id,
                "Agent disconnected"
            ),
            Some(request) => {
                tracing::warn!(
                    cluster = %self.queue.cluster(),
                    agent_id = %self.agent_id,
                    deployment_id = ?request.id,
                    "Agent disconnected with an unfinished deployment, requeueing"
                );
                self.queue.requeue_front(vec![request]);
            }
        }
    }
}
