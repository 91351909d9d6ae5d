use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

use crate::deployment::DeploymentStatus;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("deployment {0} already reached a terminal status")]
    AlreadyFinished(Uuid),

    #[error("deployment {0} is not known to the hub")]
    UnknownDeployment(Uuid),
}

/// Outcome of a successful publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    /// The status as stored, after timestamp clamping and field backfill.
    pub status: DeploymentStatus,
    pub finished: bool,
}

/// What [`StatusBus::open`] found for the ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Opened {
    /// New topic, or a placeholder promoted to a real one.
    Created,
    /// A real topic already exists; carries its latest status.
    Existing(DeploymentStatus),
}

#[derive(Debug)]
struct Topic {
    tx: watch::Sender<DeploymentStatus>,
    /// Created by a watcher before the hub saw the request.
    placeholder: bool,
    finished_at: Option<DateTime<Utc>>,
}

impl Topic {
    fn new(status: DeploymentStatus, placeholder: bool) -> Self {
        let (tx, _rx) = watch::channel(status);
        Self {
            tx,
            placeholder,
            finished_at: None,
        }
    }

    fn last(&self) -> DeploymentStatus {
        self.tx.borrow().clone()
    }

    /// Store `status` as the latest value. Never blocks, never fails for lack of receivers.
    fn store(&mut self, mut status: DeploymentStatus) -> DeploymentStatus {
        {
            let last = self.tx.borrow();
            if status.time < last.time {
                status.time = last.time;
            }
            if status.cluster.is_empty() {
                status.cluster = last.cluster.clone();
            }
            if status.team.is_empty() {
                status.team = last.team.clone();
            }
            if status.trace_parent.is_empty() {
                status.trace_parent = last.trace_parent.clone();
            }
        }
        if status.finished() {
            self.finished_at = Some(Utc::now());
        }
        self.tx.send_replace(status.clone());
        status
    }
}

/// Per-deployment status fan-out.
///
/// Each ID holds a single latest-value cell. Subscribing and publishing for one ID run under the
/// same map entry lock, so a watcher either sees a terminal status in its replay or is registered
/// before it is sent.
#[derive(Debug)]
pub struct StatusBus {
    topics: DashMap<Uuid, Topic>,
    unknown_id_grace: Duration,
}

impl StatusBus {
    pub fn new(unknown_id_grace: Duration) -> Self {
        Self {
            topics: DashMap::new(),
            unknown_id_grace,
        }
    }

    /// Open the topic for a submitted request, promoting a placeholder if watchers got there first.
    pub fn open(&self, status: DeploymentStatus) -> Opened {
        match self.topics.entry(status.request_id) {
            Entry::Occupied(mut entry) => {
                let topic = entry.get_mut();
                if topic.placeholder {
                    topic.placeholder = false;
                    topic.store(status);
                    Opened::Created
                } else {
                    Opened::Existing(topic.last())
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(Topic::new(status, false));
                Opened::Created
            }
        }
    }

    pub fn publish(&self, status: DeploymentStatus) -> Result<Published, BusError> {
        let id = status.request_id;
        let mut topic = match self.topics.get_mut(&id) {
            Some(topic) if !topic.placeholder => topic,
            _ => return Err(BusError::UnknownDeployment(id)),
        };
        if topic.finished_at.is_some() {
            return Err(BusError::AlreadyFinished(id));
        }

        let status = topic.store(status);
        let finished = status.finished();
        Ok(Published { status, finished })
    }

    /// Tell placeholder watchers of `id` that the hub has no memory of it, then drop the topic.
    ///
    /// Returns false when there were no placeholder watchers to tell.
    pub fn forget_placeholder(&self, id: Uuid, message: &str) -> bool {
        match self.topics.entry(id) {
            Entry::Occupied(mut entry) if entry.get().placeholder => {
                entry.get_mut().store(DeploymentStatus::inactive(id, message));
                entry.remove();
                true
            }
            _ => false,
        }
    }

    pub fn subscribe(&self, id: Uuid) -> StatusSubscription {
        let entry = self
            .topics
            .entry(id)
            .or_insert_with(|| Topic::new(DeploymentStatus::placeholder(id), true));

        let mut rx = entry.tx.subscribe();
        let initial = rx.borrow_and_update().clone();
        let grace = entry.placeholder.then_some(self.unknown_id_grace);

        StatusSubscription {
            request_id: id,
            rx,
            initial: Some(initial),
            grace,
            done: false,
        }
    }

    /// Latest status of a submitted request. Placeholders don't count.
    pub fn last(&self, id: &Uuid) -> Option<DeploymentStatus> {
        self.topics
            .get(id)
            .filter(|topic| !topic.placeholder)
            .map(|topic| topic.last())
    }

    pub fn is_finished(&self, id: &Uuid) -> bool {
        self.topics
            .get(id)
            .map(|topic| topic.finished_at.is_some())
            .unwrap_or(false)
    }

    pub fn watcher_count(&self, id: &Uuid) -> usize {
        self.topics
            .get(id)
            .map(|topic| topic.tx.receiver_count())
            .unwrap_or(0)
    }

    /// Publish `inactive` to every unfinished topic and forget all of them.
    pub fn abandon_all(&self, message: &str) -> usize {
        let mut abandoned = 0;
        for mut topic in self.topics.iter_mut() {
            if topic.finished_at.is_none() {
                let id = *topic.key();
                topic.store(DeploymentStatus::inactive(id, message));
                abandoned += 1;
            }
        }
        self.topics.clear();
        abandoned
    }

    /// Drop topics finished longer than `retention` ago and placeholders nobody watches.
    pub fn reap(&self, retention: Duration) -> usize {
        let retention = chrono::Duration::from_std(retention)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let cutoff = Utc::now() - retention;
        let before = self.topics.len();
        self.topics.retain(|_, topic| {
            let expired = topic.finished_at.map(|at| at <= cutoff).unwrap_or(false);
            let orphaned = topic.placeholder && topic.tx.receiver_count() == 0;
            !expired && !orphaned
        });
        before - self.topics.len()
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

/// A watcher's view of one deployment.
///
/// Yields the latest known status first, then every newer status it gets to observe, and ends
/// after a finished or `inactive` status.
#[derive(Debug)]
pub struct StatusSubscription {
    request_id: Uuid,
    rx: watch::Receiver<DeploymentStatus>,
    initial: Option<DeploymentStatus>,
    grace: Option<Duration>,
    done: bool,
}

impl StatusSubscription {
    /// Next status, or `None` once the stream is over. Cancel safe.
    pub async fn next(&mut self) -> Option<DeploymentStatus> {
        if self.done {
            return None;
        }

        let status = match self.initial.take() {
            Some(status) => status,
            None => {
                let changed = match self.grace {
                    Some(grace) => match tokio::time::timeout(grace, self.rx.changed()).await {
                        Ok(changed) => changed,
                        Err(_) => {
                            self.done = true;
                            return Some(DeploymentStatus::inactive(
                                self.request_id,
                                "no deployment with this ID is known to the hub; resubmit",
                            ));
                        }
                    },
                    None => self.rx.changed().await,
                };
                if changed.is_err() {
                    // Topic reaped or hub state dropped.
                    self.done = true;
                    return None;
                }
                self.grace = None;
                self.rx.borrow_and_update().clone()
            }
        };

        if status.state.ends_stream() {
            self.done = true;
        }
        Some(status)
    }
}
