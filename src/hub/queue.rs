use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::deployment::DeploymentRequest;

/// Pending requests for one cluster, in submission order.
///
/// The deque sits behind a std mutex because requeueing happens from `Drop` of an agent session.
/// The lock is never held across an await.
#[derive(Debug)]
pub struct ClusterQueue {
    cluster: String,
    pending: Mutex<VecDeque<DeploymentRequest>>,
    notify: Notify,
}

impl ClusterQueue {
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            pending: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    fn pending(&self) -> MutexGuard<'_, VecDeque<DeploymentRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a request and wake every waiting agent; the first one ready takes it.
    pub fn push_back(&self, request: DeploymentRequest) {
        self.pending().push_back(request);
        self.notify.notify_waiters();
    }

    /// Put requests back at the head, keeping their relative order.
    pub fn requeue_front(&self, requests: Vec<DeploymentRequest>) {
        if requests.is_empty() {
            return;
        }
        {
            let mut pending = self.pending();
            for request in requests.into_iter().rev() {
                pending.push_front(request);
            }
        }
        self.notify.notify_waiters();
    }

    pub fn try_pop(&self) -> Option<DeploymentRequest> {
        self.pending().pop_front()
    }

    /// Wait for the next request.
    ///
    /// Cancel safe: a request is only removed in the same poll that returns it.
    pub async fn pop(&self) -> DeploymentRequest {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a push between the check and the await is not missed.
            notified.as_mut().enable();

            if let Some(request) = self.try_pop() {
                return request;
            }
            notified.await;
        }
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.pending().iter().any(|r| r.id.as_ref() == Some(id))
    }

    /// Remove every request matching `predicate`, returning them in queue order.
    pub fn drain_where<F>(&self, mut predicate: F) -> Vec<DeploymentRequest>
    where
        F: FnMut(&DeploymentRequest) -> bool,
    {
        let mut pending = self.pending();
        let mut removed = Vec::new();
        let mut kept = VecDeque::with_capacity(pending.len());
        for request in pending.drain(..) {
            if predicate(&request) {
                removed.push(request);
            } else {
                kept.push_back(request);
            }
        }
        *pending = kept;
        removed
    }

    /// IDs currently waiting, head first.
    pub fn pending_ids(&self) -> Vec<Uuid> {
        self.pending().iter().filter_map(|r| r.id).collect()
    }

    pub fn len(&self) -> usize {
        self.pending().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending().is_empty()
    }
}

/// Lazily created queues keyed by cluster name.
#[derive(Debug, Default)]
pub struct ClusterQueues {
    queues: DashMap<String, Arc<ClusterQueue>>,
}

impl ClusterQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, cluster: &str) -> Arc<ClusterQueue> {
        if let Some(queue) = self.queues.get(cluster) {
            return queue.clone();
        }
        self.queues
            .entry(cluster.to_string())
            .or_insert_with(|| Arc::new(ClusterQueue::new(cluster)))
            .clone()
    }

    pub fn get(&self, cluster: &str) -> Option<Arc<ClusterQueue>> {
        self.queues.get(cluster).map(|q| q.clone())
    }

    pub fn all(&self) -> Vec<Arc<ClusterQueue>> {
        self.queues.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Queue depth per cluster, sorted by cluster name.
    pub fn depths(&self) -> Vec<(String, usize)> {
        let mut depths: Vec<(String, usize)> = self
            .queues
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().len()))
            .collect();
        depths.sort();
        depths
    }
}
