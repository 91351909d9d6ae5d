//! Audit persistence for deployments.
//!
//! The hub never waits on storage: records go through [`PersistenceSink`], a channel drained by a
//! single background writer, so submit and status reports finish after their in-memory update.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::deployment::{DeploymentRequest, DeploymentStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("deployment request has no ID")]
    MissingId,

    #[error("storage backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait DeploymentStore: Send + Sync {
    async fn record_request(&self, request: &DeploymentRequest) -> Result<(), StoreError>;

    async fn record_status(&self, status: &DeploymentStatus) -> Result<(), StoreError>;

    async fn request(&self, id: &Uuid) -> Result<Option<DeploymentRequest>, StoreError>;

    /// Every recorded status for `id`, oldest first.
    async fn history(&self, id: &Uuid) -> Result<Vec<DeploymentStatus>, StoreError>;
}

/// In-process store, used by default and in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    requests: RwLock<HashMap<Uuid, DeploymentRequest>>,
    statuses: RwLock<HashMap<Uuid, Vec<DeploymentStatus>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeploymentStore for MemoryStore {
    async fn record_request(&self, request: &DeploymentRequest) -> Result<(), StoreError> {
        let id = request.id.ok_or(StoreError::MissingId)?;
        self.requests.write().await.insert(id, request.clone());
        Ok(())
    }

    async fn record_status(&self, status: &DeploymentStatus) -> Result<(), StoreError> {
        self.statuses
            .write()
            .await
            .entry(status.request_id)
            .or_default()
            .push(status.clone());
        Ok(())
    }

    async fn request(&self, id: &Uuid) -> Result<Option<DeploymentRequest>, StoreError> {
        Ok(self.requests.read().await.get(id).cloned())
    }

    async fn history(&self, id: &Uuid) -> Result<Vec<DeploymentStatus>, StoreError> {
        Ok(self
            .statuses
            .read()
            .await
            .get(id)
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Debug)]
enum Record {
    Request(DeploymentRequest),
    Status(DeploymentStatus),
}

/// Fire-and-forget handle to the background store writer.
#[derive(Clone)]
pub struct PersistenceSink {
    tx: mpsc::UnboundedSender<Record>,
    store: Arc<dyn DeploymentStore>,
}

impl PersistenceSink {
    /// Spawn the writer task. Must be called from within a tokio runtime.
    pub fn spawn(store: Arc<dyn DeploymentStore>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Record>();
        let writer = store.clone();

        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                let result = match &record {
                    Record::Request(request) => writer.record_request(request).await,
                    Record::Status(status) => writer.record_status(status).await,
                };
                if let Err(e) = result {
                    tracing::warn!(
                        error = %e,
                        record = ?record,
                        "Failed to persist deployment record"
                    );
                }
            }
            tracing::debug!("Persistence writer stopped");
        });

        Self { tx, store }
    }

    pub fn request(&self, request: &DeploymentRequest) {
        if self.tx.send(Record::Request(request.clone())).is_err() {
            tracing::warn!("Persistence writer gone, dropping request record");
        }
    }

    pub fn status(&self, status: &DeploymentStatus) {
        if self.tx.send(Record::Status(status.clone())).is_err() {
            tracing::warn!("Persistence writer gone, dropping status record");
        }
    }

    /// The store behind this sink, for read-side queries.
    pub fn store(&self) -> Arc<dyn DeploymentStore> {
        self.store.clone()
    }
}
