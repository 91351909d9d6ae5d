//! Test doubles for driving the hub from the agent side.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::agent::runner::{ApplyOutcome, Applier};
use crate::deployment::DeploymentRequest;

/// Applier returning a fixed outcome after an optional delay, recording what it applied.
#[derive(Clone)]
pub struct ScriptedApplier {
    outcome: ApplyOutcome,
    delay: Duration,
    applied: Arc<Mutex<Vec<Uuid>>>,
}

impl ScriptedApplier {
    pub fn new(outcome: ApplyOutcome) -> Self {
        Self {
            outcome,
            delay: Duration::ZERO,
            applied: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(ApplyOutcome::success("all resources applied"))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// IDs handed to `apply`, in call order.
    pub fn applied(&self) -> Vec<Uuid> {
        self.applied
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Applier for ScriptedApplier {
    async fn apply(&self, request: &DeploymentRequest) -> ApplyOutcome {
        if let Some(id) = request.id {
            self.applied
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(id);
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.outcome.clone()
    }
}
