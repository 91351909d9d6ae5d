//! Client pipeline behaviour against a hub that misbehaves in controlled ways.


use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tonic::{Code, Status};
use uuid::Uuid;

use deploy_hub::agent::testing::ScriptedApplier;
use deploy_hub::agent::{AgentRunner, LocalDispatchApi};
use deploy_hub::client::{
    DeployApi, DeployError, Deployer, ExitCode, LocalDeployApi, StatusStream,
};
use deploy_hub::config::{AgentConfig, ClientConfig, RetryPolicy};
use deploy_hub::deployment::{DeploymentRequest, DeploymentState, DeploymentStatus};
use deploy_hub::hub::Hub;
use test_harness::{test_client_config, test_hub_config, test_request};

/// Wraps the in-process API and injects failures.
struct FlakyApi {
    inner: LocalDeployApi,
    failure: Code,
    deploy_failures: AtomicU32,
    truncated_streams: AtomicU32,
    inactive_once: AtomicBool,
    stream_error: Mutex<Option<Code>>,
    deploy_calls: AtomicU32,
    status_calls: AtomicU32,
    submitted_ids: Mutex<Vec<Option<Uuid>>>,
}

impl FlakyApi {
    fn new(hub: Arc<Hub>) -> Self {
        Self {
            inner: LocalDeployApi::new(hub),
            failure: Code::Unavailable,
            deploy_failures: AtomicU32::new(0),
            truncated_streams: AtomicU32::new(0),
            inactive_once: AtomicBool::new(false),
            stream_error: Mutex::new(None),
            deploy_calls: AtomicU32::new(0),
            status_calls: AtomicU32::new(0),
            submitted_ids: Mutex::new(Vec::new()),
        }
    }

    fn failing_deploys(mut self, code: Code, times: u32) -> Self {
        self.failure = code;
        self.deploy_failures = AtomicU32::new(times);
        self
    }

    /// The next `times` status streams end after their first item.
    fn truncating_streams(self, times: u32) -> Self {
        self.truncated_streams.store(times, Ordering::SeqCst);
        self
    }

    /// The first status stream reports `inactive` as if the hub had restarted.
    fn forgetting_once(self) -> Self {
        self.inactive_once.store(true, Ordering::SeqCst);
        self
    }

    /// The next status stream fails with `code` after its first item.
    fn failing_stream_once(self, code: Code) -> Self {
        *self.stream_error.lock().unwrap() = Some(code);
        self
    }

    fn deploy_calls(&self) -> u32 {
        self.deploy_calls.load(Ordering::SeqCst)
    }

    fn status_calls(&self) -> u32 {
        self.status_calls.load(Ordering::SeqCst)
    }

    fn submitted_ids(&self) -> Vec<Option<Uuid>> {
        self.submitted_ids.lock().unwrap().clone()
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl DeployApi for FlakyApi {
    async fn deploy(&self, request: &DeploymentRequest) -> Result<DeploymentStatus, Status> {
        self.deploy_calls.fetch_add(1, Ordering::SeqCst);
        self.submitted_ids.lock().unwrap().push(request.id);
        if take_one(&self.deploy_failures) {
            return Err(Status::new(self.failure, "injected failure"));
        }
        self.inner.deploy(request).await
    }

    async fn status(&self, id: Uuid, trace_parent: &str) -> Result<StatusStream, Status> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        if self.inactive_once.swap(false, Ordering::SeqCst) {
            let inactive = DeploymentStatus::inactive(id, "hub restarted");
            return Ok(Box::pin(tokio_stream::iter(vec![Ok(inactive)])));
        }
        let stream = self.inner.status(id, trace_parent).await?;
        if let Some(code) = self.stream_error.lock().unwrap().take() {
            let failure = tokio_stream::iter(vec![Err(Status::new(code, "injected failure"))]);
            return Ok(Box::pin(stream.take(1).chain(failure)));
        }
        if take_one(&self.truncated_streams) {
            return Ok(Box::pin(stream.take(1)));
        }
        Ok(stream)
    }
}

fn fast_retry_config() -> ClientConfig {
    test_client_config("local")
        .with_retry(RetryPolicy::default().with_interval(Duration::from_millis(10)))
}

fn spawn_agent(hub: &Arc<Hub>, applier: ScriptedApplier) -> CancellationToken {
    let shutdown = CancellationToken::new();
    let config =
        AgentConfig::new("dev", "dev-agent").with_reconnect_interval(Duration::from_millis(20));
    let mut runner = AgentRunner::new(LocalDispatchApi::new(hub.clone()), applier, config);
    let token = shutdown.clone();
    tokio::spawn(async move { runner.run(token).await });
    shutdown
}

// ============================================================================
// Submit retries
// ============================================================================

#[tokio::test]
async fn test_transient_submit_failures_are_retried() {
    let hub = Arc::new(Hub::new(test_hub_config()));
    let shutdown = spawn_agent(&hub, ScriptedApplier::succeeding());
    let api = Arc::new(FlakyApi::new(hub.clone()).failing_deploys(Code::Unavailable, 2));

    let deployer = Deployer::new(api.clone(), fast_retry_config());
    let status = deployer.deploy(test_request("dev")).await.unwrap();

    assert_eq!(status.state, DeploymentState::Success);
    assert_eq!(api.deploy_calls(), 3);
    shutdown.cancel();
}

#[tokio::test]
async fn test_internal_errors_are_retried() {
    let hub = Arc::new(Hub::new(test_hub_config()));
    let api = Arc::new(FlakyApi::new(hub.clone()).failing_deploys(Code::Internal, 1));

    let deployer = Deployer::new(api.clone(), fast_retry_config().with_wait(false));
    let status = deployer.deploy(test_request("dev")).await.unwrap();

    assert_eq!(status.state, DeploymentState::Pending);
    assert_eq!(api.deploy_calls(), 2);
}

#[tokio::test]
async fn test_unauthenticated_is_not_retried() {
    let hub = Arc::new(Hub::new(test_hub_config()));
    let api = Arc::new(FlakyApi::new(hub.clone()).failing_deploys(Code::Unauthenticated, 5));

    let deployer = Deployer::new(api.clone(), fast_retry_config());
    let err = deployer.deploy(test_request("dev")).await.unwrap_err();

    assert!(matches!(err, DeployError::Rejected(ref s) if s.code() == Code::Unauthenticated));
    assert_eq!(err.exit_code(), ExitCode::NoDeployment);
    assert_eq!(api.deploy_calls(), 1);
    assert!(hub.queue_depths().await.is_empty());
}

#[tokio::test]
async fn test_retry_budget_is_bounded() {
    let hub = Arc::new(Hub::new(test_hub_config()));
    let api = Arc::new(FlakyApi::new(hub.clone()).failing_deploys(Code::Unavailable, 100));

    let config = test_client_config("local").with_retry(
        RetryPolicy::default()
            .with_interval(Duration::from_millis(10))
            .with_max_attempts(2),
    );
    let err = Deployer::new(api.clone(), config)
        .deploy(test_request("dev"))
        .await
        .unwrap_err();

    assert_eq!(err.exit_code(), ExitCode::Unavailable);
    assert_eq!(api.deploy_calls(), 3);
}

#[tokio::test]
async fn test_disabled_retry_fails_on_first_error() {
    let hub = Arc::new(Hub::new(test_hub_config()));
    let api = Arc::new(FlakyApi::new(hub.clone()).failing_deploys(Code::Unavailable, 1));

    let config = test_client_config("local").with_retry(RetryPolicy::disabled());
    let err = Deployer::new(api.clone(), config)
        .deploy(test_request("dev"))
        .await
        .unwrap_err();

    assert_eq!(err.exit_code(), ExitCode::Unavailable);
    assert_eq!(api.deploy_calls(), 1);
}

#[tokio::test]
async fn test_invalid_request_never_reaches_the_hub() {
    let hub = Arc::new(Hub::new(test_hub_config()));
    let api = Arc::new(FlakyApi::new(hub.clone()));
    let mut request = test_request("dev");
    request.team.clear();

    let err = Deployer::new(api.clone(), fast_retry_config())
        .deploy(request)
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::Invalid(_)));
    assert_eq!(err.exit_code(), ExitCode::InvocationFailure);
    assert_eq!(api.deploy_calls(), 0);
}

// ============================================================================
// Watching
// ============================================================================

#[tokio::test]
async fn test_interrupted_status_stream_is_reopened() {
    let hub = Arc::new(Hub::new(test_hub_config()));
    let api = Arc::new(FlakyApi::new(hub.clone()).truncating_streams(2));
    let applier = ScriptedApplier::succeeding().with_delay(Duration::from_millis(100));
    let shutdown = spawn_agent(&hub, applier);

    let status = Deployer::new(api.clone(), fast_retry_config())
        .deploy(test_request("dev"))
        .await
        .unwrap();

    assert_eq!(status.state, DeploymentState::Success);
    assert!(api.status_calls() >= 3);
    shutdown.cancel();
}

#[tokio::test]
async fn test_transient_stream_error_reopens_watch() {
    let hub = Arc::new(Hub::new(test_hub_config()));
    let api = Arc::new(FlakyApi::new(hub.clone()).failing_stream_once(Code::Unavailable));
    let applier = ScriptedApplier::succeeding().with_delay(Duration::from_millis(50));
    let shutdown = spawn_agent(&hub, applier);

    let status = Deployer::new(api.clone(), fast_retry_config())
        .deploy(test_request("dev"))
        .await
        .unwrap();

    assert_eq!(status.state, DeploymentState::Success);
    assert!(api.status_calls() >= 2);
    shutdown.cancel();
}

#[tokio::test]
async fn test_rejected_status_stream_is_fatal() {
    let hub = Arc::new(Hub::new(test_hub_config()));
    let api = Arc::new(FlakyApi::new(hub.clone()).failing_stream_once(Code::Unauthenticated));

    let err = tokio::time::timeout(
        Duration::from_secs(2),
        Deployer::new(api.clone(), fast_retry_config()).deploy(test_request("dev")),
    )
    .await
    .expect("rejection must not be retried")
    .unwrap_err();

    match &err {
        DeployError::Rejected(status) => assert_eq!(status.code(), Code::Unauthenticated),
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(err.exit_code(), ExitCode::NoDeployment);
    assert_eq!(api.status_calls(), 1);
}

#[tokio::test]
async fn test_inactive_triggers_resubmission_with_same_id() {
    let hub = Arc::new(Hub::new(test_hub_config()));
    let api = Arc::new(FlakyApi::new(hub.clone()).forgetting_once());
    let shutdown = spawn_agent(&hub, ScriptedApplier::succeeding());

    let status = Deployer::new(api.clone(), fast_retry_config())
        .deploy(test_request("dev"))
        .await
        .unwrap();

    let submitted = api.submitted_ids();
    assert_eq!(submitted.len(), 2);
    assert_eq!(submitted[0], None);
    assert_eq!(submitted[1], Some(status.request_id));
    assert_eq!(status.state, DeploymentState::Success);
    shutdown.cancel();
}

#[tokio::test]
async fn test_status_callback_sees_every_observed_status() {
    let hub = Arc::new(Hub::new(test_hub_config()));
    let shutdown = spawn_agent(&hub, ScriptedApplier::succeeding());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();

    let status = Deployer::new(LocalDeployApi::new(hub.clone()), fast_retry_config())
        .on_status(Arc::new(move |s: &DeploymentStatus| {
            sink.lock().unwrap().push(s.state);
        }))
        .deploy(test_request("dev"))
        .await
        .unwrap();

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.first(), Some(&DeploymentState::Pending));
    assert_eq!(seen.last(), Some(&status.state));
    assert_eq!(status.state, DeploymentState::Success);
    shutdown.cancel();
}

#[tokio::test]
async fn test_resubmitting_finished_id_returns_terminal_status() {
    let hub = Arc::new(Hub::new(test_hub_config()));
    let shutdown = spawn_agent(&hub, ScriptedApplier::succeeding());
    let deployer = Deployer::new(LocalDeployApi::new(hub.clone()), fast_retry_config());

    let first = deployer.deploy(test_request("dev")).await.unwrap();
    let again = deployer
        .deploy(test_request("dev").with_id(first.request_id))
        .await
        .unwrap();

    assert_eq!(again.request_id, first.request_id);
    assert_eq!(again.state, DeploymentState::Success);
    shutdown.cancel();
}
