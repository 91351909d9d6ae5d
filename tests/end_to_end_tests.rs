//! Client, hub and agent talking gRPC over loopback.


use std::time::Duration;

use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tonic::Code;
use uuid::Uuid;

use deploy_hub::agent::testing::ScriptedApplier;
use deploy_hub::agent::{AgentRunner, ApplyOutcome, DispatchApi, GrpcDispatchApi};
use deploy_hub::client::{DeployApi, DeployError, Deployer, ExitCode, GrpcDeployApi};
use deploy_hub::config::{AgentConfig, RetryPolicy};
use deploy_hub::deployment::{DeploymentState, DeploymentStatus};
use test_harness::{assert_eventually, test_client_config, test_request, TestHub};

fn spawn_agent(
    api: GrpcDispatchApi,
    cluster: &str,
    applier: ScriptedApplier,
) -> CancellationToken {
    let shutdown = CancellationToken::new();
    let config = AgentConfig::new(cluster, format!("{}-agent", cluster))
        .with_reconnect_interval(Duration::from_millis(50));
    let mut runner = AgentRunner::new(api, applier, config);
    let token = shutdown.clone();
    tokio::spawn(async move { runner.run(token).await });
    shutdown
}

/// Test: a deployment travels client → hub → agent and the result travels back
#[tokio::test]
async fn test_deploy_round_trip_over_grpc() {
    let hub = TestHub::start().await;
    let applier = ScriptedApplier::succeeding();
    let agent = spawn_agent(hub.dispatch_api(None).await, "dev", applier.clone());

    let deployer = Deployer::new(hub.deploy_api(None).await, hub.client_config());
    let status = deployer.deploy(test_request("dev")).await.unwrap();

    assert_eq!(status.state, DeploymentState::Success);
    assert_eq!(status.cluster, "dev");
    assert_eq!(applier.applied(), vec![status.request_id]);
    agent.cancel();
}

/// Test: a second agent on the same cluster gets new work while the first one is still applying
#[tokio::test]
async fn test_agents_compete_for_queue_head_over_grpc() {
    let hub = TestHub::start().await;
    let busy = ScriptedApplier::succeeding().with_delay(Duration::from_secs(5));
    let idle = ScriptedApplier::succeeding();

    let first = hub.hub.submit(test_request("dev")).await.unwrap().request_id;
    let busy_agent = spawn_agent(hub.dispatch_api(None).await, "dev", busy.clone());
    assert_eventually(
        || {
            let busy = busy.clone();
            async move { !busy.applied().is_empty() }
        },
        Duration::from_secs(2),
        "Busy agent should start on the first request",
    )
    .await;

    let idle_agent = spawn_agent(hub.dispatch_api(None).await, "dev", idle.clone());
    tokio::time::sleep(Duration::from_millis(100)).await;
    let second = hub.hub.submit(test_request("dev")).await.unwrap().request_id;

    let state = hub.hub.clone();
    assert_eventually(
        || {
            let state = state.clone();
            async move {
                state
                    .last_status(&second)
                    .await
                    .map(|s| s.state == DeploymentState::Success)
                    .unwrap_or(false)
            }
        },
        Duration::from_secs(2),
        "Idle agent should apply the second request",
    )
    .await;
    assert_eq!(busy.applied(), vec![first]);
    assert_eq!(idle.applied(), vec![second]);

    busy_agent.cancel();
    idle_agent.cancel();
}

/// Test: watchers opened before and after completion both see success
#[tokio::test]
async fn test_watchers_before_and_after_completion() {
    let hub = TestHub::start().await;
    let client = hub.deploy_api(None).await;

    let pending = client.deploy(&test_request("dev")).await.unwrap();
    let id = pending.request_id;
    let mut early = client.status(id, "").await.unwrap();
    let first = early.next().await.unwrap().unwrap();
    assert_eq!(first.state, DeploymentState::Pending);

    let dispatch = hub.dispatch_api(None).await;
    let mut work = dispatch.deployments("dev", "agent-1").await.unwrap();
    let request = work.next().await.unwrap().unwrap();
    assert_eq!(request.id, Some(id));

    let ack = dispatch
        .report_status(&DeploymentStatus::for_request(
            &request,
            DeploymentState::Pending,
            "applying",
        ))
        .await
        .unwrap();
    assert!(ack.continue_reporting);
    let ack = dispatch
        .report_status(&DeploymentStatus::for_request(
            &request,
            DeploymentState::Success,
            "applied",
        ))
        .await
        .unwrap();
    assert!(!ack.continue_reporting);

    let mut last = None;
    while let Some(status) = early.next().await {
        last = Some(status.unwrap());
    }
    assert_eq!(last.unwrap().state, DeploymentState::Success);

    let mut late = client.status(id, "").await.unwrap();
    let terminal = late.next().await.unwrap().unwrap();
    assert_eq!(terminal.state, DeploymentState::Success);
    assert!(late.next().await.is_none());
}

/// Test: failure reported by the agent reaches the client's exit code
#[tokio::test]
async fn test_agent_failure_reaches_client() {
    let hub = TestHub::start().await;
    let applier = ScriptedApplier::new(ApplyOutcome::error("kubernetes API unreachable"));
    let agent = spawn_agent(hub.dispatch_api(None).await, "dev", applier);

    let deployer = Deployer::new(hub.deploy_api(None).await, hub.client_config());
    let err = deployer.deploy(test_request("dev")).await.unwrap_err();

    assert_eq!(err.exit_code(), ExitCode::DeploymentError);
    agent.cancel();
}

/// Test: a client waiting on a cluster without agents times out instead of failing
#[tokio::test]
async fn test_wait_on_cluster_without_agent_times_out() {
    let hub = TestHub::start().await;
    let config = hub.client_config().with_timeout(Duration::from_millis(500));
    let deployer = Deployer::new(hub.deploy_api(None).await, config);

    let err = deployer.deploy(test_request("prod")).await.unwrap_err();
    assert!(matches!(err, DeployError::Timeout { id: Some(_) }));
    assert_eq!(err.exit_code(), ExitCode::Timeout);
}

/// Test: agent reconnects and the client resubmits after the hub loses its state
#[tokio::test]
async fn test_recovery_after_hub_reset() {
    let hub = TestHub::start().await;
    let applier = ScriptedApplier::succeeding();

    let deployer = Deployer::new(hub.deploy_api(None).await, hub.client_config());
    let running = tokio::spawn(async move { deployer.deploy(test_request("dev")).await });

    let state = hub.hub.clone();
    assert_eventually(
        || {
            let state = state.clone();
            async move { !state.pending_ids("dev").await.is_empty() }
        },
        Duration::from_secs(2),
        "Deployment should be queued",
    )
    .await;
    let id = hub.hub.pending_ids("dev").await[0];

    hub.hub.reset().await;
    let agent = spawn_agent(hub.dispatch_api(None).await, "dev", applier.clone());

    let status = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("client should recover")
        .unwrap()
        .unwrap();
    assert_eq!(status.request_id, id);
    assert_eq!(status.state, DeploymentState::Success);
    assert_eq!(applier.applied(), vec![id]);
    agent.cancel();
}

// ============================================================================
// Authentication
// ============================================================================

/// Test: calls without a valid token are rejected before touching hub state
#[tokio::test]
async fn test_missing_or_wrong_token_is_rejected() {
    let hub = TestHub::start_with_tokens(&["s3cret"]).await;

    for token in [None, Some("wrong")] {
        let client = hub.deploy_api(token).await;
        let err = client.deploy(&test_request("dev")).await.unwrap_err();
        assert_eq!(err.code(), Code::Unauthenticated);

        let err = client.status(Uuid::new_v4(), "").await.err().unwrap();
        assert_eq!(err.code(), Code::Unauthenticated);

        let dispatch = hub.dispatch_api(token).await;
        let err = dispatch.deployments("dev", "agent-1").await.err().unwrap();
        assert_eq!(err.code(), Code::Unauthenticated);
    }

    assert!(hub.hub.queue_depths().await.is_empty());
}

/// Test: the deployer treats rejection as fatal
#[tokio::test]
async fn test_deployer_does_not_retry_unauthenticated() {
    let hub = TestHub::start_with_tokens(&["s3cret"]).await;
    let deployer = Deployer::new(hub.deploy_api(Some("wrong")).await, hub.client_config());

    let err = tokio::time::timeout(Duration::from_secs(2), deployer.deploy(test_request("dev")))
        .await
        .expect("rejection must not be retried")
        .unwrap_err();
    assert_eq!(err.exit_code(), ExitCode::NoDeployment);
}

/// Test: valid tokens work for both client and agent
#[tokio::test]
async fn test_valid_token_is_accepted() {
    let hub = TestHub::start_with_tokens(&["s3cret", "other"]).await;
    let agent = spawn_agent(
        hub.dispatch_api(Some("other")).await,
        "dev",
        ScriptedApplier::succeeding(),
    );

    let deployer = Deployer::new(hub.deploy_api(Some("s3cret")).await, hub.client_config());
    let status = deployer.deploy(test_request("dev")).await.unwrap();
    assert_eq!(status.state, DeploymentState::Success);
    agent.cancel();
}

// ============================================================================
// Connectivity
// ============================================================================

/// Test: an unreachable hub surfaces as unavailable once retries run out
#[tokio::test]
async fn test_unreachable_hub_is_unavailable() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let config = test_client_config(&format!("http://{}", addr)).with_retry(
        RetryPolicy::default()
            .with_interval(Duration::from_millis(10))
            .with_max_attempts(1),
    );
    let api = GrpcDeployApi::connect(&config).await.unwrap();
    let err = Deployer::new(api, config)
        .deploy(test_request("dev"))
        .await
        .unwrap_err();

    assert_eq!(err.exit_code(), ExitCode::Unavailable);
}
