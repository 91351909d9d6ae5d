//! Read-only HTTP view of the hub, for operators and health checks.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::deployment::{DeploymentRequest, DeploymentStatus};
use crate::hub::Hub;

#[derive(Clone)]
pub struct ApiState {
    pub hub: Arc<Hub>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    epoch: String,
}

#[derive(Serialize)]
struct ClusterQueueResponse {
    cluster: String,
    pending: usize,
}

#[derive(Serialize)]
struct DeploymentResponse {
    id: String,
    /// Live status, absent once reaped or after a restart.
    status: Option<DeploymentStatus>,
    request: Option<DeploymentRequest>,
    history: Vec<DeploymentStatus>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error(code: StatusCode, message: impl Into<String>) -> Response {
    (
        code,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/healthz", get(health_handler))
        .route("/api/v1/clusters", get(clusters_handler))
        .route("/api/v1/deployments/:id", get(deployment_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

pub async fn run_api(addr: SocketAddr, state: ApiState, shutdown: CancellationToken) {
    tracing::info!(addr = %addr, "Starting HTTP API server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind HTTP API server");
            return;
        }
    };

    let serve = axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await });
    if let Err(e) = serve.await {
        tracing::error!(error = %e, "HTTP API server failed");
    }
}

async fn health_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        epoch: state.hub.epoch().await.to_string(),
    })
}

async fn clusters_handler(State(state): State<ApiState>) -> impl IntoResponse {
    let clusters: Vec<ClusterQueueResponse> = state
        .hub
        .queue_depths()
        .await
        .into_iter()
        .map(|(cluster, pending)| ClusterQueueResponse { cluster, pending })
        .collect();
    Json(clusters)
}

async fn deployment_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Response {
    let Ok(id) = Uuid::parse_str(&id) else {
        return error(StatusCode::BAD_REQUEST, "Invalid deployment ID");
    };

    let status = state.hub.last_status(&id).await;
    let (request, history) = match state.hub.persistence() {
        Some(sink) => {
            let store = sink.store();
            let request = store.request(&id).await;
            let history = store.history(&id).await;
            match (request, history) {
                (Ok(request), Ok(history)) => (request, history),
                (Err(e), _) | (_, Err(e)) => {
                    tracing::error!(
                        deployment_id = %id,
                        error = %e,
                        "Failed to read deployment history"
                    );
                    return error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
                }
            }
        }
        None => (None, Vec::new()),
    };

    if status.is_none() && request.is_none() && history.is_empty() {
        return error(StatusCode::NOT_FOUND, "Deployment not found");
    }

    Json(DeploymentResponse {
        id: id.to_string(),
        status,
        request,
        history,
    })
    .into_response()
}
