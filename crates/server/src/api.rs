//! HTTP API for agent reports, connectivity checks and Prometheus metrics

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use server_lib::{
    AgentMetrics, AgentStore, CacheJanitor, ConnectivityChecker, StoreError, StructuredLogger,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn AgentStore>,
    pub janitor: Arc<CacheJanitor>,
    pub checker: Arc<ConnectivityChecker>,
    pub metrics: AgentMetrics,
    pub logger: StructuredLogger,
}

impl AppState {
    pub fn new(
        store: Arc<dyn AgentStore>,
        janitor: Arc<CacheJanitor>,
        metrics: AgentMetrics,
        logger: StructuredLogger,
    ) -> Self {
        let checker = Arc::new(ConnectivityChecker::new(
            store.clone(),
            janitor.clone(),
            logger.clone(),
        ));
        Self {
            store,
            janitor,
            checker,
            metrics,
            logger,
        }
    }
}

/// Store failure rendered as a plain-text HTTP error
pub struct ApiError(StoreError);

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            StoreError::InvalidRecord(_) => StatusCode::BAD_REQUEST,
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            StoreError::MembershipUnavailable(_) | StoreError::StartupFailure(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self.0, "Request failed");
        } else {
            warn!(status = status.as_u16(), error = %self.0, "Request rejected");
        }
        (status, self.0.to_string()).into_response()
    }
}

/// Accept a keepalive report for the agent named in the path
async fn accept_report(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let record = state.store.accept(&name, &body).await?;
    state.logger.log_report_accepted(&name, &record);
    Ok(Json(record))
}

async fn get_agent(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.janitor.purge().await?;
    let record = state.store.get(&name).await?;
    Ok(Json(record))
}

async fn list_agents(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    state.janitor.purge().await?;
    let records: BTreeMap<_, _> = state.store.list().await?.into_iter().collect();
    Ok(Json(records))
}

/// 200 when every expected agent reports in time, 400 with the offenders otherwise
async fn connectivity_check(State(state): State<Arc<AppState>>) -> Response {
    match state.checker.check().await {
        Ok(report) if report.is_clean() => (StatusCode::OK, Json(report)).into_response(),
        Ok(report) => (StatusCode::BAD_REQUEST, Json(report)).into_response(),
        Err(e) => {
            let message = format!("Error occurred while checking the agents. Details: {e}");
            error!(error = %e, "Connectivity check failed");
            (StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
        }
    }
}

async fn ping() -> StatusCode {
    StatusCode::OK
}

/// Prometheus metrics endpoint
async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let encoder = TextEncoder::new();
    let metric_families = state.metrics.registry().gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        StatusCode::OK,
        [("content-type", encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/agents/", get(list_agents))
        .route("/api/v1/agents/:name", get(get_agent).post(accept_report))
        .route("/api/v1/connectivity_check", get(connectivity_check))
        .route("/api/v1/ping", get(ping))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve the API until `shutdown` fires
pub async fn serve(
    listen_addr: String,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let app = create_router(state);

    info!(addr = %listen_addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}
