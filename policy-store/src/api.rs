use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, put},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, instrument, warn};

use policy_common::{PolicyContent, PolicyError, Subject};

use crate::config::ApiConfig;
use crate::store::{PolicyStore, StoreStats};

/// Control API state
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<PolicyStore>,
    pub started_at: Instant,
}

/// Error returned by control API handlers, rendered as plain text
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn missing_identifier() -> Self {
        Self::new(StatusCode::BAD_REQUEST, "Missing dataset identifier")
    }
}

impl From<PolicyError> for ApiError {
    fn from(err: PolicyError) -> Self {
        let status = match &err {
            PolicyError::NotFound(_) => StatusCode::NOT_FOUND,
            PolicyError::BadRequest(_) | PolicyError::Dropped(_) => StatusCode::BAD_REQUEST,
            PolicyError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            PolicyError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            PolicyError::Internal(_) | PolicyError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let reason = self.status.canonical_reason().unwrap_or("Error");
        (self.status, format!("{}: {}", reason, self.message)).into_response()
    }
}

/// Dataset identifiers response
#[derive(Debug, Serialize, Deserialize)]
pub struct IdentifiersResponse {
    #[serde(rename = "Identifiers")]
    pub identifiers: Vec<Subject>,
}

/// Active policy response
#[derive(Debug, Serialize, Deserialize)]
pub struct PolicyResponse {
    #[serde(rename = "Policy")]
    pub policy: String,
}

/// Policy content accepted by set-policy: a boolean or a richer rule
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PolicyValue {
    Flag(bool),
    Rule(String),
}

impl From<PolicyValue> for PolicyContent {
    fn from(value: PolicyValue) -> Self {
        match value {
            PolicyValue::Flag(allow) => PolicyContent::from(allow),
            PolicyValue::Rule(rule) => PolicyContent::new(rule),
        }
    }
}

/// Set-policy request body
#[derive(Debug, Deserialize)]
pub struct SetPolicyRequest {
    #[serde(alias = "Policy")]
    pub policy: PolicyValue,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub peer: String,
    pub datasets: usize,
    pub uptime_seconds: u64,
}

/// Create the control API router
pub fn create_router(store: Arc<PolicyStore>) -> Router {
    let state = ApiState {
        store,
        started_at: Instant::now(),
    };

    Router::new()
        .route("/dataset/identifiers", get(handle_get_identifiers))
        .route("/dataset/metadata/", get(handle_missing_identifier))
        .route("/dataset/metadata/*id", get(handle_get_metadata))
        .route("/dataset/getpolicy/", get(handle_missing_identifier))
        .route("/dataset/getpolicy/*id", get(handle_get_policy))
        .route("/dataset/setpolicy/", put(handle_missing_identifier))
        .route("/dataset/setpolicy/*id", put(handle_set_policy))
        .route("/health", get(health_check))
        .route("/status", get(handle_status))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the control API server
#[instrument(skip(config, store))]
pub async fn start_control_api(config: ApiConfig, store: Arc<PolicyStore>) -> Result<()> {
    if !config.enabled {
        info!("Control API is disabled");
        return Ok(());
    }

    let app = create_router(store);

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.listen_addr))?;

    info!(addr = %config.listen_addr, "Control API server listening");

    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "Control API server failed");
        return Err(e.into());
    }

    Ok(())
}

#[instrument(skip(state))]
async fn handle_get_identifiers(State(state): State<ApiState>) -> Json<IdentifiersResponse> {
    Json(IdentifiersResponse {
        identifiers: state.store.get_dataset_identifiers(),
    })
}

/// Dataset routes hit without an identifier segment
async fn handle_missing_identifier() -> ApiError {
    ApiError::missing_identifier()
}

#[instrument]
async fn handle_get_metadata(Path(id): Path<String>) -> Result<Json<serde_json::Value>, ApiError> {
    warn!(dataset = %id, "Dataset metadata requested but not implemented");
    Err(PolicyError::NotImplemented("dataset metadata is not implemented".to_string()).into())
}

#[instrument(skip(state))]
async fn handle_get_policy(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<PolicyResponse>, ApiError> {
    if id.trim().is_empty() {
        return Err(ApiError::missing_identifier());
    }

    let content = state.store.get_object_policy(&id)?;
    Ok(Json(PolicyResponse {
        policy: content.as_str().to_string(),
    }))
}

#[instrument(skip(state, body))]
async fn handle_set_policy(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    body: std::result::Result<Json<SetPolicyRequest>, JsonRejection>,
) -> Result<String, ApiError> {
    if id.trim().is_empty() {
        return Err(ApiError::missing_identifier());
    }

    // Unknown datasets are reported before body problems
    state.store.get_object_policy(&id)?;

    let Json(request) = body.map_err(|rejection| {
        warn!(dataset = %id, error = %rejection, "Malformed set-policy body");
        ApiError::new(StatusCode::BAD_REQUEST, rejection.body_text())
    })?;

    match state.store.set_object_policy(&id, request.policy.into()).await {
        Ok(_) => Ok(format!("Successfully set a new policy for {}\n", id)),
        // A failed commit at the node of record is the caller's bad request
        Err(PolicyError::Unavailable(message)) => Err(ApiError::new(StatusCode::BAD_REQUEST, message)),
        Err(e) => Err(e.into()),
    }
}

/// Health check endpoint
async fn health_check(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        peer: state.store.peer().to_string(),
        datasets: state.store.registry().len(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}

async fn handle_status(State(state): State<ApiState>) -> Json<StoreStats> {
    Json(state.store.stats())
}
