use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, instrument, warn};

use policy_common::{DataUser, Node, Permission, Scope, Subject};

use crate::authority::{AuthorityStats, CoordinatingAuthority};
use crate::config::ApiConfig;

#[derive(Clone)]
pub struct ApiState {
    pub authority: Arc<CoordinatingAuthority>,
    pub started_at: Instant,
}

/// Plain-text error of the coordinator API
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let reason = self.status.canonical_reason().unwrap_or("Error");
        (self.status, format!("{}: {}", reason, self.message)).into_response()
    }
}

/// Recipients of a grant or revocation
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetRequest {
    #[default]
    All,
    StorageNodes(Vec<String>),
    DataUsers(Vec<String>),
}

impl TargetRequest {
    fn into_scope(self) -> Result<Scope, ApiError> {
        let scope = match self {
            TargetRequest::All => Scope::All,
            TargetRequest::StorageNodes(nodes) => Scope::storage_nodes(nodes.into_iter().map(Node::new)),
            TargetRequest::DataUsers(users) => Scope::data_users(users.into_iter().map(DataUser::new)),
        };
        if scope.is_empty() {
            return Err(ApiError::bad_request("Recipient set cannot be empty"));
        }
        Ok(scope)
    }
}

#[derive(Debug, Deserialize)]
pub struct DirectiveRequest {
    pub subject: String,
    /// Defaults to the network's default permission
    pub permission: Option<String>,
    #[serde(default)]
    pub scope: TargetRequest,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DirectiveAccepted {
    pub subject: Subject,
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct SubjectQuery {
    pub subject: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StorageNodesResponse {
    pub subject: Subject,
    pub storage_nodes: Vec<Node>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DataUsersResponse {
    pub subject: Subject,
    pub data_users: Vec<DataUser>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub peer: String,
    pub pending_queries: usize,
    pub uptime_seconds: u64,
}

/// Create the coordinator API router
pub fn create_router(authority: Arc<CoordinatingAuthority>) -> Router {
    let state = ApiState {
        authority,
        started_at: Instant::now(),
    };

    Router::new()
        .route("/permissions/grant", post(handle_grant))
        .route("/permissions/revoke", post(handle_revoke))
        .route("/permissions/storage-nodes", get(handle_storage_nodes))
        .route("/permissions/data-users", get(handle_data_users))
        .route("/health", get(health_check))
        .route("/status", get(handle_status))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[instrument(skip(config, authority))]
pub async fn start_api(config: ApiConfig, authority: Arc<CoordinatingAuthority>) -> Result<()> {
    if !config.enabled {
        info!("Coordinator API is disabled");
        return Ok(());
    }

    let app = create_router(authority);

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.listen_addr))?;

    info!(addr = %config.listen_addr, "Coordinator API server listening");

    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "Coordinator API server failed");
        return Err(e.into());
    }

    Ok(())
}

fn parse_directive(
    body: std::result::Result<Json<DirectiveRequest>, JsonRejection>,
) -> Result<(Subject, Option<Permission>, Scope), ApiError> {
    let Json(request) = body.map_err(|rejection| {
        warn!(error = %rejection, "Malformed directive body");
        ApiError::bad_request(rejection.body_text())
    })?;

    let subject = request.subject.trim();
    if subject.is_empty() {
        return Err(ApiError::bad_request("Missing subject"));
    }

    let permission = request
        .permission
        .filter(|permission| !permission.trim().is_empty())
        .map(Permission::new);
    Ok((Subject::new(subject), permission, request.scope.into_scope()?))
}

#[instrument(skip(state, body))]
async fn handle_grant(
    State(state): State<ApiState>,
    body: std::result::Result<Json<DirectiveRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<DirectiveAccepted>), ApiError> {
    let (subject, permission, scope) = parse_directive(body)?;
    state
        .authority
        .grant(subject.clone(), permission.unwrap_or_default(), scope);

    Ok((
        StatusCode::ACCEPTED,
        Json(DirectiveAccepted {
            subject,
            status: "published".to_string(),
        }),
    ))
}

#[instrument(skip(state, body))]
async fn handle_revoke(
    State(state): State<ApiState>,
    body: std::result::Result<Json<DirectiveRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<DirectiveAccepted>), ApiError> {
    let (subject, _, scope) = parse_directive(body)?;
    state.authority.revoke(subject.clone(), scope);

    Ok((
        StatusCode::ACCEPTED,
        Json(DirectiveAccepted {
            subject,
            status: "published".to_string(),
        }),
    ))
}

fn query_subject(query: &SubjectQuery) -> Result<Subject, ApiError> {
    let subject = query.subject.trim();
    if subject.is_empty() {
        return Err(ApiError::bad_request("Missing subject"));
    }
    Ok(Subject::new(subject))
}

#[instrument(skip(state))]
async fn handle_storage_nodes(
    State(state): State<ApiState>,
    Query(query): Query<SubjectQuery>,
) -> Result<Json<StorageNodesResponse>, ApiError> {
    let subject = query_subject(&query)?;
    let storage_nodes = state.authority.get_permitted_storage_nodes(subject.clone()).await;
    Ok(Json(StorageNodesResponse {
        subject,
        storage_nodes,
    }))
}

#[instrument(skip(state))]
async fn handle_data_users(
    State(state): State<ApiState>,
    Query(query): Query<SubjectQuery>,
) -> Result<Json<DataUsersResponse>, ApiError> {
    let subject = query_subject(&query)?;
    let data_users = state.authority.get_permitted_data_users(subject.clone()).await;
    Ok(Json(DataUsersResponse { subject, data_users }))
}

async fn health_check(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        peer: state.authority.peer().to_string(),
        pending_queries: state.authority.pending_queries(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}

async fn handle_status(State(state): State<ApiState>) -> Json<AuthorityStats> {
    Json(state.authority.stats())
}
