//! HTTP handlers.

use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
};
use serde::{Deserialize, Serialize};

use super::error::{ApiError, ApiResult};
use super::state::AppState;
use crate::auth::{BearerToken, WebhookSignature};
use crate::instance::InstanceKey;
use crate::router::{Access, WebhookAck};
use crate::status::InstanceView;
use crate::supervisor::DEFAULT_TAIL_LIMIT;

/// Upper bound for `?limit=` on log reads.
const MAX_TAIL_LIMIT: usize = 5000;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub instances: usize,
    pub free_ports: usize,
}

/// Health check endpoint.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let lifecycle = state.router.lifecycle();
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        instances: lifecycle.registry().len(),
        free_ports: lifecycle.pool().free_count(),
    })
}

fn parse_key(repository: &str, git_ref: &str) -> ApiResult<InstanceKey> {
    Ok(InstanceKey::new(repository, git_ref)?)
}

/// List all instances.
pub async fn list_instances(
    State(state): State<AppState>,
    token: BearerToken,
) -> ApiResult<Json<Vec<InstanceView>>> {
    state.router.authorize(token.as_deref(), Access::Read)?;
    Ok(Json(state.status.list()))
}

/// Get one instance.
pub async fn get_instance(
    State(state): State<AppState>,
    token: BearerToken,
    Path((repository, git_ref)): Path<(String, String)>,
) -> ApiResult<Json<InstanceView>> {
    state.router.authorize(token.as_deref(), Access::Read)?;
    let key = parse_key(&repository, &git_ref)?;
    Ok(Json(state.status.get(&key)?))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct LogsResponse {
    pub key: String,
    pub lines: Vec<String>,
}

/// Tail of an instance's log file.
pub async fn get_logs(
    State(state): State<AppState>,
    token: BearerToken,
    Path((repository, git_ref)): Path<(String, String)>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<LogsResponse>> {
    state.router.authorize(token.as_deref(), Access::Read)?;
    let key = parse_key(&repository, &git_ref)?;

    let limit = query.limit.unwrap_or(DEFAULT_TAIL_LIMIT);
    if limit == 0 || limit > MAX_TAIL_LIMIT {
        return Err(ApiError::bad_request(format!(
            "limit must be between 1 and {}",
            MAX_TAIL_LIMIT
        )));
    }

    let lines = state.status.logs(&key, limit).await?;
    Ok(Json(LogsResponse {
        key: key.to_string(),
        lines,
    }))
}

/// Start an instance.
pub async fn start_instance(
    State(state): State<AppState>,
    token: BearerToken,
    Path((repository, git_ref)): Path<(String, String)>,
) -> ApiResult<Json<InstanceView>> {
    state.router.authorize(token.as_deref(), Access::Manage)?;
    let key = parse_key(&repository, &git_ref)?;
    let instance = state.router.start(token.as_deref(), &key).await?;
    Ok(Json(instance.into()))
}

/// Stop an instance.
pub async fn stop_instance(
    State(state): State<AppState>,
    token: BearerToken,
    Path((repository, git_ref)): Path<(String, String)>,
) -> ApiResult<Json<InstanceView>> {
    state.router.authorize(token.as_deref(), Access::Manage)?;
    let key = parse_key(&repository, &git_ref)?;
    let instance = state.router.stop(token.as_deref(), &key).await?;
    Ok(Json(instance.into()))
}

/// Restart an instance.
pub async fn restart_instance(
    State(state): State<AppState>,
    token: BearerToken,
    Path((repository, git_ref)): Path<(String, String)>,
) -> ApiResult<Json<InstanceView>> {
    state.router.authorize(token.as_deref(), Access::Manage)?;
    let key = parse_key(&repository, &git_ref)?;
    let instance = state.router.restart(token.as_deref(), &key).await?;
    Ok(Json(instance.into()))
}

/// Stop and remove an instance.
pub async fn delete_instance(
    State(state): State<AppState>,
    token: BearerToken,
    Path((repository, git_ref)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    state.router.authorize(token.as_deref(), Access::Manage)?;
    let key = parse_key(&repository, &git_ref)?;
    state.router.remove(token.as_deref(), &key).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Repository webhook.
pub async fn git_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<WebhookAck>)> {
    let signature = WebhookSignature {
        hub_signature: header_string(&headers, "x-hub-signature-256"),
        token: header_string(&headers, "x-gitlab-token"),
    };

    let ack = state.router.handle_webhook(&signature, &body)?;
    Ok((StatusCode::ACCEPTED, Json(ack)))
}
