//! Manual triggers and build lookups.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::routing::get;
use axum::{Json, Router};
use keel_core::{BuildJob, Commit, ResourceId};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::AppState;
use crate::error::ApiError;

const DEFAULT_LIMIT: usize = 20;
const MAX_LIMIT: usize = 200;

/// Routes under `/api/v1/projects`.
pub fn api_router() -> Router<AppState> {
    Router::new().route("/{name}/builds", get(list_builds).post(trigger_build))
}

/// Build pages linked from notifications.
pub fn page_router() -> Router<AppState> {
    Router::new().route("/{project}/builds/{id}", get(get_build))
}

#[derive(Debug, Deserialize)]
struct TriggerRequest {
    sha: String,
    branch: String,
    message: Option<String>,
    author: Option<String>,
}

/// Token from an `Authorization: Bearer <token>` header.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

async fn trigger_build(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(req): Json<TriggerRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if req.sha.trim().is_empty() || req.branch.trim().is_empty() {
        return Err(ApiError::BadRequest("sha and branch are required".to_string()));
    }

    let commit = Commit {
        sha: req.sha,
        author: req.author.unwrap_or_else(|| "manual".to_string()),
        message: req.message.unwrap_or_default(),
        branch: req.branch,
        timestamp: None,
    };
    let handle = state
        .ingestor
        .trigger(&name, bearer_token(&headers), commit)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "status": "queued", "build": handle.id().to_string() })),
    ))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<usize>,
}

async fn list_builds(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<BuildJob>>, ApiError> {
    if state.store.load_project(&name).await?.is_none() {
        return Err(ApiError::NotFound(format!("unknown project: {}", name)));
    }
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let builds = state
        .store
        .load_recent_builds_for_project(&name, limit)
        .await?;
    Ok(Json(builds))
}

async fn get_build(
    State(state): State<AppState>,
    Path((project, id)): Path<(String, String)>,
) -> Result<Json<BuildJob>, ApiError> {
    let not_found = || ApiError::NotFound(format!("no build {} for {}", id, project));
    let build_id: ResourceId = id.parse().map_err(|_| not_found())?;
    match state.store.load_build(build_id).await? {
        Some(build) if build.project == project => Ok(Json(build)),
        _ => Err(not_found()),
    }
}
