//! Webhook endpoints for Git providers.

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use keel_core::GitProvider;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::AppState;
use crate::error::ApiError;
use crate::ingest::{Ingested, PushRequest};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/github", post(github_webhook))
        .route("/gitlab", post(gitlab_webhook))
}

#[derive(Debug, Default, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Handle GitHub push events.
async fn github_webhook(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let request = PushRequest {
        event: header(&headers, "X-GitHub-Event"),
        signature: header(&headers, "X-Hub-Signature-256"),
        token: query.token,
    };
    receive(state, GitProvider::Github, request, body).await
}

/// Handle GitLab push hooks.
async fn gitlab_webhook(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let request = PushRequest {
        event: header(&headers, "X-Gitlab-Event"),
        signature: None,
        token: header(&headers, "X-Gitlab-Token").or(query.token),
    };
    receive(state, GitProvider::Gitlab, request, body).await
}

async fn receive(
    state: AppState,
    provider: GitProvider,
    request: PushRequest,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let response = match state.ingestor.receive(provider, &request, &body).await? {
        Ingested::Queued { project, builds } => {
            let ids: Vec<String> = builds.iter().map(|b| b.id().to_string()).collect();
            (
                StatusCode::ACCEPTED,
                Json(json!({ "status": "queued", "project": project, "builds": ids })),
            )
        }
        Ingested::Ignored { reason } => (
            StatusCode::OK,
            Json(json!({ "status": "ignored", "reason": reason })),
        ),
    };
    Ok(response)
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}
