//! Health check endpoint.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.scheduler.snapshot();
    Json(json!({
        "status": "ok",
        "queued": snapshot.queued,
        "running": snapshot.running,
    }))
}
