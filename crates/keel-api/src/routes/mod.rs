//! API routes.

pub mod builds;
pub mod health;
pub mod webhooks;

use crate::AppState;
use axum::Router;

/// Build the main router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/push", webhooks::router())
        .nest("/api/v1/projects", builds::api_router())
        .merge(builds::page_router())
        .merge(health::router())
        .with_state(state)
}
