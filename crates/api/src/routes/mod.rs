//! HTTP routes

pub mod webhooks;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

/// Build the application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/frisbii", post(webhooks::receive_frisbii_webhook))
        .with_state(state)
}

/// Readiness probe: verifies the database is reachable
async fn health(State(state): State<AppState>) -> StatusCode {
    match sqlx::query("SELECT 1").execute(&state.pool).await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            tracing::error!(error = %e, "Health check database probe failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}
