//! HTTP route definitions.

mod accept;
mod health;

use axum::Router;
use axum::routing::get;

use crate::state::AppState;

/// Build the complete router.
///
/// # Route Structure
///
/// - `GET /health` - Health check
/// - `GET /api/verve/accept?id=<int>&endpoint=<url>` - Record an id (and
///   optional callback endpoint) in the current window
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/verve/accept", get(accept::accept))
        .with_state(state)
}
