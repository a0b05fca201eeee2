//! Ingest endpoint.

use axum::extract::{Query, State};
use serde::Deserialize;
use tally_core::WindowStore;

use crate::state::AppState;

/// Query parameters for `GET /api/verve/accept`.
#[derive(Debug, Deserialize)]
pub struct AcceptParams {
    /// Identifier to count. Non-integers are rejected by the extractor.
    pub id: i64,

    /// Optional callback URL, notified with the count after the flush.
    pub endpoint: Option<String>,
}

/// Record `id` (and `endpoint`, if non-empty) in the current window.
///
/// Always answers 200. The body is `ok` when the writes succeeded and
/// `failed` when the store returned an error.
pub async fn accept(
    State(state): State<AppState>,
    Query(params): Query<AcceptParams>,
) -> &'static str {
    match record(&state, &params).await {
        Ok(()) => {
            metrics::counter!("ingest_accepted_total").increment(1);
            "ok"
        }
        Err(e) => {
            metrics::counter!("ingest_failed_total").increment(1);
            tracing::error!(id = params.id, error = %e, "failed to record id");
            "failed"
        }
    }
}

async fn record(state: &AppState, params: &AcceptParams) -> tally_core::Result<()> {
    state.store.add_identifier(params.id).await?;

    if let Some(endpoint) = params.endpoint.as_deref().filter(|e| !e.is_empty()) {
        state.store.add_endpoint(endpoint).await?;
    }

    Ok(())
}
