use axum::extract::State;
use axum::Json;

use crate::app_state::AppState;
use crate::models::api::PurgeResponse;
use crate::routes::error::ApiError;
use crate::services::monitor::QueueStatus;

/// GET /queue/status: Read-only queue snapshot.
pub async fn queue_status(State(state): State<AppState>) -> Result<Json<QueueStatus>, ApiError> {
    Ok(Json(state.monitor.status().await?))
}

/// POST /queue/purge: Drop every message not held by a worker.
pub async fn purge_queue(State(state): State<AppState>) -> Result<Json<PurgeResponse>, ApiError> {
    let removed = state.monitor.purge().await?;
    Ok(Json(PurgeResponse {
        status: "purged".to_string(),
        queue_name: state.queue.queue_name().to_string(),
        removed,
    }))
}
