pub mod error;
pub mod files;
pub mod health;
pub mod jobs;
pub mod metrics;
pub mod queue;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;

use crate::app_state::AppState;

/// JSON API routes. The metrics endpoint is mounted separately because it
/// carries its own state.
pub fn api_router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route(
            "/upload",
            post(jobs::upload_images).layer(DefaultBodyLimit::max(max_upload_bytes)),
        )
        .route("/jobs/{job_id}", get(jobs::get_job_status))
        .route("/queue/status", get(queue::queue_status))
        .route("/queue/purge", post(queue::purge_queue))
        .route("/files", get(files::list_files))
        .route(
            "/files/{bucket}/{key}",
            get(files::get_file_url).delete(files::delete_file),
        )
        .with_state(state)
}
