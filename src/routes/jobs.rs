use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::Json;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::api::{JobStatusResponse, SubmitResponse};
use crate::models::job::{JobStatus, TattooOptions};
use crate::routes::error::ApiError;

/// Split a form value into list entries: repeated fields and comma-separated
/// values are both accepted.
fn push_list(target: &mut Vec<String>, value: &str) {
    target.extend(
        value
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string),
    );
}

/// POST /upload: Submit a body photo and a tattoo design for compositing.
pub async fn upload_images(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let mut body_image: Option<Vec<u8>> = None;
    let mut tattoo_image: Option<Vec<u8>> = None;
    let mut options = TattooOptions::default();
    let mut socket_id: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Malformed multipart body: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "body_image" | "tattoo_image" => {
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("Failed to read {name}: {e}")))?;
                if name == "body_image" {
                    body_image = Some(data.to_vec());
                } else {
                    tattoo_image = Some(data.to_vec());
                }
            }
            "styles" | "colors" | "description" | "socketId" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("Failed to read {name}: {e}")))?;
                match name.as_str() {
                    "styles" => push_list(&mut options.styles, &text),
                    "colors" => push_list(&mut options.colors, &text),
                    "socketId" => {
                        socket_id = Some(text.trim().to_string()).filter(|s| !s.is_empty())
                    }
                    _ => options.description = text.trim().to_string(),
                }
            }
            other => tracing::debug!(field = other, "Ignoring unknown multipart field"),
        }
    }

    let body_image =
        body_image.ok_or_else(|| ApiError::BadRequest("body_image is required".into()))?;
    let tattoo_image =
        tattoo_image.ok_or_else(|| ApiError::BadRequest("tattoo_image is required".into()))?;

    let submission = state
        .submitter
        .submit_for_socket(&body_image, &tattoo_image, options, socket_id)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            job_id: submission.job_id,
            status: submission.status,
            message: "Images uploaded, job queued for processing".to_string(),
            body_image: submission.body,
            tattoo_image: submission.tattoo,
        }),
    ))
}

/// GET /jobs/{job_id}: Current state of a job.
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let job = state
        .jobs
        .get(job_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Job {job_id} not found")))?;

    let output_url = match (&job.output_ref, job.status) {
        (Some(output), JobStatus::Succeeded) => {
            match state.storage.presigned_url(output, state.result_url_ttl).await {
                Ok(url) => Some(url),
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "Could not sign result URL");
                    None
                }
            }
        }
        _ => None,
    };

    Ok(Json(JobStatusResponse::from_job(job, output_url)))
}
