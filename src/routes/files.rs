use axum::extract::{Path, Query, State};
use axum::Json;
use std::time::Duration;

use crate::app_state::AppState;
use crate::models::api::{
    DeleteFileResponse, FileUrlQuery, FileUrlResponse, ListFilesQuery, ListFilesResponse,
};
use crate::models::job::ObjectRef;
use crate::routes::error::ApiError;

/// Longest lifetime accepted for a presigned URL (7 days, the S3 maximum).
const MAX_URL_EXPIRY_SECS: u64 = 7 * 24 * 3600;

impl AppState {
    fn check_bucket(&self, bucket: &str) -> Result<(), ApiError> {
        if bucket == self.input_bucket || bucket == self.output_bucket {
            Ok(())
        } else {
            Err(ApiError::BadRequest(format!(
                "Unknown bucket {bucket:?}, expected {:?} or {:?}",
                self.input_bucket, self.output_bucket
            )))
        }
    }
}

/// GET /files?bucket=&prefix=: List stored objects.
pub async fn list_files(
    State(state): State<AppState>,
    Query(query): Query<ListFilesQuery>,
) -> Result<Json<ListFilesResponse>, ApiError> {
    let bucket = query.bucket.unwrap_or_else(|| state.output_bucket.clone());
    state.check_bucket(&bucket)?;

    let files = state.storage.list(&bucket, &query.prefix).await?;
    Ok(Json(ListFilesResponse {
        count: files.len(),
        bucket,
        prefix: query.prefix,
        files,
    }))
}

/// GET /files/{bucket}/{key}?expires=: Presigned download URL.
pub async fn get_file_url(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
    Query(query): Query<FileUrlQuery>,
) -> Result<Json<FileUrlResponse>, ApiError> {
    state.check_bucket(&bucket)?;
    let expires = query.expires.unwrap_or(state.result_url_ttl.as_secs());
    if expires == 0 || expires > MAX_URL_EXPIRY_SECS {
        return Err(ApiError::BadRequest(format!(
            "expires must be between 1 and {MAX_URL_EXPIRY_SECS} seconds"
        )));
    }

    let object = ObjectRef::new(&bucket, &key);
    if !state.storage.exists(&object).await? {
        return Err(ApiError::NotFound(format!("File {object} not found")));
    }
    let url = state
        .storage
        .presigned_url(&object, Duration::from_secs(expires))
        .await?;

    Ok(Json(FileUrlResponse {
        bucket,
        filename: key,
        url,
        expires_in_seconds: expires,
    }))
}

/// DELETE /files/{bucket}/{key}: Remove an object. Deleting twice is fine.
pub async fn delete_file(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Json<DeleteFileResponse>, ApiError> {
    state.check_bucket(&bucket)?;
    let object = ObjectRef::new(&bucket, &key);
    state.storage.delete(&object).await?;
    tracing::info!(object = %object, "File deleted");

    Ok(Json(DeleteFileResponse {
        status: "deleted".to_string(),
        bucket,
        filename: key,
    }))
}
