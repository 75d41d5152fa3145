use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::{Job, JobError, JobStatus, ObjectRef};
use crate::services::validation::ImageInfo;

/// Response after submitting a body/tattoo pair.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub message: String,
    pub body_image: ImageInfo,
    pub tattoo_image: ImageInfo,
}

/// Response for querying job status.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub attempt_count: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_ref: Option<ObjectRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobStatusResponse {
    pub fn from_job(job: Job, output_url: Option<String>) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            attempt_count: job.attempt_count,
            output_ref: job.output_ref,
            output_url,
            error: job.error,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

/// Query string for `GET /files`.
#[derive(Debug, Deserialize)]
pub struct ListFilesQuery {
    pub bucket: Option<String>,
    #[serde(default)]
    pub prefix: String,
}

#[derive(Debug, Serialize)]
pub struct ListFilesResponse {
    pub bucket: String,
    pub prefix: String,
    pub count: usize,
    pub files: Vec<String>,
}

/// Query string for `GET /files/{bucket}/{key}`.
#[derive(Debug, Deserialize)]
pub struct FileUrlQuery {
    pub expires: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct FileUrlResponse {
    pub bucket: String,
    pub filename: String,
    pub url: String,
    pub expires_in_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct DeleteFileResponse {
    pub status: String,
    pub bucket: String,
    pub filename: String,
}

#[derive(Debug, Serialize)]
pub struct PurgeResponse {
    pub status: String,
    pub queue_name: String,
    pub removed: u64,
}
