use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::job::{
    ErrorKind, InputRefs, Job, JobError, JobStatus, ObjectRef, TattooOptions, Transition,
};
use crate::services::job_store::{JobStore, JobStoreError};

const JOB_COLUMNS: &str = "id, status, body_ref, tattoo_ref, options, attempt_count, output_ref, \
                           error_kind, error, lease_expires_at, created_at, updated_at";

/// PostgreSQL-backed [`JobStore`] shared by the API and worker processes.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn corrupt(id: Uuid, reason: impl ToString) -> JobStoreError {
    JobStoreError::Corrupt {
        id,
        reason: reason.to_string(),
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, JobStoreError> {
    let id: Uuid = row.try_get("id")?;

    let status_str: String = row.try_get("status")?;
    let status: JobStatus = status_str.parse().map_err(|e| corrupt(id, e))?;

    let body_ref: String = row.try_get("body_ref")?;
    let tattoo_ref: String = row.try_get("tattoo_ref")?;
    let output_ref: Option<String> = row.try_get("output_ref")?;
    let Json(options): Json<TattooOptions> = row.try_get("options")?;

    let error_kind: Option<String> = row.try_get("error_kind")?;
    let error_message: Option<String> = row.try_get("error")?;
    let error = match error_kind {
        Some(kind) => {
            let kind: ErrorKind = kind.parse().map_err(|e| corrupt(id, e))?;
            Some(JobError::new(kind, error_message.unwrap_or_default()))
        }
        None => None,
    };

    Ok(Job {
        id,
        status,
        input_refs: InputRefs {
            body: body_ref.parse().map_err(|e| corrupt(id, e))?,
            tattoo: tattoo_ref.parse().map_err(|e| corrupt(id, e))?,
        },
        options,
        attempt_count: row.try_get("attempt_count")?,
        output_ref: output_ref
            .map(|r| r.parse::<ObjectRef>())
            .transpose()
            .map_err(|e| corrupt(id, e))?,
        error,
        lease_expires_at: row.try_get("lease_expires_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, job: &Job) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO tattoo_jobs (id, status, body_ref, tattoo_ref, options, attempt_count,
                                     created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(job.id)
        .bind(job.status.to_string())
        .bind(job.input_refs.body.to_string())
        .bind(job.input_refs.tattoo.to_string())
        .bind(Json(job.options.clone()))
        .bind(job.attempt_count)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::Duplicate(job.id));
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM tattoo_jobs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn transition(
        &self,
        id: Uuid,
        expected: JobStatus,
        transition: Transition,
    ) -> Result<Option<Job>, JobStoreError> {
        if !transition.allows_from(expected) {
            return Ok(None);
        }

        let row = match &transition {
            Transition::Claim {
                now,
                lease_until,
                max_attempts,
            } => {
                sqlx::query(&format!(
                    r#"
                    UPDATE tattoo_jobs
                    SET status = 'processing',
                        attempt_count = attempt_count + 1,
                        lease_expires_at = $3,
                        updated_at = $2
                    WHERE id = $1
                      AND status = $4
                      AND attempt_count < $5
                      AND (status <> 'processing'
                           OR lease_expires_at IS NULL
                           OR lease_expires_at <= $2)
                    RETURNING {JOB_COLUMNS}
                    "#
                ))
                .bind(id)
                .bind(*now)
                .bind(*lease_until)
                .bind(expected.to_string())
                .bind(*max_attempts)
                .fetch_optional(&self.pool)
                .await?
            }
            Transition::Succeed { output_ref, now } => {
                sqlx::query(&format!(
                    r#"
                    UPDATE tattoo_jobs
                    SET status = 'succeeded',
                        output_ref = $3,
                        lease_expires_at = NULL,
                        updated_at = $2
                    WHERE id = $1 AND status = $4
                    RETURNING {JOB_COLUMNS}
                    "#
                ))
                .bind(id)
                .bind(*now)
                .bind(output_ref.to_string())
                .bind(expected.to_string())
                .fetch_optional(&self.pool)
                .await?
            }
            Transition::Release { now } => {
                sqlx::query(&format!(
                    r#"
                    UPDATE tattoo_jobs
                    SET status = 'pending',
                        lease_expires_at = NULL,
                        updated_at = $2
                    WHERE id = $1 AND status = $3
                    RETURNING {JOB_COLUMNS}
                    "#
                ))
                .bind(id)
                .bind(*now)
                .bind(expected.to_string())
                .fetch_optional(&self.pool)
                .await?
            }
            Transition::Fail { error, now } => {
                sqlx::query(&format!(
                    r#"
                    UPDATE tattoo_jobs
                    SET status = 'failed',
                        error_kind = $3,
                        error = $4,
                        lease_expires_at = NULL,
                        updated_at = $2
                    WHERE id = $1 AND status = $5
                    RETURNING {JOB_COLUMNS}
                    "#
                ))
                .bind(id)
                .bind(*now)
                .bind(error.kind.to_string())
                .bind(&error.message)
                .bind(expected.to_string())
                .fetch_optional(&self.pool)
                .await?
            }
        };

        row.as_ref().map(job_from_row).transpose()
    }

    async fn ping(&self) -> Result<(), JobStoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
