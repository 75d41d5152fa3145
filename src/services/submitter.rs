use garde::Validate;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::job::{
    ErrorKind, InputRefs, Job, JobError, JobStatus, ObjectRef, TattooOptions, Transition,
};
use crate::models::message::JobMessage;
use crate::services::job_store::{JobStore, JobStoreError};
use crate::services::queue::{MessageBroker, QueueError};
use crate::services::storage::{ObjectStore, StorageError};
use crate::services::validation::{inspect_image, ImageInfo, ImageLimits, ValidationError};

/// Key of an uploaded body photo.
pub fn body_key(job_id: Uuid) -> String {
    format!("body_{job_id}")
}

/// Key of an uploaded tattoo design.
pub fn tattoo_key(job_id: Uuid) -> String {
    format!("tattoo_{job_id}")
}

/// Result of a successful submission.
#[derive(Debug, Clone)]
pub struct Submission {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub body: ImageInfo,
    pub tattoo: ImageInfo,
}

/// Accepts image pairs, stores them and hands a job to the worker queue.
pub struct JobSubmitter {
    jobs: Arc<dyn JobStore>,
    storage: Arc<dyn ObjectStore>,
    broker: Arc<dyn MessageBroker>,
    input_bucket: String,
    limits: ImageLimits,
}

impl JobSubmitter {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        storage: Arc<dyn ObjectStore>,
        broker: Arc<dyn MessageBroker>,
        input_bucket: impl Into<String>,
        limits: ImageLimits,
    ) -> Self {
        Self {
            jobs,
            storage,
            broker,
            input_bucket: input_bucket.into(),
            limits,
        }
    }

    /// Validate, upload, record and enqueue one job.
    ///
    /// Invalid input has no side effects. An upload failure publishes
    /// nothing. The job record is written before the message is published,
    /// and a failed publish leaves the job `failed` rather than `pending`.
    pub async fn submit(
        &self,
        body_image: &[u8],
        tattoo_image: &[u8],
        options: TattooOptions,
    ) -> Result<Submission, SubmitError> {
        self.submit_for_socket(body_image, tattoo_image, options, None)
            .await
    }

    /// Like [`submit`](Self::submit), tagging the job message with the
    /// client connection the completion webhook should address.
    pub async fn submit_for_socket(
        &self,
        body_image: &[u8],
        tattoo_image: &[u8],
        options: TattooOptions,
        socket_id: Option<String>,
    ) -> Result<Submission, SubmitError> {
        let body = inspect_image("body_image", body_image, self.limits)?;
        let tattoo = inspect_image("tattoo_image", tattoo_image, self.limits)?;
        options
            .validate()
            .map_err(|report| ValidationError::Options(report.to_string()))?;

        let job_id = Uuid::new_v4();
        let input_refs = InputRefs {
            body: ObjectRef::new(&self.input_bucket, body_key(job_id)),
            tattoo: ObjectRef::new(&self.input_bucket, tattoo_key(job_id)),
        };

        tracing::info!(
            job_id = %job_id,
            body_resolution = %body.resolution(),
            tattoo_resolution = %tattoo.resolution(),
            "Uploading job inputs"
        );
        self.upload_inputs(&input_refs, body_image, &body, tattoo_image, &tattoo)
            .await?;

        let job = Job::new(job_id, input_refs, options);
        if let Err(e) = self.jobs.insert(&job).await {
            tracing::error!(job_id = %job_id, error = %e, "Failed to record job");
            self.remove_inputs(&job.input_refs).await;
            return Err(SubmitError::JobStoreUnavailable(e));
        }

        let message = JobMessage::for_job(&job).with_socket_id(socket_id);
        if let Err(e) = self.broker.publish(&message).await {
            tracing::error!(job_id = %job_id, error = %e, "Failed to enqueue job");
            self.mark_enqueue_failed(job_id, &e).await;
            metrics::counter!("tattoo_jobs_failed_total", "kind" => "enqueue_failed").increment(1);
            return Err(SubmitError::EnqueueFailed { job_id, source: e });
        }

        metrics::counter!("tattoo_jobs_submitted_total").increment(1);
        tracing::info!(job_id = %job_id, queue = %self.broker.queue_name(), "Job enqueued");

        Ok(Submission {
            job_id,
            status: JobStatus::Pending,
            body,
            tattoo,
        })
    }

    async fn upload_inputs(
        &self,
        refs: &InputRefs,
        body_image: &[u8],
        body: &ImageInfo,
        tattoo_image: &[u8],
        tattoo: &ImageInfo,
    ) -> Result<(), SubmitError> {
        self.storage
            .put(&refs.body, body_image, &body.content_type)
            .await
            .map_err(SubmitError::StorageUnavailable)?;

        if let Err(e) = self
            .storage
            .put(&refs.tattoo, tattoo_image, &tattoo.content_type)
            .await
        {
            self.remove_inputs(refs).await;
            return Err(SubmitError::StorageUnavailable(e));
        }
        Ok(())
    }

    /// Best-effort cleanup so aborted submissions leave no orphaned inputs.
    async fn remove_inputs(&self, refs: &InputRefs) {
        for object in [&refs.body, &refs.tattoo] {
            if let Err(e) = self.storage.delete(object).await {
                tracing::warn!(object = %object, error = %e, "Failed to remove orphaned input");
            }
        }
    }

    async fn mark_enqueue_failed(&self, job_id: Uuid, cause: &QueueError) {
        let transition = Transition::Fail {
            error: JobError::new(
                ErrorKind::EnqueueFailed,
                format!("could not publish job to the queue: {cause}"),
            ),
            now: chrono::Utc::now(),
        };
        match self.jobs.transition(job_id, JobStatus::Pending, transition).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                tracing::warn!(job_id = %job_id, "Job left pending state before enqueue failure was recorded");
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to record enqueue failure");
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("Invalid input: {0}")]
    InvalidInput(#[from] ValidationError),

    #[error("Object storage unavailable: {0}")]
    StorageUnavailable(#[source] StorageError),

    #[error("Job store unavailable: {0}")]
    JobStoreUnavailable(#[source] JobStoreError),

    #[error("Failed to enqueue job {job_id}: {source}")]
    EnqueueFailed {
        job_id: Uuid,
        #[source]
        source: QueueError,
    },
}

impl SubmitError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SubmitError::InvalidInput(_) => ErrorKind::InvalidInput,
            SubmitError::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
            SubmitError::JobStoreUnavailable(_) => ErrorKind::JobStoreUnavailable,
            SubmitError::EnqueueFailed { .. } => ErrorKind::EnqueueFailed,
        }
    }
}
