use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use strum::Display;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::models::job::{ErrorKind, Job, JobError, JobStatus, ObjectRef, Transition};
use crate::services::ai::AiProvider;
use crate::services::job_store::JobStore;
use crate::services::notify::WebhookNotifier;
use crate::services::queue::{Delivery, MessageBroker, QueueError};
use crate::services::retry::RetryPolicy;
use crate::services::storage::{ObjectStore, StorageError};
use crate::services::validation::{ensure_png, inspect_image, ImageLimits};

/// Upper bound on the wait between attempts to settle a delivery.
const MAX_SETTLE_BACKOFF: Duration = Duration::from_secs(5);

const RESULT_CONTENT_TYPE: &str = "image/png";

/// Key under which the composite for `job_id` is stored.
pub fn result_key(job_id: Uuid) -> String {
    format!("result_{job_id}.png")
}

/// Steps of processing one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Received,
    Validating,
    Downloading,
    InvokingAi,
    UploadingResult,
    Acking,
}

/// How a delivery was settled.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Result stored, job `succeeded`, message acked.
    Succeeded { output_ref: ObjectRef },
    /// Job was already terminal; message acked without doing any work.
    AlreadyFinished(JobStatus),
    /// Job returned to `pending`, message nacked for redelivery after `delay`.
    RetryScheduled { attempt: u32, delay: Duration },
    /// Job terminally `failed`, message acked.
    Failed(ErrorKind),
    /// Message nacked without touching the job (another worker holds it, or
    /// the job store could not be written).
    Deferred(Duration),
    /// Another worker took the job over while this one was working; message
    /// acked.
    Superseded,
    /// Message can never be processed and was moved to the dead-letter list.
    DeadLettered(ErrorKind),
}

/// Broker call that settles a delivery.
#[derive(Debug, Clone, Copy)]
enum Settle<'a> {
    Ack,
    Nack(Duration),
    DeadLetter(&'a str),
}

#[derive(Debug)]
enum Class {
    Retryable,
    Terminal,
}

#[derive(Debug)]
struct Failure {
    class: Class,
    stage: Stage,
    error: JobError,
}

impl Failure {
    fn retryable(stage: Stage, kind: ErrorKind, cause: impl std::fmt::Display) -> Self {
        Self {
            class: Class::Retryable,
            stage,
            error: JobError::new(kind, cause.to_string()),
        }
    }

    fn terminal(stage: Stage, kind: ErrorKind, cause: impl std::fmt::Display) -> Self {
        Self {
            class: Class::Terminal,
            stage,
            error: JobError::new(kind, cause.to_string()),
        }
    }
}

/// Tunables of a worker instance.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub output_bucket: String,
    /// Deliveries processed at the same time.
    pub concurrency: usize,
    /// How long a claim on a `processing` job is honoured.
    pub lease: Duration,
    /// Sleep between polls of an empty queue, and the retry delay for
    /// deferred deliveries.
    pub poll_interval: Duration,
    pub result_url_ttl: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            output_bucket: "output-images".to_string(),
            concurrency: 4,
            lease: Duration::from_secs(300),
            poll_interval: Duration::from_secs(1),
            result_url_ttl: Duration::from_secs(3600),
        }
    }
}

/// Consumes job messages and drives each job to a terminal state.
pub struct JobWorker {
    jobs: Arc<dyn JobStore>,
    storage: Arc<dyn ObjectStore>,
    ai: Arc<dyn AiProvider>,
    broker: Arc<dyn MessageBroker>,
    retry: RetryPolicy,
    settings: WorkerSettings,
    notifier: Option<WebhookNotifier>,
}

impl JobWorker {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        storage: Arc<dyn ObjectStore>,
        ai: Arc<dyn AiProvider>,
        broker: Arc<dyn MessageBroker>,
        retry: RetryPolicy,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            jobs,
            storage,
            ai,
            broker,
            retry,
            settings,
            notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: WebhookNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn output_ref(&self, job_id: Uuid) -> ObjectRef {
        ObjectRef::new(&self.settings.output_bucket, result_key(job_id))
    }

    fn max_attempts(&self) -> i32 {
        i32::try_from(self.retry.max_attempts).unwrap_or(i32::MAX)
    }

    /// Consume until `shutdown` resolves, then wait for in-flight jobs.
    pub async fn run<F>(self: Arc<Self>, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        let concurrency = self.settings.concurrency.max(1);
        let permits = Arc::new(Semaphore::new(concurrency));
        tokio::pin!(shutdown);

        tracing::info!(
            queue = %self.broker.queue_name(),
            concurrency,
            max_attempts = self.retry.max_attempts,
            "Worker consume loop started"
        );

        loop {
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.broker.receive().await {
                Ok(Some(delivery)) => {
                    let worker = self.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        match worker.handle(delivery).await {
                            Ok(outcome) => tracing::debug!(?outcome, "Delivery settled"),
                            Err(e) => tracing::error!(
                                error = %e,
                                "Giving up on settling delivery, it returns to the queue when this consumer deregisters"
                            ),
                        }
                    });
                    continue;
                }
                Ok(None) => tracing::trace!("No jobs available, sleeping"),
                Err(e) => tracing::error!(error = %e, "Failed to receive from queue"),
            }

            drop(permit);
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }

        tracing::info!("Shutdown requested, waiting for in-flight jobs");
        let _ = permits.acquire_many(concurrency as u32).await;
        tracing::info!("Worker consume loop stopped");
    }

    /// Process one delivery and settle it with the broker.
    pub async fn handle(&self, delivery: Delivery) -> Result<Outcome, WorkerError> {
        // ── RECEIVED ─────────────────────────────────────────────────────
        let message = match delivery.decode() {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "Undecodable job message");
                let reason = format!("undecodable message: {e}");
                self.settle(&delivery, Settle::DeadLetter(&reason)).await?;
                return Ok(Outcome::DeadLettered(ErrorKind::InvalidInput));
            }
        };
        let job_id = message.job_id;
        tracing::debug!(job_id = %job_id, stage = %Stage::Received, "Delivery received");

        let job = match self.jobs.get(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::warn!(job_id = %job_id, "Message references unknown job");
                let reason = format!("unknown job {job_id}");
                self.settle(&delivery, Settle::DeadLetter(&reason)).await?;
                return Ok(Outcome::DeadLettered(ErrorKind::UnknownJob));
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Job store unavailable");
                return self.defer(&delivery, self.settings.poll_interval).await;
            }
        };

        // ── Idempotency guard ────────────────────────────────────────────
        let now = Utc::now();
        if job.status.is_terminal() {
            tracing::info!(
                job_id = %job_id,
                status = %job.status,
                "Job already finished, acknowledging duplicate delivery"
            );
            self.settle(&delivery, Settle::Ack).await?;
            return Ok(Outcome::AlreadyFinished(job.status));
        }
        if job.lease_is_live(now) {
            let remaining = job
                .lease_expires_at
                .and_then(|until| (until - now).to_std().ok())
                .unwrap_or_default()
                .max(self.settings.poll_interval);
            tracing::info!(
                job_id = %job_id,
                retry_in_ms = remaining.as_millis() as u64,
                "Job is being processed by another worker, deferring"
            );
            return self.defer(&delivery, remaining).await;
        }
        if job.attempt_count >= self.max_attempts() {
            let error = JobError::new(
                ErrorKind::AttemptsExhausted,
                format!("no attempts left ({} of {})", job.attempt_count, self.max_attempts()),
            );
            return self.finish_failed(&delivery, job_id, job.status, error).await;
        }

        // ── Claim ────────────────────────────────────────────────────────
        let claim = Transition::Claim {
            now,
            lease_until: now
                + chrono::Duration::from_std(self.settings.lease)
                    .unwrap_or(chrono::Duration::zero()),
            max_attempts: self.max_attempts(),
        };
        let job = match self.jobs.transition(job_id, job.status, claim).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::info!(job_id = %job_id, "Lost claim race, deferring");
                return self.defer(&delivery, self.settings.poll_interval).await;
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to claim job");
                return self.defer(&delivery, self.settings.poll_interval).await;
            }
        };

        tracing::info!(
            job_id = %job_id,
            attempt = job.attempt_count,
            max_attempts = self.retry.max_attempts,
            "Processing tattoo job"
        );

        let started = Instant::now();
        match self.execute(&job).await {
            Ok(output_ref) => {
                let socket_id = message.socket_id.as_deref();
                self.commit(&delivery, &job, output_ref, started, socket_id)
                    .await
            }
            Err(failure) => self.settle_failure(&delivery, &job, failure).await,
        }
    }

    async fn execute(&self, job: &Job) -> Result<ObjectRef, Failure> {
        let output_ref = self.output_ref(job.id);

        // ── VALIDATING ───────────────────────────────────────────────────
        // A previous attempt may have stored the result and then failed to
        // record it.
        match self.storage.exists(&output_ref).await {
            Ok(true) => {
                tracing::info!(
                    job_id = %job.id,
                    output = %output_ref,
                    "Result already stored by an earlier attempt"
                );
                return Ok(output_ref);
            }
            Ok(false) => {}
            Err(e) => {
                return Err(Failure::retryable(
                    Stage::Validating,
                    ErrorKind::StorageUnavailable,
                    e,
                ))
            }
        }

        // ── DOWNLOADING ──────────────────────────────────────────────────
        tracing::debug!(job_id = %job.id, stage = %Stage::Downloading, "Downloading inputs");
        let body = self.download(&job.input_refs.body).await?;
        let tattoo = self.download(&job.input_refs.tattoo).await?;

        // ── INVOKING_AI ──────────────────────────────────────────────────
        tracing::debug!(job_id = %job.id, stage = %Stage::InvokingAi, "Calling AI provider");
        let ai_started = Instant::now();
        let result = self
            .ai
            .apply_tattoo(&body, &tattoo, &job.options)
            .await
            .map_err(|e| {
                if e.is_retryable() {
                    Failure::retryable(Stage::InvokingAi, ErrorKind::AiUnavailable, e)
                } else {
                    Failure::terminal(Stage::InvokingAi, ErrorKind::AiRejected, e)
                }
            })?;
        let info = inspect_image(
            "result",
            &result,
            ImageLimits {
                max_bytes: usize::MAX,
            },
        )
        .map_err(|e| Failure::terminal(Stage::InvokingAi, ErrorKind::AiRejected, e))?;

        tracing::info!(
            job_id = %job.id,
            ai_duration_ms = ai_started.elapsed().as_millis() as u64,
            resolution = %info.resolution(),
            format = %info.format,
            "AI provider returned composite"
        );

        // Results are always stored as PNG under a fixed key.
        let result = ensure_png("result", result)
            .map_err(|e| Failure::terminal(Stage::InvokingAi, ErrorKind::AiRejected, e))?;

        // ── UPLOADING_RESULT ─────────────────────────────────────────────
        self.storage
            .put(&output_ref, &result, RESULT_CONTENT_TYPE)
            .await
            .map_err(|e| {
                Failure::retryable(Stage::UploadingResult, ErrorKind::StorageUnavailable, e)
            })?;

        Ok(output_ref)
    }

    async fn download(&self, object: &ObjectRef) -> Result<Vec<u8>, Failure> {
        self.storage.get(object).await.map_err(|e| match e {
            StorageError::NotFound(_) => Failure::terminal(
                Stage::Downloading,
                ErrorKind::MissingInput,
                format!("input {object} not found"),
            ),
            other => Failure::retryable(
                Stage::Downloading,
                ErrorKind::StorageUnavailable,
                format!("failed to fetch {object}: {other}"),
            ),
        })
    }

    // ── ACKING ───────────────────────────────────────────────────────────

    async fn commit(
        &self,
        delivery: &Delivery,
        job: &Job,
        output_ref: ObjectRef,
        started: Instant,
        socket_id: Option<&str>,
    ) -> Result<Outcome, WorkerError> {
        tracing::debug!(job_id = %job.id, stage = %Stage::Acking, "Recording success");
        let transition = Transition::Succeed {
            output_ref: output_ref.clone(),
            now: Utc::now(),
        };
        match self.jobs.transition(job.id, JobStatus::Processing, transition).await {
            Ok(Some(_)) => {
                self.settle(delivery, Settle::Ack).await?;
                let elapsed = started.elapsed();
                metrics::counter!("tattoo_jobs_succeeded_total").increment(1);
                metrics::histogram!("tattoo_job_processing_seconds").record(elapsed.as_secs_f64());
                tracing::info!(
                    job_id = %job.id,
                    attempt = job.attempt_count,
                    output = %output_ref,
                    processing_ms = elapsed.as_millis() as u64,
                    "Job succeeded"
                );
                self.notify(job, socket_id, &output_ref, elapsed).await;
                Ok(Outcome::Succeeded { output_ref })
            }
            Ok(None) => {
                tracing::warn!(job_id = %job.id, "Claim expired before commit, another worker owns the job");
                self.settle(delivery, Settle::Ack).await?;
                Ok(Outcome::Superseded)
            }
            Err(e) => {
                // The stored result is picked up by the presence check on redelivery.
                tracing::error!(job_id = %job.id, error = %e, "Failed to record success");
                let delay = self.retry.delay_for_attempt(job.attempt_count.max(1) as u32);
                self.defer(delivery, delay).await
            }
        }
    }

    async fn settle_failure(
        &self,
        delivery: &Delivery,
        job: &Job,
        failure: Failure,
    ) -> Result<Outcome, WorkerError> {
        let attempt = job.attempt_count.max(0) as u32;
        tracing::warn!(
            job_id = %job.id,
            attempt,
            stage = %failure.stage,
            kind = %failure.error.kind,
            error = %failure.error.message,
            "Job attempt failed"
        );

        match failure.class {
            Class::Terminal => {
                self.finish_failed(delivery, job.id, JobStatus::Processing, failure.error)
                    .await
            }
            Class::Retryable if self.retry.should_retry(attempt) => {
                let delay = self.retry.delay_for_attempt(attempt);
                let release = Transition::Release { now: Utc::now() };
                match self.jobs.transition(job.id, JobStatus::Processing, release).await {
                    Ok(Some(_)) => {
                        self.settle(delivery, Settle::Nack(delay)).await?;
                        metrics::counter!("tattoo_jobs_retried_total").increment(1);
                        tracing::info!(
                            job_id = %job.id,
                            attempt,
                            retry_in_ms = delay.as_millis() as u64,
                            "Job re-queued for retry"
                        );
                        Ok(Outcome::RetryScheduled { attempt, delay })
                    }
                    Ok(None) => {
                        self.settle(delivery, Settle::Ack).await?;
                        Ok(Outcome::Superseded)
                    }
                    Err(e) => {
                        tracing::error!(job_id = %job.id, error = %e, "Failed to release job");
                        self.defer(delivery, delay).await
                    }
                }
            }
            Class::Retryable => {
                let error = JobError::new(
                    ErrorKind::AttemptsExhausted,
                    format!(
                        "gave up after {attempt} attempts; last error: {}",
                        failure.error
                    ),
                );
                self.finish_failed(delivery, job.id, JobStatus::Processing, error)
                    .await
            }
        }
    }

    async fn finish_failed(
        &self,
        delivery: &Delivery,
        job_id: Uuid,
        expected: JobStatus,
        error: JobError,
    ) -> Result<Outcome, WorkerError> {
        let kind = error.kind;
        let transition = Transition::Fail {
            error: error.clone(),
            now: Utc::now(),
        };
        match self.jobs.transition(job_id, expected, transition).await {
            Ok(Some(_)) => {
                self.settle(delivery, Settle::Ack).await?;
                metrics::counter!("tattoo_jobs_failed_total", "kind" => kind.to_string())
                    .increment(1);
                tracing::warn!(job_id = %job_id, kind = %kind, error = %error.message, "Job failed");
                Ok(Outcome::Failed(kind))
            }
            Ok(None) => {
                self.settle(delivery, Settle::Ack).await?;
                Ok(Outcome::Superseded)
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to record job failure");
                self.defer(delivery, self.settings.poll_interval).await
            }
        }
    }

    async fn defer(&self, delivery: &Delivery, delay: Duration) -> Result<Outcome, WorkerError> {
        self.settle(delivery, Settle::Nack(delay)).await?;
        Ok(Outcome::Deferred(delay))
    }

    /// Settle `delivery`, retrying broker errors with capped exponential
    /// backoff for up to one lease period. A delivery that cannot be settled
    /// stays in this consumer's processing list.
    async fn settle(&self, delivery: &Delivery, action: Settle<'_>) -> Result<(), QueueError> {
        let started = Instant::now();
        let mut backoff = self.settings.poll_interval.max(Duration::from_millis(1));
        loop {
            let result = match action {
                Settle::Ack => self.broker.ack(delivery).await,
                Settle::Nack(delay) => self.broker.nack(delivery, delay).await,
                Settle::DeadLetter(reason) => self.broker.dead_letter(delivery, reason).await,
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) if started.elapsed() + backoff < self.settings.lease => {
                    tracing::warn!(
                        error = %e,
                        action = ?action,
                        retry_in_ms = backoff.as_millis() as u64,
                        "Failed to settle delivery, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_SETTLE_BACKOFF);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn notify(
        &self,
        job: &Job,
        socket_id: Option<&str>,
        output_ref: &ObjectRef,
        elapsed: Duration,
    ) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        let url = match self
            .storage
            .presigned_url(output_ref, self.settings.result_url_ttl)
            .await
        {
            Ok(url) => Some(url),
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Could not sign result URL");
                None
            }
        };
        notifier
            .job_succeeded(job, socket_id, output_ref, url, elapsed)
            .await;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}
