use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::job::{Job, JobStatus, Transition};

/// Mapping from job id to the job record; the single source of truth for
/// status.
///
/// Every status change goes through [`JobStore::transition`], a
/// compare-and-swap on the expected prior status.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a freshly created job. Fails if the id already exists.
    async fn insert(&self, job: &Job) -> Result<(), JobStoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Job>, JobStoreError>;

    /// Apply `transition` if the job is still in `expected`. Returns the
    /// updated job, or `None` when the transition was stale.
    async fn transition(
        &self,
        id: Uuid,
        expected: JobStatus,
        transition: Transition,
    ) -> Result<Option<Job>, JobStoreError>;

    async fn ping(&self) -> Result<(), JobStoreError>;
}

/// Process-local job store.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    pub async fn all(&self) -> Vec<Job> {
        self.jobs.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::Duplicate(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, JobStoreError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn transition(
        &self,
        id: Uuid,
        expected: JobStatus,
        transition: Transition,
    ) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };
        if job.apply(expected, &transition) {
            Ok(Some(job.clone()))
        } else {
            Ok(None)
        }
    }

    async fn ping(&self) -> Result<(), JobStoreError> {
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobStoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Job {0} already exists")]
    Duplicate(Uuid),

    #[error("Corrupt job record {id}: {reason}")]
    Corrupt { id: Uuid, reason: String },
}
