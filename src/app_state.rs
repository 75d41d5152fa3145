use std::sync::Arc;
use std::time::Duration;

use crate::services::{
    job_store::JobStore, monitor::QueueMonitor, queue::MessageBroker, storage::ObjectStore,
    submitter::JobSubmitter, validation::ImageLimits,
};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<dyn JobStore>,
    pub storage: Arc<dyn ObjectStore>,
    pub queue: Arc<dyn MessageBroker>,
    pub submitter: Arc<JobSubmitter>,
    pub monitor: QueueMonitor,
    pub input_bucket: String,
    pub output_bucket: String,
    pub result_url_ttl: Duration,
}

impl AppState {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        storage: Arc<dyn ObjectStore>,
        queue: Arc<dyn MessageBroker>,
        input_bucket: &str,
        output_bucket: &str,
        limits: ImageLimits,
        result_url_ttl: Duration,
    ) -> Self {
        let submitter = JobSubmitter::new(
            jobs.clone(),
            storage.clone(),
            queue.clone(),
            input_bucket,
            limits,
        );
        Self {
            monitor: QueueMonitor::new(queue.clone()),
            submitter: Arc::new(submitter),
            jobs,
            storage,
            queue,
            input_bucket: input_bucket.to_string(),
            output_bucket: output_bucket.to_string(),
            result_url_ttl,
        }
    }
}
