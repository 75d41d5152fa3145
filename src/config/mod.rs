use serde::Deserialize;
use std::net::{AddrParseError, SocketAddr};
use std::time::Duration;

use crate::services::retry::RetryPolicy;
use crate::services::validation::ImageLimits;
use crate::services::worker::WorkerSettings;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:8000"). Ignored by worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Prometheus scrape address served by worker processes
    #[serde(default = "default_worker_metrics_addr")]
    pub worker_metrics_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for the job queue
    pub redis_url: String,

    #[serde(default = "default_queue_name")]
    pub queue_name: String,

    /// S3-compatible endpoint URL (MinIO, R2, ...)
    pub s3_endpoint: String,

    #[serde(default = "default_s3_region")]
    pub s3_region: String,

    pub s3_access_key: String,

    pub s3_secret_key: String,

    #[serde(default = "default_input_bucket")]
    pub input_bucket: String,

    #[serde(default = "default_output_bucket")]
    pub output_bucket: String,

    /// Reve API token
    pub reve_api_key: String,

    #[serde(default = "default_reve_base_url")]
    pub reve_base_url: String,

    #[serde(default = "default_ai_timeout_secs")]
    pub ai_timeout_secs: u64,

    #[serde(default = "default_storage_timeout_secs")]
    pub storage_timeout_secs: u64,

    /// Jobs a single worker process handles at once
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Fraction of each backoff delay that may be randomly cut (0.0 - 1.0)
    #[serde(default = "default_backoff_jitter")]
    pub backoff_jitter: f64,

    /// How long a worker's claim on a job stays valid
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,

    /// Silence after which a worker's in-flight messages are redelivered
    #[serde(default = "default_consumer_ttl_secs")]
    pub consumer_ttl_secs: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: usize,

    /// Lifetime of presigned result URLs
    #[serde(default = "default_result_url_ttl_secs")]
    pub result_url_ttl_secs: u64,

    /// Completion callback, disabled when unset
    #[serde(default)]
    pub webhook_url: Option<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_worker_metrics_addr() -> String {
    "0.0.0.0:9100".to_string()
}

fn default_queue_name() -> String {
    "image_processing_queue".to_string()
}

fn default_s3_region() -> String {
    "us-east-1".to_string()
}

fn default_input_bucket() -> String {
    "input-images".to_string()
}

fn default_output_bucket() -> String {
    "output-images".to_string()
}

fn default_reve_base_url() -> String {
    "https://api.reve.com/v1/image".to_string()
}

fn default_ai_timeout_secs() -> u64 {
    60
}

fn default_storage_timeout_secs() -> u64 {
    30
}

fn default_worker_concurrency() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_backoff_jitter() -> f64 {
    0.2
}

fn default_lease_secs() -> u64 {
    300
}

fn default_consumer_ttl_secs() -> u64 {
    30
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_max_image_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_result_url_ttl_secs() -> u64 {
    3_600
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.max_attempts.max(1),
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
        .with_jitter(self.backoff_jitter)
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            output_bucket: self.output_bucket.clone(),
            concurrency: self.worker_concurrency.max(1),
            lease: Duration::from_secs(self.lease_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            result_url_ttl: Duration::from_secs(self.result_url_ttl_secs),
        }
    }

    pub fn image_limits(&self) -> ImageLimits {
        ImageLimits {
            max_bytes: self.max_image_bytes,
        }
    }

    pub fn ai_timeout(&self) -> Duration {
        Duration::from_secs(self.ai_timeout_secs)
    }

    pub fn storage_timeout(&self) -> Duration {
        Duration::from_secs(self.storage_timeout_secs)
    }

    pub fn consumer_ttl(&self) -> Duration {
        Duration::from_secs(self.consumer_ttl_secs)
    }

    pub fn worker_metrics_addr(&self) -> Result<SocketAddr, AddrParseError> {
        self.worker_metrics_addr.parse()
    }
}
