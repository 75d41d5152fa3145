use tracing_subscriber::EnvFilter;

/// JSON logs to stdout, filtered by `RUST_LOG` (default `info`).
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();
}

/// Register descriptions for the metrics the API process emits.
pub fn describe_api_metrics() {
    metrics::describe_counter!(
        "tattoo_jobs_submitted_total",
        "Total tattoo preview jobs accepted and enqueued"
    );
    describe_failed_total();
    metrics::describe_gauge!(
        "tattoo_queue_depth",
        "Messages waiting in the queue, ready or delayed"
    );
}

/// Register descriptions for the metrics a worker process emits.
pub fn describe_worker_metrics() {
    metrics::describe_counter!(
        "tattoo_jobs_succeeded_total",
        "Total tattoo preview jobs that produced a result"
    );
    describe_failed_total();
    metrics::describe_counter!(
        "tattoo_jobs_retried_total",
        "Total job attempts re-queued after a retryable failure"
    );
    metrics::describe_histogram!(
        "tattoo_job_processing_seconds",
        "Time from claim to recorded success"
    );
}

fn describe_failed_total() {
    metrics::describe_counter!(
        "tattoo_jobs_failed_total",
        "Total tattoo preview jobs that ended failed, by error kind"
    );
}
