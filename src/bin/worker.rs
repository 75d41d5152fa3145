use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use tattoo_preview::{
    config::AppConfig,
    db::{self, queries::PgJobStore},
    services::{
        ai::ReveClient, notify::WebhookNotifier, queue::RedisQueue, storage::S3Storage,
        worker::JobWorker,
    },
    telemetry,
};

#[tokio::main]
async fn main() {
    telemetry::init_tracing();

    tracing::info!("Starting tattoo preview worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    // Expose worker metrics on their own scrape endpoint
    let metrics_addr = config
        .worker_metrics_addr()
        .expect("WORKER_METRICS_ADDR must be a socket address");
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .expect("Failed to install Prometheus metrics exporter");
    telemetry::describe_worker_metrics();
    tracing::info!(addr = %metrics_addr, "Serving worker metrics");

    // Initialize database
    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Initialize services
    tracing::info!("Initializing services");
    let storage = S3Storage::new(
        &config.s3_endpoint,
        &config.s3_region,
        &config.s3_access_key,
        &config.s3_secret_key,
        config.storage_timeout(),
    )
    .expect("Failed to initialize object storage client");

    let consumer_id = format!("worker-{}", uuid::Uuid::new_v4());
    let queue = Arc::new(
        RedisQueue::new(&config.redis_url, &config.queue_name, &consumer_id)
            .expect("Failed to initialize job queue")
            .with_consumer_ttl(config.consumer_ttl()),
    );

    let ai = ReveClient::new(&config.reve_base_url, &config.reve_api_key, config.ai_timeout())
        .expect("Failed to initialize Reve API client");

    let mut worker = JobWorker::new(
        Arc::new(PgJobStore::new(db_pool)),
        Arc::new(storage),
        Arc::new(ai),
        queue.clone(),
        config.retry_policy(),
        config.worker_settings(),
    );
    if let Some(url) = &config.webhook_url {
        let notifier = WebhookNotifier::new(url).expect("Failed to initialize webhook client");
        tracing::info!(url = %notifier.url(), "Webhook notifications enabled");
        worker = worker.with_notifier(notifier);
    }

    queue
        .heartbeat()
        .await
        .expect("Failed to register worker with the queue");

    // Keep this consumer alive and hand back work of consumers that died.
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let beat_queue = queue.clone();
    let beat_every = (config.consumer_ttl() / 3).max(Duration::from_secs(1));
    let heartbeat = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(beat_every);
        loop {
            tokio::select! {
                _ = stop_rx.changed() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = beat_queue.heartbeat().await {
                tracing::error!(error = %e, "Heartbeat failed");
                continue;
            }
            match beat_queue.recover_abandoned().await {
                Ok(0) => {}
                Ok(recovered) => tracing::warn!(recovered, "Requeued messages of silent consumers"),
                Err(e) => tracing::error!(error = %e, "Failed to recover abandoned messages"),
            }
        }
    });

    tracing::info!(consumer_id = %consumer_id, "Worker ready, starting job processing loop");

    Arc::new(worker)
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await;

    let _ = stop_tx.send(true);
    let _ = heartbeat.await;
    match queue.deregister().await {
        Ok(returned) => tracing::info!(returned, "Worker deregistered"),
        Err(e) => tracing::error!(error = %e, "Failed to deregister worker"),
    }
}
