use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use tattoo_preview::{
    app_state::AppState,
    config::AppConfig,
    db::{self, queries::PgJobStore},
    routes, telemetry,
    services::{queue::RedisQueue, storage::S3Storage},
};

/// Room for the text fields and multipart framing around the two images.
const FORM_OVERHEAD_BYTES: usize = 1024 * 1024;

#[tokio::main]
async fn main() {
    telemetry::init_tracing();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing tattoo-preview API server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);
    telemetry::describe_api_metrics();

    // Initialize database connection pool
    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    // Initialize object storage and make sure both buckets exist
    tracing::info!(endpoint = %config.s3_endpoint, "Initializing object storage client");
    let storage = S3Storage::new(
        &config.s3_endpoint,
        &config.s3_region,
        &config.s3_access_key,
        &config.s3_secret_key,
        config.storage_timeout(),
    )
    .expect("Failed to initialize object storage client");
    for bucket in [&config.input_bucket, &config.output_bucket] {
        match storage.ensure_bucket(bucket).await {
            Ok(true) => tracing::info!(bucket = %bucket, "Created bucket"),
            Ok(false) => tracing::debug!(bucket = %bucket, "Bucket already exists"),
            Err(e) => tracing::warn!(bucket = %bucket, error = %e, "Could not verify bucket"),
        }
    }

    // The API only publishes, so it never registers as a consumer.
    tracing::info!(queue = %config.queue_name, "Connecting to Redis job queue");
    let queue = RedisQueue::new(&config.redis_url, &config.queue_name, "api")
        .expect("Failed to initialize job queue");

    let state = AppState::new(
        Arc::new(PgJobStore::new(db_pool)),
        Arc::new(storage),
        Arc::new(queue),
        &config.input_bucket,
        &config.output_bucket,
        config.image_limits(),
        config.worker_settings().result_url_ttl,
    );

    let body_limit = 2 * config.max_image_bytes + FORM_OVERHEAD_BYTES;

    let app = routes::api_router(state, body_limit)
        // Prometheus metrics endpoint (separate state)
        .merge(
            Router::new()
                .route("/metrics", get(routes::metrics::prometheus_metrics))
                .with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(body_limit));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await
        .expect("Server error");
}
