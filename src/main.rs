use axum::extract::DefaultBodyLimit;
use axum::{routing::get, routing::post, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use twin_analysis::{
    app_state::AppState,
    config::AppConfig,
    db, routes,
    services::{
        jobs::JobService,
        persistence::PgAnalysisRepository,
        pipeline::PIPELINE,
        queue::TaskQueue,
        storage::R2Client,
        vision::Analyzer,
    },
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing twin-analysis API server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    metrics::describe_counter!(
        "analysis_jobs_submitted_total",
        "Analysis jobs accepted, labelled by queue"
    );
    metrics::describe_histogram!(
        "analysis_processing_seconds",
        "Time to analyze and persist one image"
    );
    metrics::describe_gauge!(
        "analysis_queue_depth",
        "Messages waiting per queue, sampled on health checks"
    );

    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    tracing::info!("Initializing R2 storage client");
    let r2_client = R2Client::new(
        &config.r2_bucket,
        &config.r2_endpoint,
        &config.r2_access_key,
        &config.r2_secret_key,
    )
    .expect("Failed to initialize R2 client");
    let repository = Arc::new(PgAnalysisRepository::new(db_pool.clone(), Arc::new(r2_client)));

    // The synchronous endpoint runs the pipeline in-process
    let pipeline = config.vision_pipeline();
    tracing::info!(mode = ?pipeline.mode(), "Loading analysis pipeline");
    PIPELINE.init_once(|| Box::new(pipeline) as Box<dyn Analyzer>);

    tracing::info!("Connecting to Redis broker and result backend");
    let queue = TaskQueue::connect(
        &config.broker_url,
        &config.result_backend_url,
        config.result_ttl_secs,
    )
    .expect("Failed to initialize task queue");
    let jobs = JobService::new(queue, config.queue_router());

    let state = AppState::new(db_pool, jobs, repository, &PIPELINE);

    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/v1/analyze", post(routes::analyze::analyze_now))
        .route("/v1/analyze_async", post(routes::analyze::submit_analysis))
        .route(
            "/v1/result_async/{task_id}",
            get(routes::analyze::get_async_result),
        )
        .route(
            "/v1/analyses/{analysis_id}",
            get(routes::analyze::get_analysis),
        )
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(20 * 1024 * 1024)); // 20 MB, base64 inflates images

    tracing::info!("Starting twin-analysis on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .await
        .expect("Server error");
}
