use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use twin_analysis::{
    config::AppConfig,
    db,
    services::{
        notifier::{CompletionNotifier, RedisPublisher},
        persistence::PgAnalysisRepository,
        pipeline::PIPELINE,
        queue::TaskQueue,
        storage::R2Client,
        vision::Analyzer,
        worker::Worker,
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

    tracing::info!("Starting analysis worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    // Initialize database
    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Initialize services
    tracing::info!("Initializing services");
    let r2_client = R2Client::new(
        &config.r2_bucket,
        &config.r2_endpoint,
        &config.r2_access_key,
        &config.r2_secret_key,
    )
    .expect("Failed to initialize R2 client");
    let repository = Arc::new(PgAnalysisRepository::new(db_pool, Arc::new(r2_client)));

    let queue = TaskQueue::connect(
        &config.broker_url,
        &config.result_backend_url,
        config.result_ttl_secs,
    )
    .expect("Failed to initialize task queue");

    // One pipeline per worker process, built before the first task arrives
    let pipeline = config.vision_pipeline();
    let mode = pipeline.mode();
    if PIPELINE.init_once(|| Box::new(pipeline) as Box<dyn Analyzer>) {
        tracing::info!(mode = ?mode, "Analysis pipeline loaded");
    }

    let publisher = RedisPublisher::new(&config.result_backend_url)
        .expect("Failed to initialize completion publisher");
    let notifier = CompletionNotifier::new(Arc::new(publisher), config.events_channel.clone());

    let router = config.queue_router();
    let mut worker = Worker::new(
        queue,
        router.priority_order(),
        &PIPELINE,
        repository,
        config.task_max_retries,
    );
    worker.on_terminal(Arc::new(notifier));

    // Anything still in flight was abandoned by a previous run
    if let Err(e) = worker.recover().await {
        tracing::error!(error = %e, "Failed to recover in-flight tasks");
    }

    tokio::select! {
        _ = worker.run() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received, stopping worker");
        }
    }
}
