use futures::StreamExt;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use twin_analysis::{
    config::MonitorConfig,
    models::event::NotificationEvent,
    services::poller::{HttpResultFetcher, ResultPoller},
};

/// Pause before resubscribing after the pub/sub connection drops.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = MonitorConfig::from_env().expect("Failed to load configuration");

    PrometheusBuilder::new()
        .install()
        .expect("Failed to install Prometheus metrics exporter");
    metrics::describe_counter!(
        "result_poll_timeouts_total",
        "Completion events whose result never became available"
    );

    let fetcher = HttpResultFetcher::new(&config.api_base_url, config.fetch_timeout())
        .expect("Failed to build result fetcher");
    let poller = Arc::new(ResultPoller::new(Arc::new(fetcher), config.poll_policy()));

    let client = redis::Client::open(config.result_backend_url.as_str())
        .expect("Invalid result backend URL");

    tracing::info!(
        channel = %config.events_channel,
        api = %config.api_base_url,
        "Listening for completion events"
    );

    tokio::select! {
        _ = listen(&client, &config.events_channel, poller) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received, stopping monitor");
        }
    }
}

/// Subscribe to the completion channel and spawn one poll per event.
async fn listen(client: &redis::Client, channel: &str, poller: Arc<ResultPoller>) {
    loop {
        let mut pubsub = match client.get_async_pubsub().await {
            Ok(pubsub) => pubsub,
            Err(e) => {
                tracing::error!(error = %e, "Failed to connect to result backend");
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        };
        if let Err(e) = pubsub.subscribe(channel).await {
            tracing::error!(channel, error = %e, "Failed to subscribe");
            tokio::time::sleep(RECONNECT_DELAY).await;
            continue;
        }

        let mut messages = pubsub.on_message();
        while let Some(message) = messages.next().await {
            let payload: String = match message.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::warn!(error = %e, "Unreadable completion message");
                    continue;
                }
            };
            let event: NotificationEvent = match serde_json::from_str(&payload) {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!(error = %e, payload = %payload, "Malformed completion event");
                    continue;
                }
            };

            let poller = Arc::clone(&poller);
            tokio::spawn(async move {
                poller.handle_event(&event).await;
            });
        }

        tracing::warn!("Completion channel closed, resubscribing");
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}
