use async_trait::async_trait;
use redis::AsyncCommands;
use std::sync::Arc;

use crate::models::event::NotificationEvent;
use crate::services::worker::CompletionHook;

/// Fire-and-forget pub/sub transport.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), PublishError>;
}

pub struct RedisPublisher {
    client: redis::Client,
}

impl RedisPublisher {
    pub fn new(redis_url: &str) -> Result<Self, PublishError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl EventPublisher for RedisPublisher {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), PublishError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let receivers: i64 = conn.publish(channel, payload).await?;
        tracing::debug!(channel = %channel, receivers, "Event published");
        Ok(())
    }
}

/// Publishes one event per terminal task transition.
///
/// Delivery is best-effort: failures are logged and swallowed, since the task
/// outcome is already recorded in the result backend.
pub struct CompletionNotifier {
    publisher: Arc<dyn EventPublisher>,
    channel: String,
}

impl CompletionNotifier {
    pub fn new(publisher: Arc<dyn EventPublisher>, channel: impl Into<String>) -> Self {
        Self {
            publisher,
            channel: channel.into(),
        }
    }

    pub async fn notify(&self, event: &NotificationEvent) {
        if let Err(e) = self.try_notify(event).await {
            metrics::counter!("notification_publish_failures_total").increment(1);
            tracing::warn!(
                task_id = %event.task_id,
                channel = %self.channel,
                error = %e,
                "Failed to publish task event"
            );
        }
    }

    async fn try_notify(&self, event: &NotificationEvent) -> Result<(), PublishError> {
        let payload = serde_json::to_string(event)?;
        self.publisher.publish(&self.channel, &payload).await?;
        tracing::info!(
            task_id = %event.task_id,
            status = %event.status,
            ok = event.ok,
            channel = %self.channel,
            "Published task event"
        );
        Ok(())
    }
}

#[async_trait]
impl CompletionHook for CompletionNotifier {
    async fn on_terminal(&self, event: &NotificationEvent) {
        self.notify(event).await;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl EventPublisher for Recording {
        async fn publish(&self, channel: &str, payload: &str) -> Result<(), PublishError> {
            self.sent
                .lock()
                .unwrap()
                .push((channel.to_string(), payload.to_string()));
            Ok(())
        }
    }

    struct Unreachable;

    #[async_trait]
    impl EventPublisher for Unreachable {
        async fn publish(&self, _channel: &str, _payload: &str) -> Result<(), PublishError> {
            Err(PublishError::Redis(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "connection refused",
            ))))
        }
    }

    #[tokio::test]
    async fn test_notify_publishes_flat_event_on_channel() {
        let recording = Arc::new(Recording::default());
        let notifier = CompletionNotifier::new(recording.clone(), "analysis:done");
        let task_id = Uuid::new_v4();

        notifier.notify(&NotificationEvent::success(task_id)).await;

        let sent = recording.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "analysis:done");
        let event: NotificationEvent = serde_json::from_str(&sent[0].1).unwrap();
        assert_eq!(event.task_id, task_id);
        assert!(event.ok);
        assert!(event.error.is_none());
    }

    #[tokio::test]
    async fn test_publish_failure_is_swallowed() {
        let notifier = CompletionNotifier::new(Arc::new(Unreachable), "analysis:done");
        // Must return normally even though the transport is down.
        notifier
            .notify(&NotificationEvent::failure(Uuid::new_v4(), "boom"))
            .await;
    }
}
