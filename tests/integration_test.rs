use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use twin_analysis::{
    models::event::NotificationEvent,
    models::task::{JobSubmission, TaskState},
    services::{
        notifier::{CompletionNotifier, RedisPublisher},
        queue::TaskQueue,
        router::QueueRouter,
    },
};

fn broker_url() -> String {
    std::env::var("BROKER_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/0".to_string())
}

fn backend_url() -> String {
    std::env::var("RESULT_BACKEND_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/1".to_string())
}

/// Integration test: Redis broker and result backend
///
/// Submits to both priority queues, checks the PENDING record written at
/// submission, claims the emergency task first, and recovers an
/// unacknowledged claim.
///
/// Note: This requires a running Redis instance.
#[tokio::test]
#[ignore] // Run with: cargo test --test integration_test -- --ignored
async fn test_redis_queue_round_trip() {
    let queue = TaskQueue::connect(&broker_url(), &backend_url(), 60)
        .expect("Failed to initialize queue");
    queue.health_check().await.expect("Redis unreachable");

    let router = QueueRouter::default();
    let routine_id = queue
        .submit(
            router.route("lobby_cam1.jpg"),
            &JobSubmission::new("it-1", "lobby_cam1.jpg", b"routine".to_vec()),
        )
        .await
        .expect("Submit failed");
    let urgent_id = queue
        .submit(
            router.route("emergency_cam3.jpg"),
            &JobSubmission::new("it-2", "emergency_cam3.jpg", b"urgent".to_vec()),
        )
        .await
        .expect("Submit failed");

    assert_eq!(queue.fetch_state(routine_id).await.unwrap(), TaskState::Pending);

    let order = router.priority_order();
    let first = queue
        .dequeue(&order, Duration::from_secs(2))
        .await
        .unwrap()
        .expect("No task available");
    let second = queue
        .dequeue(&order, Duration::from_secs(2))
        .await
        .unwrap()
        .expect("No task available");

    assert_eq!(first.message.task_id, urgent_id);
    assert_eq!(second.message.task_id, routine_id);

    // Unacknowledged claims come back on recovery; acknowledged ones do not.
    queue.ack(&first).await.unwrap();
    assert_eq!(queue.recover(&order).await.unwrap(), 1);
    let again = queue
        .dequeue(&order, Duration::from_secs(2))
        .await
        .unwrap()
        .expect("Recovered task missing");
    assert_eq!(again.message.task_id, routine_id);
    queue.ack(&again).await.unwrap();
}

/// Integration test: completion events over Redis pub/sub
#[tokio::test]
#[ignore] // Requires a running Redis instance
async fn test_completion_event_reaches_subscriber() {
    let channel = format!("analysis:done:test:{}", uuid::Uuid::new_v4());
    let client = redis::Client::open(backend_url()).unwrap();
    let mut pubsub = client.get_async_pubsub().await.expect("Redis unreachable");
    pubsub.subscribe(&channel).await.unwrap();

    let publisher = RedisPublisher::new(&backend_url()).unwrap();
    let notifier = CompletionNotifier::new(Arc::new(publisher), channel.clone());
    let event = NotificationEvent::failure(uuid::Uuid::new_v4(), "boom");
    notifier.notify(&event).await;

    let message = tokio::time::timeout(Duration::from_secs(2), pubsub.on_message().next())
        .await
        .expect("No event received")
        .unwrap();
    let payload: String = message.get_payload().unwrap();
    let received: NotificationEvent = serde_json::from_str(&payload).unwrap();

    assert_eq!(received.task_id, event.task_id);
    assert_eq!(received.status, event.status);
    assert_eq!(received.error.as_deref(), Some("boom"));
}
