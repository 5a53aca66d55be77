use async_trait::async_trait;
use base64::Engine;
use redis::AsyncCommands;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::models::task::{JobSubmission, TaskMessage, TaskRecord, TaskState};

const QUEUE_KEY_PREFIX: &str = "queue:";
const PROCESSING_KEY_PREFIX: &str = "processing:";
const RECORD_KEY_PREFIX: &str = "task-meta:";

/// Pause between claim sweeps while every queue is empty.
const CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(200);

fn queue_key(queue: &str) -> String {
    format!("{QUEUE_KEY_PREFIX}{queue}")
}

fn processing_key(queue: &str) -> String {
    format!("{PROCESSING_KEY_PREFIX}{queue}")
}

fn record_key(task_id: Uuid) -> String {
    format!("{RECORD_KEY_PREFIX}{task_id}")
}

/// A message a worker has claimed but not yet acknowledged.
///
/// Until `ack` the message stays parked on its queue's processing list, so a
/// worker that dies mid-task leaves it recoverable.
#[derive(Debug, Clone, PartialEq)]
pub struct Claimed {
    pub message: TaskMessage,
    receipt: String,
}

/// Message transport holding enqueued tasks until a worker acknowledges them.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Append a message to the tail of `message.queue`.
    async fn push(&self, message: &TaskMessage) -> Result<(), TransportError>;

    /// Move the oldest message of the first non-empty queue in `queues` onto
    /// that queue's processing list, waiting up to `timeout` for one to arrive.
    async fn claim(
        &self,
        queues: &[String],
        timeout: Duration,
    ) -> Result<Option<Claimed>, TransportError>;

    /// Forget a claimed message once its outcome is recorded.
    async fn ack(&self, claimed: &Claimed) -> Result<(), TransportError>;

    /// Put a claimed message back at the head of its queue.
    async fn release(&self, claimed: &Claimed) -> Result<(), TransportError>;

    /// Return everything left on the processing lists of `queues` to their
    /// queues, oldest first. Returns how many messages moved.
    async fn recover(&self, queues: &[String]) -> Result<u64, TransportError>;

    async fn depth(&self, queue: &str) -> Result<u64, TransportError>;

    async fn ping(&self) -> Result<(), TransportError>;
}

/// Store recording task state and results.
#[async_trait]
pub trait ResultBackend: Send + Sync {
    async fn load(&self, task_id: Uuid) -> Result<Option<TaskRecord>, TransportError>;

    async fn store(&self, record: &TaskRecord) -> Result<(), TransportError>;
}

/// Redis list-backed broker. One list per queue (LPUSH in, RPOPLPUSH out gives
/// FIFO) plus a `processing:{queue}` list holding claimed messages until ack.
pub struct RedisBroker {
    client: redis::Client,
}

impl RedisBroker {
    pub fn new(redis_url: &str) -> Result<Self, TransportError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn push(&self, message: &TaskMessage) -> Result<(), TransportError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let payload = serde_json::to_string(message)?;
        conn.lpush::<_, _, ()>(queue_key(&message.queue), &payload).await?;
        Ok(())
    }

    async fn claim(
        &self,
        queues: &[String],
        timeout: Duration,
    ) -> Result<Option<Claimed>, TransportError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            for queue in queues {
                let payload: Option<String> =
                    conn.rpoplpush(queue_key(queue), processing_key(queue)).await?;
                let Some(payload) = payload else {
                    continue;
                };

                match serde_json::from_str(&payload) {
                    Ok(message) => {
                        return Ok(Some(Claimed {
                            message,
                            receipt: payload,
                        }))
                    }
                    Err(e) => {
                        tracing::warn!(queue = %queue, error = %e, "Dropping malformed task message");
                        conn.lrem::<_, _, ()>(processing_key(queue), 1, &payload).await?;
                    }
                }
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(CLAIM_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn ack(&self, claimed: &Claimed) -> Result<(), TransportError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.lrem::<_, _, ()>(processing_key(&claimed.message.queue), 1, &claimed.receipt)
            .await?;
        Ok(())
    }

    async fn release(&self, claimed: &Claimed) -> Result<(), TransportError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let queue = &claimed.message.queue;
        redis::pipe()
            .atomic()
            .rpush(queue_key(queue), &claimed.receipt)
            .ignore()
            .lrem(processing_key(queue), 1, &claimed.receipt)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn recover(&self, queues: &[String]) -> Result<u64, TransportError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let mut moved = 0;
        for queue in queues {
            // Newest claim sits on the left; pushing each onto the consuming
            // end leaves the oldest to be claimed first.
            loop {
                let payload: Option<String> = conn
                    .lmove(
                        processing_key(queue),
                        queue_key(queue),
                        redis::Direction::Left,
                        redis::Direction::Right,
                    )
                    .await?;
                if payload.is_none() {
                    break;
                }
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn depth(&self, queue: &str) -> Result<u64, TransportError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let depth: u64 = conn.llen(queue_key(queue)).await?;
        Ok(depth)
    }

    async fn ping(&self) -> Result<(), TransportError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

/// Redis key-value result backend with per-record expiry.
pub struct RedisResultBackend {
    client: redis::Client,
    ttl_secs: u64,
}

impl RedisResultBackend {
    pub fn new(redis_url: &str, ttl_secs: u64) -> Result<Self, TransportError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client, ttl_secs })
    }
}

#[async_trait]
impl ResultBackend for RedisResultBackend {
    async fn load(&self, task_id: Uuid) -> Result<Option<TaskRecord>, TransportError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let raw: Option<String> = conn.get(record_key(task_id)).await?;
        match raw {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn store(&self, record: &TaskRecord) -> Result<(), TransportError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let payload = serde_json::to_string(record)?;
        conn.set_ex::<_, _, ()>(record_key(record.task_id), payload, self.ttl_secs)
            .await?;
        Ok(())
    }
}

/// Single-process broker and result backend.
#[derive(Default)]
pub struct MemoryTransport {
    queues: Mutex<HashMap<String, VecDeque<TaskMessage>>>,
    processing: Mutex<HashMap<String, Vec<Claimed>>>,
    records: Mutex<HashMap<Uuid, TaskRecord>>,
    available: Notify,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_claim(&self, queues: &[String]) -> Result<Option<Claimed>, TransportError> {
        let message = {
            let mut lists = self.queues.lock().unwrap_or_else(|e| e.into_inner());
            queues
                .iter()
                .find_map(|q| lists.get_mut(q).and_then(VecDeque::pop_front))
        };
        let Some(message) = message else {
            return Ok(None);
        };

        let claimed = Claimed {
            receipt: serde_json::to_string(&message)?,
            message,
        };
        self.processing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(claimed.message.queue.clone())
            .or_default()
            .push(claimed.clone());
        Ok(Some(claimed))
    }

    fn take_processing(&self, claimed: &Claimed) -> bool {
        let mut processing = self.processing.lock().unwrap_or_else(|e| e.into_inner());
        let Some(parked) = processing.get_mut(&claimed.message.queue) else {
            return false;
        };
        match parked.iter().position(|c| c.receipt == claimed.receipt) {
            Some(index) => {
                parked.remove(index);
                true
            }
            None => false,
        }
    }

    fn push_front(&self, message: TaskMessage) {
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(message.queue.clone())
            .or_default()
            .push_front(message);
        self.available.notify_one();
    }
}

#[async_trait]
impl Broker for MemoryTransport {
    async fn push(&self, message: &TaskMessage) -> Result<(), TransportError> {
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(message.queue.clone())
            .or_default()
            .push_back(message.clone());
        self.available.notify_one();
        Ok(())
    }

    async fn claim(
        &self,
        queues: &[String],
        timeout: Duration,
    ) -> Result<Option<Claimed>, TransportError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.available.notified();
            if let Some(claimed) = self.try_claim(queues)? {
                return Ok(Some(claimed));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_claim(queues);
            }
        }
    }

    async fn ack(&self, claimed: &Claimed) -> Result<(), TransportError> {
        self.take_processing(claimed);
        Ok(())
    }

    async fn release(&self, claimed: &Claimed) -> Result<(), TransportError> {
        if self.take_processing(claimed) {
            self.push_front(claimed.message.clone());
        }
        Ok(())
    }

    async fn recover(&self, queues: &[String]) -> Result<u64, TransportError> {
        let mut moved = 0;
        for queue in queues {
            let parked = self
                .processing
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(queue)
                .unwrap_or_default();
            // Parked in claim order; push newest first so the oldest leads.
            for claimed in parked.into_iter().rev() {
                self.push_front(claimed.message);
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn depth(&self, queue: &str) -> Result<u64, TransportError> {
        let lists = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        Ok(lists.get(queue).map_or(0, |l| l.len() as u64))
    }

    async fn ping(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

#[async_trait]
impl ResultBackend for MemoryTransport {
    async fn load(&self, task_id: Uuid) -> Result<Option<TaskRecord>, TransportError> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(records.get(&task_id).cloned())
    }

    async fn store(&self, record: &TaskRecord) -> Result<(), TransportError> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(record.task_id, record.clone());
        Ok(())
    }
}

/// Typed client over a broker + result backend pair.
#[derive(Clone)]
pub struct TaskQueue {
    broker: Arc<dyn Broker>,
    backend: Arc<dyn ResultBackend>,
}

impl TaskQueue {
    pub fn new(broker: Arc<dyn Broker>, backend: Arc<dyn ResultBackend>) -> Self {
        Self { broker, backend }
    }

    /// Build a client over Redis for both the broker and the result backend.
    pub fn connect(broker_url: &str, backend_url: &str, ttl_secs: u64) -> Result<Self, QueueError> {
        let broker = RedisBroker::new(broker_url).map_err(QueueError::QueueUnavailable)?;
        let backend =
            RedisResultBackend::new(backend_url, ttl_secs).map_err(QueueError::BackendUnavailable)?;
        Ok(Self::new(Arc::new(broker), Arc::new(backend)))
    }

    pub fn backend(&self) -> Arc<dyn ResultBackend> {
        Arc::clone(&self.backend)
    }

    /// Enqueue a task and return its freshly assigned id without waiting for execution.
    pub async fn submit(&self, queue: &str, submission: &JobSubmission) -> Result<Uuid, QueueError> {
        let task_id = Uuid::new_v4();
        let message = TaskMessage {
            task_id,
            queue: queue.to_string(),
            request_id: submission.request_id.clone(),
            image_id: submission.image_id.clone(),
            image_b64: base64::engine::general_purpose::STANDARD.encode(&submission.image_payload),
            submitted_at: submission.submitted_at,
            retries: 0,
        };

        self.backend
            .store(&TaskRecord::new(task_id, queue, TaskState::Pending))
            .await
            .map_err(QueueError::BackendUnavailable)?;

        if let Err(e) = self.broker.push(&message).await {
            // Best effort: a task that never reached the broker must not read as pending.
            let mut record = TaskRecord::new(task_id, queue, TaskState::Failure);
            record.error = Some("task could not be enqueued".to_string());
            if let Err(store_err) = self.backend.store(&record).await {
                tracing::warn!(task_id = %task_id, error = %store_err, "Failed to mark unqueued task as failed");
            }
            return Err(QueueError::QueueUnavailable(e));
        }

        tracing::debug!(task_id = %task_id, queue = %queue, "Task enqueued");
        Ok(task_id)
    }

    /// Put an already-identified message back on its queue.
    pub async fn requeue(&self, message: &TaskMessage) -> Result<(), QueueError> {
        self.broker
            .push(message)
            .await
            .map_err(QueueError::QueueUnavailable)
    }

    /// Claim the next message, checking `queues` in priority order.
    pub async fn dequeue(
        &self,
        queues: &[String],
        timeout: Duration,
    ) -> Result<Option<Claimed>, QueueError> {
        self.broker
            .claim(queues, timeout)
            .await
            .map_err(QueueError::QueueUnavailable)
    }

    /// Acknowledge a claimed message whose outcome has been recorded.
    pub async fn ack(&self, claimed: &Claimed) -> Result<(), QueueError> {
        self.broker
            .ack(claimed)
            .await
            .map_err(QueueError::QueueUnavailable)
    }

    /// Hand a claimed message back for redelivery.
    pub async fn release(&self, claimed: &Claimed) -> Result<(), QueueError> {
        self.broker
            .release(claimed)
            .await
            .map_err(QueueError::QueueUnavailable)
    }

    /// Requeue messages stranded on processing lists by a stopped worker.
    pub async fn recover(&self, queues: &[String]) -> Result<u64, QueueError> {
        self.broker
            .recover(queues)
            .await
            .map_err(QueueError::QueueUnavailable)
    }

    pub async fn fetch_record(&self, task_id: Uuid) -> Result<Option<TaskRecord>, QueueError> {
        self.backend
            .load(task_id)
            .await
            .map_err(QueueError::BackendUnavailable)
    }

    /// Current state; `Unknown` when the backend has no record of the task.
    pub async fn fetch_state(&self, task_id: Uuid) -> Result<TaskState, QueueError> {
        Ok(self
            .fetch_record(task_id)
            .await?
            .map_or(TaskState::Unknown, |r| r.state))
    }

    /// Terminal payload of a task. Signals `NotReady` for any non-terminal state.
    pub async fn fetch_result(&self, task_id: Uuid) -> Result<serde_json::Value, QueueError> {
        let record = self.fetch_record(task_id).await?.ok_or(QueueError::NotReady)?;
        match record.state {
            TaskState::Success => Ok(record.result.unwrap_or(serde_json::Value::Null)),
            TaskState::Failure => Err(QueueError::TaskFailed(
                record.error.unwrap_or_else(|| "unknown error".to_string()),
            )),
            _ => Err(QueueError::NotReady),
        }
    }

    /// Check broker connectivity (for health checks).
    pub async fn health_check(&self) -> Result<(), QueueError> {
        self.broker.ping().await.map_err(QueueError::QueueUnavailable)
    }

    /// Number of messages waiting on `queue`.
    pub async fn queue_depth(&self, queue: &str) -> Result<u64, QueueError> {
        self.broker
            .depth(queue)
            .await
            .map_err(QueueError::QueueUnavailable)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Broker unavailable: {0}")]
    QueueUnavailable(#[source] TransportError),

    #[error("Result backend unavailable: {0}")]
    BackendUnavailable(#[source] TransportError),

    #[error("Task result is not ready")]
    NotReady,

    #[error("Task failed: {0}")]
    TaskFailed(String),
}
