use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};
use uuid::Uuid;

/// State of a task as recorded by the result backend.
///
/// Backend strings outside the known set deserialize to [`TaskState::Unknown`]
/// instead of failing.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, IntoStaticStr,
)]
#[serde(from = "String", into = "&'static str")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Received,
    Started,
    Retry,
    Success,
    Failure,
    Unknown,
}

impl TaskState {
    /// Parse a raw backend value, falling back to `Unknown`.
    pub fn from_backend(raw: &str) -> Self {
        raw.parse().unwrap_or(TaskState::Unknown)
    }
}

impl From<String> for TaskState {
    fn from(raw: String) -> Self {
        TaskState::from_backend(&raw)
    }
}

/// One analysis request as accepted by the submission facade.
#[derive(Debug, Clone)]
pub struct JobSubmission {
    pub request_id: String,
    pub image_id: String,
    pub image_payload: Vec<u8>,
    pub submitted_at: DateTime<Utc>,
}

impl JobSubmission {
    pub fn new(request_id: impl Into<String>, image_id: impl Into<String>, image_payload: Vec<u8>) -> Self {
        Self {
            request_id: request_id.into(),
            image_id: image_id.into(),
            image_payload,
            submitted_at: Utc::now(),
        }
    }
}

/// Message carried on the broker. The image travels inline as base64.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskMessage {
    pub task_id: Uuid,
    pub queue: String,
    pub request_id: String,
    pub image_id: String,
    pub image_b64: String,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub retries: u32,
}

/// Task record stored in the result backend under `task-meta:{task_id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: Uuid,
    pub queue: String,
    pub state: TaskState,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    #[serde(default)]
    pub retries: u32,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(task_id: Uuid, queue: impl Into<String>, state: TaskState) -> Self {
        Self {
            task_id,
            queue: queue.into(),
            state,
            result: None,
            error: None,
            retries: 0,
            updated_at: Utc::now(),
        }
    }
}
