use chrono::Utc;
use serde::{Deserialize, Serialize};
use strum::Display;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Success,
    Failure,
}

/// Completion event published once per terminal task transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub task_id: Uuid,
    pub status: EventStatus,
    pub ok: bool,
    pub error: Option<String>,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
}

impl NotificationEvent {
    pub fn success(task_id: Uuid) -> Self {
        Self {
            task_id,
            status: EventStatus::Success,
            ok: true,
            error: None,
            timestamp: now_epoch_secs(),
        }
    }

    pub fn failure(task_id: Uuid, error: impl Into<String>) -> Self {
        Self {
            task_id,
            status: EventStatus::Failure,
            ok: false,
            error: Some(error.into()),
            timestamp: now_epoch_secs(),
        }
    }
}

fn now_epoch_secs() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}
