//! Task state classification and monotonic state recording.
//!
//! Transition graph:
//!
//! ```text
//! PENDING -> RECEIVED -> STARTED -> (RETRY -> RECEIVED? -> STARTED)* -> SUCCESS | FAILURE
//! ```
//!
//! Any non-terminal state may also jump straight to `FAILURE`, and back to
//! `RECEIVED` when a claimed message is delivered again. Terminal records are
//! never overwritten.

use chrono::Utc;
use std::sync::Arc;

use crate::models::task::{TaskMessage, TaskRecord, TaskState};
use crate::services::queue::{ResultBackend, TransportError};

pub fn is_terminal(state: TaskState) -> bool {
    matches!(state, TaskState::Success | TaskState::Failure)
}

pub fn is_pending(state: TaskState) -> bool {
    matches!(
        state,
        TaskState::Pending | TaskState::Received | TaskState::Started | TaskState::Retry
    )
}

/// Whether a record in state `from` may be moved to `to`.
pub fn can_transition(from: TaskState, to: TaskState) -> bool {
    use TaskState::*;

    if is_terminal(from) || to == Unknown {
        return false;
    }
    if matches!(to, Failure | Received) {
        return true;
    }

    match from {
        // No record, or a state this service does not know: accept the write.
        Unknown => true,
        Pending | Received => to == Started,
        Started => matches!(to, Started | Retry | Success),
        Retry => matches!(to, Retry | Started),
        Success | Failure => false,
    }
}

/// Outcome of a state write.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Applied(TaskRecord),
    Rejected { current: TaskState },
}

/// Writes task state to the result backend, refusing regressions.
///
/// Only the worker executing a task writes its record, so the read-check-write
/// sequence is not raced by other writers.
#[derive(Clone)]
pub struct LifecycleTracker {
    backend: Arc<dyn ResultBackend>,
}

impl LifecycleTracker {
    pub fn new(backend: Arc<dyn ResultBackend>) -> Self {
        Self { backend }
    }

    /// Move the task to `state`, carrying result or error for terminal writes.
    pub async fn record(
        &self,
        message: &TaskMessage,
        state: TaskState,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<Transition, TransportError> {
        let existing = self.backend.load(message.task_id).await?;
        let current = existing.as_ref().map_or(TaskState::Unknown, |r| r.state);

        if !can_transition(current, state) {
            tracing::warn!(
                task_id = %message.task_id,
                from = %current,
                to = %state,
                "Rejected task state transition"
            );
            return Ok(Transition::Rejected { current });
        }

        let record = TaskRecord {
            task_id: message.task_id,
            queue: message.queue.clone(),
            state,
            result,
            error,
            retries: message.retries,
            updated_at: Utc::now(),
        };
        self.backend.store(&record).await?;

        tracing::debug!(task_id = %message.task_id, from = %current, to = %state, "Task state recorded");
        Ok(Transition::Applied(record))
    }
}
