use uuid::Uuid;

use crate::models::analysis::{AnalyzeResult, ErrorCode, JobResultResponse, JobState};
use crate::models::task::{JobSubmission, TaskState};
use crate::services::lifecycle;
use crate::services::queue::{QueueError, TaskQueue};
use crate::services::router::QueueRouter;

#[derive(Debug, Clone, PartialEq)]
pub struct SubmittedJob {
    pub task_id: Uuid,
    pub queue: String,
}

/// Job outcome as seen by API callers and the poller.
#[derive(Debug, Clone, PartialEq)]
pub struct JobResult {
    pub state: JobState,
    pub result: Option<AnalyzeResult>,
    pub error: Option<String>,
}

impl JobResult {
    fn pending() -> Self {
        Self {
            state: JobState::Pending,
            result: None,
            error: None,
        }
    }

    pub fn into_response(self, task_id: Uuid) -> JobResultResponse {
        let error_code = match self.state {
            JobState::Pending => ErrorCode::Pending,
            JobState::Success => ErrorCode::None,
            JobState::Failure => ErrorCode::InternalError,
        };
        JobResultResponse {
            response_id: Uuid::new_v4(),
            ok: self.state != JobState::Failure,
            task_id,
            state: self.state,
            result: self.result,
            error_code,
            error_message: self.error,
        }
    }
}

/// Submission and result lookup for asynchronous analysis jobs.
#[derive(Clone)]
pub struct JobService {
    queue: TaskQueue,
    router: QueueRouter,
}

impl JobService {
    pub fn new(queue: TaskQueue, router: QueueRouter) -> Self {
        Self { queue, router }
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn router(&self) -> &QueueRouter {
        &self.router
    }

    pub async fn submit_job(&self, submission: JobSubmission) -> Result<SubmittedJob, JobError> {
        let queue = self.router.route(&submission.image_id).to_string();
        let task_id = self
            .queue
            .submit(&queue, &submission)
            .await
            .map_err(JobError::Unavailable)?;

        metrics::counter!("analysis_jobs_submitted_total", "queue" => queue.clone()).increment(1);
        tracing::info!(
            task_id = %task_id,
            queue = %queue,
            request_id = %submission.request_id,
            image_id = %submission.image_id,
            "Analysis job submitted"
        );

        Ok(SubmittedJob { task_id, queue })
    }

    pub async fn get_job_result(&self, task_id: Uuid) -> Result<JobResult, JobError> {
        let record = self
            .queue
            .fetch_record(task_id)
            .await
            .map_err(JobError::Unavailable)?
            .ok_or(JobError::NotFound(task_id))?;

        // Backend states this service does not recognize are neither terminal
        // nor errors, so callers keep treating them as in flight.
        if !lifecycle::is_terminal(record.state) {
            if record.state == TaskState::Unknown {
                tracing::debug!(task_id = %task_id, "Unrecognized backend state reported as pending");
            }
            return Ok(JobResult::pending());
        }

        match self.queue.fetch_result(task_id).await {
            Ok(value) => Ok(JobResult {
                state: JobState::Success,
                result: Some(serde_json::from_value(value).map_err(JobError::CorruptResult)?),
                error: None,
            }),
            Err(QueueError::TaskFailed(message)) => Ok(JobResult {
                state: JobState::Failure,
                result: None,
                error: Some(message),
            }),
            // Record expired between the two reads.
            Err(QueueError::NotReady) => Err(JobError::NotFound(task_id)),
            Err(e) => Err(JobError::Unavailable(e)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job queue unavailable: {0}")]
    Unavailable(#[source] QueueError),

    #[error("Task {0} not found")]
    NotFound(Uuid),

    #[error("Stored task result could not be decoded: {0}")]
    CorruptResult(#[source] serde_json::Error),
}

impl JobError {
    pub fn code(&self) -> ErrorCode {
        match self {
            JobError::NotFound(_) => ErrorCode::NotFound,
            JobError::Unavailable(_) | JobError::CorruptResult(_) => ErrorCode::InternalError,
        }
    }
}
