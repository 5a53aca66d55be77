use async_trait::async_trait;
use base64::Engine;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::models::analysis::AnalyzeResult;
use crate::models::event::NotificationEvent;
use crate::models::task::{TaskMessage, TaskState};
use crate::services::lifecycle::{LifecycleTracker, Transition};
use crate::services::persistence::{self, AnalysisRepository, PersistError};
use crate::services::pipeline::{ExecutionSlot, PipelineError};
use crate::services::queue::{Claimed, QueueError, TaskQueue, TransportError};
use crate::services::vision::{AnalyzeError, Analyzer};

/// How long one dequeue waits for work before returning empty-handed.
const POP_TIMEOUT: Duration = Duration::from_secs(1);

/// Pause after an infrastructure error before the next dequeue.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Callback run once after a task's terminal state has been recorded.
#[async_trait]
pub trait CompletionHook: Send + Sync {
    async fn on_terminal(&self, event: &NotificationEvent);
}

/// Decode-analyze-persist for one image, holding the pipeline lock only for the analysis.
pub async fn analyze_and_persist(
    pipeline: &ExecutionSlot<Box<dyn Analyzer>>,
    repository: &dyn AnalysisRepository,
    request_id: &str,
    image_id: &str,
    image: Vec<u8>,
) -> Result<AnalyzeResult, TaskError> {
    let (image, output) = pipeline
        .with_pipeline(move |analyzer| {
            Box::pin(async move {
                let output = analyzer.analyze(&image).await;
                (image, output)
            })
        })
        .await?;
    let output = output?;

    Ok(persistence::persist_analysis(repository, request_id, image_id, &image, output).await?)
}

/// Pulls tasks from its queues in priority order and executes them one at a time.
pub struct Worker {
    queue: TaskQueue,
    tracker: LifecycleTracker,
    queues: Vec<String>,
    pipeline: &'static ExecutionSlot<Box<dyn Analyzer>>,
    repository: Arc<dyn AnalysisRepository>,
    hooks: Vec<Arc<dyn CompletionHook>>,
    max_retries: u32,
    pop_timeout: Duration,
}

impl Worker {
    pub fn new(
        queue: TaskQueue,
        queues: Vec<String>,
        pipeline: &'static ExecutionSlot<Box<dyn Analyzer>>,
        repository: Arc<dyn AnalysisRepository>,
        max_retries: u32,
    ) -> Self {
        let tracker = LifecycleTracker::new(queue.backend());
        Self {
            queue,
            tracker,
            queues,
            pipeline,
            repository,
            hooks: Vec::new(),
            max_retries,
            pop_timeout: POP_TIMEOUT,
        }
    }

    pub fn with_pop_timeout(mut self, timeout: Duration) -> Self {
        self.pop_timeout = timeout;
        self
    }

    /// Register a hook for terminal transitions. Done once at startup.
    pub fn on_terminal(&mut self, hook: Arc<dyn CompletionHook>) {
        self.hooks.push(hook);
    }

    /// Process jobs until the surrounding task is cancelled.
    pub async fn run(&self) {
        tracing::info!(queues = ?self.queues, "Worker ready, starting job processing loop");
        loop {
            match self.process_next().await {
                Ok(true) => tracing::debug!("Job processed, checking for next job"),
                Ok(false) => tracing::trace!("No jobs available"),
                Err(e) => {
                    tracing::error!(error = %e, "Error processing job, will retry");
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
        }
    }

    /// Process the next job from the queues.
    /// Returns Ok(true) if a job was handled, Ok(false) if none arrived in time.
    ///
    /// The claimed message is acknowledged only after its outcome is recorded.
    /// If recording fails it goes back on its queue and the error is returned.
    pub async fn process_next(&self) -> Result<bool, WorkerError> {
        let Some(claimed) = self.queue.dequeue(&self.queues, self.pop_timeout).await? else {
            return Ok(false);
        };

        match self.handle(&claimed.message).await {
            Ok(()) => {
                self.queue.ack(&claimed).await?;
                Ok(true)
            }
            Err(e) => {
                self.release(&claimed).await;
                Err(e)
            }
        }
    }

    /// Startup sweep for tasks a previous run claimed but never acknowledged.
    pub async fn recover(&self) -> Result<u64, WorkerError> {
        let moved = self.queue.recover(&self.queues).await?;
        if moved > 0 {
            tracing::warn!(count = moved, "Requeued tasks left in flight by a previous worker");
        }
        Ok(moved)
    }

    async fn release(&self, claimed: &Claimed) {
        if let Err(e) = self.queue.release(claimed).await {
            tracing::error!(
                task_id = %claimed.message.task_id,
                error = %e,
                "Failed to release task; it stays in flight until the next recovery"
            );
        }
    }

    async fn handle(&self, message: &TaskMessage) -> Result<(), WorkerError> {
        tracing::info!(
            task_id = %message.task_id,
            queue = %message.queue,
            image_id = %message.image_id,
            retries = message.retries,
            "Processing analysis task"
        );

        // Non-terminal records accept RECEIVED again, so a redelivery resumes.
        if let Transition::Rejected { current } =
            self.tracker.record(message, TaskState::Received, None, None).await?
        {
            tracing::warn!(task_id = %message.task_id, state = %current, "Skipping redelivered task");
            return Ok(());
        }
        self.tracker.record(message, TaskState::Started, None, None).await?;

        let started = Instant::now();
        let outcome = match AssertUnwindSafe(self.execute(message)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => Err(TaskError::Panicked(panic_message(panic))),
        };
        metrics::histogram!("analysis_processing_seconds").record(started.elapsed().as_secs_f64());

        match outcome {
            Ok(result) => {
                let value = serde_json::to_value(&result)?;
                let transition = self
                    .tracker
                    .record(message, TaskState::Success, Some(value), None)
                    .await?;

                metrics::counter!("analysis_jobs_completed_total").increment(1);
                tracing::info!(
                    task_id = %message.task_id,
                    risk_level = %result.risk_level,
                    objects = result.objects.len(),
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Job completed successfully"
                );

                if matches!(transition, Transition::Applied(_)) {
                    self.fire(NotificationEvent::success(message.task_id)).await;
                }
            }
            Err(e) if e.is_transient() && message.retries < self.max_retries => {
                self.tracker
                    .record(message, TaskState::Retry, None, Some(e.to_string()))
                    .await?;

                let mut retry = message.clone();
                retry.retries += 1;
                self.queue.requeue(&retry).await?;

                metrics::counter!("analysis_jobs_retried_total").increment(1);
                tracing::info!(
                    task_id = %message.task_id,
                    retry_count = retry.retries,
                    error = %e,
                    "Job re-queued for retry"
                );
            }
            Err(e) => {
                let error = e.to_string();
                let transition = self
                    .tracker
                    .record(message, TaskState::Failure, None, Some(error.clone()))
                    .await?;

                metrics::counter!("analysis_jobs_failed_total").increment(1);
                tracing::warn!(
                    task_id = %message.task_id,
                    retry_count = message.retries,
                    error = %error,
                    "Job failed"
                );

                if matches!(transition, Transition::Applied(_)) {
                    self.fire(NotificationEvent::failure(message.task_id, error)).await;
                }
            }
        }

        Ok(())
    }

    async fn execute(&self, message: &TaskMessage) -> Result<AnalyzeResult, TaskError> {
        let image = base64::engine::general_purpose::STANDARD.decode(&message.image_b64)?;
        analyze_and_persist(
            self.pipeline,
            self.repository.as_ref(),
            &message.request_id,
            &message.image_id,
            image,
        )
        .await
    }

    async fn fire(&self, event: NotificationEvent) {
        for hook in &self.hooks {
            hook.on_terminal(&event).await;
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Why a single task did not produce a result.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Invalid image payload: {0}")]
    Payload(#[from] base64::DecodeError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Analyze(#[from] AnalyzeError),

    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error("Analysis panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    pub fn is_transient(&self) -> bool {
        match self {
            TaskError::Analyze(e) => e.is_transient(),
            TaskError::Persist(_) => true,
            TaskError::Payload(_) | TaskError::Pipeline(_) | TaskError::Panicked(_) => false,
        }
    }
}

/// Infrastructure failure that prevented a task from being handled at all.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Result backend error: {0}")]
    Backend(#[from] TransportError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
