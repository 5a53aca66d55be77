//! Client-side resolution of completed tasks.
//!
//! The completion event can arrive before the result backend serves the
//! finished record, so a `SUCCESS` event is followed by a bounded poll of the
//! result-fetch endpoint with exponential backoff.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::models::analysis::JobResultResponse;
use crate::models::event::{EventStatus, NotificationEvent};

/// Attempt bound and delay schedule for result polling.
#[derive(Debug, Clone, PartialEq)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 1.5,
        }
    }
}

impl PollPolicy {
    pub fn delays(&self) -> Backoff {
        Backoff {
            next: self.base_delay.min(self.max_delay),
            max: self.max_delay,
            factor: self.factor,
        }
    }
}

/// Endless delay sequence: `base, base*f, base*f^2, ...` capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
    factor: f64,
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let current = self.next;
        let grown = (current.as_nanos() as f64 * self.factor.max(1.0)).round();
        self.next = Duration::from_nanos(grown as u64).min(self.max);
        Some(current)
    }
}

#[async_trait]
pub trait ResultFetcher: Send + Sync {
    async fn fetch(&self, task_id: Uuid) -> Result<JobResultResponse, FetchError>;
}

/// Fetches results from the API's `/v1/result_async/{task_id}` endpoint.
pub struct HttpResultFetcher {
    http: Client,
    base_url: String,
}

impl HttpResultFetcher {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, FetchError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ResultFetcher for HttpResultFetcher {
    async fn fetch(&self, task_id: Uuid) -> Result<JobResultResponse, FetchError> {
        let url = format!("{}/v1/result_async/{}", self.base_url, task_id);
        let response = self.http.get(&url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status));
        }
        Ok(response.json().await?)
    }
}

#[derive(Debug)]
pub enum PollOutcome {
    /// A non-pending answer arrived.
    Resolved {
        response: JobResultResponse,
        attempts: u32,
    },
    /// Attempts ran out while the result was still pending or unreachable.
    TimedOut { attempts: u32 },
    /// The event reported a failed task; nothing was fetched.
    TaskFailed { error: Option<String> },
}

pub struct ResultPoller {
    fetcher: Arc<dyn ResultFetcher>,
    policy: PollPolicy,
}

impl ResultPoller {
    pub fn new(fetcher: Arc<dyn ResultFetcher>, policy: PollPolicy) -> Self {
        Self { fetcher, policy }
    }

    /// React to one completion event.
    pub async fn handle_event(&self, event: &NotificationEvent) -> PollOutcome {
        tracing::info!(
            task_id = %event.task_id,
            status = %event.status,
            ok = event.ok,
            error = ?event.error,
            "Task done"
        );

        match event.status {
            EventStatus::Success => self.poll(event.task_id).await,
            EventStatus::Failure => {
                metrics::counter!("result_poll_failures_observed_total").increment(1);
                tracing::warn!(task_id = %event.task_id, error = ?event.error, "Task failed");
                PollOutcome::TaskFailed {
                    error: event.error.clone(),
                }
            }
        }
    }

    /// Fetch until a non-pending answer arrives or attempts are exhausted.
    pub async fn poll(&self, task_id: Uuid) -> PollOutcome {
        let max_attempts = self.policy.max_attempts;
        let mut delays = self.policy.delays();

        for attempt in 1..=max_attempts {
            match self.fetcher.fetch(task_id).await {
                Ok(response) if !response.is_pending() => {
                    metrics::counter!("result_poll_resolved_total").increment(1);
                    tracing::info!(
                        task_id = %task_id,
                        attempt,
                        state = ?response.state,
                        risk_level = ?response.result.as_ref().map(|r| r.risk_level),
                        caption = ?response.result.as_ref().map(|r| r.caption.as_str()),
                        "Fetched task result"
                    );
                    return PollOutcome::Resolved {
                        response,
                        attempts: attempt,
                    };
                }
                Ok(_) => {
                    tracing::info!(task_id = %task_id, attempt, max_attempts, "Result still pending");
                }
                Err(e) => {
                    tracing::warn!(
                        task_id = %task_id,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Result fetch failed"
                    );
                }
            }

            if attempt < max_attempts {
                let delay = delays.next().unwrap_or(self.policy.max_delay);
                tokio::time::sleep(delay).await;
            }
        }

        metrics::counter!("result_poll_timeouts_total").increment(1);
        tracing::error!(task_id = %task_id, attempts = max_attempts, "Result fetch timed out");
        PollOutcome::TimedOut {
            attempts: max_attempts,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Result request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Result endpoint returned {0}")]
    Status(StatusCode),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::analysis::{ErrorCode, JobState};

    fn response(task_id: Uuid, state: JobState) -> JobResultResponse {
        JobResultResponse {
            response_id: Uuid::new_v4(),
            ok: state != JobState::Failure,
            task_id,
            state,
            result: None,
            error_code: match state {
                JobState::Pending => ErrorCode::Pending,
                JobState::Success => ErrorCode::None,
                JobState::Failure => ErrorCode::InternalError,
            },
            error_message: None,
        }
    }

    struct Flaky {
        failures: std::sync::Mutex<u32>,
    }

    #[async_trait]
    impl ResultFetcher for Flaky {
        async fn fetch(&self, task_id: Uuid) -> Result<JobResultResponse, FetchError> {
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(FetchError::Status(StatusCode::BAD_GATEWAY));
            }
            Ok(response(task_id, JobState::Success))
        }
    }

    #[test]
    fn test_backoff_schedule_grows_then_caps() {
        let delays: Vec<u64> = PollPolicy::default()
            .delays()
            .take(9)
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![200, 300, 450, 675, 1012, 1518, 2000, 2000, 2000]);
    }

    #[test]
    fn test_backoff_base_above_cap_starts_at_cap() {
        let policy = PollPolicy {
            base_delay: Duration::from_secs(5),
            ..PollPolicy::default()
        };
        assert_eq!(policy.delays().next(), Some(Duration::from_secs(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_errors_count_as_attempts() {
        let fetcher = Arc::new(Flaky {
            failures: std::sync::Mutex::new(2),
        });
        let poller = ResultPoller::new(fetcher, PollPolicy::default());

        match poller.poll(Uuid::new_v4()).await {
            PollOutcome::Resolved { attempts, response } => {
                assert_eq!(attempts, 3);
                assert_eq!(response.state, JobState::Success);
            }
            other => panic!("expected Resolved, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolved_failure_state_stops_polling() {
        struct Failed;

        #[async_trait]
        impl ResultFetcher for Failed {
            async fn fetch(&self, task_id: Uuid) -> Result<JobResultResponse, FetchError> {
                Ok(response(task_id, JobState::Failure))
            }
        }

        let poller = ResultPoller::new(Arc::new(Failed), PollPolicy::default());
        assert!(matches!(
            poller.poll(Uuid::new_v4()).await,
            PollOutcome::Resolved { attempts: 1, .. }
        ));
    }
}
