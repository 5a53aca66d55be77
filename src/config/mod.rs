use serde::Deserialize;
use std::time::Duration;

use crate::services::poller::PollPolicy;
use crate::services::router::QueueRouter;
use crate::services::vision::{VisionPipeline, WorkersAiClient};

/// Configuration shared by the API server and the worker.
#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:8000"). Unused by workers.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for the task broker
    #[serde(default = "default_broker_url")]
    pub broker_url: String,

    /// Redis connection string for task state and the completion channel
    #[serde(default = "default_result_backend_url")]
    pub result_backend_url: String,

    #[serde(default = "default_queue")]
    pub default_queue: String,

    #[serde(default = "default_emergency_queue")]
    pub emergency_queue: String,

    /// Pub/sub channel for completion events
    #[serde(default = "default_events_channel")]
    pub events_channel: String,

    /// Expiry of task records in the result backend
    #[serde(default = "default_result_ttl_secs")]
    pub result_ttl_secs: u64,

    /// Redispatch bound for transient task failures
    #[serde(default = "default_task_max_retries")]
    pub task_max_retries: u32,

    /// R2 bucket name for stored images
    pub r2_bucket: String,

    /// R2 access key ID (S3-compatible)
    pub r2_access_key: String,

    /// R2 secret access key (S3-compatible)
    pub r2_secret_key: String,

    /// R2 endpoint URL
    pub r2_endpoint: String,

    /// Cloudflare account ID. Without it the pipeline runs in stub mode.
    pub cf_account_id: Option<String>,

    /// Cloudflare Workers AI API token
    pub cf_api_token: Option<String>,

    #[serde(default = "default_true")]
    pub use_detector: bool,

    #[serde(default = "default_true")]
    pub use_captioner: bool,
}

/// Configuration for the completion monitor.
#[derive(Debug, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_result_backend_url")]
    pub result_backend_url: String,

    #[serde(default = "default_events_channel")]
    pub events_channel: String,

    /// Base URL of the API serving `/v1/result_async/{task_id}`
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    #[serde(default = "default_fetch_max_attempts")]
    pub fetch_max_attempts: u32,

    #[serde(default = "default_fetch_base_delay_ms")]
    pub fetch_base_delay_ms: u64,

    #[serde(default = "default_fetch_max_delay_ms")]
    pub fetch_max_delay_ms: u64,

    #[serde(default = "default_fetch_backoff_factor")]
    pub fetch_backoff_factor: f64,

    /// Per-request timeout for result fetches
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_broker_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}

fn default_result_backend_url() -> String {
    "redis://127.0.0.1:6379/1".to_string()
}

fn default_queue() -> String {
    crate::services::router::DEFAULT_QUEUE.to_string()
}

fn default_emergency_queue() -> String {
    crate::services::router::EMERGENCY_QUEUE.to_string()
}

fn default_events_channel() -> String {
    "analysis:done".to_string()
}

fn default_result_ttl_secs() -> u64 {
    86_400
}

fn default_task_max_retries() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_api_base_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_fetch_max_attempts() -> u32 {
    30
}

fn default_fetch_base_delay_ms() -> u64 {
    200
}

fn default_fetch_max_delay_ms() -> u64 {
    2_000
}

fn default_fetch_backoff_factor() -> f64 {
    1.5
}

fn default_fetch_timeout_ms() -> u64 {
    3_000
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn queue_router(&self) -> QueueRouter {
        QueueRouter::new(&self.default_queue, &self.emergency_queue)
    }

    /// Remote models need both Cloudflare credentials; otherwise the stub runs.
    pub fn vision_pipeline(&self) -> VisionPipeline {
        let remote = match (&self.cf_account_id, &self.cf_api_token) {
            (Some(account), Some(token)) => {
                Some(WorkersAiClient::new(account.clone(), token.clone()))
            }
            _ => None,
        };
        VisionPipeline::new(remote, self.use_detector, self.use_captioner)
    }
}

impl MonitorConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            max_attempts: self.fetch_max_attempts,
            base_delay: Duration::from_millis(self.fetch_base_delay_ms),
            max_delay: Duration::from_millis(self.fetch_max_delay_ms),
            factor: self.fetch_backoff_factor,
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::vision::PipelineMode;

    #[test]
    fn test_monitor_defaults() {
        let config: MonitorConfig = envy::from_iter(Vec::<(String, String)>::new()).unwrap();
        let policy = config.poll_policy();

        assert_eq!(config.events_channel, "analysis:done");
        assert_eq!(policy.max_attempts, 30);
        assert_eq!(policy.base_delay, Duration::from_millis(200));
        assert_eq!(policy.max_delay, Duration::from_secs(2));
    }

    #[test]
    fn test_app_config_requires_database_url() {
        let vars = vec![
            ("R2_BUCKET".to_string(), "images".to_string()),
            ("R2_ACCESS_KEY".to_string(), "key".to_string()),
            ("R2_SECRET_KEY".to_string(), "secret".to_string()),
            ("R2_ENDPOINT".to_string(), "http://localhost:9000".to_string()),
        ];
        assert!(envy::from_iter::<_, AppConfig>(vars).is_err());
    }

    #[test]
    fn test_app_config_queue_defaults() {
        let vars = vec![
            ("DATABASE_URL".to_string(), "postgres://localhost/twin".to_string()),
            ("R2_BUCKET".to_string(), "images".to_string()),
            ("R2_ACCESS_KEY".to_string(), "key".to_string()),
            ("R2_SECRET_KEY".to_string(), "secret".to_string()),
            ("R2_ENDPOINT".to_string(), "http://localhost:9000".to_string()),
        ];
        let config: AppConfig = envy::from_iter(vars).unwrap();

        assert_eq!(config.default_queue, "analyze.default");
        assert_eq!(config.emergency_queue, "analyze.emergency");
        assert_eq!(config.task_max_retries, 3);
        assert!(config.cf_account_id.is_none());
        assert!(config.use_detector);
        assert_eq!(config.queue_router().route("emergency_gate.jpg"), "analyze.emergency");
    }

    #[test]
    fn test_pipeline_stubbed_without_both_credentials() {
        let vars = vec![
            ("DATABASE_URL".to_string(), "postgres://localhost/twin".to_string()),
            ("R2_BUCKET".to_string(), "images".to_string()),
            ("R2_ACCESS_KEY".to_string(), "key".to_string()),
            ("R2_SECRET_KEY".to_string(), "secret".to_string()),
            ("R2_ENDPOINT".to_string(), "http://localhost:9000".to_string()),
            ("CF_ACCOUNT_ID".to_string(), "acct".to_string()),
        ];
        let config: AppConfig = envy::from_iter(vars).unwrap();

        assert_eq!(config.vision_pipeline().mode(), PipelineMode::Stub);
    }
}
