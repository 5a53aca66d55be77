//! In-process doubles for the broker, pipeline, storage and result API

#![allow(dead_code)]

use async_trait::async_trait;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use uuid::Uuid;

use twin_analysis::models::analysis::{
    AnalysisOutput, DetectedLabel, DetectedObject, ErrorCode, JobResultResponse, JobState,
    RiskLevel,
};
use twin_analysis::models::event::NotificationEvent;
use twin_analysis::models::task::{TaskRecord, TaskState};
use twin_analysis::services::jobs::{JobError, JobService};
use twin_analysis::services::notifier::{EventPublisher, PublishError};
use twin_analysis::services::persistence::{AnalysisRepository, PersistError, StoredImage};
use twin_analysis::services::pipeline::ExecutionSlot;
use twin_analysis::services::poller::{FetchError, ResultFetcher};
use twin_analysis::services::queue::{MemoryTransport, ResultBackend, TaskQueue, TransportError};
use twin_analysis::services::router::QueueRouter;
use twin_analysis::services::vision::{AnalyzeError, Analyzer};

/// Small valid PNG for payloads that must decode as an image.
pub fn tiny_png() -> Vec<u8> {
    let picture = image::DynamicImage::ImageRgb8(image::RgbImage::new(8, 8));
    let mut bytes = Vec::new();
    picture
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .unwrap();
    bytes
}

/// Job service over a fresh in-memory broker and result backend.
pub fn memory_jobs() -> (Arc<MemoryTransport>, JobService) {
    let transport = Arc::new(MemoryTransport::new());
    let queue = TaskQueue::new(transport.clone(), transport.clone());
    (transport, JobService::new(queue, QueueRouter::default()))
}

/// A pipeline slot private to one test.
pub fn leaked_slot(analyzer: impl Analyzer + 'static) -> &'static ExecutionSlot<Box<dyn Analyzer>> {
    let slot: &'static ExecutionSlot<Box<dyn Analyzer>> = Box::leak(Box::new(ExecutionSlot::new()));
    slot.init_once(|| Box::new(analyzer) as Box<dyn Analyzer>);
    slot
}

pub fn person_output() -> AnalysisOutput {
    let objects = vec![DetectedObject {
        label: DetectedLabel::Person,
        confidence: 0.91,
        bbox: Some([10, 12, 40, 60]),
    }];
    AnalysisOutput {
        risk_level: RiskLevel::from_objects(&objects),
        objects,
        caption: "a person standing in a lobby".to_string(),
    }
}

/// Analyzer that succeeds every call, or fails every call with `boom`.
pub struct ScriptedAnalyzer {
    fail: bool,
    pub calls: Arc<AtomicUsize>,
}

impl ScriptedAnalyzer {
    pub fn succeeding() -> Self {
        Self {
            fail: false,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::succeeding()
        }
    }
}

#[async_trait]
impl Analyzer for ScriptedAnalyzer {
    async fn analyze(&mut self, _image: &[u8]) -> Result<AnalysisOutput, AnalyzeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(AnalyzeError::Model("boom".to_string()));
        }
        Ok(person_output())
    }
}

/// Analyzer that panics on every call.
pub struct PanickingAnalyzer;

#[async_trait]
impl Analyzer for PanickingAnalyzer {
    async fn analyze(&mut self, _image: &[u8]) -> Result<AnalysisOutput, AnalyzeError> {
        panic!("camera feed corrupted");
    }
}

/// Repository keeping rows in memory; the first `fail_inserts` inserts fail.
#[derive(Default)]
pub struct MemoryRepository {
    next_id: AtomicI64,
    fail_inserts: AtomicUsize,
    pub analyses: Mutex<Vec<(String, i64, RiskLevel)>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_first(inserts: usize) -> Self {
        let repo = Self::default();
        repo.fail_inserts.store(inserts, Ordering::SeqCst);
        repo
    }

    pub fn stored(&self) -> usize {
        self.analyses.lock().unwrap().len()
    }
}

#[async_trait]
impl AnalysisRepository for MemoryRepository {
    async fn store_image(&self, image_id: &str, bytes: &[u8]) -> Result<StoredImage, PersistError> {
        let sha256 = twin_analysis::services::storage::sha256_hex(bytes);
        Ok(StoredImage {
            image_ref: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            path: twin_analysis::services::storage::image_key(image_id, &sha256),
            sha256,
        })
    }

    async fn insert_analysis(
        &self,
        request_id: &str,
        image_ref: i64,
        risk_level: RiskLevel,
        _objects: &[DetectedObject],
        _caption: &str,
    ) -> Result<i64, PersistError> {
        let failed = self
            .fail_inserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(PersistError::Database(sqlx::Error::PoolTimedOut));
        }

        let mut analyses = self.analyses.lock().unwrap();
        analyses.push((request_id.to_string(), image_ref, risk_level));
        Ok(analyses.len() as i64)
    }
}

/// Publisher that keeps every payload it is handed.
#[derive(Default)]
pub struct RecordingPublisher {
    pub published: Mutex<Vec<(String, String)>>,
}

impl RecordingPublisher {
    pub fn events(&self) -> Vec<NotificationEvent> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(_, payload)| serde_json::from_str(payload).unwrap())
            .collect()
    }

}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), PublishError> {
        self.published
            .lock()
            .unwrap()
            .push((channel.to_string(), payload.to_string()));
        Ok(())
    }
}

/// Publisher whose broker is always down.
pub struct UnreachablePublisher;

#[async_trait]
impl EventPublisher for UnreachablePublisher {
    async fn publish(&self, _channel: &str, _payload: &str) -> Result<(), PublishError> {
        Err(PublishError::Redis(redis::RedisError::from((
            redis::ErrorKind::IoError,
            "connection refused",
        ))))
    }
}

/// Result backend over the memory transport whose first SUCCESS write fails.
pub struct FlakyBackend {
    inner: Arc<MemoryTransport>,
    failed_once: AtomicBool,
}

#[async_trait]
impl ResultBackend for FlakyBackend {
    async fn load(&self, task_id: Uuid) -> Result<Option<TaskRecord>, TransportError> {
        self.inner.load(task_id).await
    }

    async fn store(&self, record: &TaskRecord) -> Result<(), TransportError> {
        if record.state == TaskState::Success && !self.failed_once.swap(true, Ordering::SeqCst) {
            return Err(TransportError::Redis(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "connection reset",
            ))));
        }
        self.inner.store(record).await
    }
}

/// Job service whose result backend drops the first SUCCESS write.
pub fn flaky_jobs() -> (Arc<MemoryTransport>, JobService) {
    let transport = Arc::new(MemoryTransport::new());
    let backend = Arc::new(FlakyBackend {
        inner: transport.clone(),
        failed_once: AtomicBool::new(false),
    });
    let queue = TaskQueue::new(transport.clone(), backend);
    (transport, JobService::new(queue, QueueRouter::default()))
}

pub fn pending_response(task_id: Uuid) -> JobResultResponse {
    JobResultResponse {
        response_id: Uuid::new_v4(),
        ok: true,
        task_id,
        state: JobState::Pending,
        result: None,
        error_code: ErrorCode::Pending,
        error_message: None,
    }
}

/// Answers `pending` for the first `lag` calls, then asks the job service.
pub struct LaggingFetcher {
    jobs: Option<JobService>,
    lag: usize,
    pub calls: Mutex<Vec<Instant>>,
}

impl LaggingFetcher {
    pub fn new(jobs: JobService, lag: usize) -> Self {
        Self {
            jobs: Some(jobs),
            lag,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Never leaves `pending`.
    pub fn always_pending() -> Self {
        Self {
            jobs: None,
            lag: usize::MAX,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResultFetcher for LaggingFetcher {
    async fn fetch(&self, task_id: Uuid) -> Result<JobResultResponse, FetchError> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(Instant::now());
            calls.len()
        };

        let jobs = match &self.jobs {
            Some(jobs) if call > self.lag => jobs,
            _ => return Ok(pending_response(task_id)),
        };
        match jobs.get_job_result(task_id).await {
            Ok(result) => Ok(result.into_response(task_id)),
            Err(JobError::NotFound(_)) => Err(FetchError::Status(reqwest::StatusCode::NOT_FOUND)),
            Err(_) => Err(FetchError::Status(reqwest::StatusCode::INTERNAL_SERVER_ERROR)),
        }
    }
}
