use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Object classes the analysis pipeline reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DetectedLabel {
    Person,
    Vehicle,
    Fire,
    Smoke,
    Accident,
    Unknown,
}

impl DetectedLabel {
    /// Labels that raise the scene to `high` risk.
    pub fn is_emergency(self) -> bool {
        matches!(self, Self::Fire | Self::Smoke | Self::Accident)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RiskLevel {
    High,
    Normal,
}

impl RiskLevel {
    pub fn from_objects(objects: &[DetectedObject]) -> Self {
        if objects.iter().any(|o| o.label.is_emergency()) {
            RiskLevel::High
        } else {
            RiskLevel::Normal
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedObject {
    pub label: DetectedLabel,
    pub confidence: f64,
    /// Pixel box as `[x1, y1, x2, y2]`.
    pub bbox: Option<[i32; 4]>,
}

/// Output of one analysis run. Stub and model-backed runs share this shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisOutput {
    pub objects: Vec<DetectedObject>,
    pub caption: String,
    pub risk_level: RiskLevel,
}

/// Persisted analysis, returned to clients as the task result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzeResult {
    pub result_id: i64,
    pub request_id: String,
    pub image_id: String,
    pub risk_level: RiskLevel,
    pub objects: Vec<DetectedObject>,
    pub caption: String,
    pub image_path: String,
    pub image_sha256: String,
}

/// Closed error-code set surfaced to API callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    #[default]
    None,
    InternalError,
    NotFound,
    Pending,
}

impl ErrorCode {
    /// Fixed client-facing text for the code. Error details stay in the logs.
    pub fn message(self) -> Option<&'static str> {
        match self {
            ErrorCode::None => None,
            ErrorCode::InternalError => Some("internal error"),
            ErrorCode::NotFound => Some("task not found"),
            ErrorCode::Pending => Some("task is still pending"),
        }
    }
}

/// Client-visible job state. `Pending` covers every non-terminal backend state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Success,
    Failure,
}

/// Request body for both the sync and async analysis endpoints.
#[derive(Debug, Deserialize, Validate)]
pub struct AnalyzeRequest {
    #[garde(length(min = 1, max = 200))]
    pub request_id: String,

    #[garde(length(min = 1, max = 255))]
    pub image_id: String,

    #[garde(length(min = 1))]
    pub image_base64: String,

    #[garde(skip)]
    pub requested_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AnalyzeResponse {
    pub response_id: Uuid,
    pub ok: bool,
    pub result: Option<AnalyzeResult>,
    pub error_code: ErrorCode,
    pub error_message: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AnalyzeAsyncResponse {
    pub response_id: Uuid,
    pub ok: bool,
    pub task_id: Option<Uuid>,
    pub queue: Option<String>,
    pub error_code: ErrorCode,
    pub error_message: Option<String>,
}

/// Body of `GET /v1/result_async/{task_id}`; `state` is the pending discriminant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResultResponse {
    pub response_id: Uuid,
    pub ok: bool,
    pub task_id: Uuid,
    pub state: JobState,
    pub result: Option<AnalyzeResult>,
    pub error_code: ErrorCode,
    pub error_message: Option<String>,
}

impl JobResultResponse {
    pub fn is_pending(&self) -> bool {
        self.state == JobState::Pending
    }
}
