use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use base64::Engine;
use garde::Validate;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::db::queries;
use crate::models::analysis::{
    AnalyzeAsyncResponse, AnalyzeRequest, AnalyzeResponse, AnalyzeResult, ErrorCode,
    JobResultResponse, JobState,
};
use crate::models::task::JobSubmission;
use crate::services::worker;

/// Validate the request and decode its image, rejecting non-image payloads.
fn decode_image(req: &AnalyzeRequest) -> Result<Vec<u8>, StatusCode> {
    req.validate().map_err(|e| {
        tracing::debug!(error = %e, "Rejected analysis request");
        StatusCode::BAD_REQUEST
    })?;

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(req.image_base64.trim())
        .map_err(|_| StatusCode::BAD_REQUEST)?;

    // Validate image format using the `image` crate
    image::guess_format(&bytes).map_err(|_| StatusCode::UNSUPPORTED_MEDIA_TYPE)?;

    Ok(bytes)
}

/// POST /v1/analyze_async: Queue an image for analysis.
pub async fn submit_analysis(
    State(state): State<AppState>,
    Json(req): Json<AnalyzeRequest>,
) -> Result<(StatusCode, Json<AnalyzeAsyncResponse>), StatusCode> {
    let image = decode_image(&req)?;
    let mut submission = JobSubmission::new(req.request_id, req.image_id, image);
    if let Some(requested_at) = req.requested_at {
        submission.submitted_at = requested_at;
    }

    let response = match state.jobs.submit_job(submission).await {
        Ok(job) => (
            StatusCode::ACCEPTED,
            AnalyzeAsyncResponse {
                response_id: Uuid::new_v4(),
                ok: true,
                task_id: Some(job.task_id),
                queue: Some(job.queue),
                error_code: ErrorCode::None,
                error_message: None,
            },
        ),
        Err(e) => {
            tracing::error!(error = %e, "Failed to submit analysis job");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                AnalyzeAsyncResponse {
                    response_id: Uuid::new_v4(),
                    ok: false,
                    task_id: None,
                    queue: None,
                    error_code: e.code(),
                    error_message: Some("job submission failed".to_string()),
                },
            )
        }
    };

    Ok((response.0, Json(response.1)))
}

/// GET /v1/result_async/{task_id}: Current state and, once finished, the result.
pub async fn get_async_result(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> (StatusCode, Json<JobResultResponse>) {
    match state.jobs.get_job_result(task_id).await {
        Ok(result) => (StatusCode::OK, Json(result.into_response(task_id))),
        Err(e) => {
            let status = match e.code() {
                ErrorCode::NotFound => StatusCode::NOT_FOUND,
                _ => {
                    tracing::error!(task_id = %task_id, error = %e, "Failed to fetch job result");
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            };
            (status, Json(unavailable_result(task_id, e.code())))
        }
    }
}

/// Body for a result lookup that failed. Carries only the code's fixed text.
fn unavailable_result(task_id: Uuid, error_code: ErrorCode) -> JobResultResponse {
    JobResultResponse {
        response_id: Uuid::new_v4(),
        ok: false,
        task_id,
        state: JobState::Pending,
        result: None,
        error_code,
        error_message: error_code.message().map(str::to_string),
    }
}

/// POST /v1/analyze: Analyze in-process and wait for the result.
pub async fn analyze_now(
    State(state): State<AppState>,
    Json(req): Json<AnalyzeRequest>,
) -> Result<(StatusCode, Json<AnalyzeResponse>), StatusCode> {
    let image = decode_image(&req)?;

    let outcome = worker::analyze_and_persist(
        state.pipeline,
        state.repository.as_ref(),
        &req.request_id,
        &req.image_id,
        image,
    )
    .await;

    let response = match outcome {
        Ok(result) => (
            StatusCode::OK,
            AnalyzeResponse {
                response_id: Uuid::new_v4(),
                ok: true,
                result: Some(result),
                error_code: ErrorCode::None,
                error_message: None,
            },
        ),
        Err(e) => {
            tracing::error!(request_id = %req.request_id, error = %e, "Synchronous analysis failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                AnalyzeResponse {
                    response_id: Uuid::new_v4(),
                    ok: false,
                    result: None,
                    error_code: ErrorCode::InternalError,
                    error_message: ErrorCode::InternalError.message().map(str::to_string),
                },
            )
        }
    };

    Ok((response.0, Json(response.1)))
}

/// GET /v1/analyses/{analysis_id}: A stored analysis row.
pub async fn get_analysis(
    State(state): State<AppState>,
    Path(analysis_id): Path<i64>,
) -> Result<Json<AnalyzeResult>, StatusCode> {
    match queries::get_analysis(&state.db, analysis_id).await {
        Ok(Some(stored)) => Ok(Json(stored.into())),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!(analysis_id, error = %e, "Failed to load analysis");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
