use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub database: ComponentHealth,
    pub broker: ComponentHealth,
    pub pipeline: ComponentHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
}

impl ComponentHealth {
    fn ok(latency_ms: Option<u64>) -> Self {
        Self {
            status: "ok".to_string(),
            latency_ms,
        }
    }

    fn error() -> Self {
        Self {
            status: "error".to_string(),
            latency_ms: None,
        }
    }
}

/// GET /health: health check with dependency status.
pub async fn health_check(
    State(state): State<AppState>,
) -> (StatusCode, Json<HealthResponse>) {
    let start = std::time::Instant::now();

    // Check database connectivity
    let db_check = match sqlx::query("SELECT 1").execute(&state.db).await {
        Ok(_) => ComponentHealth::ok(Some(start.elapsed().as_millis() as u64)),
        Err(_) => ComponentHealth::error(),
    };

    // Check broker connectivity
    let broker_start = std::time::Instant::now();
    let broker_check = match state.jobs.queue().health_check().await {
        Ok(_) => ComponentHealth::ok(Some(broker_start.elapsed().as_millis() as u64)),
        Err(_) => ComponentHealth::error(),
    };

    for queue in state.jobs.router().priority_order() {
        if let Ok(depth) = state.jobs.queue().queue_depth(&queue).await {
            metrics::gauge!("analysis_queue_depth", "queue" => queue).set(depth as f64);
        }
    }

    let pipeline_check = if state.pipeline.is_initialized() {
        ComponentHealth::ok(None)
    } else {
        ComponentHealth::error()
    };

    let all_healthy = [&db_check, &broker_check, &pipeline_check]
        .iter()
        .all(|c| c.status == "ok");
    let status_code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if all_healthy {
            "ok".to_string()
        } else {
            "degraded".to_string()
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks {
            database: db_check,
            broker: broker_check,
            pipeline: pipeline_check,
        },
    };

    (status_code, Json(response))
}
