use sqlx::PgPool;
use std::sync::Arc;

use crate::services::{
    jobs::JobService,
    persistence::AnalysisRepository,
    pipeline::ExecutionSlot,
    vision::Analyzer,
};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub jobs: JobService,
    pub repository: Arc<dyn AnalysisRepository>,
    pub pipeline: &'static ExecutionSlot<Box<dyn Analyzer>>,
}

impl AppState {
    pub fn new(
        db: PgPool,
        jobs: JobService,
        repository: Arc<dyn AnalysisRepository>,
        pipeline: &'static ExecutionSlot<Box<dyn Analyzer>>,
    ) -> Self {
        Self {
            db,
            jobs,
            repository,
            pipeline,
        }
    }
}
