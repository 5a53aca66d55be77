use async_trait::async_trait;
use sqlx::PgPool;
use std::sync::Arc;

use crate::db::queries;
use crate::models::analysis::{AnalysisOutput, AnalyzeResult, DetectedObject, RiskLevel};
use crate::services::storage::{self, R2Client, StorageError};

/// Where a stored image ended up.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredImage {
    pub image_ref: i64,
    pub path: String,
    pub sha256: String,
}

/// Image blob + relational storage for finished analyses.
#[async_trait]
pub trait AnalysisRepository: Send + Sync {
    async fn store_image(&self, image_id: &str, bytes: &[u8]) -> Result<StoredImage, PersistError>;

    async fn insert_analysis(
        &self,
        request_id: &str,
        image_ref: i64,
        risk_level: RiskLevel,
        objects: &[DetectedObject],
        caption: &str,
    ) -> Result<i64, PersistError>;
}

/// R2 for image bytes, PostgreSQL for rows.
pub struct PgAnalysisRepository {
    db: PgPool,
    storage: Arc<R2Client>,
}

impl PgAnalysisRepository {
    pub fn new(db: PgPool, storage: Arc<R2Client>) -> Self {
        Self { db, storage }
    }
}

#[async_trait]
impl AnalysisRepository for PgAnalysisRepository {
    async fn store_image(&self, image_id: &str, bytes: &[u8]) -> Result<StoredImage, PersistError> {
        let sha256 = storage::sha256_hex(bytes);
        let path = storage::image_key(image_id, &sha256);

        self.storage
            .upload(&path, bytes, storage::content_type_for(&path))
            .await?;
        let image_ref = queries::insert_image(&self.db, image_id, &path, &sha256).await?;

        Ok(StoredImage {
            image_ref,
            path,
            sha256,
        })
    }

    async fn insert_analysis(
        &self,
        request_id: &str,
        image_ref: i64,
        risk_level: RiskLevel,
        objects: &[DetectedObject],
        caption: &str,
    ) -> Result<i64, PersistError> {
        Ok(queries::insert_analysis(&self.db, request_id, image_ref, risk_level, objects, caption).await?)
    }
}

/// Store the image and its analysis, returning the client-facing result.
pub async fn persist_analysis(
    repository: &dyn AnalysisRepository,
    request_id: &str,
    image_id: &str,
    image_bytes: &[u8],
    output: AnalysisOutput,
) -> Result<AnalyzeResult, PersistError> {
    let image = repository.store_image(image_id, image_bytes).await?;
    let result_id = repository
        .insert_analysis(
            request_id,
            image.image_ref,
            output.risk_level,
            &output.objects,
            &output.caption,
        )
        .await?;

    Ok(AnalyzeResult {
        result_id,
        request_id: request_id.to_string(),
        image_id: image_id.to_string(),
        risk_level: output.risk_level,
        objects: output.objects,
        caption: output.caption,
        image_path: image.path,
        image_sha256: image.sha256,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("Image storage failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}
