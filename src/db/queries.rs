use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Row};

use crate::models::analysis::{AnalyzeResult, DetectedObject, RiskLevel};

/// Analysis row joined with its image, as read back for clients.
#[derive(Debug, Clone)]
pub struct StoredAnalysis {
    pub analysis_id: i64,
    pub request_id: String,
    pub risk_level: RiskLevel,
    pub objects: Vec<DetectedObject>,
    pub caption: String,
    pub created_at: DateTime<Utc>,
    pub image_id: String,
    pub image_path: String,
    pub image_sha256: String,
}

/// Insert an image row, returning its id
pub async fn insert_image(
    pool: &PgPool,
    image_id: &str,
    path: &str,
    sha256: &str,
) -> Result<i64, sqlx::Error> {
    let row = sqlx::query(
        r#"
        INSERT INTO images (image_id, path, sha256)
        VALUES ($1, $2, $3)
        RETURNING id
        "#,
    )
    .bind(image_id)
    .bind(path)
    .bind(sha256)
    .fetch_one(pool)
    .await?;

    row.try_get("id")
}

/// Insert an analysis row, returning its id
pub async fn insert_analysis(
    pool: &PgPool,
    request_id: &str,
    image_ref_id: i64,
    risk_level: RiskLevel,
    objects: &[DetectedObject],
    caption: &str,
) -> Result<i64, sqlx::Error> {
    let row = sqlx::query(
        r#"
        INSERT INTO analyses (request_id, image_ref_id, risk_level, objects, caption)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING id
        "#,
    )
    .bind(request_id)
    .bind(image_ref_id)
    .bind(risk_level.to_string())
    .bind(Json(objects))
    .bind(caption)
    .fetch_one(pool)
    .await?;

    row.try_get("id")
}

/// Get an analysis by id
fn parse_risk_level(raw: String) -> Result<RiskLevel, sqlx::Error> {
    raw.parse::<RiskLevel>()
        .map_err(|e| sqlx::Error::Decode(format!("risk_level {raw:?}: {e}").into()))
}

pub async fn get_analysis(
    pool: &PgPool,
    analysis_id: i64,
) -> Result<Option<StoredAnalysis>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT a.id, a.request_id, a.risk_level, a.objects, a.caption, a.created_at,
               i.image_id, i.path, i.sha256
        FROM analyses a
        JOIN images i ON i.id = a.image_ref_id
        WHERE a.id = $1
        "#,
    )
    .bind(analysis_id)
    .fetch_optional(pool)
    .await?;

    let Some(r) = row else {
        return Ok(None);
    };

    let risk_level = parse_risk_level(r.try_get("risk_level")?)?;
    let Json(objects): Json<Vec<DetectedObject>> = r.try_get("objects")?;

    Ok(Some(StoredAnalysis {
        analysis_id: r.try_get("id")?,
        request_id: r.try_get("request_id")?,
        risk_level,
        objects,
        caption: r.try_get("caption")?,
        created_at: r.try_get("created_at")?,
        image_id: r.try_get("image_id")?,
        image_path: r.try_get("path")?,
        image_sha256: r.try_get("sha256")?,
    }))
}

impl From<StoredAnalysis> for AnalyzeResult {
    fn from(stored: StoredAnalysis) -> Self {
        AnalyzeResult {
            result_id: stored.analysis_id,
            request_id: stored.request_id,
            image_id: stored.image_id,
            risk_level: stored.risk_level,
            objects: stored.objects,
            caption: stored.caption,
            image_path: stored.image_path,
            image_sha256: stored.image_sha256,
        }
    }
}
