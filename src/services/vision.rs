use async_trait::async_trait;
use image::{DynamicImage, GenericImageView, ImageFormat};
use reqwest::Client;
use serde::Deserialize;
use std::io::Cursor;

use crate::models::analysis::{AnalysisOutput, DetectedLabel, DetectedObject, RiskLevel};

const DETECTION_MODEL: &str = "@cf/facebook/detr-resnet-50";
const CAPTION_MODEL: &str = "@cf/llava-hf/llava-1.5-7b-hf";

/// Detections below this score are dropped.
const MIN_DETECTION_SCORE: f64 = 0.25;

pub const STUB_CAPTION: &str = "stub caption: models not installed.";

/// Opaque image analysis routine run under the execution slot.
#[async_trait]
pub trait Analyzer: Send {
    async fn analyze(&mut self, image: &[u8]) -> Result<AnalysisOutput, AnalyzeError>;
}

/// Client for Cloudflare Workers AI detection and captioning models.
pub struct WorkersAiClient {
    http: Client,
    account_id: String,
    api_token: String,
}

#[derive(Deserialize)]
struct DetectionResponse {
    result: Vec<Detection>,
}

#[derive(Deserialize)]
struct Detection {
    score: f64,
    label: String,
    #[serde(rename = "box")]
    bbox: DetectionBox,
}

#[derive(Deserialize)]
struct DetectionBox {
    xmin: f64,
    ymin: f64,
    xmax: f64,
    ymax: f64,
}

#[derive(Deserialize)]
struct LlavaResponse {
    result: LlavaResult,
}

#[derive(Deserialize)]
struct LlavaResult {
    description: String,
}

impl WorkersAiClient {
    pub fn new(account_id: String, api_token: String) -> Self {
        Self {
            http: Client::new(),
            account_id,
            api_token,
        }
    }

    fn model_url(&self, model: &str) -> String {
        format!(
            "https://api.cloudflare.com/client/v4/accounts/{}/ai/run/{}",
            self.account_id, model
        )
    }

    /// Run object detection and map the COCO classes onto our labels.
    pub async fn detect_objects(&self, image_bytes: &[u8]) -> Result<Vec<DetectedObject>, AnalyzeError> {
        let request_body = serde_json::json!({ "image": image_bytes });

        let response: DetectionResponse = self
            .http
            .post(self.model_url(DETECTION_MODEL))
            .bearer_auth(&self.api_token)
            .json(&request_body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(response
            .result
            .into_iter()
            .filter(|d| d.score >= MIN_DETECTION_SCORE)
            .map(|d| DetectedObject {
                label: map_coco_label(&d.label),
                confidence: d.score.clamp(0.0, 1.0),
                bbox: Some([
                    d.bbox.xmin as i32,
                    d.bbox.ymin as i32,
                    d.bbox.xmax as i32,
                    d.bbox.ymax as i32,
                ]),
            })
            .collect())
    }

    /// Describe the scene in a short sentence.
    pub async fn caption(&self, image_bytes: &[u8]) -> Result<String, AnalyzeError> {
        let request_body = serde_json::json!({
            "image": image_bytes,
            "prompt": "Describe this surveillance camera image in one short sentence.",
            "max_tokens": 40
        });

        let response: LlavaResponse = self
            .http
            .post(self.model_url(CAPTION_MODEL))
            .bearer_auth(&self.api_token)
            .json(&request_body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(response.result.description.trim().to_string())
    }
}

fn map_coco_label(label: &str) -> DetectedLabel {
    match label {
        "person" => DetectedLabel::Person,
        "car" | "motorcycle" | "bus" | "truck" => DetectedLabel::Vehicle,
        _ => DetectedLabel::Unknown,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineMode {
    Remote,
    Stub,
}

/// Detection, crop-to-best-box captioning and risk scoring.
///
/// Either model falls back to its stub when no client is configured or it is
/// disabled; the output shape is the same in both modes.
pub struct VisionPipeline {
    remote: Option<WorkersAiClient>,
    use_detector: bool,
    use_captioner: bool,
}

impl VisionPipeline {
    pub fn new(remote: Option<WorkersAiClient>, use_detector: bool, use_captioner: bool) -> Self {
        Self {
            remote,
            use_detector,
            use_captioner,
        }
    }

    pub fn stub() -> Self {
        Self::new(None, false, false)
    }

    pub fn mode(&self) -> PipelineMode {
        if self.remote.is_some() && (self.use_detector || self.use_captioner) {
            PipelineMode::Remote
        } else {
            PipelineMode::Stub
        }
    }

    fn detector(&self) -> Option<&WorkersAiClient> {
        self.remote.as_ref().filter(|_| self.use_detector)
    }

    fn captioner(&self) -> Option<&WorkersAiClient> {
        self.remote.as_ref().filter(|_| self.use_captioner)
    }
}

#[async_trait]
impl Analyzer for VisionPipeline {
    async fn analyze(&mut self, image_bytes: &[u8]) -> Result<AnalysisOutput, AnalyzeError> {
        let picture = image::load_from_memory(image_bytes)?;

        let objects = match self.detector() {
            Some(client) => client.detect_objects(image_bytes).await?,
            None => stub_objects(&picture),
        };

        let caption = match self.captioner() {
            Some(client) => {
                let crop = crop_best(&picture, &objects);
                client.caption(&encode_png(&crop)?).await?
            }
            None => STUB_CAPTION.to_string(),
        };

        let risk_level = RiskLevel::from_objects(&objects);
        Ok(AnalysisOutput {
            objects,
            caption,
            risk_level,
        })
    }
}

fn stub_objects(picture: &DynamicImage) -> Vec<DetectedObject> {
    let (width, height) = picture.dimensions();
    vec![DetectedObject {
        label: DetectedLabel::Unknown,
        confidence: 0.5,
        bbox: Some([0, 0, width.min(100) as i32, height.min(100) as i32]),
    }]
}

/// Crop to the most confident box, or return the whole image if no usable box exists.
fn crop_best(picture: &DynamicImage, objects: &[DetectedObject]) -> DynamicImage {
    let best = objects
        .iter()
        .filter(|o| o.bbox.is_some())
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence));

    let Some([x1, y1, x2, y2]) = best.and_then(|o| o.bbox) else {
        return picture.clone();
    };

    let (width, height) = picture.dimensions();
    let x1 = x1.max(0) as u32;
    let y1 = y1.max(0) as u32;
    let x2 = (x2.max(0) as u32).min(width);
    let y2 = (y2.max(0) as u32).min(height);
    if x2 <= x1 || y2 <= y1 {
        return picture.clone();
    }

    picture.crop_imm(x1, y1, x2 - x1, y2 - y1)
}

fn encode_png(picture: &DynamicImage) -> Result<Vec<u8>, AnalyzeError> {
    let mut buf = Vec::new();
    picture.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
    Ok(buf)
}

#[derive(Debug, thiserror::Error)]
pub enum AnalyzeError {
    #[error("Image processing failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("Vision model request failed: {0}")]
    Remote(#[from] reqwest::Error),

    #[error("{0}")]
    Model(String),
}

impl AnalyzeError {
    /// Errors worth redispatching the task for.
    pub fn is_transient(&self) -> bool {
        matches!(self, AnalyzeError::Remote(_))
    }
}
