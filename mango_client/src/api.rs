use crate::bounding_box::{DetectionResult, LabelCounts};
use crate::cancel::CancelToken;
use crate::config::BackendConfig;
use crate::error::ApiError;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{multipart, Client, Response};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;
use tracing::instrument;

/// Multipart field every upload endpoint reads the file from.
pub const UPLOAD_FIELD: &str = "file";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Predict,
    PredictFrame,
    PredictVideo,
}

impl Endpoint {
    pub fn path(&self) -> &'static str {
        match self {
            Endpoint::Predict => "/predict/",
            Endpoint::PredictFrame => "/predict-frame/",
            Endpoint::PredictVideo => "/predict-video/",
        }
    }
}

pub const HEALTH_PATH: &str = "/health";
pub const ROOT_PATH: &str = "/";
pub const RECOMMENDATION_PATH: &str = "/get-recommendation/";
pub const CHAT_PATH: &str = "/chat/";

/// A compressed payload bound for one upload endpoint. It lives for exactly
/// one HTTP call.
#[derive(Debug, Clone)]
pub struct PendingUpload {
    pub endpoint: Endpoint,
    pub file_name: String,
    pub content_type: String,
    pub payload: Bytes,
}

impl PendingUpload {
    pub fn jpeg(endpoint: Endpoint, file_name: &str, payload: impl Into<Bytes>) -> Self {
        Self {
            endpoint,
            file_name: file_name.to_string(),
            content_type: "image/jpeg".to_string(),
            payload: payload.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    fn into_form(self) -> Result<multipart::Form, ApiError> {
        let length = self.payload.len() as u64;
        let part = multipart::Part::stream_with_length(self.payload, length)
            .file_name(self.file_name)
            .mime_str(&self.content_type)
            .map_err(|e| ApiError::Network {
                message: format!("invalid content type: {}", e),
                refused: false,
            })?;
        Ok(multipart::Form::new().part(UPLOAD_FIELD, part))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    #[serde(default)]
    pub model_loaded: bool,
}

impl HealthResponse {
    pub fn is_healthy(&self) -> bool {
        self.status.eq_ignore_ascii_case("healthy")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictResponse {
    pub results: Vec<DetectionResult>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub processing_time: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameResponse {
    pub detections: Vec<DetectionResult>,
    #[serde(default)]
    pub timestamp: f64,
    #[serde(default)]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoSummary {
    pub total_frames: u64,
    pub processed_frames: u64,
    pub total_detections: u64,
    pub fresh_count: u64,
    pub rotten_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoFrameDetections {
    pub frame: u64,
    pub time: f64,
    pub detections: Vec<DetectionResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoResponse {
    pub summary: VideoSummary,
    #[serde(default)]
    pub detections_by_frame: Vec<VideoFrameDetections>,
}

#[derive(Debug, Deserialize)]
struct RecommendationResponse {
    recommendation: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    question: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    answer: String,
}

/// Everything the client needs from the inference backend.
///
/// Calls that belong to a submission cycle take that cycle's token and must
/// stop as soon as it fires.
#[async_trait]
pub trait InferenceApi: Send + Sync + 'static {
    async fn health(&self) -> Result<HealthResponse, ApiError>;

    /// Hits the root route so an idle backend starts booting.
    async fn wake(&self) -> Result<(), ApiError>;

    async fn predict(
        &self,
        upload: PendingUpload,
        cancel: &CancelToken,
    ) -> Result<PredictResponse, ApiError>;

    async fn predict_frame(&self, upload: PendingUpload) -> Result<FrameResponse, ApiError>;

    async fn predict_video(&self, upload: PendingUpload) -> Result<VideoResponse, ApiError>;

    async fn fetch_image(&self, image_url: &str, cancel: &CancelToken) -> Result<Bytes, ApiError>;

    async fn recommendation(
        &self,
        counts: LabelCounts,
        cancel: &CancelToken,
    ) -> Result<String, ApiError>;

    async fn chat(&self, question: &str) -> Result<String, ApiError>;
}

#[derive(Debug, Clone)]
pub struct HttpInferenceApi {
    client: Client,
    backend: BackendConfig,
}

impl HttpInferenceApi {
    pub fn new(backend: &BackendConfig) -> Result<Self, ApiError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            backend: backend.clone(),
        })
    }

    pub fn backend(&self) -> &BackendConfig {
        &self.backend
    }

    async fn upload(&self, upload: PendingUpload) -> Result<Response, ApiError> {
        let url = self.backend.url_for(upload.endpoint.path());
        tracing::debug!("Uploading {} bytes to {}", upload.len(), url);
        let response = self
            .client
            .post(url)
            .timeout(self.backend.request_timeout())
            .multipart(upload.into_form()?)
            .send()
            .await?;
        ensure_success(response).await
    }
}

/// Turns a non-2xx response into `ApiError::Server` carrying the text the
/// backend sent back.
async fn ensure_success(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = server_message(&body)
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("Unknown error").to_string());
    tracing::warn!("Backend returned {}: {}", status, message);
    Err(ApiError::Server {
        status: status.as_u16(),
        message,
    })
}

/// Prefers the `detail` field of a JSON error body, falls back to the raw text.
fn server_message(body: &str) -> Option<String> {
    let body = body.trim();
    if body.is_empty() {
        return None;
    }
    if let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(serde_json::Value::String(detail)) = map.get("detail") {
            return Some(detail.clone());
        }
    }
    Some(body.to_string())
}

async fn parse_json<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    let body = response.bytes().await?;
    serde_json::from_slice(&body).map_err(|e| ApiError::Malformed(e.to_string()))
}

#[async_trait]
impl InferenceApi for HttpInferenceApi {
    #[instrument(skip(self))]
    async fn health(&self) -> Result<HealthResponse, ApiError> {
        let response = self
            .client
            .get(self.backend.url_for(HEALTH_PATH))
            .timeout(self.backend.health_check_timeout())
            .send()
            .await?;
        parse_json(ensure_success(response).await?).await
    }

    #[instrument(skip(self))]
    async fn wake(&self) -> Result<(), ApiError> {
        let response = self
            .client
            .get(self.backend.url_for(ROOT_PATH))
            .timeout(self.backend.warmup_timeout())
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    #[instrument(skip(self, upload, cancel))]
    async fn predict(
        &self,
        upload: PendingUpload,
        cancel: &CancelToken,
    ) -> Result<PredictResponse, ApiError> {
        cancel
            .run(async {
                let response = self.upload(upload).await?;
                parse_json::<PredictResponse>(response).await
            })
            .await?
    }

    #[instrument(skip(self, upload))]
    async fn predict_frame(&self, upload: PendingUpload) -> Result<FrameResponse, ApiError> {
        let response = self.upload(upload).await?;
        parse_json(response).await
    }

    #[instrument(skip(self, upload))]
    async fn predict_video(&self, upload: PendingUpload) -> Result<VideoResponse, ApiError> {
        let response = self.upload(upload).await?;
        parse_json(response).await
    }

    #[instrument(skip(self, cancel))]
    async fn fetch_image(&self, image_url: &str, cancel: &CancelToken) -> Result<Bytes, ApiError> {
        let url = self.backend.url_for(image_url);
        cancel
            .run(async {
                let response = self
                    .client
                    .get(url)
                    .timeout(self.backend.request_timeout())
                    .send()
                    .await?;
                let bytes = ensure_success(response).await?.bytes().await?;
                Ok::<_, ApiError>(bytes)
            })
            .await?
    }

    #[instrument(skip(self, cancel))]
    async fn recommendation(
        &self,
        counts: LabelCounts,
        cancel: &CancelToken,
    ) -> Result<String, ApiError> {
        cancel
            .run(async {
                let response = self
                    .client
                    .post(self.backend.url_for(RECOMMENDATION_PATH))
                    .timeout(self.backend.request_timeout())
                    .json(&counts)
                    .send()
                    .await?;
                let parsed: RecommendationResponse =
                    parse_json(ensure_success(response).await?).await?;
                Ok::<_, ApiError>(parsed.recommendation)
            })
            .await?
    }

    #[instrument(skip(self, question))]
    async fn chat(&self, question: &str) -> Result<String, ApiError> {
        let response = self
            .client
            .post(self.backend.url_for(CHAT_PATH))
            .timeout(self.backend.request_timeout())
            .json(&ChatRequest { question })
            .send()
            .await?;
        let parsed: ChatResponse = parse_json(ensure_success(response).await?).await?;
        Ok(parsed.answer)
    }
}
