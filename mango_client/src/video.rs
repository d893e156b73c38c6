use crate::api::{Endpoint, InferenceApi, PendingUpload, VideoResponse};
use crate::error::SubmissionError;
use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;
use tracing::instrument;

pub const MAX_VIDEO_BYTES: usize = 50 * 1024 * 1024;

/// One-shot analysis of a whole video clip. The backend samples frames and
/// returns an aggregate summary plus detections per sampled frame.
pub struct VideoAnalyzer {
    api: Arc<dyn InferenceApi>,
    max_bytes: usize,
}

impl VideoAnalyzer {
    pub fn new(api: Arc<dyn InferenceApi>) -> Self {
        Self {
            api,
            max_bytes: MAX_VIDEO_BYTES,
        }
    }

    #[instrument(skip(self, payload), fields(bytes = payload.len()))]
    pub async fn analyze(
        &self,
        payload: Bytes,
        file_name: &str,
    ) -> Result<VideoResponse, SubmissionError> {
        if payload.is_empty() {
            return Err(SubmissionError::Validation(
                "Please choose a video file".to_string(),
            ));
        }
        if payload.len() > self.max_bytes {
            return Err(SubmissionError::Validation(format!(
                "Video is too large. Maximum size is {}MB",
                self.max_bytes / (1024 * 1024)
            )));
        }

        let upload = PendingUpload {
            endpoint: Endpoint::PredictVideo,
            file_name: file_name.to_string(),
            content_type: video_content_type(file_name).to_string(),
            payload,
        };
        let response = self.api.predict_video(upload).await?;
        tracing::info!(
            "Video analysed: {} of {} frames, {} detections",
            response.summary.processed_frames,
            response.summary.total_frames,
            response.summary.total_detections
        );
        Ok(response)
    }
}

fn video_content_type(file_name: &str) -> &'static str {
    let extension = Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());
    match extension.as_deref() {
        Some("webm") => "video/webm",
        Some("mov") => "video/quicktime",
        Some("avi") => "video/x-msvideo",
        Some("mkv") => "video/x-matroska",
        _ => "video/mp4",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{FrameResponse, HealthResponse, PredictResponse, VideoSummary};
    use crate::bounding_box::LabelCounts;
    use crate::cancel::CancelToken;
    use crate::error::ApiError;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct VideoApi {
        uploads: Mutex<Vec<PendingUpload>>,
    }

    #[async_trait]
    impl InferenceApi for VideoApi {
        async fn health(&self) -> Result<HealthResponse, ApiError> {
            unimplemented!()
        }

        async fn wake(&self) -> Result<(), ApiError> {
            unimplemented!()
        }

        async fn predict(
            &self,
            _upload: PendingUpload,
            _cancel: &CancelToken,
        ) -> Result<PredictResponse, ApiError> {
            unimplemented!()
        }

        async fn predict_frame(&self, _upload: PendingUpload) -> Result<FrameResponse, ApiError> {
            unimplemented!()
        }

        async fn predict_video(&self, upload: PendingUpload) -> Result<VideoResponse, ApiError> {
            self.uploads.lock().push(upload);
            Ok(VideoResponse {
                summary: VideoSummary {
                    total_frames: 300,
                    processed_frames: 30,
                    total_detections: 4,
                    fresh_count: 3,
                    rotten_count: 1,
                },
                detections_by_frame: Vec::new(),
            })
        }

        async fn fetch_image(
            &self,
            _image_url: &str,
            _cancel: &CancelToken,
        ) -> Result<Bytes, ApiError> {
            unimplemented!()
        }

        async fn recommendation(
            &self,
            _counts: LabelCounts,
            _cancel: &CancelToken,
        ) -> Result<String, ApiError> {
            unimplemented!()
        }

        async fn chat(&self, _question: &str) -> Result<String, ApiError> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn test_analyze_uploads_clip() {
        let api = Arc::new(VideoApi::default());
        let analyzer = VideoAnalyzer::new(api.clone());

        let response = analyzer
            .analyze(Bytes::from_static(b"\x00\x00\x00\x18ftypmp42"), "orchard.MOV")
            .await
            .unwrap();
        assert_eq!(response.summary.fresh_count, 3);

        let uploads = api.uploads.lock();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].endpoint, Endpoint::PredictVideo);
        assert_eq!(uploads[0].content_type, "video/quicktime");
        assert_eq!(uploads[0].file_name, "orchard.MOV");
    }

    #[tokio::test]
    async fn test_empty_clip_is_rejected() {
        let api = Arc::new(VideoApi::default());
        let analyzer = VideoAnalyzer::new(api.clone());

        let err = analyzer.analyze(Bytes::new(), "empty.mp4").await.unwrap_err();
        assert!(matches!(err, SubmissionError::Validation(_)));
        assert!(api.uploads.lock().is_empty());
    }

    #[test]
    fn test_content_type_defaults_to_mp4() {
        assert_eq!(video_content_type("clip"), "video/mp4");
        assert_eq!(video_content_type("clip.webm"), "video/webm");
    }
}
