use crate::api::{Endpoint, InferenceApi, PendingUpload};
use crate::bounding_box::{DetectionResult, LabelCounts};
use crate::cancel::{AbortHandle, CancelToken};
use crate::config::UploadConfig;
use crate::error::{ApiError, SubmissionError};
use crate::image_utils::{ImageError, ImageInput, PreparedImage};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::instrument;

const UPLOAD_FILE_NAME: &str = "mango.jpg";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Preparing,
    Uploading,
    Interpreting,
    FetchingExtra,
    Done,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessingState {
    pub phase: Phase,
    pub is_processing: bool,
    pub progress_percent: u8,
    pub stage_label: String,
    pub error: Option<String>,
}

impl Default for ProcessingState {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            is_processing: false,
            progress_percent: 0,
            stage_label: String::new(),
            error: None,
        }
    }
}

impl ProcessingState {
    fn starting() -> Self {
        Self {
            phase: Phase::Preparing,
            is_processing: true,
            progress_percent: 0,
            stage_label: "Preparing image...".to_string(),
            error: None,
        }
    }

    fn cancelled() -> Self {
        Self {
            phase: Phase::Cancelled,
            ..Self::default()
        }
    }

    /// Progress never moves backwards within a cycle.
    fn advance(&mut self, phase: Phase, progress: u8, stage: &str) {
        self.phase = phase;
        self.progress_percent = self.progress_percent.max(progress.min(100));
        self.stage_label = stage.to_string();
    }
}

/// Server-rendered copy of the submitted image with boxes drawn on it.
#[derive(Debug, PartialEq, Eq)]
pub struct AnnotatedImage {
    pub source_url: String,
    pub bytes: Bytes,
}

#[derive(Debug, Clone, Serialize)]
pub struct Analysis {
    pub results: Vec<DetectionResult>,
    pub counts: LabelCounts,
    pub processing_time: Option<String>,
    #[serde(skip)]
    pub annotated_image: Option<Arc<AnnotatedImage>>,
    pub recommendation: Option<String>,
}

#[derive(Debug, Clone)]
pub enum SubmissionOutcome {
    Detected(Analysis),
    /// The backend answered but found no mango. Not an error: callers show
    /// guidance instead of the error surface.
    NothingDetected(Analysis),
}

impl SubmissionOutcome {
    pub fn analysis(&self) -> &Analysis {
        match self {
            SubmissionOutcome::Detected(analysis) => analysis,
            SubmissionOutcome::NothingDetected(analysis) => analysis,
        }
    }
}

/// Everything an observer of the pipeline can see.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineSnapshot {
    pub state: ProcessingState,
    pub results: Option<Vec<DetectionResult>>,
    pub no_subject_detected: bool,
    pub recommendation: Option<String>,
    #[serde(skip)]
    pub annotated_image: Option<Arc<AnnotatedImage>>,
}

impl PipelineSnapshot {
    /// A cancelled cycle leaves nothing partial behind.
    fn cancelled() -> Self {
        Self {
            state: ProcessingState::cancelled(),
            ..Self::default()
        }
    }
}

struct PipelineInner {
    generation: u64,
    active: Option<AbortHandle>,
    snapshot: PipelineSnapshot,
}

/// Turns a raw image into a finished (or failed) analysis cycle against the
/// predict endpoint. At most one cycle is in flight per pipeline: starting a
/// new one aborts the previous one before anything else happens.
pub struct SubmissionPipeline {
    api: Arc<dyn InferenceApi>,
    upload: UploadConfig,
    request_timeout: Duration,
    inner: Mutex<PipelineInner>,
}

impl SubmissionPipeline {
    pub fn new(api: Arc<dyn InferenceApi>, upload: &UploadConfig, request_timeout: Duration) -> Self {
        Self {
            api,
            upload: upload.clone(),
            request_timeout,
            inner: Mutex::new(PipelineInner {
                generation: 0,
                active: None,
                snapshot: PipelineSnapshot::default(),
            }),
        }
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        self.inner.lock().snapshot.clone()
    }

    pub fn is_processing(&self) -> bool {
        self.inner.lock().active.is_some()
    }

    #[instrument(skip(self, input))]
    pub async fn submit(
        &self,
        input: impl Into<ImageInput>,
    ) -> Result<SubmissionOutcome, SubmissionError> {
        let (generation, token) = self.begin_cycle();
        let mut guard = CycleGuard {
            pipeline: self,
            generation,
            settled: false,
        };
        let result = self.run_cycle(generation, &token, input.into()).await;
        guard.settled = true;
        self.finish_cycle(generation, &result);
        result
    }

    /// Aborts the in-flight cycle, if any. Returns whether one was running.
    pub fn cancel(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.active.take() {
            Some(handle) => {
                handle.abort();
                inner.generation += 1;
                inner.snapshot = PipelineSnapshot::cancelled();
                tracing::info!("Submission cancelled");
                true
            }
            None => false,
        }
    }

    /// Clears any displayed error without touching results.
    pub fn clear_error(&self) {
        self.inner.lock().snapshot.state.error = None;
    }

    /// Aborts whatever is running and releases every fetched resource.
    pub fn teardown(&self) {
        let mut inner = self.inner.lock();
        if let Some(handle) = inner.active.take() {
            handle.abort();
        }
        inner.generation += 1;
        inner.snapshot = PipelineSnapshot::default();
    }

    fn begin_cycle(&self) -> (u64, CancelToken) {
        let mut inner = self.inner.lock();
        if let Some(previous) = inner.active.take() {
            previous.abort();
            tracing::info!("Cancelled in-flight submission to start a new one");
        }
        inner.generation += 1;
        let handle = AbortHandle::new();
        let token = handle.token();
        inner.active = Some(handle);
        // Dropping the old snapshot releases the previous annotated image.
        inner.snapshot = PipelineSnapshot {
            state: ProcessingState::starting(),
            ..PipelineSnapshot::default()
        };
        (inner.generation, token)
    }

    fn finish_cycle(&self, generation: u64, result: &Result<SubmissionOutcome, SubmissionError>) {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return;
        }
        inner.active = None;
        let snapshot = &mut inner.snapshot;
        match result {
            Ok(_) => {
                snapshot.state.advance(Phase::Done, 100, "Done!");
                snapshot.state.is_processing = false;
            }
            Err(SubmissionError::Cancelled) => {
                *snapshot = PipelineSnapshot::cancelled();
            }
            Err(err) => {
                tracing::error!("Submission failed: {}", err);
                snapshot.state = ProcessingState {
                    phase: Phase::Failed,
                    error: Some(err.user_message()),
                    ..ProcessingState::default()
                };
            }
        }
    }

    /// Runs when a `submit` future is dropped before it settled its cycle.
    fn abandon_cycle(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return;
        }
        if let Some(handle) = inner.active.take() {
            handle.abort();
        }
        inner.generation += 1;
        inner.snapshot = PipelineSnapshot::cancelled();
        tracing::info!("Submission dropped before completion");
    }

    /// Applies `f` only while `generation` is still the current cycle, so a
    /// superseded cycle can never clobber its successor.
    fn update(&self, generation: u64, f: impl FnOnce(&mut PipelineSnapshot)) {
        let mut inner = self.inner.lock();
        if inner.generation == generation {
            f(&mut inner.snapshot);
        }
    }

    fn set_stage(&self, generation: u64, phase: Phase, progress: u8, stage: &str) {
        self.update(generation, |snapshot| {
            snapshot.state.advance(phase, progress, stage)
        });
    }

    async fn run_cycle(
        &self,
        generation: u64,
        token: &CancelToken,
        input: ImageInput,
    ) -> Result<SubmissionOutcome, SubmissionError> {
        self.set_stage(generation, Phase::Preparing, 10, "Compressing image...");
        let jpeg = token.run(self.prepare(input)).await??;

        if jpeg.len() > self.upload.max_file_size_bytes {
            return Err(SubmissionError::Validation(format!(
                "File is too large ({:.1} MB). Maximum is {:.1} MB",
                jpeg.len() as f64 / (1024.0 * 1024.0),
                self.upload.max_file_size_bytes as f64 / (1024.0 * 1024.0)
            )));
        }
        token.check()?;

        self.set_stage(generation, Phase::Uploading, 25, "Uploading to server...");
        let upload = PendingUpload::jpeg(Endpoint::Predict, UPLOAD_FILE_NAME, jpeg);

        self.set_stage(generation, Phase::Uploading, 50, "AI is analyzing...");
        let deadline = Instant::now() + self.request_timeout;
        let response = match timeout_at(deadline, token.run(self.api.predict(upload, token))).await
        {
            Ok(result) => result??,
            Err(_) => return Err(SubmissionError::Timeout),
        };
        self.set_stage(generation, Phase::Interpreting, 75, "Processing results...");

        let counts = LabelCounts::tally(&response.results);
        let nothing_detected = response.results.is_empty();
        self.update(generation, |snapshot| {
            snapshot.state.advance(Phase::Interpreting, 85, "Processing results...");
            snapshot.results = Some(response.results.clone());
            snapshot.no_subject_detected = nothing_detected;
        });
        if nothing_detected {
            tracing::info!("No mango detected in submitted image");
        } else {
            tracing::info!(
                "Detected {} fresh and {} rotten",
                counts.fresh_count,
                counts.rotten_count
            );
        }

        let mut analysis = Analysis {
            results: response.results,
            counts,
            processing_time: response.processing_time,
            annotated_image: None,
            recommendation: None,
        };

        if let Some(image_url) = response.image_url.filter(|url| !url.is_empty()) {
            token.check()?;
            self.set_stage(generation, Phase::FetchingExtra, 90, "Loading annotated image...");
            analysis.annotated_image = self.fetch_annotated(&image_url, token, deadline).await?;
            let annotated = analysis.annotated_image.clone();
            self.update(generation, |snapshot| snapshot.annotated_image = annotated);
        }

        if !nothing_detected && self.upload.fetch_recommendation {
            token.check()?;
            self.set_stage(generation, Phase::FetchingExtra, 95, "Getting recommendation...");
            analysis.recommendation = self.fetch_recommendation(counts, token, deadline).await?;
            let recommendation = analysis.recommendation.clone();
            self.update(generation, |snapshot| snapshot.recommendation = recommendation);
        }

        if nothing_detected {
            Ok(SubmissionOutcome::NothingDetected(analysis))
        } else {
            Ok(SubmissionOutcome::Detected(analysis))
        }
    }

    /// Decode, downscale and re-encode off the async workers.
    async fn prepare(&self, input: ImageInput) -> Result<Vec<u8>, SubmissionError> {
        let max_long_edge = self.upload.max_long_edge;
        let quality = self.upload.jpeg_quality;
        let jpeg = tokio::task::spawn_blocking(move || {
            PreparedImage::decode(input)?
                .fit_within(max_long_edge)
                .to_jpeg(quality)
        })
        .await
        .map_err(|e| ImageError::Encode(format!("image worker failed: {}", e)))??;
        tracing::debug!("Prepared {} byte JPEG for upload", jpeg.len());
        Ok(jpeg)
    }

    /// Best effort: only cancellation escapes, everything else is logged.
    async fn fetch_annotated(
        &self,
        image_url: &str,
        token: &CancelToken,
        deadline: Instant,
    ) -> Result<Option<Arc<AnnotatedImage>>, SubmissionError> {
        let fetched = timeout_at(deadline, token.run(self.api.fetch_image(image_url, token))).await;
        match fetched {
            Ok(Ok(Ok(bytes))) => Ok(Some(Arc::new(AnnotatedImage {
                source_url: image_url.to_string(),
                bytes,
            }))),
            Ok(Err(_)) | Ok(Ok(Err(ApiError::Cancelled))) => Err(SubmissionError::Cancelled),
            Ok(Ok(Err(err))) => {
                tracing::warn!("Could not load annotated image: {}", err);
                Ok(None)
            }
            Err(_) => {
                tracing::warn!("Timed out loading annotated image");
                Ok(None)
            }
        }
    }

    async fn fetch_recommendation(
        &self,
        counts: LabelCounts,
        token: &CancelToken,
        deadline: Instant,
    ) -> Result<Option<String>, SubmissionError> {
        let fetched =
            timeout_at(deadline, token.run(self.api.recommendation(counts, token))).await;
        match fetched {
            Ok(Ok(Ok(recommendation))) => Ok(Some(recommendation)),
            Ok(Err(_)) | Ok(Ok(Err(ApiError::Cancelled))) => Err(SubmissionError::Cancelled),
            Ok(Ok(Err(err))) => {
                tracing::warn!("Error fetching recommendation: {}", err);
                Ok(None)
            }
            Err(_) => {
                tracing::warn!("Timed out fetching recommendation");
                Ok(None)
            }
        }
    }
}

/// Settles the cycle it guards unless `submit` got to do so itself.
struct CycleGuard<'a> {
    pipeline: &'a SubmissionPipeline,
    generation: u64,
    settled: bool,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.pipeline.abandon_cycle(self.generation);
        }
    }
}

impl Drop for SubmissionPipeline {
    fn drop(&mut self) {
        if let Some(handle) = self.inner.get_mut().active.take() {
            handle.abort();
        }
    }
}
