use crate::api::{Endpoint, InferenceApi, PendingUpload};
use crate::bounding_box::{DetectionResult, FrameSize};
use crate::camera::{FrameSource, FrameSourceError};
use crate::error::ApiError;
use crate::telemetry::Metrics;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};

const FRAME_FILE_NAME: &str = "frame.jpg";
const THROUGHPUT_WINDOW: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum DetectionLoopError {
    #[error("Frame source error: {0}")]
    Frame(#[from] FrameSourceError),
    #[error("Prediction request failed: {0}")]
    Api(#[from] ApiError),
}

/// Current overlay state. Boxes are in `frame` space; see
/// [`crate::bounding_box::BoundingBox::to_display`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LiveDetections {
    pub sequence: u64,
    pub detections: Vec<DetectionResult>,
    pub frame: FrameSize,
    pub fps: u32,
    pub frames_completed: u64,
}

/// Counts completed responses over rolling one second windows.
#[derive(Debug)]
pub struct ThroughputMeter {
    window: Duration,
    window_start: Instant,
    count: u32,
    rate: u32,
}

impl ThroughputMeter {
    pub fn new(window: Duration, now: Instant) -> Self {
        Self {
            window,
            window_start: now,
            count: 0,
            rate: 0,
        }
    }

    pub fn reset(&mut self, now: Instant) {
        self.window_start = now;
        self.count = 0;
        self.rate = 0;
    }

    /// Returns the new rate when a window closes.
    pub fn record(&mut self, now: Instant) -> Option<u32> {
        if now.duration_since(self.window_start) >= self.window * 2 {
            // Nothing closed a window for a while; the old rate is gone.
            self.reset(now);
        }
        self.count += 1;
        if now.duration_since(self.window_start) >= self.window {
            self.rate = self.count;
            self.count = 0;
            self.window_start = now;
            return Some(self.rate);
        }
        None
    }

    /// Rate as of `now`. Windows that elapsed without any completion count
    /// as zero.
    pub fn rate_at(&self, now: Instant) -> u32 {
        let elapsed = now.duration_since(self.window_start);
        if elapsed < self.window {
            self.rate
        } else if elapsed < self.window * 2 {
            self.count
        } else {
            0
        }
    }
}

#[derive(Debug)]
struct LoopState {
    latest_applied: u64,
    live: LiveDetections,
    meter: ThroughputMeter,
}

impl LoopState {
    fn new(frame: FrameSize) -> Self {
        Self {
            latest_applied: 0,
            live: LiveDetections {
                frame,
                ..LiveDetections::default()
            },
            meter: ThroughputMeter::new(THROUGHPUT_WINDOW, Instant::now()),
        }
    }

    fn reset_throughput(&mut self, now: Instant) {
        self.meter.reset(now);
        self.live.fps = 0;
    }

    /// Responses can resolve out of order; anything older than what is
    /// already on screen is dropped.
    fn apply(&mut self, sequence: u64, detections: Vec<DetectionResult>) -> bool {
        if sequence <= self.latest_applied {
            tracing::debug!(
                "Discarding stale frame response {} (latest {})",
                sequence,
                self.latest_applied
            );
            return false;
        }
        self.latest_applied = sequence;
        self.live.sequence = sequence;
        self.live.detections = detections;
        true
    }

    fn record_completion(&mut self, now: Instant) -> Option<u32> {
        self.live.frames_completed += 1;
        let closed = self.meter.record(now);
        self.live.fps = self.meter.rate_at(now);
        closed
    }
}

#[derive(Clone)]
struct TickContext {
    api: Arc<dyn InferenceApi>,
    source: Arc<dyn FrameSource>,
    state: Arc<Mutex<LoopState>>,
    metrics: Option<Arc<Metrics>>,
}

struct RunningLoop {
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

/// Fixed-period capture and predict loop. Every tick fires its own request
/// without waiting for the previous one.
pub struct DetectionLoop {
    context: TickContext,
    poll_interval: Duration,
    next_sequence: Arc<AtomicU64>,
    running: Mutex<Option<RunningLoop>>,
}

impl DetectionLoop {
    pub fn new(
        api: Arc<dyn InferenceApi>,
        source: Arc<dyn FrameSource>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            context: TickContext {
                api,
                source,
                state: Arc::new(Mutex::new(LoopState::new(FrameSize::default()))),
                metrics: None,
            },
            poll_interval,
            next_sequence: Arc::new(AtomicU64::new(0)),
            running: Mutex::new(None),
        }
    }

    /// Size of the frames the source produces. Defaults to 640x480.
    pub fn with_frame_size(self, frame: FrameSize) -> Self {
        self.context.state.lock().live.frame = frame;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.context.metrics = Some(metrics);
        self
    }

    pub fn snapshot(&self) -> LiveDetections {
        let state = self.context.state.lock();
        let mut live = state.live.clone();
        live.fps = state.meter.rate_at(Instant::now());
        live
    }

    pub fn throughput(&self) -> u32 {
        self.context.state.lock().meter.rate_at(Instant::now())
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .map(|running| !running.handle.is_finished())
            .unwrap_or(false)
    }

    /// Returns false when the loop is already running.
    pub fn start(&self) -> bool {
        let mut running = self.running.lock();
        if running.is_some() {
            return false;
        }

        self.context.state.lock().reset_throughput(Instant::now());
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let context = self.context.clone();
        let next_sequence = self.next_sequence.clone();
        let poll_interval = self.poll_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + poll_interval, poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut in_flight = JoinSet::new();

            tracing::info!("Detection loop started, polling every {:?}", poll_interval);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Detection loop received shutdown signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        while in_flight.try_join_next().is_some() {}
                        let sequence = next_sequence.fetch_add(1, Ordering::SeqCst) + 1;
                        in_flight.spawn(Self::run_tick(context.clone(), sequence));
                    }
                }
            }

            // Requests that have not resolved yet are torn down with their tasks.
            in_flight.shutdown().await;
            tracing::info!("Detection loop stopped");
        });

        *running = Some(RunningLoop {
            shutdown_tx,
            handle,
        });
        true
    }

    /// Once this returns, no further frame is captured or submitted.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        if let Some(running) = running {
            let _ = running.shutdown_tx.send(());
            if let Err(e) = running.handle.await {
                tracing::error!("Detection loop task failed: {:?}", e);
            }
            self.context.state.lock().reset_throughput(Instant::now());
            if let Some(metrics) = self.context.metrics.as_ref() {
                metrics.record_prediction_fps(0.0, Endpoint::PredictFrame.path());
            }
        }
    }

    async fn run_tick(context: TickContext, sequence: u64) {
        let detections = match Self::poll_and_predict(&context).await {
            Ok(Some(detections)) => detections,
            Ok(None) => return,
            Err(err) => {
                tracing::error!("Real-time detection error: {}", err);
                context.state.lock().apply(sequence, Vec::new());
                return;
            }
        };

        let rate = {
            let mut state = context.state.lock();
            state.apply(sequence, detections);
            state.record_completion(Instant::now())
        };
        if let (Some(rate), Some(metrics)) = (rate, context.metrics.as_ref()) {
            metrics.record_prediction_fps(rate as f64, Endpoint::PredictFrame.path());
        }
    }

    async fn poll_and_predict(
        context: &TickContext,
    ) -> Result<Option<Vec<DetectionResult>>, DetectionLoopError> {
        let frame = match context.source.capture_frame().await? {
            Some(frame) if !frame.is_empty() => frame,
            _ => return Ok(None),
        };

        let upload = PendingUpload::jpeg(Endpoint::PredictFrame, FRAME_FILE_NAME, frame);
        let started = Instant::now();
        let response = context.api.predict_frame(upload).await?;

        if let Some(metrics) = context.metrics.as_ref() {
            metrics.record_request(Endpoint::PredictFrame.path());
            metrics.record_prediction_duration(
                started.elapsed().as_millis() as u64,
                Endpoint::PredictFrame.path(),
            );
        }
        Ok(Some(response.detections))
    }
}

impl Drop for DetectionLoop {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            let _ = running.shutdown_tx.send(());
            running.handle.abort();
        }
    }
}
