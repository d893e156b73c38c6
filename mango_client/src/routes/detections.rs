use crate::{
    bounding_box::{DetectionResult, FrameSize},
    server::SharedState,
};
use axum::{
    extract::{Query, State},
    response::Json,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct DisplaySize {
    width: Option<f32>,
    height: Option<f32>,
}

#[derive(Debug, Serialize)]
pub struct LiveOverlay {
    running: bool,
    sequence: u64,
    fps: u32,
    frame: FrameSize,
    detections: Vec<DetectionResult>,
}

/// Latest real-time detections, with boxes mapped onto the caller's display
/// size when one is given.
pub async fn live_detections(
    State(state): State<SharedState>,
    Query(display): Query<DisplaySize>,
) -> Json<LiveOverlay> {
    let Some(detection_loop) = state.detection_loop.as_ref() else {
        return Json(LiveOverlay {
            running: false,
            sequence: 0,
            fps: 0,
            frame: FrameSize::default(),
            detections: Vec::new(),
        });
    };

    let live = detection_loop.snapshot();
    let frame = live.frame;
    let width = display
        .width
        .filter(|w| *w > 0.0)
        .unwrap_or(frame.width as f32);
    let height = display
        .height
        .filter(|h| *h > 0.0)
        .unwrap_or(frame.height as f32);
    let detections = live
        .detections
        .into_iter()
        .map(|mut detection| {
            detection.bounding_box = detection.bounding_box.to_display(frame, width, height);
            detection
        })
        .collect();

    Json(LiveOverlay {
        running: detection_loop.is_running(),
        sequence: live.sequence,
        fps: live.fps,
        frame,
        detections,
    })
}
