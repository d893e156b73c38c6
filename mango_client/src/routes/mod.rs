mod connectivity;
mod detections;
mod health;
mod metrics;
mod predict_image;
mod status;

use crate::server::SharedState;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};

/// Largest raw image the console accepts before compression.
const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health::healthcheck))
        .route("/status", get(status::server_status))
        .route("/detections", get(detections::live_detections))
        .route(
            "/predict",
            post(predict_image::predict_image).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/cancel", post(predict_image::cancel_submission))
        .route("/connectivity/{state}", post(connectivity::connectivity_changed))
        .route("/metrics", get(metrics::metrics_handler))
}
