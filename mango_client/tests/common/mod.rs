//! In-process stand-in for the inference backend.

#![allow(dead_code)]

use axum::{
    extract::{Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

pub const ANNOTATED_PATH: &str = "/download/annotated.jpg";
pub const ANNOTATED_BYTES: &[u8] = b"\xFF\xD8annotated\xFF\xD9";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// One fresh (92%) and one rotten (81%) mango.
    TwoMangoes,
    Empty,
    ModelError,
    /// The health route never answers in time. Predictions still work.
    SlowHealth,
}

#[derive(Debug, Clone)]
pub struct ReceivedUpload {
    pub route: &'static str,
    pub field: String,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

#[derive(Default)]
pub struct Recorded {
    pub uploads: Mutex<Vec<ReceivedUpload>>,
    pub recommendation_bodies: Mutex<Vec<Value>>,
    pub health_calls: AtomicUsize,
    pub annotated_fetches: AtomicUsize,
}

impl Recorded {
    pub fn uploads_to(&self, route: &str) -> Vec<ReceivedUpload> {
        self.uploads
            .lock()
            .iter()
            .filter(|upload| upload.route == route)
            .cloned()
            .collect()
    }
}

#[derive(Clone)]
struct BackendState {
    mode: Mode,
    recorded: Arc<Recorded>,
}

pub struct FakeBackend {
    pub base_url: String,
    pub recorded: Arc<Recorded>,
}

pub async fn spawn_backend(mode: Mode) -> FakeBackend {
    let recorded = Arc::new(Recorded::default());
    let state = BackendState {
        mode,
        recorded: recorded.clone(),
    };

    let router = Router::new()
        .route("/", get(|| async { Json(json!({"message": "Mango API"})) }))
        .route("/health", get(health))
        .route("/predict/", post(predict))
        .route("/predict-frame/", post(predict_frame))
        .route("/get-recommendation/", post(recommendation))
        .route(ANNOTATED_PATH, get(annotated))
        .layer(axum::extract::DefaultBodyLimit::max(20 * 1024 * 1024))
        .with_state(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    FakeBackend {
        base_url: format!("http://{}", addr),
        recorded,
    }
}

fn detection(label: &str, confidence: u8, bbox: [f32; 4]) -> Value {
    json!({
        "label": label,
        "confidence": confidence,
        "emoji": "",
        "message": format!("{} mango", label),
        "bbox": bbox,
    })
}

fn two_mangoes() -> Vec<Value> {
    vec![
        detection("fresh", 92, [12.0, 20.0, 300.0, 310.0]),
        detection("rotten", 81, [320.0, 40.0, 620.0, 400.0]),
    ]
}

async fn health(State(state): State<BackendState>) -> Json<Value> {
    state.recorded.health_calls.fetch_add(1, Ordering::SeqCst);
    if state.mode == Mode::SlowHealth {
        tokio::time::sleep(Duration::from_secs(30)).await;
    }
    Json(json!({"status": "healthy", "model_loaded": true}))
}

async fn record_upload(
    recorded: &Recorded,
    route: &'static str,
    mut multipart: Multipart,
) -> Result<(), StatusCode> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?
    {
        let field_name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(str::to_string);
        let bytes = field.bytes().await.map_err(|_| StatusCode::BAD_REQUEST)?;
        recorded.uploads.lock().push(ReceivedUpload {
            route,
            field: field_name,
            file_name,
            content_type,
            bytes: bytes.to_vec(),
        });
    }
    Ok(())
}

async fn predict(State(state): State<BackendState>, multipart: Multipart) -> Response {
    if let Err(status) = record_upload(&state.recorded, "/predict/", multipart).await {
        return status.into_response();
    }
    match state.mode {
        Mode::ModelError => (StatusCode::INTERNAL_SERVER_ERROR, "model error").into_response(),
        Mode::Empty => Json(json!({"results": [], "processing_time": "0.4s"})).into_response(),
        Mode::TwoMangoes | Mode::SlowHealth => Json(json!({
            "results": two_mangoes(),
            "image_url": ANNOTATED_PATH,
            "processing_time": "1.3s",
        }))
        .into_response(),
    }
}

async fn predict_frame(State(state): State<BackendState>, multipart: Multipart) -> Response {
    if let Err(status) = record_upload(&state.recorded, "/predict-frame/", multipart).await {
        return status.into_response();
    }
    Json(json!({"detections": two_mangoes(), "timestamp": 1.5})).into_response()
}

async fn recommendation(State(state): State<BackendState>, Json(body): Json<Value>) -> Json<Value> {
    state.recorded.recommendation_bodies.lock().push(body);
    Json(json!({"recommendation": "Sort out the rotten mango today."}))
}

async fn annotated(State(state): State<BackendState>) -> impl IntoResponse {
    state.recorded.annotated_fetches.fetch_add(1, Ordering::SeqCst);
    ([(axum::http::header::CONTENT_TYPE, "image/jpeg")], ANNOTATED_BYTES)
}
