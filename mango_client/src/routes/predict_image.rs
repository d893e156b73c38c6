use crate::{
    error::SubmissionError,
    pipeline::{Analysis, SubmissionOutcome},
    server::SharedState,
};
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum PredictImageError {
    #[error("{0}")]
    Submission(#[from] SubmissionError),
    #[error("Submission task failed: {0}")]
    Task(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    may_be_starting: bool,
}

impl IntoResponse for PredictImageError {
    fn into_response(self) -> Response {
        let (status, message, may_be_starting) = match &self {
            PredictImageError::Submission(err) => {
                let status = match err {
                    SubmissionError::Validation(_) | SubmissionError::Image(_) => {
                        StatusCode::UNPROCESSABLE_ENTITY
                    }
                    SubmissionError::Timeout => StatusCode::GATEWAY_TIMEOUT,
                    SubmissionError::Network(_) | SubmissionError::Server { .. } => {
                        StatusCode::BAD_GATEWAY
                    }
                    SubmissionError::Cancelled => StatusCode::CONFLICT,
                };
                (status, err.user_message(), err.suggests_cold_start())
            }
            PredictImageError::Task(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string(), false)
            }
        };
        (
            status,
            Json(ErrorBody {
                error: message,
                may_be_starting,
            }),
        )
            .into_response()
    }
}

#[derive(Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PredictReply {
    Detected { analysis: Analysis },
    NothingDetected { analysis: Analysis },
}

impl From<SubmissionOutcome> for PredictReply {
    fn from(outcome: SubmissionOutcome) -> Self {
        match outcome {
            SubmissionOutcome::Detected(analysis) => PredictReply::Detected { analysis },
            SubmissionOutcome::NothingDetected(analysis) => {
                PredictReply::NothingDetected { analysis }
            }
        }
    }
}

#[instrument(skip(state, image_data), fields(bytes = image_data.len()))]
pub async fn predict_image(
    State(state): State<SharedState>,
    image_data: Bytes,
) -> Result<Json<PredictReply>, PredictImageError> {
    state.metrics.record_request("/predict");

    // The cycle runs on its own task so a client hanging up does not leave
    // the pipeline stuck mid-cycle.
    let pipeline = state.pipeline.clone();
    let result = tokio::spawn(async move { pipeline.submit(image_data).await })
        .await
        .map_err(|e| PredictImageError::Task(e.to_string()))?;

    let outcome_label = match &result {
        Ok(SubmissionOutcome::Detected(_)) => "detected",
        Ok(SubmissionOutcome::NothingDetected(_)) => "nothing_detected",
        Err(SubmissionError::Cancelled) => "cancelled",
        Err(_) => "failed",
    };
    state.metrics.record_submission(outcome_label);

    Ok(Json(result?.into()))
}

#[derive(Serialize)]
pub struct CancelReply {
    cancelled: bool,
}

pub async fn cancel_submission(State(state): State<SharedState>) -> Json<CancelReply> {
    Json(CancelReply {
        cancelled: state.pipeline.cancel(),
    })
}
