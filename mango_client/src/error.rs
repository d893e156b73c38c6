use crate::cancel::Cancelled;
use crate::image_utils::ImageError;
use thiserror::Error;

/// Failures talking to the inference backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("Network error: {message}")]
    Network { message: String, refused: bool },
    #[error("Request timed out")]
    Timeout,
    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },
    #[error("Malformed response: {0}")]
    Malformed(String),
    #[error("Request cancelled")]
    Cancelled,
}

impl From<Cancelled> for ApiError {
    fn from(_: Cancelled) -> Self {
        ApiError::Cancelled
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Timeout
        } else if err.is_decode() {
            ApiError::Malformed(err.to_string())
        } else {
            ApiError::Network {
                message: err.to_string(),
                refused: err.is_connect(),
            }
        }
    }
}

/// Why a submission cycle did not complete.
///
/// `Server` and `Validation` display exactly the text the user should see.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmissionError {
    #[error("{0}")]
    Validation(String),
    #[error("Image error: {0}")]
    Image(#[from] ImageError),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Request timed out")]
    Timeout,
    #[error("{message}")]
    Server { status: Option<u16>, message: String },
    #[error("Analysis cancelled")]
    Cancelled,
}

impl From<Cancelled> for SubmissionError {
    fn from(_: Cancelled) -> Self {
        SubmissionError::Cancelled
    }
}

impl From<ApiError> for SubmissionError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Network { message, .. } => SubmissionError::Network(message),
            ApiError::Timeout => SubmissionError::Timeout,
            ApiError::Server { status, message } => SubmissionError::Server {
                status: Some(status),
                message,
            },
            ApiError::Malformed(message) => SubmissionError::Server {
                status: None,
                message: format!("Malformed response from server: {}", message),
            },
            ApiError::Cancelled => SubmissionError::Cancelled,
        }
    }
}

impl SubmissionError {
    /// Text for the error surface. Timeouts get a cold-start hint because the
    /// backend can take a minute or two to wake up.
    pub fn user_message(&self) -> String {
        match self {
            SubmissionError::Timeout => {
                "Connection timed out. The server may be starting up, please try again in 1-2 minutes."
                    .to_string()
            }
            SubmissionError::Network(message) => {
                format!("Could not reach the server: {}", message)
            }
            other => other.to_string(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SubmissionError::Cancelled)
    }

    pub fn suggests_cold_start(&self) -> bool {
        matches!(self, SubmissionError::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_message_is_verbatim() {
        let err: SubmissionError = ApiError::Server {
            status: 500,
            message: "model error".into(),
        }
        .into();
        assert_eq!(err.to_string(), "model error");
        assert_eq!(err.user_message(), "model error");
    }

    #[test]
    fn test_malformed_fails_closed_as_server_error() {
        let err: SubmissionError = ApiError::Malformed("missing field `results`".into()).into();
        assert!(matches!(err, SubmissionError::Server { status: None, .. }));
    }

    #[test]
    fn test_timeout_hints_cold_start() {
        let err: SubmissionError = ApiError::Timeout.into();
        assert!(err.suggests_cold_start());
        assert!(err.user_message().contains("starting up"));
    }

    #[test]
    fn test_cancelled_maps_through() {
        let err: SubmissionError = ApiError::from(Cancelled).into();
        assert!(err.is_cancelled());
    }
}
