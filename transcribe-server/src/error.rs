//! Error types for the transcription pipeline
//!
//! Every failure a request can hit is folded into [`TranscriptionError`],
//! which decides the HTTP status. Internal details are logged, never sent.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use transcribe_common::api::{ErrorBody, ErrorDetail};

/// Client-side problems with an upload or its options (400)
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Unsupported content type: {0}")]
    UnsupportedFormat(String),

    #[error("Upload exceeds the {limit} byte limit")]
    TooLarge { limit: u64 },

    #[error("Upload truncated: {0}")]
    Truncated(String),

    #[error("Upload is empty")]
    Empty,

    #[error("Invalid option: {0}")]
    InvalidOption(String),

    #[error("Malformed request: {0}")]
    Malformed(String),
}

/// Why the engine failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineFailureReason {
    /// The audio itself could not be decoded or was rejected (client-attributable)
    Decode,
    /// Fault inside the engine or its plumbing (operator-attributable)
    Internal,
}

impl fmt::Display for EngineFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineFailureReason::Decode => f.write_str("decode"),
            EngineFailureReason::Internal => f.write_str("internal"),
        }
    }
}

/// Errors reported by a [`crate::engine::TranscriptionEngine`]
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Audio decode failed: {0}")]
    Decode(String),

    #[error("Engine fault: {0}")]
    Internal(String),

    #[error("Engine call cancelled")]
    Cancelled,
}

/// Terminal failure of one transcription request
#[derive(Debug, Error)]
pub enum TranscriptionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("No admission slot freed within {}ms", .waited.as_millis())]
    AdmissionTimeout { waited: Duration },

    #[error("Engine failure ({reason}): {message}")]
    EngineFailure {
        reason: EngineFailureReason,
        message: String,
    },

    #[error("Deadline exceeded during {stage}")]
    Cancelled { stage: &'static str },
}

impl TranscriptionError {
    pub fn internal(message: impl Into<String>) -> Self {
        TranscriptionError::EngineFailure {
            reason: EngineFailureReason::Internal,
            message: message.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            TranscriptionError::Validation(_) => StatusCode::BAD_REQUEST,
            TranscriptionError::AdmissionTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
            TranscriptionError::Cancelled { .. } => StatusCode::GATEWAY_TIMEOUT,
            TranscriptionError::EngineFailure {
                reason: EngineFailureReason::Decode,
                ..
            } => StatusCode::UNPROCESSABLE_ENTITY,
            TranscriptionError::EngineFailure {
                reason: EngineFailureReason::Internal,
                ..
            } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code for the error body
    pub fn error_code(&self) -> &'static str {
        match self {
            TranscriptionError::Validation(ValidationError::UnsupportedFormat(_)) => {
                "UNSUPPORTED_FORMAT"
            }
            TranscriptionError::Validation(ValidationError::TooLarge { .. }) => "UPLOAD_TOO_LARGE",
            TranscriptionError::Validation(ValidationError::Truncated(_)) => "UPLOAD_TRUNCATED",
            TranscriptionError::Validation(ValidationError::Empty) => "UPLOAD_EMPTY",
            TranscriptionError::Validation(ValidationError::InvalidOption(_)) => "INVALID_OPTION",
            TranscriptionError::Validation(ValidationError::Malformed(_)) => "BAD_REQUEST",
            TranscriptionError::AdmissionTimeout { .. } => "SERVER_BUSY",
            TranscriptionError::Cancelled { .. } => "DEADLINE_EXCEEDED",
            TranscriptionError::EngineFailure {
                reason: EngineFailureReason::Decode,
                ..
            } => "UNDECODABLE_AUDIO",
            TranscriptionError::EngineFailure {
                reason: EngineFailureReason::Internal,
                ..
            } => "INTERNAL_ERROR",
        }
    }

    /// Message safe to show the client
    fn public_message(&self) -> String {
        match self {
            TranscriptionError::EngineFailure {
                reason: EngineFailureReason::Internal,
                ..
            } => "Transcription engine failed".to_string(),
            TranscriptionError::AdmissionTimeout { .. } => {
                "Server is at capacity, retry later".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<EngineError> for TranscriptionError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Decode(message) => TranscriptionError::EngineFailure {
                reason: EngineFailureReason::Decode,
                message,
            },
            EngineError::Internal(message) => TranscriptionError::internal(message),
            EngineError::Cancelled => TranscriptionError::Cancelled { stage: "inference" },
        }
    }
}

impl IntoResponse for TranscriptionError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(ErrorBody {
            error: ErrorDetail {
                code: self.error_code().to_string(),
                message: self.public_message(),
            },
        });

        let mut response = (status, body).into_response();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, TranscriptionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases: Vec<(TranscriptionError, StatusCode)> = vec![
            (ValidationError::Empty.into(), StatusCode::BAD_REQUEST),
            (
                TranscriptionError::AdmissionTimeout {
                    waited: Duration::from_secs(1),
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                TranscriptionError::Cancelled { stage: "inference" },
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                EngineError::Decode("bad header".into()).into(),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                EngineError::Internal("oom".into()).into(),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(err.status_code(), expected, "{err}");
        }
    }

    #[test]
    fn test_engine_cancel_maps_to_cancelled() {
        let err: TranscriptionError = EngineError::Cancelled.into();
        assert!(matches!(err, TranscriptionError::Cancelled { .. }));
    }

    #[test]
    fn test_internal_detail_not_exposed() {
        let err = TranscriptionError::internal("cuda device 0 lost");
        assert!(!err.public_message().contains("cuda"));
    }

    #[test]
    fn test_busy_response_carries_retry_after() {
        let response = TranscriptionError::AdmissionTimeout {
            waited: Duration::from_millis(10),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.headers().contains_key(header::RETRY_AFTER));
    }
}
