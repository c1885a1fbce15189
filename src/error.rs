//! API error types with structured JSON responses.

use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::compositor::{CompositeError, StrategyAttempt};
use crate::validation::ValidationError;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<StrategyAttempt>,
}

/// API-level errors with HTTP status mapping.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),
    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),
    #[error("Unprocessable template: {0}")]
    Unprocessable(String),
    #[error("Composite failed: {message}")]
    CompositeFailed {
        message: String,
        attempts: Vec<StrategyAttempt>,
    },
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message, attempts) = match self {
            ApiError::BadRequest(detail) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", detail, Vec::new()),
            ApiError::UnsupportedMediaType(detail) => (
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "UNSUPPORTED_MEDIA_TYPE",
                detail,
                Vec::new(),
            ),
            ApiError::PayloadTooLarge(detail) => (
                StatusCode::PAYLOAD_TOO_LARGE,
                "PAYLOAD_TOO_LARGE",
                detail,
                Vec::new(),
            ),
            ApiError::Unprocessable(detail) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "UNPROCESSABLE",
                detail,
                Vec::new(),
            ),
            ApiError::CompositeFailed { message, attempts } => {
                (StatusCode::BAD_GATEWAY, "COMPOSITE_FAILED", message, attempts)
            }
            ApiError::NotFound(detail) => (StatusCode::NOT_FOUND, "NOT_FOUND", detail, Vec::new()),
            ApiError::Internal(detail) => {
                tracing::error!(detail, "API internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL",
                    "An internal error occurred".to_string(),
                    Vec::new(),
                )
            }
        };

        let body = ErrorBody {
            error: ErrorDetail {
                code,
                message,
                attempts,
            },
        };
        (status, Json(body)).into_response()
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::TooLarge { .. } => ApiError::PayloadTooLarge(err.to_string()),
            e if e.is_media_type() => ApiError::UnsupportedMediaType(e.to_string()),
            e => ApiError::BadRequest(e.to_string()),
        }
    }
}

impl From<CompositeError> for ApiError {
    fn from(err: CompositeError) -> Self {
        let message = err.to_string();
        match err {
            CompositeError::PageSize { .. } => ApiError::Unprocessable(
                "Could not read the template's first page; is it a valid PDF?".to_string(),
            ),
            CompositeError::AllStrategiesFailed { attempts } => ApiError::CompositeFailed { message, attempts },
            CompositeError::Layers(detail) => ApiError::Unprocessable(detail),
            CompositeError::Io(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::PayloadTooLarge(err.body_text())
        } else {
            ApiError::BadRequest(err.body_text())
        }
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        ApiError::Internal(format!("blocking task failed: {}", err))
    }
}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        ApiError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::Strategy;
    use axum::body::to_bytes;

    async fn body_json(response: Response) -> serde_json::Value {
        let body = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn bad_request_returns_400() {
        let response = ApiError::BadRequest("missing artwork".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], "BAD_REQUEST");
        assert!(json["error"].get("attempts").is_none());
    }

    #[tokio::test]
    async fn internal_hides_details() {
        let response = ApiError::Internal("disk on fire".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(response).await;
        assert_eq!(json["error"]["message"], "An internal error occurred");
    }

    #[tokio::test]
    async fn composite_failure_lists_attempts() {
        let err: ApiError = CompositeError::AllStrategiesFailed {
            attempts: vec![StrategyAttempt {
                strategy: Strategy::QpdfUnderlay,
                succeeded: false,
                duration_ms: 5,
                error: Some("qpdf not found".to_string()),
            }],
        }
        .into();

        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], "COMPOSITE_FAILED");
        assert_eq!(
            json["error"]["message"],
            "all compositing strategies failed: qpdf_underlay (qpdf not found)"
        );
        assert_eq!(json["error"]["attempts"][0]["strategy"], "qpdf_underlay");
        assert_eq!(json["error"]["attempts"][0]["error"], "qpdf not found");
    }

    #[tokio::test]
    async fn page_size_failure_returns_422() {
        let err: ApiError = CompositeError::PageSize { reasons: vec![] }.into();
        assert_eq!(err.into_response().status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn validation_errors_map_to_statuses() {
        let status = |e: ValidationError| ApiError::from(e).into_response().status();

        assert_eq!(status(ValidationError::Missing("artwork")), StatusCode::BAD_REQUEST);
        assert_eq!(status(ValidationError::NotPdf), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert_eq!(status(ValidationError::UnsupportedImage), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert_eq!(
            status(ValidationError::TooLarge { field: "template", limit_mb: 50 }),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(status(ValidationError::InvalidDpi("9000".into())), StatusCode::BAD_REQUEST);
    }
}
