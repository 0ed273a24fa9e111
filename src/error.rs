use std::time::Duration;

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("missing or invalid API key")]
    Unauthorized,
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("request queue is full ({capacity} pending), retry later")]
    QueueFull { capacity: usize },
    #[error("model produced no output within {}s", .0.as_secs_f64())]
    ModelStall(Duration),
    #[error("model execution failed: {0}")]
    Inference(String),
    #[error("request cancelled by client")]
    Cancelled,
    #[error("model is not loaded")]
    ModelLoading,
    #[error("service is shutting down")]
    ShuttingDown,
    #[error("a benchmark is already running")]
    BenchmarkBusy,
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("other: {0}")]
    Other(String),
}

impl ServiceError {
    /// Taxonomy name shared by HTTP error bodies and SSE `error` events.
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::Unauthorized => "AuthError",
            ServiceError::Validation(_) => "ValidationError",
            ServiceError::QueueFull { .. } => "QueueFullError",
            ServiceError::ModelStall(_) => "ModelStallError",
            ServiceError::Cancelled => "CancelledError",
            ServiceError::BenchmarkBusy => "BenchmarkBusyError",
            ServiceError::Inference(_)
            | ServiceError::ModelLoading
            | ServiceError::ShuttingDown
            | ServiceError::Tokenizer(_)
            | ServiceError::Io(_)
            | ServiceError::Other(_) => "RuntimeError",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::Unauthorized => StatusCode::UNAUTHORIZED,
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::QueueFull { .. }
            | ServiceError::ModelLoading
            | ServiceError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::BenchmarkBusy => StatusCode::CONFLICT,
            // Client closed request; nobody is left to read it.
            ServiceError::Cancelled => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
            }
            ServiceError::ModelStall(_)
            | ServiceError::Inference(_)
            | ServiceError::Tokenizer(_)
            | ServiceError::Io(_)
            | ServiceError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        ServiceError::Inference(err.to_string())
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = serde_json::json!({
            "error": self.kind(),
            "detail": self.to_string(),
        });

        let mut response = (status, axum::Json(body)).into_response();
        match self {
            ServiceError::Unauthorized => {
                response
                    .headers_mut()
                    .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("ApiKey"));
            }
            ServiceError::QueueFull { .. } => {
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
            }
            _ => {}
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy_status_codes() {
        assert_eq!(ServiceError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ServiceError::Validation("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServiceError::QueueFull { capacity: 3 }.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ServiceError::ModelStall(Duration::from_secs(1)).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(ServiceError::Cancelled.status().as_u16(), 499);
        assert_eq!(
            ServiceError::ShuttingDown.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(ServiceError::QueueFull { capacity: 1 }.kind(), "QueueFullError");
        assert_eq!(
            ServiceError::ModelStall(Duration::from_millis(10)).kind(),
            "ModelStallError"
        );
        assert_eq!(ServiceError::Inference("boom".into()).kind(), "RuntimeError");
        assert_eq!(ServiceError::ModelLoading.kind(), "RuntimeError");
    }

    #[test]
    fn test_queue_full_response_carries_retry_after() {
        let response = ServiceError::QueueFull { capacity: 2 }.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "1");
    }
}
