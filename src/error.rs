//! Error types for pubsite
//!
//! All errors in the application are converted to `AppError`,
//! which implements `IntoResponse` for proper HTTP error responses.
//! Federation components keep their own narrower error types
//! (`SignatureError`, `FetchError`, `DeliveryError`) and convert into
//! `AppError` at the module boundary.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::federation::{DeliveryError, FetchError, SignatureError};

/// Application-wide error type
#[derive(Debug, Error)]
pub enum AppError {
    /// Resource not found (404)
    #[error("Resource not found")]
    NotFound,

    /// Validation error (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Local file could not be read or written (500)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Local state or remote payload did not decode (500)
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Cached entry or follower list exists but is corrupt (500)
    #[error("Corrupt state at {path}: {reason}")]
    CorruptState { path: String, reason: String },

    /// HTTP client error (502)
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Remote object fetch failed where no placeholder applies (502)
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Outbound delivery failed (502)
    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    /// Request signing failed (500)
    #[error("Signature error: {0}")]
    Signature(#[from] SignatureError),

    /// Operation exceeded its deadline (504)
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl IntoResponse for AppError {
    /// Convert error to HTTP response
    ///
    /// Client errors carry their message; server-side failures are logged
    /// and answered with a generic message.
    fn into_response(self) -> Response {
        use axum::Json;

        let (status, error_message, error_type) = match &self {
            AppError::NotFound => (StatusCode::NOT_FOUND, self.to_string(), "not_found"),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone(), "validation"),
            AppError::HttpClient(_) => (
                StatusCode::BAD_GATEWAY,
                "Upstream request failed".to_string(),
                "http_client",
            ),
            AppError::Fetch(_) => (
                StatusCode::BAD_GATEWAY,
                "Upstream request failed".to_string(),
                "fetch",
            ),
            AppError::Delivery(_) => (
                StatusCode::BAD_GATEWAY,
                "Delivery failed".to_string(),
                "delivery",
            ),
            AppError::Timeout(_) => (
                StatusCode::GATEWAY_TIMEOUT,
                "Operation timed out".to_string(),
                "timeout",
            ),
            AppError::Io(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
                "io",
            ),
            AppError::Serialization(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
                "serialization",
            ),
            AppError::CorruptState { .. } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
                "corrupt_state",
            ),
            AppError::Signature(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
                "signature",
            ),
            AppError::Config(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
                "config",
            ),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
                "internal",
            ),
        };

        if status.is_server_error() {
            tracing::error!(error = %self, error_type, "Request failed");
        }

        use crate::metrics::ERRORS_TOTAL;
        ERRORS_TOTAL.with_label_values(&[error_type]).inc();

        let body = Json(serde_json::json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
