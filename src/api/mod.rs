//! API layer
//!
//! HTTP handlers for:
//! - ActivityPub (actor document, inbox)
//! - Site operations (object lookup, reply trees, entry submission)
//! - Metrics (Prometheus)

mod activitypub;
mod admin;
pub mod metrics;

pub use activitypub::activitypub_router;
pub use admin::admin_router;
pub use metrics::metrics_router;

use http::HeaderMap;

use crate::error::AppError;

/// Host the request was addressed to: `X-Forwarded-Host`, else `Host`
pub(crate) fn request_host(headers: &HeaderMap) -> Result<String, AppError> {
    headers
        .get("x-forwarded-host")
        .or_else(|| headers.get(http::header::HOST))
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').next().unwrap_or(v).trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::Validation("Missing Host header".to_string()))
}
