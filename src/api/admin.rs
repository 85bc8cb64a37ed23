//! Site owner endpoints
//!
//! Remote object lookup, reply trees and entry submission. These sit
//! behind the authenticated file-serving layer in front of this server.

use axum::body::Bytes;
use axum::{
    Form, Router,
    extract::{RawQuery, State},
    http::HeaderMap,
    response::{Json, Redirect},
    routing::post,
};
use serde::Deserialize;
use url::Url;

use super::request_host;
use crate::AppState;
use crate::error::AppError;
use crate::federation::delivery::DeliveryTarget;
use crate::federation::model::{ApObject, RemoteObject};
use crate::federation::tree::ReplyTreeWalker;
use crate::service::NewEntry;

/// Create admin router
///
/// Routes:
/// - POST /get-object - Resolve one remote object
/// - POST /get-tree - Walk the reply tree under an object
/// - POST /retry-object - Forget a placeholder
/// - POST /entry-submit - Publish a new entry
pub fn admin_router() -> Router<AppState> {
    Router::new()
        .route("/get-object", post(get_object))
        .route("/get-tree", post(get_tree))
        .route("/retry-object", post(retry_object))
        .route("/entry-submit", post(entry_submit))
}

// =============================================================================
// Remote objects
// =============================================================================

/// `uri` from the form body, else from the query string
fn uri_param(query: Option<&str>, body: &[u8]) -> Result<Url, AppError> {
    let find = |input: &[u8]| {
        url::form_urlencoded::parse(input)
            .find(|(key, _)| key == "uri")
            .map(|(_, value)| value.into_owned())
    };
    let raw = find(body)
        .or_else(|| query.and_then(|q| find(q.as_bytes())))
        .ok_or_else(|| AppError::Validation("uri is required".to_string()))?;

    let uri = Url::parse(raw.trim())
        .map_err(|e| AppError::Validation(format!("invalid uri: {}", e)))?;
    match uri.scheme() {
        "http" | "https" => Ok(uri),
        scheme => Err(AppError::Validation(format!(
            "unsupported uri scheme: {}",
            scheme
        ))),
    }
}

/// POST /get-object
///
/// Returns the resolved object, replies flattened to IRIs.
async fn get_object(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Result<Json<ApObject>, AppError> {
    let uri = uri_param(query.as_deref(), &body)?;
    let object = state.resolver.resolve(&uri).await?;
    Ok(Json(object))
}

/// POST /get-tree
///
/// Returns the object and all of its replies as a nested tree.
async fn get_tree(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Result<Json<RemoteObject>, AppError> {
    let uri = uri_param(query.as_deref(), &body)?;
    let federation = &state.config.federation;

    let walker = ReplyTreeWalker::new(&*state.resolver, federation.max_walk_depth);
    let tree = walker
        .walk_with_deadline(&uri, federation.walk_deadline())
        .await?;

    tracing::info!(uri = %uri, nodes = tree.size(), "Reply tree materialized");
    Ok(Json(tree))
}

/// Retry response
#[derive(Debug, serde::Serialize)]
pub struct RetryResponse {
    pub uri: Url,
    /// Whether a placeholder was dropped
    pub removed: bool,
}

/// POST /retry-object
///
/// Drops a cached placeholder so the next lookup fetches again.
async fn retry_object(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Result<Json<RetryResponse>, AppError> {
    let uri = uri_param(query.as_deref(), &body)?;
    let removed = state.resolver.cache().remove_placeholder(&uri).await?;
    Ok(Json(RetryResponse { uri, removed }))
}

// =============================================================================
// Entries
// =============================================================================

/// Entry form
#[derive(Debug, Deserialize)]
struct EntrySubmit {
    #[serde(default)]
    title: String,
    entry: String,
    #[serde(default)]
    parent_uri: String,
}

/// POST /entry-submit
///
/// # Steps
/// 1. Store the entry and its Create activity
/// 2. Queue the Create for the relay inbox, if one is configured
/// 3. Re-render the site
/// 4. Redirect to the entry page
async fn entry_submit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<EntrySubmit>,
) -> Result<Redirect, AppError> {
    let host = request_host(&headers)?;

    let parent = match form.parent_uri.trim() {
        "" => None,
        raw => Some(
            Url::parse(raw)
                .map_err(|e| AppError::Validation(format!("invalid parent_uri: {}", e)))?,
        ),
    };

    let published = state
        .entries
        .publish(
            &host,
            NewEntry {
                title: form.title,
                body: form.entry,
                parent,
            },
        )
        .await?;

    match &state.config.federation.relay_inbox {
        Some(relay) => {
            let relay = Url::parse(relay).map_err(|e| AppError::Config(e.to_string()))?;
            // The entry is stored either way; delivery failures are only logged.
            if let Err(e) = state
                .delivery
                .enqueue(published.activity, DeliveryTarget::Inbox(relay.clone()))
            {
                tracing::error!(relay = %relay, error = %e, "Failed to queue Create");
            }
        }
        None => tracing::debug!(id = published.id, "No relay inbox configured"),
    }

    state.render(&host).await?;

    Ok(Redirect::to(&format!("/{}/", published.id)))
}
