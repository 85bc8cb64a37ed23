//! ActivityPub endpoints
//!
//! - Actor document
//! - Inbox (activity receiving)

use axum::body::Bytes;
use axum::{
    Router,
    extract::State,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use http::{HeaderMap, StatusCode, header};

use super::request_host;
use crate::AppState;
use crate::error::AppError;
use crate::federation::model::{ACTIVITY_JSON, ACTIVITYSTREAMS_CONTEXT};
use crate::federation::parse_signature_header;
use crate::metrics::{FEDERATION_REQUEST_DURATION_SECONDS, FEDERATION_REQUESTS_TOTAL};

/// Create ActivityPub router
///
/// Routes:
/// - GET /ap.jsonld - Actor document
/// - POST /inbox - Inbox
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/ap.jsonld", get(actor))
        .route("/inbox", post(inbox))
}

/// GET /ap.jsonld
///
/// Returns the site actor with its public key.
///
/// Content-Type: application/activity+json
async fn actor(State(state): State<AppState>) -> Result<Response, AppError> {
    let base_url = state.config.server.base_url();
    let identity = &state.identity;

    let document = serde_json::json!({
        "@context": [
            ACTIVITYSTREAMS_CONTEXT,
            "https://w3id.org/security/v1"
        ],
        "type": "Person",
        "id": identity.actor().as_str(),
        "preferredUsername": state.config.server.domain,
        "name": state.config.server.domain,
        "url": format!("{}/", base_url),
        "inbox": format!("{}/inbox", base_url),
        "followers": format!("{}/followers.jsonld", base_url),
        "publicKey": {
            "id": identity.key_id().as_str(),
            "owner": identity.actor().as_str(),
            "publicKeyPem": identity.public_key_pem()
        }
    });

    Ok((
        [(header::CONTENT_TYPE, ACTIVITY_JSON)],
        serde_json::to_vec(&document)?,
    )
        .into_response())
}

/// POST /inbox
///
/// Receives incoming ActivityPub activities.
///
/// # Steps
/// 1. Log the signature key id (signatures are not verified)
/// 2. Parse activity
/// 3. Process based on type
async fn inbox(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let _fed_timer = FEDERATION_REQUEST_DURATION_SECONDS
        .with_label_values(&["inbound"])
        .start_timer();

    let host = request_host(&headers)?;

    match headers.get("signature").and_then(|v| v.to_str().ok()) {
        Some(raw) => match parse_signature_header(raw) {
            Ok(signature) => tracing::debug!(
                host,
                key_id = %signature.key_id,
                algorithm = %signature.algorithm,
                "Inbound signature present; not verified"
            ),
            Err(e) => tracing::warn!(host, error = %e, "Unparseable Signature header"),
        },
        None => tracing::info!(host, "Unsigned inbound activity"),
    }

    let result = state.inbox.handle_inbound(&host, &body).await;
    FEDERATION_REQUESTS_TOTAL
        .with_label_values(&["inbound", if result.is_ok() { "success" } else { "error" }])
        .inc();

    let outcome = result?;
    tracing::debug!(host, ?outcome, "Inbound activity handled");
    Ok(StatusCode::OK)
}
