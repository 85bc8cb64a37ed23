//! HTTP Signatures for ActivityPub
//!
//! Implements request signing per:
//! https://docs.joinmastodon.org/spec/security/
//!
//! Inbound signatures are parsed for logging only; they are not verified.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use http::HeaderValue;
use http::header::{DATE, HOST};
use rsa::signature::{SignatureEncoding, Signer};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::keys::SigningIdentity;

/// Seconds a signature stays valid after signing
pub const SIGNATURE_EXPIRY_SECS: i64 = 3600;

/// Request signing failures
#[derive(Debug, Error)]
pub enum SignatureError {
    /// A header that must be covered by the signature is not set
    #[error("missing {0} header")]
    MissingHeader(&'static str),

    #[error("invalid {0} header value")]
    InvalidHeader(&'static str),

    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),

    /// Streaming bodies cannot be digested before sending
    #[error("request body is not buffered")]
    UnbufferedBody,

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("malformed Signature header: {0}")]
    Malformed(String),
}

/// Format a timestamp for the `Date` header (RFC 1123, GMT)
pub fn http_date(at: chrono::DateTime<chrono::Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Sign an outgoing request in place
///
/// `Date` and `Host` must already be set. Covers
/// `(request-target) date host`, plus `digest` when the request has a
/// body, in which case a `Digest` header is added as well.
///
/// # Example
/// ```ignore
/// let mut request = client.post(inbox).body(body).build()?;
/// request.headers_mut().insert(DATE, http_date(Utc::now()).parse()?);
/// request.headers_mut().insert(HOST, "remote.example".parse()?);
/// sign_request(&identity, &mut request)?;
/// ```
pub fn sign_request(
    identity: &SigningIdentity,
    request: &mut reqwest::Request,
) -> Result<(), SignatureError> {
    let date = header_str(request.headers(), DATE, "date")?.to_string();
    let host = header_str(request.headers(), HOST, "host")?.to_string();

    let url = request.url();
    let path_and_query = match url.query() {
        Some(q) => format!("{}?{}", url.path(), q),
        None => url.path().to_string(),
    };
    let request_target = format!(
        "{} {}",
        request.method().as_str().to_lowercase(),
        path_and_query
    );

    let digest = match request.body() {
        Some(body) => {
            let bytes = body.as_bytes().ok_or(SignatureError::UnbufferedBody)?;
            Some(generate_digest(bytes))
        }
        None => None,
    };

    let mut signing_parts = vec![
        format!("(request-target): {}", request_target),
        format!("date: {}", date),
        format!("host: {}", host),
    ];
    let mut headers_list = vec!["(request-target)", "date", "host"];

    if let Some(ref digest_value) = digest {
        signing_parts.push(format!("digest: {}", digest_value));
        headers_list.push("digest");
    }

    let signing_string = signing_parts.join("\n");

    let signature = identity
        .signing_key()
        .try_sign(signing_string.as_bytes())
        .map_err(|e| SignatureError::Signing(e.to_string()))?;
    let signature_b64 = BASE64.encode(signature.to_bytes());

    let expires = chrono::Utc::now().timestamp() + SIGNATURE_EXPIRY_SECS;

    let signature_header = format!(
        "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\",expires=\"{}\"",
        identity.key_id(),
        headers_list.join(" "),
        signature_b64,
        expires
    );

    let headers = request.headers_mut();
    if let Some(digest_value) = digest {
        headers.insert(
            "digest",
            HeaderValue::from_str(&digest_value)
                .map_err(|_| SignatureError::InvalidHeader("digest"))?,
        );
    }
    headers.insert(
        "signature",
        HeaderValue::from_str(&signature_header)
            .map_err(|_| SignatureError::InvalidHeader("signature"))?,
    );

    Ok(())
}

fn header_str<'a>(
    headers: &'a http::HeaderMap,
    name: http::header::HeaderName,
    label: &'static str,
) -> Result<&'a str, SignatureError> {
    headers
        .get(name)
        .ok_or(SignatureError::MissingHeader(label))?
        .to_str()
        .map_err(|_| SignatureError::InvalidHeader(label))
}

/// Parsed Signature header
#[derive(Debug, Clone)]
pub struct ParsedSignature {
    /// Key ID (URL to public key)
    pub key_id: String,
    /// Algorithm (usually rsa-sha256)
    pub algorithm: String,
    /// Signed header names
    pub headers: Vec<String>,
    /// Base64-encoded signature
    pub signature: String,
}

/// Parse Signature header value
///
/// # Format
/// ```text
/// keyId="...",algorithm="...",headers="...",signature="..."
/// ```
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, SignatureError> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;

    for part in header.split(',') {
        let part = part.trim();
        if let Some((key, value)) = part.split_once('=') {
            let key = key.trim();
            let value = value.trim().trim_matches('"');

            match key {
                "keyId" => key_id = Some(value.to_string()),
                "algorithm" => algorithm = Some(value.to_string()),
                "headers" => {
                    headers = Some(
                        value
                            .split_whitespace()
                            .map(|s| s.to_ascii_lowercase())
                            .collect(),
                    )
                }
                "signature" => signature = Some(value.to_string()),
                _ => {}
            }
        }
    }

    let missing = |field: &str| SignatureError::Malformed(format!("missing {}", field));
    Ok(ParsedSignature {
        key_id: key_id.ok_or_else(|| missing("keyId"))?,
        // Absent algorithm means "derive from key" (hs2019)
        algorithm: algorithm.unwrap_or_else(|| "hs2019".to_string()),
        headers: headers.unwrap_or_else(|| vec!["date".to_string()]),
        signature: signature.ok_or_else(|| missing("signature"))?,
    })
}

/// Generate SHA-256 digest for body
///
/// # Returns
/// `SHA-256=base64(hash)`
pub fn generate_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    let hash = hasher.finalize();
    format!("SHA-256={}", BASE64.encode(hash))
}
