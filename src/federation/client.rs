//! Signed federation HTTP client
//!
//! Every outbound request, GET or POST, carries `Date` and `Host` and is
//! signed with the site's actor key.

use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use http::HeaderValue;
use http::header::{ACCEPT, CONTENT_TYPE, DATE, HOST};
use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;
use url::Url;

use super::keys::SigningIdentity;
use super::model::ACTIVITY_JSON;
use super::signature::{SignatureError, http_date, sign_request};
use crate::metrics::{FEDERATION_REQUEST_DURATION_SECONDS, FEDERATION_REQUESTS_TOTAL};

const ACCEPT_ACTIVITY: &str =
    "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

/// Failures talking to a remote server
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {iri} failed: {source}")]
    Transport {
        iri: Url,
        #[source]
        source: reqwest::Error,
    },

    #[error("{iri} answered HTTP {status}")]
    Status { iri: Url, status: StatusCode },

    /// The remote answered 2xx with something that is not an AS document
    #[error("{iri} returned an undecodable body: {reason}")]
    Decode { iri: Url, reason: String },

    #[error("refusing to contact {host}: local or private address")]
    Blocked { host: String },

    #[error("unsupported IRI {0}")]
    UnsupportedIri(Url),

    #[error(transparent)]
    Signature(#[from] SignatureError),
}

impl FetchError {
    /// Remote could not be reached or refused the request
    ///
    /// These are the failures that the resolver answers with a placeholder.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, FetchError::Transport { .. } | FetchError::Status { .. })
    }
}

/// Source of remote ActivityStreams documents
pub trait ObjectFetcher: Send + Sync {
    fn fetch(&self, iri: &Url) -> impl Future<Output = Result<Value, FetchError>> + Send;
}

/// HTTP client that signs with the site's actor key
#[derive(Clone)]
pub struct FederationClient {
    http: reqwest::Client,
    identity: Arc<SigningIdentity>,
    allow_private_hosts: bool,
}

impl FederationClient {
    pub fn new(
        http: reqwest::Client,
        identity: Arc<SigningIdentity>,
        allow_private_hosts: bool,
    ) -> Self {
        Self {
            http,
            identity,
            allow_private_hosts,
        }
    }

    pub fn identity(&self) -> &SigningIdentity {
        &self.identity
    }

    /// Signed GET of one document
    pub async fn get_json(&self, iri: &Url) -> Result<Value, FetchError> {
        let response = self
            .send(reqwest::Method::GET, iri, None, "fetch")
            .await?;
        response.json::<Value>().await.map_err(|e| FetchError::Decode {
            iri: iri.clone(),
            reason: e.to_string(),
        })
    }

    /// Signed POST of an activity body; returns the remote status on success
    pub async fn post_activity(&self, inbox: &Url, body: Vec<u8>) -> Result<StatusCode, FetchError> {
        let response = self
            .send(reqwest::Method::POST, inbox, Some(body), "deliver")
            .await?;
        Ok(response.status())
    }

    async fn send(
        &self,
        method: reqwest::Method,
        iri: &Url,
        body: Option<Vec<u8>>,
        direction: &'static str,
    ) -> Result<reqwest::Response, FetchError> {
        self.check_destination(iri).await?;

        let mut builder = self.http.request(method, iri.clone()).header(ACCEPT, ACCEPT_ACTIVITY);
        if let Some(body) = body {
            builder = builder.header(CONTENT_TYPE, ACTIVITY_JSON).body(body);
        }
        let mut request = builder.build().map_err(|source| FetchError::Transport {
            iri: iri.clone(),
            source,
        })?;

        let headers = request.headers_mut();
        headers.insert(
            DATE,
            HeaderValue::from_str(&http_date(chrono::Utc::now()))
                .map_err(|_| SignatureError::InvalidHeader("date"))?,
        );
        headers.insert(
            HOST,
            HeaderValue::from_str(&host_header(iri)?)
                .map_err(|_| SignatureError::InvalidHeader("host"))?,
        );
        sign_request(&self.identity, &mut request)?;

        let started = Instant::now();
        let result = self.http.execute(request).await;
        FEDERATION_REQUEST_DURATION_SECONDS
            .with_label_values(&[direction])
            .observe(started.elapsed().as_secs_f64());

        let response = match result {
            Ok(response) => response,
            Err(source) => {
                FEDERATION_REQUESTS_TOTAL
                    .with_label_values(&[direction, "error"])
                    .inc();
                tracing::warn!(iri = %iri, error = %source, "Federation request failed");
                return Err(FetchError::Transport {
                    iri: iri.clone(),
                    source,
                });
            }
        };

        let status = response.status();
        FEDERATION_REQUESTS_TOTAL
            .with_label_values(&[direction, status.as_str()])
            .inc();

        if !status.is_success() {
            tracing::warn!(iri = %iri, status = %status, "Remote server rejected request");
            return Err(FetchError::Status {
                iri: iri.clone(),
                status,
            });
        }

        tracing::debug!(iri = %iri, status = %status, direction, "Federation request completed");
        Ok(response)
    }

    async fn check_destination(&self, iri: &Url) -> Result<(), FetchError> {
        match iri.scheme() {
            "http" | "https" => {}
            _ => return Err(FetchError::UnsupportedIri(iri.clone())),
        }
        let host = iri
            .host_str()
            .ok_or_else(|| FetchError::UnsupportedIri(iri.clone()))?;

        if self.allow_private_hosts {
            return Ok(());
        }
        if is_disallowed_host(host) {
            return Err(FetchError::Blocked {
                host: host.to_string(),
            });
        }
        let port = iri
            .port_or_known_default()
            .ok_or_else(|| FetchError::UnsupportedIri(iri.clone()))?;
        validate_resolved_host_ips(host, port).await
    }
}

impl ObjectFetcher for FederationClient {
    fn fetch(&self, iri: &Url) -> impl Future<Output = Result<Value, FetchError>> + Send {
        self.get_json(iri)
    }
}

/// `Host` value for `iri`: host plus any non-default port
fn host_header(iri: &Url) -> Result<String, FetchError> {
    let host = iri
        .host_str()
        .ok_or_else(|| FetchError::UnsupportedIri(iri.clone()))?;
    Ok(match iri.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

fn is_disallowed_host(host: &str) -> bool {
    let normalized = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }

    normalized
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

async fn validate_resolved_host_ips(host: &str, port: u16) -> Result<(), FetchError> {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();

    // Resolution failures surface later as transport errors.
    let Ok(lookup) = tokio::net::lookup_host((normalized.as_str(), port)).await else {
        return Ok(());
    };

    for addr in lookup {
        if is_disallowed_ip(addr.ip()) {
            return Err(FetchError::Blocked {
                host: host.to_string(),
            });
        }
    }

    Ok(())
}
