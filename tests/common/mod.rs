//! Common test utilities for E2E tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use pubsite::service::{LogRenderer, Renderer};
use pubsite::{AppState, config};
use serde_json::Value;
use tempfile::TempDir;
use tokio::net::TcpListener;

/// Fixed actor key so servers start without generating one
pub const ACTOR_KEY_PEM: &str = include_str!("actor_key.pem");

/// Test server instance
pub struct TestServer {
    pub addr: String,
    /// `Host` the server answers to, `127.0.0.1:<port>`
    pub domain: String,
    pub state: AppState,
    pub temp_dir: TempDir,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Create a new test server instance
    pub async fn new() -> Self {
        Self::with_relay(None).await
    }

    /// Test server that queues new entries for `relay_inbox`
    pub async fn with_relay(relay_inbox: Option<String>) -> Self {
        Self::start(relay_inbox, Arc::new(LogRenderer)).await
    }

    /// Test server with a custom site renderer
    pub async fn start(relay_inbox: Option<String>, renderer: Arc<dyn Renderer>) -> Self {
        let temp_dir = TempDir::new().unwrap();

        // Bind first; the port is part of the actor IRI
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let domain = addr.to_string();

        let state = test_state(&temp_dir, &domain, relay_inbox, renderer).await;

        // Redirects are asserted on, not followed
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap();

        let app = pubsite::build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr: format!("http://{}", addr),
            domain,
            state,
            temp_dir,
            client,
        }
    }

    /// Get base URL for API requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    pub fn cache_root(&self) -> std::path::PathBuf {
        self.state.config.storage.cache_root.clone()
    }

    pub fn source_root(&self) -> std::path::PathBuf {
        self.state.config.storage.source_root.clone()
    }

    /// Parsed `followers.jsonld` of this server
    pub fn followers_document(&self) -> Value {
        let path = self
            .state
            .config
            .storage
            .serve_root
            .join(&self.domain)
            .join("followers.jsonld");
        serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
    }

    /// POST a urlencoded form
    pub async fn post_form(&self, path: &str, fields: &[(&str, &str)]) -> reqwest::Response {
        let body: String = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(fields)
            .finish();
        self.client
            .post(self.url(path))
            .header("content-type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .unwrap()
    }
}

/// App state rooted in `dir` with its delivery worker running
pub async fn test_state(
    dir: &TempDir,
    domain: &str,
    relay_inbox: Option<String>,
    renderer: Arc<dyn Renderer>,
) -> AppState {
    let config = test_config(dir, domain, relay_inbox);

    let key_path = config.storage.key_path_for(domain);
    std::fs::create_dir_all(key_path.parent().unwrap()).unwrap();
    std::fs::write(&key_path, ACTOR_KEY_PEM).unwrap();

    let (state, worker) = AppState::with_renderer(config, renderer).await.unwrap();
    worker.spawn();
    state
}

fn test_config(dir: &TempDir, domain: &str, relay_inbox: Option<String>) -> config::AppConfig {
    config::AppConfig {
        server: config::ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            domain: domain.to_string(),
            protocol: "http".to_string(),
        },
        storage: config::StorageConfig {
            source_root: dir.path().join("src"),
            serve_root: dir.path().join("files"),
            cache_root: dir.path().join("ap_cache"),
            key_path: None,
        },
        federation: config::FederationConfig {
            relay_inbox,
            user_agent: "pubsite-test".to_string(),
            request_timeout_secs: 5,
            connect_timeout_secs: 2,
            walk_deadline_secs: 10,
            max_walk_depth: 8,
            max_reply_pages: 10,
            placeholder_retry_secs: None,
            allow_private_hosts: true,
        },
        delivery: config::DeliveryConfig {
            queue_capacity: 16,
            max_concurrent: 4,
            max_retries: 0,
            initial_delay_secs: 0,
            max_delay_secs: 0,
            multiplier: 1.0,
        },
        logging: config::LoggingConfig {
            level: "info".to_string(),
            format: "pretty".to_string(),
        },
    }
}

/// Request received by the mock remote server
#[derive(Debug, Clone)]
pub struct ReceivedRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ReceivedRequest {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap()
    }

    pub fn header(&self, name: &str) -> &str {
        self.headers.get(name).unwrap().to_str().unwrap()
    }
}

#[derive(Clone, Default)]
struct MockState {
    documents: Arc<Mutex<HashMap<String, Value>>>,
    received: Arc<Mutex<Vec<ReceivedRequest>>>,
    post_status: Arc<Mutex<Option<StatusCode>>>,
}

/// Remote ActivityPub server
///
/// GET serves registered documents (404 otherwise); POST is recorded
/// and answered with 202 unless overridden.
pub struct MockRemote {
    pub base: String,
    state: MockState,
}

impl MockRemote {
    pub async fn start() -> Self {
        let state = MockState::default();
        let app = axum::Router::new()
            .fallback(mock_handler)
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base, state }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// Serve `document` at `path`
    pub fn serve(&self, path: &str, document: Value) {
        self.state
            .documents
            .lock()
            .unwrap()
            .insert(path.to_string(), document);
    }

    /// Answer every POST with `status`
    pub fn reject_posts(&self, status: StatusCode) {
        *self.state.post_status.lock().unwrap() = Some(status);
    }

    pub fn requests(&self) -> Vec<ReceivedRequest> {
        self.state.received.lock().unwrap().clone()
    }

    pub fn gets_to(&self, path: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.method == Method::GET && r.path == path)
            .count()
    }

    pub fn posts_to(&self, path: &str) -> Vec<ReceivedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == Method::POST && r.path == path)
            .collect()
    }

    /// Wait until `count` POSTs reached `path`
    pub async fn wait_for_posts(&self, path: &str, count: usize) -> Vec<ReceivedRequest> {
        for _ in 0..100 {
            let posts = self.posts_to(path);
            if posts.len() >= count {
                return posts;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("expected {} POSTs to {}, got {:?}", count, path, self.posts_to(path));
    }
}

async fn mock_handler(
    State(state): State<MockState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path().to_string();
    state.received.lock().unwrap().push(ReceivedRequest {
        method: method.clone(),
        path: path.clone(),
        headers,
        body,
    });

    if method == Method::POST {
        let status = state.post_status.lock().unwrap().unwrap_or(StatusCode::ACCEPTED);
        return status.into_response();
    }

    match state.documents.lock().unwrap().get(&path) {
        Some(document) => (
            [("content-type", "application/activity+json")],
            document.to_string(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
