//! pubsite - ActivityPub federation for a personal publishing site
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - ActivityPub endpoints (actor, inbox)                     │
//! │  - Site endpoints (object lookup, reply trees, entries)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Service / Federation Layer                   │
//! │  - Entry store and render hook                              │
//! │  - Object resolver, reply tree walker                       │
//! │  - Inbox processing, outbound delivery queue                │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Files on disk                           │
//! │  - Remote object cache                                      │
//! │  - Follower lists, entries, actor key                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers
//! - `service`: Entry store and rendering hook
//! - `federation`: ActivityPub federation handling
//! - `config`: Configuration management
//! - `error`: Error types
//! - `metrics`: Prometheus metrics

pub mod api;
pub mod config;
pub mod error;
pub mod federation;
pub mod metrics;
pub mod service;

use std::sync::Arc;

use url::Url;

use federation::{
    ActivityDispatcher, DeliveryQueue, DeliveryWorker, FederationClient, FollowerStore,
    InboxProcessor, ObjectCache, ObjectResolver, ResolverOptions, RetryPolicy, SigningIdentity,
};
use service::{EntryService, LogRenderer, Renderer};

/// Application state shared across all handlers
///
/// Cloned for each request; every component is behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Actor IRI and signing key
    pub identity: Arc<SigningIdentity>,

    /// Cache-first remote object resolution
    pub resolver: Arc<ObjectResolver<FederationClient>>,

    /// Inbound activity handling
    pub inbox: Arc<InboxProcessor>,

    /// Outbound delivery queue
    pub delivery: DeliveryQueue,

    /// Local entry store
    pub entries: Arc<EntryService>,

    /// Site rendering hook
    pub renderer: Arc<dyn Renderer>,
}

impl AppState {
    /// Initialize application state with the logging renderer
    ///
    /// The returned worker drains the delivery queue; spawn it next to
    /// the server.
    pub async fn new(config: config::AppConfig) -> Result<(Self, DeliveryWorker), error::AppError> {
        Self::with_renderer(config, Arc::new(LogRenderer)).await
    }

    /// Initialize application state
    ///
    /// # Steps
    /// 1. Load or generate the actor key
    /// 2. Build the signed HTTP client
    /// 3. Ensure the follower list exists
    /// 4. Wire resolver, inbox and delivery queue
    /// 5. Render the site once
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn with_renderer(
        config: config::AppConfig,
        renderer: Arc<dyn Renderer>,
    ) -> Result<(Self, DeliveryWorker), error::AppError> {
        tracing::info!("Initializing application state...");

        let domain = config.server.domain.clone();
        let actor = actor_iri(&config.server)?;

        // 1. Actor key
        let key_path = config.storage.key_path_for(&domain);
        let identity = Arc::new(SigningIdentity::load_or_create(&key_path, actor.clone()).await?);
        tracing::info!(key_id = %identity.key_id(), "Signing identity loaded");

        // 2. HTTP client for federation
        let http_client = reqwest::Client::builder()
            .user_agent(config.federation.user_agent.clone())
            .timeout(config.federation.request_timeout())
            .connect_timeout(config.federation.connect_timeout())
            .build()
            .map_err(|e| error::AppError::Internal(e.into()))?;
        let client = FederationClient::new(
            http_client,
            identity.clone(),
            config.federation.allow_private_hosts,
        );

        // 3. Follower list
        let followers = FollowerStore::new(&config.storage.serve_root);
        let list = followers.ensure(&domain, &actor).await?;
        metrics::FOLLOWERS_TOTAL.set(i64::try_from(list.len()).unwrap_or(i64::MAX));
        tracing::info!(followers = list.len(), "Follower list ready");

        // 4. Federation components
        let resolver = ObjectResolver::new(
            client.clone(),
            ObjectCache::new(&config.storage.cache_root),
            ResolverOptions {
                max_pages: config.federation.max_reply_pages,
                placeholder_retry: config.federation.placeholder_retry(),
            },
        );
        let (delivery, receiver) = DeliveryQueue::channel(config.delivery.queue_capacity);
        let worker = DeliveryWorker::new(
            Arc::new(ActivityDispatcher::new(client)),
            receiver,
            RetryPolicy::from(&config.delivery),
            config.delivery.max_concurrent,
        );
        let inbox = InboxProcessor::new(followers, delivery.clone(), actor.clone());
        let entries = EntryService::new(
            &config.storage.source_root,
            config.server.protocol.clone(),
            actor,
        );

        let state = Self {
            config: Arc::new(config),
            identity,
            resolver: Arc::new(resolver),
            inbox: Arc::new(inbox),
            delivery,
            entries: Arc::new(entries),
            renderer,
        };

        // 5. Initial render
        let count = state.render(&domain).await?;
        metrics::ENTRIES_TOTAL.set(i64::try_from(count).unwrap_or(i64::MAX));

        tracing::info!("Application state initialized successfully");
        Ok((state, worker))
    }

    /// Hand every entry of `host` to the renderer; returns the entry count.
    pub async fn render(&self, host: &str) -> Result<usize, error::AppError> {
        let entries = self.entries.list_entries(host).await?;
        self.renderer.render(host, &entries)?;
        Ok(entries.len())
    }
}

/// `<base-url>/ap.jsonld`
pub fn actor_iri(server: &config::ServerConfig) -> Result<Url, error::AppError> {
    Url::parse(&format!("{}/ap.jsonld", server.base_url()))
        .map_err(|e| error::AppError::Config(format!("invalid server domain: {}", e)))
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::{compression::CompressionLayer, trace::TraceLayer};

    let cors_layer = build_cors_layer(&state.config.server);

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::activitypub_router())
        .merge(api::admin_router())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer)
        .with_state(state)
        .merge(api::metrics_router())
}

fn build_cors_layer(server: &config::ServerConfig) -> tower_http::cors::CorsLayer {
    use axum::http::HeaderValue;
    use tower_http::cors::{Any, CorsLayer};

    if !server.protocol.eq_ignore_ascii_case("https") {
        return CorsLayer::permissive();
    }

    let allowed_origin = server.base_url();
    match HeaderValue::from_str(&allowed_origin) {
        Ok(origin) => CorsLayer::new()
            .allow_origin([origin])
            .allow_methods(Any)
            .allow_headers(Any),
        Err(error) => {
            tracing::error!(
                %error,
                origin = %allowed_origin,
                "Failed to parse CORS origin from server base URL; denying cross-origin requests"
            );
            CorsLayer::new().allow_methods(Any).allow_headers(Any)
        }
    }
}

async fn health_check() -> &'static str {
    "OK"
}
