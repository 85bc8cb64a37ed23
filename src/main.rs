//! pubsite binary entry point

use pubsite::{AppState, config};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application entry point
///
/// # Setup
/// 1. Load configuration from file and environment
/// 2. Initialize tracing/logging from the `logging` section
/// 3. Register metrics
/// 4. Initialize AppState and start the delivery worker
/// 5. Build Axum router and start HTTP server
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Load configuration
    let config = config::AppConfig::load()?;

    // 2. Initialize tracing/logging; RUST_LOG overrides the configured level
    init_tracing(&config.logging);

    tracing::info!("Starting pubsite...");
    tracing::info!(
        domain = %config.server.domain,
        protocol = %config.server.protocol,
        relay_inbox = ?config.federation.relay_inbox,
        "Configuration loaded"
    );
    if config.server.is_local() {
        tracing::warn!(
            domain = %config.server.domain,
            "Running with a local domain; remote servers cannot reach this actor"
        );
    }

    // 3. Initialize metrics
    pubsite::metrics::init_metrics();

    // 4. Initialize application state
    let (state, worker) = AppState::new(config.clone()).await?;
    let worker = worker.spawn();

    // 5. Build Axum router
    let app = pubsite::build_router(state);

    // 6. Start HTTP server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);
    tracing::info!("Public URL: {}", config.server.base_url());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Returns once the router has dropped the last queue handle and
    // in-flight deliveries have finished.
    if let Err(e) = worker.await {
        tracing::error!(error = %e, "Delivery worker panicked");
    }

    Ok(())
}

fn init_tracing(logging: &config::LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| logging.default_filter().into());

    if logging.is_json() {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
