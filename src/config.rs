//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration files (config/default.toml, config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::{net::IpAddr, path::PathBuf, time::Duration};

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub federation: FederationConfig,
    pub delivery: DeliveryConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "blog.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Loopback or `localhost` domain that remote servers cannot reach
    pub fn is_local(&self) -> bool {
        is_local_server_domain(&self.domain)
    }

    /// Get the base URL for the site
    ///
    /// # Returns
    /// Full URL like "https://blog.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }
}

/// On-disk locations
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Entry store root; entries live under `<source_root>/<host>/<id>/`
    pub source_root: PathBuf,
    /// Served files root; holds `<serve_root>/<host>/followers.jsonld`
    pub serve_root: PathBuf,
    /// Remote object cache root
    pub cache_root: PathBuf,
    /// Actor private key. Defaults to `<source_root>/<domain>/private_key.pem`.
    pub key_path: Option<PathBuf>,
}

impl StorageConfig {
    pub fn key_path_for(&self, domain: &str) -> PathBuf {
        self.key_path
            .clone()
            .unwrap_or_else(|| self.source_root.join(domain).join("private_key.pem"))
    }
}

/// Outbound federation behaviour
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Inbox that receives `Create` activities for new entries
    pub relay_inbox: Option<String>,
    pub user_agent: String,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Overall deadline for one reply tree walk
    pub walk_deadline_secs: u64,
    /// Nodes at this depth are returned without children
    pub max_walk_depth: usize,
    /// Ceiling on pages followed per replies collection
    pub max_reply_pages: usize,
    /// When set, placeholders older than this are refetched on resolve
    pub placeholder_retry_secs: Option<u64>,
    /// Permit fetches to loopback and private addresses (tests, LAN setups)
    #[serde(default)]
    pub allow_private_hosts: bool,
}

impl FederationConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn walk_deadline(&self) -> Duration {
        Duration::from_secs(self.walk_deadline_secs)
    }

    pub fn placeholder_retry(&self) -> Option<Duration> {
        self.placeholder_retry_secs.map(Duration::from_secs)
    }
}

/// Outbound delivery queue and retry policy
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    pub queue_capacity: usize,
    /// Deliveries in progress at once, retries included
    pub max_concurrent: usize,
    pub max_retries: u32,
    pub initial_delay_secs: u64,
    pub max_delay_secs: u64,
    pub multiplier: f64,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl LoggingConfig {
    /// Filter used when `RUST_LOG` is unset
    pub fn default_filter(&self) -> String {
        format!("pubsite={},tower_http=debug", self.level.to_ascii_lowercase())
    }

    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (PUBSITE__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.protocol", "http")?
            .set_default("server.domain", "localhost")?
            .set_default("storage.source_root", "src")?
            .set_default("storage.serve_root", "files")?
            .set_default("storage.cache_root", "ap_cache")?
            .set_default("federation.user_agent", "pubsite/0.1.0")?
            .set_default("federation.request_timeout_secs", 30)?
            .set_default("federation.connect_timeout_secs", 10)?
            .set_default("federation.walk_deadline_secs", 120)?
            .set_default("federation.max_walk_depth", 32)?
            .set_default("federation.max_reply_pages", 100)?
            .set_default("federation.allow_private_hosts", false)?
            .set_default("delivery.queue_capacity", 256)?
            .set_default("delivery.max_concurrent", 16)?
            .set_default("delivery.max_retries", 5)?
            .set_default("delivery.initial_delay_secs", 30)?
            .set_default("delivery.max_delay_secs", 3600)?
            .set_default("delivery.multiplier", 2.0)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("PUBSITE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    fn validate(&self) -> Result<(), crate::error::AppError> {
        if !self.server.is_local() && !self.server.protocol.eq_ignore_ascii_case("https") {
            return Err(crate::error::AppError::Config(
                "server.protocol must be https for non-local server domains".to_string(),
            ));
        }

        if !["trace", "debug", "info", "warn", "error"]
            .iter()
            .any(|level| self.logging.level.eq_ignore_ascii_case(level))
        {
            return Err(crate::error::AppError::Config(format!(
                "logging.level must be one of trace, debug, info, warn, error (got {:?})",
                self.logging.level
            )));
        }

        if !["pretty", "json"]
            .iter()
            .any(|format| self.logging.format.eq_ignore_ascii_case(format))
        {
            return Err(crate::error::AppError::Config(format!(
                "logging.format must be pretty or json (got {:?})",
                self.logging.format
            )));
        }

        if self.federation.max_reply_pages == 0 {
            return Err(crate::error::AppError::Config(
                "federation.max_reply_pages must be greater than 0".to_string(),
            ));
        }

        if self.federation.walk_deadline_secs == 0 {
            return Err(crate::error::AppError::Config(
                "federation.walk_deadline_secs must be greater than 0".to_string(),
            ));
        }

        if self.delivery.queue_capacity == 0 {
            return Err(crate::error::AppError::Config(
                "delivery.queue_capacity must be greater than 0".to_string(),
            ));
        }

        if self.delivery.max_concurrent == 0 {
            return Err(crate::error::AppError::Config(
                "delivery.max_concurrent must be greater than 0".to_string(),
            ));
        }

        if self.delivery.multiplier < 1.0 {
            return Err(crate::error::AppError::Config(
                "delivery.multiplier must be at least 1.0".to_string(),
            ));
        }

        if let Some(relay) = &self.federation.relay_inbox {
            url::Url::parse(relay).map_err(|e| {
                crate::error::AppError::Config(format!(
                    "federation.relay_inbox is not a valid URL: {}",
                    e
                ))
            })?;
        }

        Ok(())
    }
}

fn normalized_server_host(domain: &str) -> String {
    let trimmed = domain.trim();
    let parsed_host = url::Url::parse(&format!("http://{trimmed}"))
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_string()));
    let host = parsed_host.unwrap_or_else(|| trimmed.to_string());
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn is_local_server_domain(domain: &str) -> bool {
    let host = normalized_server_host(domain);
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback() || ip.is_unspecified();
    }

    false
}
