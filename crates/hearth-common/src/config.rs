//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for production.
//! Config precedence: env vars > .env file > config.toml > defaults

use serde::Deserialize;
use std::sync::OnceLock;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Get the global application configuration.
///
/// # Panics
/// Panics if config has not been initialized via [`init`].
pub fn get() -> &'static AppConfig {
    CONFIG.get().expect("Config not initialized. Call hearth_common::config::init() first.")
}

/// Initialize the global configuration from environment.
///
/// Should be called once at application startup, before any other code accesses config.
pub fn init() -> Result<&'static AppConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let cfg = config::Config::builder()
        // Defaults
        .set_default("server.name", "localhost")?
        .set_default("replication.host", "127.0.0.1")?
        .set_default("replication.port", 9092)?
        .set_default("replication.client_name", "federation_sender")?
        .set_default("database.max_connections", 10)?
        .set_default("database.min_connections", 2)?
        .set_default("signing.key_path", "./data/signing.key")?
        .set_default("federation.page_size", 100)?
        .set_default("federation.max_connections", 50)?
        .set_default("federation.request_timeout_secs", 60)?
        .set_default("federation.send_receipts", true)?
        // Optional config file
        .add_source(config::File::with_name("config").required(false))
        // Environment variables (HEARTH__SERVER__NAME, HEARTH__DATABASE__URL, etc.)
        .add_source(
            config::Environment::with_prefix("HEARTH")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let app_config: AppConfig = cfg.try_deserialize()?;
    Ok(CONFIG.get_or_init(|| app_config))
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub replication: ReplicationConfig,
    pub database: DatabaseConfig,
    pub signing: SigningConfig,
    pub federation: FederationConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Public server name used as the federation origin (e.g. "hearth.example.com").
    /// Maps to the `HEARTH__SERVER__NAME` env var or `server.name` in config.toml.
    pub name: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReplicationConfig {
    /// Host of the homeserver core's replication listener.
    pub host: String,
    pub port: u16,
    /// Name this worker identifies itself with on the replication connection.
    pub client_name: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SigningConfig {
    /// Path to the Ed25519 signing key file. Generated on first run if missing.
    pub key_path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FederationConfig {
    /// How many events the transaction queue pulls from the store per pass.
    pub page_size: u32,
    /// Upper bound on pooled outbound HTTP connections.
    pub max_connections: u32,
    /// Per-request timeout for federation HTTP calls.
    pub request_timeout_secs: u64,
    /// Whether this worker also emits read receipts over federation.
    pub send_receipts: bool,
}
