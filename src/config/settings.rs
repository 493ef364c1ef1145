//! Application settings and configuration structures.

use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

/// Root configuration structure containing all application settings.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Server configuration (host, port)
    pub server: ServerSettings,

    /// Database configuration (PostgreSQL, persistence collaborator)
    pub database: DatabaseSettings,

    /// Redis configuration (pub/sub backbone and event log)
    pub redis: RedisSettings,

    /// JWT authentication settings
    pub jwt: JwtSettings,

    /// CORS configuration
    pub cors: CorsSettings,

    /// Real-time gateway tuning
    pub gateway: GatewaySettings,

    /// Current environment (development, staging, production)
    pub environment: String,
}

/// Server binding configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    /// Host address to bind to (e.g., "0.0.0.0")
    pub host: String,

    /// Port number to listen on
    pub port: u16,
}

/// PostgreSQL database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    /// Database connection URL
    pub url: String,

    /// Maximum number of connections in the pool
    pub max_connections: u32,

    /// Minimum number of connections to maintain
    pub min_connections: u32,

    /// Connection acquire timeout in seconds
    pub acquire_timeout: u64,
}

/// Redis configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisSettings {
    /// Redis connection URL
    pub url: String,
}

/// JWT authentication configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct JwtSettings {
    /// Secret key for validating tokens
    pub secret: String,
}

/// CORS configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CorsSettings {
    /// Allowed origins (comma-separated in env)
    pub allowed_origins: Vec<String>,

    /// How long browsers may cache preflight results, in seconds
    pub max_age_secs: u64,
}

impl CorsSettings {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

/// Real-time gateway tuning parameters.
///
/// These are operational constants, not protocol constants; every deployment
/// may tune them independently.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySettings {
    /// Expected client heartbeat interval in milliseconds
    pub heartbeat_interval_ms: u64,

    /// Grace period after a missed heartbeat before a SUSPECT connection is
    /// declared DEAD, in milliseconds
    pub heartbeat_grace_ms: u64,

    /// Idle time without heartbeat activity before an online user is
    /// downgraded to away, in seconds
    pub away_threshold_secs: u64,

    /// Period of the presence re-evaluation tick in milliseconds
    pub presence_tick_ms: u64,

    /// Typing indicator time-to-live in seconds
    pub typing_ttl_secs: u64,

    /// Minimum gap between repeated typing broadcasts for the same
    /// (channel, user), in milliseconds
    pub typing_debounce_ms: u64,

    /// Period of the typing expiry sweep in milliseconds
    pub typing_sweep_ms: u64,

    /// Maximum queued outbound frames per connection; exceeding it tears the
    /// connection down
    pub write_queue_depth: usize,

    /// Maximum queued outbound broker publishes process-wide
    pub publish_queue_depth: usize,

    /// Maximum queued domain events awaiting the event log worker
    pub event_log_queue_depth: usize,

    /// Initial broker reconnect backoff in milliseconds
    pub broker_backoff_base_ms: u64,

    /// Maximum broker reconnect backoff in milliseconds
    pub broker_backoff_max_ms: u64,
}

impl GatewaySettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_grace(&self) -> Duration {
        Duration::from_millis(self.heartbeat_grace_ms)
    }

    pub fn away_threshold(&self) -> Duration {
        Duration::from_secs(self.away_threshold_secs)
    }

    pub fn presence_tick(&self) -> Duration {
        Duration::from_millis(self.presence_tick_ms)
    }

    pub fn typing_ttl(&self) -> Duration {
        Duration::from_secs(self.typing_ttl_secs)
    }

    pub fn typing_debounce(&self) -> Duration {
        Duration::from_millis(self.typing_debounce_ms)
    }

    pub fn typing_sweep(&self) -> Duration {
        Duration::from_millis(self.typing_sweep_ms)
    }

    pub fn broker_backoff_base(&self) -> Duration {
        Duration::from_millis(self.broker_backoff_base_ms)
    }

    pub fn broker_backoff_max(&self) -> Duration {
        Duration::from_millis(self.broker_backoff_max_ms)
    }
}

/// Minimum required length for JWT secret (256 bits = 32 bytes)
pub const MIN_JWT_SECRET_LENGTH: usize = 32;

impl Settings {
    /// Load settings from environment variables and configuration files.
    ///
    /// The loading order is:
    /// 1. config/default.toml (base configuration)
    /// 2. config/{RUN_ENV}.toml (environment-specific overrides)
    /// 3. Environment variables (highest priority)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if configuration cannot be loaded or parsed,
    /// or if JWT secret is too short.
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        // Determine the running environment
        let environment = std::env::var("RUN_ENV").unwrap_or_else(|_| "development".into());

        Config::builder()
            // Start with default values
            .set_default("environment", environment.clone())?
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8001)?
            .set_default("database.max_connections", 10)?
            .set_default("database.min_connections", 2)?
            .set_default("database.acquire_timeout", 30)?
            .set_default("cors.allowed_origins", vec!["http://localhost:3000"])?
            .set_default("cors.max_age_secs", 3_600_i64)?
            // Gateway tuning defaults; heartbeat and presence windows match
            // what the product's clients expect
            .set_default("gateway.heartbeat_interval_ms", 30_000_i64)?
            .set_default("gateway.heartbeat_grace_ms", 10_000_i64)?
            .set_default("gateway.away_threshold_secs", 300_i64)?
            .set_default("gateway.presence_tick_ms", 30_000_i64)?
            .set_default("gateway.typing_ttl_secs", 10_i64)?
            .set_default("gateway.typing_debounce_ms", 2_000_i64)?
            .set_default("gateway.typing_sweep_ms", 1_000_i64)?
            .set_default("gateway.write_queue_depth", 256_i64)?
            .set_default("gateway.publish_queue_depth", 4_096_i64)?
            .set_default("gateway.event_log_queue_depth", 4_096_i64)?
            .set_default("gateway.broker_backoff_base_ms", 500_i64)?
            .set_default("gateway.broker_backoff_max_ms", 30_000_i64)?
            // Load from config files
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", environment)).required(false))
            // Load from environment variables
            // APP__SERVER__PORT=8001 -> server.port = 8001
            .add_source(
                Environment::default()
                    .prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            // Map simple environment variables
            .set_override_option("server.host", std::env::var("SERVER_HOST").ok())?
            .set_override_option("server.port", std::env::var("SERVER_PORT").ok())?
            .set_override_option("database.url", std::env::var("DATABASE_URL").ok())?
            .set_override_option("redis.url", std::env::var("REDIS_URL").ok())?
            .set_override_option("jwt.secret", std::env::var("JWT_SECRET").ok())?
            .build()?
            .try_deserialize()
            .and_then(|settings: Self| {
                // Validate JWT secret length for security
                if settings.jwt.secret.len() < MIN_JWT_SECRET_LENGTH {
                    return Err(ConfigError::Message(format!(
                        "JWT secret must be at least {} characters for security. Current length: {}",
                        MIN_JWT_SECRET_LENGTH,
                        settings.jwt.secret.len()
                    )));
                }
                Ok(settings)
            })
    }

    /// Get the full server address as a string.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
