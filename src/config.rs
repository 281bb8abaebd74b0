//! Application configuration module
//!
//! Server, database and logging settings come from environment variables.
//! Monitoring tunables come from an optional `veda.toml` overlaid with
//! `VEDA_*` environment variables (e.g. `VEDA_MONITORING__FRESHNESS_THRESHOLD_HOURS=12`).

use crate::monitor::freshness::DEFAULT_THRESHOLD_HOURS;
use crate::monitor::{DriftPolicy, FreshnessPolicy, LedgerOptions, MonitorOptions, RepeatPolicy};
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] config::ConfigError),
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: Ipv4Addr,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::new(0, 0, 0, 0), // Bind to 0.0.0.0 for Docker
            port: 3000,
        }
    }
}

/// Metadata database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_pool_size: usize,
}

/// CORS configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["http://localhost:3001".to_string()],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// Monitoring tunables
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub freshness_threshold_hours: f64,
    pub nullability_is_drift: bool,
    pub repeat_policy: RepeatPolicy,
    pub check_timeout_secs: u64,
    pub lock_timeout_ms: u64,
    pub max_parallel_checks: usize,
    /// Run `check_all` on this period; off when unset
    pub check_interval_secs: Option<u64>,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            freshness_threshold_hours: DEFAULT_THRESHOLD_HOURS,
            nullability_is_drift: false,
            repeat_policy: RepeatPolicy::default(),
            check_timeout_secs: 30,
            lock_timeout_ms: 5000,
            max_parallel_checks: 8,
            check_interval_secs: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    #[serde(default)]
    monitoring: MonitoringConfig,
}

impl MonitoringConfig {
    /// Load from `veda.toml` (if present) and `VEDA_*` environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("veda").required(false))
            .add_source(
                config::Environment::with_prefix("VEDA")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );
        Self::from_builder(builder)
    }

    fn from_builder(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self, ConfigError> {
        let settings: FileSettings = builder.build()?.try_deserialize()?;
        settings.monitoring.validate()?;
        Ok(settings.monitoring)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.freshness_threshold_hours.is_finite() && self.freshness_threshold_hours > 0.0) {
            return Err(ConfigError::InvalidValue(format!(
                "freshness_threshold_hours must be positive, got {}",
                self.freshness_threshold_hours
            )));
        }
        if self.max_parallel_checks == 0 {
            return Err(ConfigError::InvalidValue(
                "max_parallel_checks must be at least 1".to_string(),
            ));
        }
        if self.check_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "check_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.check_interval_secs == Some(0) {
            return Err(ConfigError::InvalidValue(
                "check_interval_secs must be at least 1 when set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn monitor_options(&self) -> MonitorOptions {
        MonitorOptions {
            drift: DriftPolicy {
                nullability_is_drift: self.nullability_is_drift,
            },
            freshness: FreshnessPolicy::new(self.freshness_threshold_hours),
            check_timeout: Duration::from_secs(self.check_timeout_secs),
            max_parallel_checks: self.max_parallel_checks,
        }
    }

    pub fn ledger_options(&self) -> LedgerOptions {
        LedgerOptions {
            repeat_policy: self.repeat_policy,
            lock_timeout: Duration::from_millis(self.lock_timeout_ms),
        }
    }

    pub fn check_interval(&self) -> Option<Duration> {
        self.check_interval_secs.map(Duration::from_secs)
    }
}

/// Complete application settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    /// `None` runs with in-memory stores
    pub database: Option<DatabaseConfig>,
    pub cors: CorsConfig,
    pub log_format: LogFormat,
    pub monitoring: MonitoringConfig,
}

impl Settings {
    /// Load settings from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if it exists (ignore errors if file not found)
        let _ = dotenvy::dotenv();

        let server = ServerConfig {
            host: std::env::var("HOST")
                .ok()
                .and_then(|h| h.parse().ok())
                .unwrap_or_else(|| ServerConfig::default().host),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or_else(|| ServerConfig::default().port),
        };

        let max_pool_size = std::env::var("DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        // DATABASE_URL first, then individual DB_* vars
        let database = match std::env::var("DATABASE_URL") {
            Ok(url) => Some(DatabaseConfig {
                url: Self::check_database_url(&url)?,
                max_pool_size,
            }),
            Err(_) => std::env::var("DB_HOST").ok().map(|host| DatabaseConfig {
                url: format!(
                    "postgresql://{}:{}@{}:{}/{}",
                    std::env::var("DB_USER").unwrap_or_else(|_| "postgres".to_string()),
                    std::env::var("DB_PASSWORD").unwrap_or_default(),
                    host,
                    std::env::var("DB_PORT").unwrap_or_else(|_| "5432".to_string()),
                    std::env::var("DB_NAME").unwrap_or_else(|_| "postgres".to_string()),
                ),
                max_pool_size,
            }),
        };

        let cors = CorsConfig {
            allowed_origins: std::env::var("ALLOWED_ORIGINS")
                .ok()
                .map(|s| s.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_else(|| CorsConfig::default().allowed_origins),
        };

        let log_format = match std::env::var("LOG_FORMAT") {
            Ok(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Compact,
        };

        Ok(Self {
            server,
            database,
            cors,
            log_format,
            monitoring: MonitoringConfig::load()?,
        })
    }

    /// Validate a DATABASE_URL connection string (postgresql://...)
    fn check_database_url(url: &str) -> Result<String, ConfigError> {
        let parsed = url::Url::parse(url).map_err(|_| {
            ConfigError::InvalidValue(
                "Invalid DATABASE_URL format (expected postgresql://...)".to_string(),
            )
        })?;
        if !matches!(parsed.scheme(), "postgres" | "postgresql") {
            return Err(ConfigError::InvalidValue(format!(
                "Unsupported DATABASE_URL scheme '{}'",
                parsed.scheme()
            )));
        }
        if parsed.host_str().is_none() {
            return Err(ConfigError::InvalidValue(
                "Missing host in DATABASE_URL".to_string(),
            ));
        }
        Ok(url.to_string())
    }
}
