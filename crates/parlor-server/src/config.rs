//! Server configuration.
//!
//! Loading flow:
//! 1. Start with [`ServerConfig::default()`]
//! 2. If a config file is given, its keys replace the defaults
//! 3. `PARLOR_*` environment variables override both
//!
//! Invalid environment values are ignored with a warning.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parlor_core::security::AuthSecret;
use parlor_telemetry::{parse_level, LogFormat, TelemetryConfig};
use serde::{Deserialize, Deserializer};
use tracing::{debug, warn};

use crate::error::ConfigError;

const DEFAULT_SECRET: &str = "parlor-development-secret";

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub database_path: PathBuf,
    #[serde(deserialize_with = "deserialize_secret")]
    pub auth_secret: AuthSecret,
    /// Frames buffered per connection before senders start waiting.
    pub max_send_queue: usize,
    /// How long a fanout waits on one full queue before giving up on that recipient.
    pub send_timeout_ms: u64,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
    pub max_message_size: usize,
    /// Messages per room included in the login snapshot.
    pub history_limit: u32,
    pub search_limit: u32,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8765,
            database_path: PathBuf::from("parlor.db"),
            auth_secret: AuthSecret::new(DEFAULT_SECRET),
            max_send_queue: 256,
            send_timeout_ms: 5_000,
            heartbeat_interval_secs: 30,
            client_timeout_secs: 90,
            max_message_size: 64 * 1024,
            history_limit: 100,
            search_limit: 50,
            log_level: "info".into(),
            log_format: LogFormat::Json,
        }
    }
}

fn deserialize_secret<'de, D: Deserializer<'de>>(deserializer: D) -> Result<AuthSecret, D::Error> {
    String::deserialize(deserializer).map(AuthSecret::new)
}

impl ServerConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| ConfigError::InvalidValue(format!("bind address {}: {e}", self.host)))
    }

    pub fn telemetry(&self) -> TelemetryConfig {
        TelemetryConfig {
            log_level: parse_level(&self.log_level).unwrap_or(tracing::Level::INFO),
            module_levels: Vec::new(),
            format: self.log_format,
        }
    }

    /// True while `auth_secret` is still the built-in development value.
    pub fn uses_default_secret(&self) -> bool {
        self.auth_secret.is(DEFAULT_SECRET)
    }

    /// Reject combinations the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_send_queue == 0 {
            return Err(ConfigError::InvalidValue("max_send_queue must be > 0".into()));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::InvalidValue("heartbeat_interval_secs must be > 0".into()));
        }
        if self.client_timeout_secs < self.heartbeat_interval_secs {
            return Err(ConfigError::InvalidValue(
                "client_timeout_secs must be >= heartbeat_interval_secs".into(),
            ));
        }
        if self.history_limit == 0 {
            return Err(ConfigError::InvalidValue("history_limit must be > 0".into()));
        }
        Ok(())
    }
}

/// Load config from an optional file, then apply process environment overrides.
pub fn load_config(path: Option<&Path>) -> Result<ServerConfig, ConfigError> {
    let mut config = match path {
        Some(path) => load_file(path)?,
        None => {
            debug!("no config file given, using defaults");
            ServerConfig::default()
        }
    };
    apply_env_overrides(&mut config, |name| std::env::var(name).ok());
    config.validate()?;
    Ok(config)
}

/// Parse a JSON config file. Missing keys keep their defaults.
pub fn load_file(path: &Path) -> Result<ServerConfig, ConfigError> {
    debug!(?path, "loading config file");
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Apply `PARLOR_*` overrides read through `lookup`.
pub fn apply_env_overrides<F>(config: &mut ServerConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let read = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

    if let Some(v) = read("PARLOR_HOST") {
        config.host = v;
    }
    if let Some(v) = read("PARLOR_PORT") {
        match parse_u16_range(&v, 0, u16::MAX) {
            Some(port) => config.port = port,
            None => warn!(value = %v, "ignoring invalid PARLOR_PORT"),
        }
    }
    if let Some(v) = read("PARLOR_DATABASE") {
        config.database_path = PathBuf::from(v);
    }
    if let Some(v) = read("PARLOR_AUTH_SECRET") {
        config.auth_secret = AuthSecret::new(v);
    }
    if let Some(v) = read("PARLOR_LOG_LEVEL") {
        if parse_level(&v).is_some() {
            config.log_level = v;
        } else {
            warn!(value = %v, "ignoring invalid PARLOR_LOG_LEVEL");
        }
    }
    if let Some(v) = read("PARLOR_LOG_JSON") {
        match parse_bool(&v) {
            Some(true) => config.log_format = LogFormat::Json,
            Some(false) => config.log_format = LogFormat::Pretty,
            None => warn!(value = %v, "ignoring invalid PARLOR_LOG_JSON"),
        }
    }
}

// ── Pure parsing functions ──

/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
