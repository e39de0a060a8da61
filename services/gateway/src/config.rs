//! Gateway configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/relaypub/gateway.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `redis.url`
//!
//! Everything else has a default. `delivery.resend_interval_secs = 0`
//! disables the resend monitor entirely.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Top-level gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub schema_version: u32,
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub delivery: DeliveryConfig,
    /// Event names served by the standalone binary; each is registered with
    /// the default enqueue callback and channel = event name.
    pub events: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// TTL for every delivery-state key.
    pub expire: Duration,
    /// Resend tick and freshness window; zero disables the monitor.
    pub resend_interval: Duration,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (Option for every optional field)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    server: Option<RawServerConfig>,
    redis: Option<RawRedisConfig>,
    delivery: Option<RawDeliveryConfig>,
    events: Option<RawEventsConfig>,
}

#[derive(Debug, Deserialize)]
struct RawServerConfig {
    bind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRedisConfig {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawDeliveryConfig {
    expire_secs: Option<u64>,
    resend_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawEventsConfig {
    names: Option<Vec<String>>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load gateway config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load gateway config from the default path `/etc/relaypub/gateway.toml`.
pub fn load_config() -> Result<GatewayConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/relaypub/gateway.toml"))
}

/// Load gateway config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<GatewayConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {schema_version}"
        )));
    }

    let server = ServerConfig {
        bind: raw
            .server
            .and_then(|s| s.bind)
            .unwrap_or_else(|| "0.0.0.0:3333".to_owned()),
    };

    let raw_redis = raw
        .redis
        .ok_or_else(|| ConfigError::MissingField("redis".to_owned()))?;
    let redis = RedisConfig {
        url: raw_redis
            .url
            .ok_or_else(|| ConfigError::MissingField("redis.url".to_owned()))?,
    };

    let delivery = match raw.delivery {
        Some(d) => {
            let expire_secs = d.expire_secs.unwrap_or(3600);
            if expire_secs == 0 {
                return Err(ConfigError::InvalidValue(
                    "delivery.expire_secs must be greater than 0".to_owned(),
                ));
            }
            DeliveryConfig {
                expire: Duration::from_secs(expire_secs),
                resend_interval: Duration::from_secs(d.resend_interval_secs.unwrap_or(3)),
            }
        }
        None => DeliveryConfig {
            expire: Duration::from_secs(3600),
            resend_interval: Duration::from_secs(3),
        },
    };

    let events = raw.events.and_then(|e| e.names).unwrap_or_default();
    if events.iter().any(|name| name == rp_protocol::ACK_EVENT) {
        return Err(ConfigError::InvalidValue(
            "events.names may not include the reserved name \"ack\"".to_owned(),
        ));
    }

    Ok(GatewayConfig {
        schema_version,
        server,
        redis,
        delivery,
        events,
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}
