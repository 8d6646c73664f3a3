//! Configuration management for Floodgate.
//!
//! Settings are layered: built-in defaults, then an optional YAML file, then
//! environment variables (`RATE_LIMIT_IP`, `REDIS_HOST`, ...). Invalid values
//! are fatal at startup.
//!
//! The `tokens` table is read from the YAML text directly with `serde_yaml`:
//! the layered loader normalises map keys, and token overrides must match the
//! request header byte for byte.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use axum::http::HeaderName;
use ::config::builder::DefaultState;
use ::config::{Config, ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{FloodgateError, Result};
use crate::limiter::{Policy, DEFAULT_NAMESPACE};
use crate::store::RedisStoreConfig;

/// Which counter store backs the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Shared Redis server
    Redis,
    /// In-process map, for a single instance
    Memory,
}

/// Main configuration for the Floodgate service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FloodgateConfig {
    /// Requests admitted per window for an address
    #[serde(default = "default_rate_limit_ip")]
    pub rate_limit_ip: u64,

    /// Window length in seconds for addresses
    #[serde(default = "default_ip_block_duration")]
    pub ip_block_duration: u64,

    /// Requests admitted per window for a token without an override
    #[serde(default = "default_rate_limit_token")]
    pub rate_limit_token: u64,

    /// Window length in seconds for tokens without an override
    #[serde(default = "default_token_block_duration")]
    pub token_block_duration: u64,

    /// Per-token policy overrides, keyed by the exact token string
    #[serde(default, skip_deserializing)]
    pub tokens: BTreeMap<String, Policy>,

    /// Counter store backend
    #[serde(default = "default_store_backend")]
    pub store_backend: StoreBackend,

    /// Redis host
    #[serde(default = "default_redis_host")]
    pub redis_host: String,

    /// Redis port
    #[serde(default = "default_redis_port")]
    pub redis_port: u16,

    /// Redis logical database
    #[serde(default)]
    pub redis_db: i64,

    /// Upper bound on each individual store round trip.
    ///
    /// Applied per call so a slow store fails the call it stalls on. A request
    /// dropped between the first increment and arming the expiry (client
    /// disconnect) still leaves the key without a TTL until it is reset.
    #[serde(default)]
    pub store_timeout_ms: Option<u64>,

    /// Prefix for counter keys
    #[serde(default = "default_key_namespace")]
    pub key_namespace: String,

    /// Request header carrying the bearer token
    #[serde(default = "default_token_header")]
    pub token_header: String,

    /// HTTP listen port
    #[serde(default = "default_server_port")]
    pub server_port: u16,
}

impl Default for FloodgateConfig {
    fn default() -> Self {
        Self {
            rate_limit_ip: default_rate_limit_ip(),
            ip_block_duration: default_ip_block_duration(),
            rate_limit_token: default_rate_limit_token(),
            token_block_duration: default_token_block_duration(),
            tokens: BTreeMap::new(),
            store_backend: default_store_backend(),
            redis_host: default_redis_host(),
            redis_port: default_redis_port(),
            redis_db: 0,
            store_timeout_ms: None,
            key_namespace: default_key_namespace(),
            token_header: default_token_header(),
            server_port: default_server_port(),
        }
    }
}

fn default_rate_limit_ip() -> u64 {
    5
}

fn default_ip_block_duration() -> u64 {
    300
}

fn default_rate_limit_token() -> u64 {
    10
}

fn default_token_block_duration() -> u64 {
    600
}

fn default_store_backend() -> StoreBackend {
    StoreBackend::Redis
}

fn default_redis_host() -> String {
    "localhost".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_key_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_token_header() -> String {
    "API_KEY".to_string()
}

fn default_server_port() -> u16 {
    8080
}

/// The `tokens` section of the configuration file, keys kept verbatim.
#[derive(Debug, Default, Deserialize)]
struct TokenTable {
    #[serde(default)]
    tokens: BTreeMap<String, Policy>,
}

fn token_table(yaml: &str) -> Result<BTreeMap<String, Policy>> {
    if yaml.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    let table: Option<TokenTable> = serde_yaml::from_str(yaml)
        .map_err(|e| FloodgateError::Config(format!("tokens: {}", e)))?;
    Ok(table.unwrap_or_default().tokens)
}

impl FloodgateConfig {
    /// Load configuration from an optional YAML file and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let yaml = match path {
            Some(path) => {
                info!(path = %path.display(), "Loading configuration file");
                std::fs::read_to_string(path)?
            }
            None => String::new(),
        };
        Self::from_yaml(&yaml, Environment::default())
    }

    /// Load configuration from a YAML string layered under `env`.
    pub fn from_yaml(yaml: &str, env: Environment) -> Result<Self> {
        let builder = Config::builder().add_source(File::from_str(yaml, FileFormat::Yaml));
        let mut config = Self::build(builder, env)?;
        config.tokens = token_table(yaml)?;
        config.validate()?;
        Ok(config)
    }

    fn build(builder: ConfigBuilder<DefaultState>, env: Environment) -> Result<Self> {
        let settings = builder.add_source(env.try_parsing(true)).build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Check every value the service cannot start without.
    pub fn validate(&self) -> Result<()> {
        self.address_policy()?;
        self.token_policy()?;
        self.token_header_name()?;
        if self.key_namespace.is_empty() {
            return Err(FloodgateError::Config(
                "key_namespace must not be empty".to_string(),
            ));
        }
        if self.store_timeout_ms == Some(0) {
            return Err(FloodgateError::Config(
                "store_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Default policy for address-identified requests.
    pub fn address_policy(&self) -> Result<Policy> {
        Policy::new(self.rate_limit_ip, self.ip_block_duration)
            .map_err(|e| FloodgateError::Config(format!("address policy: {}", e)))
    }

    /// Default policy for tokens without an override.
    pub fn token_policy(&self) -> Result<Policy> {
        Policy::new(self.rate_limit_token, self.token_block_duration)
            .map_err(|e| FloodgateError::Config(format!("token policy: {}", e)))
    }

    /// The token header as an HTTP header name.
    pub fn token_header_name(&self) -> Result<HeaderName> {
        HeaderName::from_str(&self.token_header.to_ascii_lowercase()).map_err(|e| {
            FloodgateError::Config(format!("invalid token_header {:?}: {}", self.token_header, e))
        })
    }

    /// Redis connection parameters.
    pub fn redis(&self) -> RedisStoreConfig {
        RedisStoreConfig {
            host: self.redis_host.clone(),
            port: self.redis_port,
            db: self.redis_db,
            ..Default::default()
        }
    }

    /// Per-check store timeout, if configured.
    pub fn store_timeout(&self) -> Option<Duration> {
        self.store_timeout_ms.map(Duration::from_millis)
    }

    /// Address the HTTP server binds to.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.server_port))
    }

    /// Render the effective configuration as YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| FloodgateError::Config(e.to_string()))
    }
}
