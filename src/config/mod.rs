use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::pool::ConfigError;

/// How a released connection gets back into circulation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseMode {
    /// Return straight to the ready queue without checking it
    #[default]
    Simple,
    /// Route through the repair loop, which revalidates before reuse
    Validated,
}

impl FromStr for ReleaseMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "simple" => Ok(ReleaseMode::Simple),
            "validated" => Ok(ReleaseMode::Validated),
            other => anyhow::bail!("Unknown release mode '{}' (expected simple or validated)", other),
        }
    }
}

/// Transport security settings for backend connections
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsOptions {
    /// Wrap connections in TLS
    #[serde(default)]
    pub enabled: bool,

    /// Extra PEM root certificate to trust
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<PathBuf>,

    /// Skip certificate and hostname verification
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

/// Parameters used to open every connection in a pool
#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Database selected for the session
    #[serde(default = "default_database")]
    pub database: String,

    /// Opaque credential token, passed through to the connector untouched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_key: Option<String>,

    /// Upper bound on a single connect attempt
    #[serde(
        default = "default_connect_timeout",
        rename = "connect_timeout_ms",
        with = "duration_ms"
    )]
    pub connect_timeout: Duration,

    #[serde(default)]
    pub tls: TlsOptions,

    /// Backend-specific options the pool does not interpret
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    28015
}

fn default_database() -> String {
    "test".to_string()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(20)
}

impl ConnectionInfo {
    /// `host:port` form used for dialing and in error messages
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ConnectionInfo {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            database: default_database(),
            auth_key: None,
            connect_timeout: default_connect_timeout(),
            tls: TlsOptions::default(),
            options: BTreeMap::new(),
        }
    }
}

// Hand-written so the credential never ends up in logs.
impl fmt::Debug for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionInfo")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("auth_key", &self.auth_key.as_ref().map(|_| "<redacted>"))
            .field("connect_timeout", &self.connect_timeout)
            .field("tls", &self.tls)
            .field("options", &self.options)
            .finish()
    }
}

/// Configuration for connection pool behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Label attached to every log event of this pool
    #[serde(default = "default_name")]
    pub name: String,

    /// Maximum number of connections that may exist at once
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Connections opened eagerly at construction
    #[serde(default)]
    pub initial_conns: usize,

    /// How long `acquire` waits on a saturated pool
    #[serde(
        default = "default_acquire_timeout",
        rename = "acquire_timeout_ms",
        with = "duration_ms"
    )]
    pub acquire_timeout: Duration,

    #[serde(default)]
    pub release_mode: ReleaseMode,

    /// Pause after a failed revalidation (validated mode only)
    #[serde(
        default = "default_reconnect_interval",
        rename = "reconnect_interval_ms",
        with = "duration_ms"
    )]
    pub reconnect_interval: Duration,

    /// Consecutive failed revalidations after which a connection is dropped.
    /// `None` retries forever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_repair_attempts: Option<u32>,

    #[serde(default)]
    pub connection: ConnectionInfo,
}

fn default_name() -> String {
    "default".to_string()
}

fn default_capacity() -> usize {
    10
}

fn default_acquire_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_reconnect_interval() -> Duration {
    Duration::from_secs(1)
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            capacity: default_capacity(),
            initial_conns: 0,
            acquire_timeout: default_acquire_timeout(),
            release_mode: ReleaseMode::default(),
            reconnect_interval: default_reconnect_interval(),
            max_repair_attempts: None,
            connection: ConnectionInfo::default(),
        }
    }
}

impl PoolConfig {
    /// Check the capacity bounds, backend address and repair limit
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.initial_conns > self.capacity {
            return Err(ConfigError::InitialExceedsCapacity {
                initial: self.initial_conns,
                capacity: self.capacity,
            });
        }
        if self.connection.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if self.connection.port == 0 {
            return Err(ConfigError::ZeroPort);
        }
        if self.max_repair_attempts == Some(0) {
            return Err(ConfigError::ZeroRepairAttempts);
        }
        Ok(())
    }
}

/// Durations are written as integer milliseconds in config files
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<PoolConfig> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: PoolConfig = serde_yaml::from_str(&content)
        .context("Failed to parse YAML configuration")?;

    Ok(config)
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Invalid value for {}: {}", key, e)),
        Err(_) => Ok(None),
    }
}

/// Load configuration from environment variables
///
/// Unset variables keep their defaults:
/// - DBPOOL_HOST / DBPOOL_PORT / DBPOOL_DATABASE / DBPOOL_AUTH_KEY
/// - DBPOOL_CAPACITY / DBPOOL_INITIAL_CONNS
/// - DBPOOL_ACQUIRE_TIMEOUT_MS / DBPOOL_RECONNECT_INTERVAL_MS
/// - DBPOOL_RELEASE_MODE (simple, validated)
/// - DBPOOL_TLS (true, false)
pub fn load_from_env() -> Result<PoolConfig> {
    // Try to load .env file if it exists (don't fail if it doesn't)
    let _ = dotenvy::dotenv();

    let mut config = PoolConfig::default();

    if let Ok(host) = std::env::var("DBPOOL_HOST") {
        config.connection.host = host;
    }
    if let Some(port) = env_parse("DBPOOL_PORT")? {
        config.connection.port = port;
    }
    if let Ok(database) = std::env::var("DBPOOL_DATABASE") {
        config.connection.database = database;
    }
    if let Ok(auth_key) = std::env::var("DBPOOL_AUTH_KEY") {
        config.connection.auth_key = Some(auth_key);
    }
    if let Some(capacity) = env_parse("DBPOOL_CAPACITY")? {
        config.capacity = capacity;
    }
    if let Some(initial) = env_parse("DBPOOL_INITIAL_CONNS")? {
        config.initial_conns = initial;
    }
    if let Some(ms) = env_parse::<u64>("DBPOOL_ACQUIRE_TIMEOUT_MS")? {
        config.acquire_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = env_parse::<u64>("DBPOOL_RECONNECT_INTERVAL_MS")? {
        config.reconnect_interval = Duration::from_millis(ms);
    }
    if let Some(mode) = env_parse("DBPOOL_RELEASE_MODE")? {
        config.release_mode = mode;
    }
    if let Some(tls) = env_parse("DBPOOL_TLS")? {
        config.connection.tls.enabled = tls;
    }

    Ok(config)
}

/// Load configuration from a YAML file when given, else from the environment
pub fn load_config(config_path: Option<&str>) -> Result<PoolConfig> {
    let config = match config_path {
        Some(path) => load_from_yaml(path)?,
        None => load_from_env()?,
    };
    config.validate().context("Invalid pool configuration")?;
    Ok(config)
}
