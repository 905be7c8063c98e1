//! Server configuration loading from file and environment variables.

use parley_cache::CacheConfig;
use parley_observe::HealthThresholds;
use parley_resilience::{CircuitBreakerConfig, RateLimitConfig};
use parley_voice::EngineConfig;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub cache: CacheSection,

    #[serde(default)]
    pub breakers: BreakersConfig,

    #[serde(default)]
    pub rate_limit: RateLimitSection,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub health: HealthConfig,

    /// Collaborator backends, persona, reply TTL and call timeouts.
    #[serde(default)]
    pub engine: EngineConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Attach raw error text to client-facing error payloads. Leave off in
    /// production.
    #[serde(default)]
    pub expose_error_details: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "parley_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// The `[cache]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSection {
    /// Shared cache URL, e.g. `redis://localhost:6379`. Unset means
    /// local-only caching. Only honoured when built with the `redis` feature.
    #[serde(default)]
    pub redis_url: Option<String>,

    #[serde(default = "default_cache_ttl_secs")]
    pub default_ttl_secs: u64,

    #[serde(default = "default_local_ttl_secs")]
    pub local_ttl_secs: u64,

    #[serde(default = "default_local_high_water")]
    pub local_high_water: usize,

    #[serde(default = "default_remote_timeout_ms")]
    pub remote_timeout_ms: u64,
}

/// The `[breakers]` section: one default plus per-service overrides, e.g.
/// `[breakers.services.llm]`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BreakersConfig {
    #[serde(default)]
    pub default: CircuitBreakerConfig,

    #[serde(default)]
    pub services: HashMap<String, CircuitBreakerConfig>,
}

/// The `[rate_limit]` section. The upstream provider quota lives under
/// `[engine.llm.quota]`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RateLimitSection {
    /// Budget per `user:<id>:<operation>` key.
    #[serde(default)]
    pub user: RateLimitConfig,
}

/// The `[session]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    /// Sessions idle for longer than this are closed by the sweep.
    #[serde(default = "default_inactivity_timeout_secs")]
    pub inactivity_timeout_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Upper bound on one listening period. 0 disables the bound.
    #[serde(default = "default_max_listening_secs")]
    pub max_listening_secs: u64,

    /// Outbound messages buffered per session before new ones are dropped.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

/// The `[health]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    #[serde(default)]
    pub thresholds: HealthThresholds,

    /// Dependency probe cadence. 0 disables the task.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,

    /// Summary log cadence. 0 disables the task.
    #[serde(default = "default_summary_interval_secs")]
    pub summary_interval_secs: u64,

    /// Extra HTTP dependencies to probe.
    #[serde(default)]
    pub probes: Vec<ProbeConfig>,
}

/// One `[[health.probes]]` entry.
#[derive(Clone, Deserialize)]
pub struct ProbeConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub bearer_token: Option<String>,
}

impl std::fmt::Debug for ProbeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeConfig")
            .field("name", &self.name)
            .field("url", &self.url)
            .field(
                "bearer_token",
                &self.bearer_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_cache_ttl_secs() -> u64 {
    3600
}

fn default_local_ttl_secs() -> u64 {
    300
}

fn default_local_high_water() -> usize {
    1000
}

fn default_remote_timeout_ms() -> u64 {
    500
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_inactivity_timeout_secs() -> u64 {
    300
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_max_listening_secs() -> u64 {
    120
}

fn default_outbound_buffer() -> usize {
    256
}

fn default_check_interval_secs() -> u64 {
    30
}

fn default_summary_interval_secs() -> u64 {
    300
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            expose_error_details: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            redis_url: None,
            default_ttl_secs: default_cache_ttl_secs(),
            local_ttl_secs: default_local_ttl_secs(),
            local_high_water: default_local_high_water(),
            remote_timeout_ms: default_remote_timeout_ms(),
        }
    }
}

impl CacheSection {
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            default_ttl: Duration::from_secs(self.default_ttl_secs),
            local_ttl: Duration::from_secs(self.local_ttl_secs),
            local_high_water: self.local_high_water,
            remote_timeout: Duration::from_millis(self.remote_timeout_ms),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keep_alive_secs: default_keep_alive_secs(),
            inactivity_timeout_secs: default_inactivity_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_listening_secs: default_max_listening_secs(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

impl SessionConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn max_listening(&self) -> Option<Duration> {
        (self.max_listening_secs > 0).then(|| Duration::from_secs(self.max_listening_secs))
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            thresholds: HealthThresholds::default(),
            check_interval_secs: default_check_interval_secs(),
            summary_interval_secs: default_summary_interval_secs(),
            probes: Vec::new(),
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `PARLEY_HOST` overrides `server.host`
/// - `PARLEY_PORT` overrides `server.port`
/// - `PARLEY_LOG_LEVEL` overrides `logging.level`
/// - `PARLEY_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `PARLEY_REDIS_URL` overrides `cache.redis_url`
/// - `PARLEY_LLM_API_KEY` overrides `engine.llm.api_key`
/// - `PARLEY_LLM_BASE_URL` overrides `engine.llm.base_url`
/// - `PARLEY_LLM_MODEL` overrides `engine.llm.model`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Applies `PARLEY_*` overrides read through `lookup`.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(host) = lookup("PARLEY_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Some(port) = lookup("PARLEY_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Some(level) = lookup("PARLEY_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = lookup("PARLEY_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Some(url) = lookup("PARLEY_REDIS_URL").filter(|u| !u.trim().is_empty()) {
        config.cache.redis_url = Some(url);
    }
    if let Some(key) = lookup("PARLEY_LLM_API_KEY") {
        config.engine.llm.api_key = key;
    }
    if let Some(url) = lookup("PARLEY_LLM_BASE_URL") {
        config.engine.llm.base_url = url;
    }
    if let Some(model) = lookup("PARLEY_LLM_MODEL") {
        config.engine.llm.model = model;
    }
}
