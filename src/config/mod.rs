//! YAML configuration: discovery, parsing, validation.
//!
//! The file is found via the `LARDER_CONFIG` environment variable or a fixed
//! candidate list under the working directory, parsed with serde_yaml, and
//! validated before anything is constructed from it. The deployment
//! environment (overridable through `DEPLOYMENT_ENV`) is folded into the
//! cache key prefix so instances of different environments sharing a redis
//! cluster never serve each other's entries.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::cache::{CacheRules, HashElements};
use crate::http::Method;
use crate::proxy::Upstream;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "LARDER_CONFIG";

/// Environment variable overriding `deploymentEnv` from the file.
pub const DEPLOYMENT_ENV: &str = "DEPLOYMENT_ENV";

// Checked in order when CONFIG_ENV is unset.
const CANDIDATES: &[&str] = &[
    "config.yaml",
    "config.yml",
    "configs/config.yaml",
    "configs/config.yml",
];

/// Errors produced while loading the configuration. All of them are fatal
/// at startup; nothing here occurs past it.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no configuration file found (set {CONFIG_ENV} or provide ./config.yaml)")]
    NotFound,

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// The whole configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub logger: LoggerConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default = "default_deployment_env")]
    pub deployment_env: String,
    pub services: Services,
    /// The file this configuration was loaded from. Not part of the schema.
    #[serde(skip)]
    pub source: PathBuf,
}

fn default_deployment_env() -> String {
    "unset".to_owned()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggerConfig {
    /// Log level directive, e.g. `info` or `larder=debug`.
    pub level: String,
    /// Human-readable output instead of the compact default.
    pub pretty: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            pretty: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Services {
    pub cache: CacheConfig,
    pub proxy: ProxyConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    /// Absence disables the distributed tier entirely.
    pub redis: Option<RedisConfig>,
    #[serde(default)]
    pub exceptions: Vec<String>,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub ttl: TtlConfig,
    #[serde(default)]
    pub forwarding_headers: Vec<String>,
    pub hash: HashConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedisConfig {
    pub servers: Vec<RedisServer>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedisServer {
    pub host: String,
    pub port: u16,
}

/// TTLs in seconds, selected by response status. Zero disables storing for
/// that outcome.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TtlConfig {
    pub success: u64,
    pub error: u64,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            success: 60,
            error: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HashConfig {
    pub prefix: String,
    #[serde(flatten)]
    pub elements: HashElements,
    #[serde(default)]
    pub overrides: Vec<OverrideConfig>,
}

/// Per-path replacement of the global hash elements, keyed by the exact
/// original request path.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideConfig {
    pub original_path: String,
    #[serde(flatten)]
    pub elements: HashElements,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    pub upstreams: Vec<Upstream>,
}

impl Config {
    /// Discovers, reads, parses and validates the configuration.
    pub fn load() -> Result<Self, ConfigError> {
        let path = discover_from(std::env::var(CONFIG_ENV).ok(), Path::new("."))?;
        Self::from_file(&path)
    }

    /// Loads the configuration from an explicit file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        let mut config: Config =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_owned(),
                source,
            })?;
        config.source = path.to_owned();
        config.apply_deployment_env(std::env::var(DEPLOYMENT_ENV).ok());
        config.validate()?;
        Ok(config)
    }

    fn apply_deployment_env(&mut self, env: Option<String>) {
        if let Some(env) = env.filter(|e| !e.is_empty()) {
            self.deployment_env = env;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.services.proxy.upstreams.is_empty() {
            return Err(ConfigError::Invalid(
                "services.proxy.upstreams must not be empty".to_owned(),
            ));
        }
        if self.services.cache.hash.prefix.is_empty() {
            return Err(ConfigError::Invalid(
                "services.cache.hash.prefix must not be empty".to_owned(),
            ));
        }
        if let Some(redis) = &self.services.cache.redis {
            if redis.servers.is_empty() {
                return Err(ConfigError::Invalid(
                    "services.cache.redis.servers must not be empty".to_owned(),
                ));
            }
        }
        Ok(())
    }

    /// The address the server binds to.
    pub fn listen_addr(&self) -> String {
        format!("0.0.0.0:{}", self.server.port)
    }

    /// Redis cluster nodes as `(host, port)` pairs, when the tier is
    /// configured.
    pub fn redis_nodes(&self) -> Option<Vec<(String, u16)>> {
        self.services.cache.redis.as_ref().map(|redis| {
            redis
                .servers
                .iter()
                .map(|s| (s.host.clone(), s.port))
                .collect()
        })
    }

    /// Converts the cache section into the policy engine's rules, composing
    /// the key prefix as `<deploymentEnv>_<hash.prefix>`.
    pub fn cache_rules(&self) -> CacheRules {
        let cache = &self.services.cache;
        let overrides: HashMap<String, HashElements> = cache
            .hash
            .overrides
            .iter()
            .map(|o| (o.original_path.clone(), o.elements.clone()))
            .collect();
        let methods: Vec<Method> = cache
            .methods
            .iter()
            .map(|m| m.to_uppercase().parse().unwrap()) // Infallible
            .collect();
        CacheRules {
            prefix: format!("{}_{}", self.deployment_env, cache.hash.prefix),
            elements: cache.hash.elements.clone(),
            overrides,
            forwarding_headers: cache.forwarding_headers.clone(),
            methods,
            exceptions: cache.exceptions.clone(),
            ttl_success: Duration::from_secs(cache.ttl.success),
            ttl_error: Duration::from_secs(cache.ttl.error),
        }
    }
}

fn discover_from(env_path: Option<String>, base: &Path) -> Result<PathBuf, ConfigError> {
    if let Some(path) = env_path.filter(|p| !p.is_empty()) {
        return Ok(PathBuf::from(path));
    }
    for candidate in CANDIDATES {
        let path = base.join(candidate);
        if path.is_file() {
            return Ok(path);
        }
    }
    Err(ConfigError::NotFound)
}
