//! Server configuration with environment variable priority
//!
//! Configuration is resolved in this order (first found wins):
//! 1. Environment variables (BURROW_*)
//! 2. Config file (server.toml)
//! 3. Default values (where applicable)

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;

use crate::auth::MIN_TOKEN_LEN;
use crate::secret::{SecretError, SecretSource};

/// Environment variable prefix
const ENV_PREFIX: &str = "BURROW";

const DEFAULT_HTTP_PORT: u16 = 8080;

/// Errors that make the server refuse to start
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} required. Set BURROW_{1} or {2} in config")]
    Missing(&'static str, &'static str, &'static str),

    #[error("Invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },

    #[error("Auth token must be at least {min} characters (got {0})", min = MIN_TOKEN_LEN)]
    TokenTooShort(usize),

    #[error("Failed to resolve auth token: {0}")]
    Secret(#[from] SecretError),
}

/// Deployment environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    #[default]
    Prod,
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dev" | "development" => Ok(Environment::Dev),
            "prod" | "production" => Ok(Environment::Prod),
            _ => Err(ConfigError::Invalid {
                name: "env",
                value: s.to_string(),
            }),
        }
    }
}

/// Server configuration (parsed from TOML, can be overridden by env)
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Port for public HTTP traffic and tunnel attaches
    pub http_port: Option<u16>,

    /// Address to bind to
    pub bind_addr: Option<IpAddr>,

    /// Base domain for tunnels (e.g., "tunnel.example.com")
    pub base_domain: Option<String>,

    /// Attach token (env://, file://, or plain value)
    pub auth_token: Option<String>,

    /// Directory for persisted session state; in-memory when unset
    pub state_dir: Option<PathBuf>,

    pub env: Option<Environment>,
}

/// Resolved server configuration with actual secret values
pub struct ResolvedServerConfig {
    pub listen_addr: SocketAddr,
    pub base_domain: String,
    pub auth_token: String,
    pub state_dir: Option<PathBuf>,
    pub env: Environment,
}

impl std::fmt::Debug for ResolvedServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedServerConfig")
            .field("listen_addr", &self.listen_addr)
            .field("base_domain", &self.base_domain)
            .field("auth_token", &"<redacted>")
            .field("state_dir", &self.state_dir)
            .field("env", &self.env)
            .finish()
    }
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    std::env::var(format!("{}_{}", ENV_PREFIX, name)).ok()
}

fn parse_var<T: FromStr>(name: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::Invalid { name, value })
}

impl ServerConfig {
    /// Load configuration from a TOML file (optional)
    pub fn load(path: &str) -> Self {
        if Path::new(path).exists() {
            match std::fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {}", path);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to parse {}: {}", path, e);
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read {}: {}", path, e);
                }
            }
        }
        Self::default()
    }

    /// Resolve configuration from environment variables first, then config file
    pub fn resolve(self) -> Result<ResolvedServerConfig, ConfigError> {
        self.resolve_with(get_env)
    }

    /// Resolve using `lookup` for the `BURROW_*` overrides (name without prefix)
    pub fn resolve_with<F>(self, lookup: F) -> Result<ResolvedServerConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // HTTP port: ENV > config > default 8080
        let http_port = match lookup("HTTP_PORT") {
            Some(v) => parse_var("http_port", v)?,
            None => self.http_port.unwrap_or(DEFAULT_HTTP_PORT),
        };

        // Bind address: ENV > config > 0.0.0.0
        let bind_addr = match lookup("BIND_ADDR") {
            Some(v) => parse_var("bind_addr", v)?,
            None => self
                .bind_addr
                .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
        };

        // Base domain: ENV > config > required
        let base_domain = lookup("BASE_DOMAIN")
            .or(self.base_domain)
            .map(|d| d.trim().trim_matches('.').to_ascii_lowercase())
            .filter(|d| !d.is_empty())
            .ok_or(ConfigError::Missing("Base domain", "BASE_DOMAIN", "base_domain"))?;

        // Auth token: ENV > config > required
        let token_source = lookup("AUTH_TOKEN")
            .or(self.auth_token)
            .ok_or(ConfigError::Missing("Auth token", "AUTH_TOKEN", "auth_token"))?;

        let state_dir = lookup("STATE_DIR").map(PathBuf::from).or(self.state_dir);

        // Environment: ENV > config > prod
        let env = match lookup("ENV") {
            Some(v) => v.parse()?,
            None => self.env.unwrap_or_default(),
        };

        let source: SecretSource = token_source.parse()?;
        tracing::debug!("Resolving auth token from {} source", source.backend_name());
        let auth_token = source.resolve()?;
        if auth_token.chars().count() < MIN_TOKEN_LEN {
            return Err(ConfigError::TokenTooShort(auth_token.chars().count()));
        }

        Ok(ResolvedServerConfig {
            listen_addr: SocketAddr::new(bind_addr, http_port),
            base_domain,
            auth_token,
            state_dir,
            env,
        })
    }

    /// Load config file and resolve with environment variable overrides
    pub fn load_and_resolve(path: &str) -> Result<ResolvedServerConfig, ConfigError> {
        let config = Self::load(path);
        config.resolve()
    }
}
