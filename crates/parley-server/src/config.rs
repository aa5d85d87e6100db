//! Server configuration loading from file and environment variables.

use parley_types::normalize_domain;
use serde::Deserialize;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Status listener settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Server-to-server trust settings.
    #[serde(default)]
    pub s2s: S2sConfig,

    /// Locally served domains.
    #[serde(default)]
    pub domains: Vec<DomainConfig>,
}

/// Network configuration for the HTTP status listener.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "parley_dialback=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Server-to-server trust configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct S2sConfig {
    /// Seconds a connection may stay unauthenticated.
    #[serde(default = "default_auth_timeout_secs")]
    pub auth_timeout_secs: u64,

    /// Keep running dialback after a trusted TLS certificate when the peer
    /// did not advertise dialback.
    #[serde(default = "default_dialback_workaround")]
    pub dialback_workaround: bool,

    /// Remote domains exempt from TLS requirements.
    #[serde(default)]
    pub skip_tls_hosts: Vec<String>,
}

/// One locally served domain.
#[derive(Debug, Clone, Deserialize)]
pub struct DomainConfig {
    /// Domain name.
    pub name: String,

    /// Dialback secret. A random one is generated at startup when absent.
    #[serde(default)]
    pub secret: Option<String>,

    /// Refuse dialback for this domain unless TLS is active.
    #[serde(default)]
    pub tls_required: bool,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    5280
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_auth_timeout_secs() -> u64 {
    30
}

fn default_dialback_workaround() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
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

impl Default for S2sConfig {
    fn default() -> Self {
        Self {
            auth_timeout_secs: default_auth_timeout_secs(),
            dialback_workaround: default_dialback_workaround(),
            skip_tls_hosts: Vec::new(),
        }
    }
}

impl S2sConfig {
    /// Runtime settings for the connection manager.
    pub fn to_runtime(&self) -> parley_dialback::S2SConfig {
        parley_dialback::S2SConfig {
            auth_timeout: Duration::from_secs(self.auth_timeout_secs),
            dialback_workaround: self.dialback_workaround,
            skip_tls_hosts: self.skip_tls_hosts.iter().cloned().collect(),
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

    /// The configuration parsed but is not usable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    /// Checks domain names and timeouts.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` for malformed or duplicate domain
    /// names, malformed skip-TLS hosts, or a zero authentication timeout.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.s2s.auth_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "s2s.auth_timeout_secs must be greater than zero".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for domain in &self.domains {
            let name = normalize_domain(&domain.name)
                .map_err(|e| ConfigError::Invalid(format!("domains: {e}")))?;
            if !seen.insert(name.clone()) {
                return Err(ConfigError::Invalid(format!("domains: duplicate domain {name}")));
            }
        }
        for host in &self.s2s.skip_tls_hosts {
            normalize_domain(host)
                .map_err(|e| ConfigError::Invalid(format!("s2s.skip_tls_hosts: {e}")))?;
        }
        Ok(())
    }

    /// Applies overrides from an environment lookup.
    ///
    /// - `PARLEY_HOST` overrides `server.host`
    /// - `PARLEY_PORT` overrides `server.port`
    /// - `PARLEY_LOG_LEVEL` overrides `logging.level`
    /// - `PARLEY_LOG_JSON` overrides `logging.json` (set to "true" to enable)
    /// - `PARLEY_AUTH_TIMEOUT_SECS` overrides `s2s.auth_timeout_secs`
    /// - `PARLEY_DIALBACK_WORKAROUND` overrides `s2s.dialback_workaround`
    ///
    /// Unparseable values are ignored with a warning.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("PARLEY_HOST") {
            match host.parse() {
                Ok(parsed) => self.server.host = parsed,
                Err(_) => tracing::warn!(value = %host, "ignoring unparseable PARLEY_HOST"),
            }
        }
        if let Some(port) = lookup("PARLEY_PORT") {
            match port.parse() {
                Ok(parsed) => self.server.port = parsed,
                Err(_) => tracing::warn!(value = %port, "ignoring unparseable PARLEY_PORT"),
            }
        }
        if let Some(level) = lookup("PARLEY_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(json) = lookup("PARLEY_LOG_JSON") {
            self.logging.json = parse_flag(&json);
        }
        if let Some(secs) = lookup("PARLEY_AUTH_TIMEOUT_SECS") {
            match secs.parse() {
                Ok(parsed) => self.s2s.auth_timeout_secs = parsed,
                Err(_) => tracing::warn!(value = %secs, "ignoring unparseable PARLEY_AUTH_TIMEOUT_SECS"),
            }
        }
        if let Some(flag) = lookup("PARLEY_DIALBACK_WORKAROUND") {
            self.s2s.dialback_workaround = parse_flag(&flag);
        }
    }
}

fn parse_flag(value: &str) -> bool {
    value == "true" || value == "1"
}

/// Loads configuration from a TOML file, falling back to defaults, then
/// applies environment overrides (see [`Config::apply_env`]) and validates.
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed, or
/// if the result fails validation.
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

    config.apply_env(|key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}
