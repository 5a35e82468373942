use crate::error::{ProxyError, Result};
use crate::http::ParserLimits;
use crate::plugin::PluginKind;
use crate::proxy::tunnel::ClosePolicy;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Listener and connection handling
    pub proxy: ProxyServerConfig,
    /// TLS interception
    pub tls: TlsConfig,
    /// Plugin pipeline
    pub plugins: PluginConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct ProxyServerConfig {
    /// Host to bind to (default: 127.0.0.1)
    pub host: String,
    /// Port for the proxy server (default: 8899)
    pub port: u16,
    /// Simultaneous connections served; further clients wait in the accept backlog
    pub max_connections: usize,
    /// Upstream connect and TLS handshake timeout in seconds
    pub connect_timeout: u64,
    /// Seconds without traffic before a connection is torn down
    pub idle_timeout: u64,
    /// What to do with the other leg when one side of a relay closes
    pub close_policy: ClosePolicy,
    /// Maximum bytes of start line plus headers
    pub max_header_size: usize,
    /// Maximum number of header fields
    pub max_headers: usize,
    /// Maximum request body the proxy buffers
    pub max_body_size: usize,
    /// Relay read buffer size in bytes
    pub buffer_size: usize,
}

impl Default for ProxyServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8899,
            max_connections: 1024,
            connect_timeout: 10,
            idle_timeout: 30,
            close_policy: ClosePolicy::CloseBoth,
            max_header_size: 64 * 1024,
            max_headers: 100,
            max_body_size: 10 * 1024 * 1024,
            buffer_size: 16 * 1024,
        }
    }
}

impl ProxyServerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }

    pub fn parser_limits(&self) -> ParserLimits {
        ParserLimits {
            max_header_bytes: self.max_header_size,
            max_headers: self.max_headers,
            max_body_bytes: self.max_body_size,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Terminate TLS inside CONNECT tunnels
    pub intercept: bool,
    /// Root CA certificate (PEM)
    pub ca_cert_file: Option<PathBuf>,
    /// Root CA private key (PEM)
    pub ca_key_file: Option<PathBuf>,
    /// Extra PEM roots trusted for upstream TLS
    pub upstream_ca_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct PluginConfig {
    /// Plugins in registration order
    pub plugins: Vec<PluginKind>,
    /// JSON rule list for the URL filter
    pub filter_rules_file: Option<PathBuf>,
    /// Enable proxy authentication
    pub auth_enabled: bool,
    /// Authentication username
    pub auth_username: String,
    /// Authentication password
    pub auth_password: String,
    /// Enable rate limiting
    pub rate_limit_enabled: bool,
    /// Rate limit requests per second
    pub rate_limit_per_second: u32,
    /// Rate limit burst size
    pub rate_limit_burst: u32,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            plugins: Vec::new(),
            filter_rules_file: None,
            auth_enabled: false,
            auth_username: String::new(),
            auth_password: String::new(),
            rate_limit_enabled: false,
            rate_limit_per_second: 100,
            rate_limit_burst: 200,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let config = Config {
            proxy: ProxyServerConfig {
                host: get_env_or("PROXY_HOST", "127.0.0.1"),
                port: parse_env("PROXY_PORT", "8899", "a valid port number")?,
                max_connections: parse_env("PROXY_MAX_CONNECTIONS", "1024", "a number")?,
                connect_timeout: parse_env("PROXY_CONNECT_TIMEOUT", "10", "a number of seconds")?,
                idle_timeout: parse_env("PROXY_IDLE_TIMEOUT", "30", "a number of seconds")?,
                close_policy: ClosePolicy::from_str(&get_env_or("PROXY_CLOSE_POLICY", "close_both"))
                    .ok_or_else(|| {
                        ProxyError::InvalidConfig(
                            "PROXY_CLOSE_POLICY must be close_both or half_close".into(),
                        )
                    })?,
                max_header_size: parse_env("PROXY_MAX_HEADER_SIZE", "65536", "a number of bytes")?,
                max_headers: parse_env("PROXY_MAX_HEADERS", "100", "a number")?,
                max_body_size: parse_env("PROXY_MAX_BODY_SIZE", "10485760", "a number of bytes")?,
                buffer_size: parse_env("PROXY_BUFFER_SIZE", "16384", "a number of bytes")?,
            },
            tls: TlsConfig {
                intercept: parse_bool("PROXY_TLS_INTERCEPT", false)?,
                ca_cert_file: get_env_path("PROXY_CA_CERT_FILE"),
                ca_key_file: get_env_path("PROXY_CA_KEY_FILE"),
                upstream_ca_file: get_env_path("PROXY_UPSTREAM_CA_FILE"),
            },
            plugins: PluginConfig {
                plugins: parse_plugins(&get_env_or("PROXY_PLUGINS", ""))?,
                filter_rules_file: get_env_path("PROXY_FILTER_RULES_FILE"),
                auth_enabled: parse_bool("PROXY_AUTH_ENABLED", false)?,
                auth_username: get_env_or("PROXY_AUTH_USERNAME", ""),
                auth_password: get_env_or("PROXY_AUTH_PASSWORD", ""),
                rate_limit_enabled: parse_bool("PROXY_RATE_LIMIT_ENABLED", false)?,
                rate_limit_per_second: parse_env("PROXY_RATE_LIMIT_PER_SECOND", "100", "a number")?,
                rate_limit_burst: parse_env("PROXY_RATE_LIMIT_BURST", "200", "a number")?,
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the proxy cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.proxy.max_connections == 0 {
            return Err(ProxyError::InvalidConfig(
                "PROXY_MAX_CONNECTIONS must be at least 1".into(),
            ));
        }
        if self.proxy.buffer_size == 0 {
            return Err(ProxyError::InvalidConfig(
                "PROXY_BUFFER_SIZE must be at least 1".into(),
            ));
        }
        if self.proxy.idle_timeout == 0 || self.proxy.connect_timeout == 0 {
            return Err(ProxyError::InvalidConfig(
                "PROXY_IDLE_TIMEOUT and PROXY_CONNECT_TIMEOUT must be positive".into(),
            ));
        }
        if self.tls.intercept && (self.tls.ca_cert_file.is_none() || self.tls.ca_key_file.is_none()) {
            return Err(ProxyError::InvalidConfig(
                "PROXY_TLS_INTERCEPT requires PROXY_CA_CERT_FILE and PROXY_CA_KEY_FILE".into(),
            ));
        }
        if self.plugins.auth_enabled && self.plugins.auth_username.is_empty() {
            return Err(ProxyError::InvalidConfig(
                "PROXY_AUTH_ENABLED requires PROXY_AUTH_USERNAME".into(),
            ));
        }
        Ok(())
    }

    /// Get the proxy server address
    pub fn proxy_addr(&self) -> String {
        format!("{}:{}", self.proxy.host, self.proxy.port)
    }
}

fn parse_plugins(raw: &str) -> Result<Vec<PluginKind>> {
    raw.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| {
            PluginKind::from_str(name)
                .ok_or_else(|| ProxyError::InvalidConfig(format!("Unknown plugin in PROXY_PLUGINS: {name}")))
        })
        .collect()
}

fn parse_env<T: FromStr>(key: &str, default: &str, expected: &str) -> Result<T> {
    get_env_or(key, default)
        .trim()
        .parse()
        .map_err(|_| ProxyError::InvalidConfig(format!("{key} must be {expected}")))
}

fn parse_bool(key: &str, default: bool) -> Result<bool> {
    match env::var(key) {
        Err(_) => Ok(default),
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" | "" => Ok(false),
            _ => Err(ProxyError::InvalidConfig(format!("{key} must be true or false"))),
        },
    }
}

fn get_env_path(key: &str) -> Option<PathBuf> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
