use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Admin API access settings
    #[serde(default)]
    pub admin: AdminConfig,

    /// Routing table storage
    #[serde(default)]
    pub store: StoreConfig,

    /// Port discovery for unknown hostnames
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Settings for connections to issuer backends
    #[serde(default)]
    pub upstream: UpstreamConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// HTTP port (default: 80, set to 0 to disable)
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// HTTPS port (default: 443). Only used when TLS is enabled.
    #[serde(default = "default_https_port")]
    pub https_port: u16,

    /// Serve HTTPS with the configured certificate (default: true).
    /// Set to false to run plain HTTP only.
    #[serde(default = "default_true")]
    pub tls: bool,

    /// Path to TLS certificate file (PEM format)
    #[serde(default = "default_tls_cert")]
    pub tls_cert: String,

    /// Path to TLS private key file (PEM format)
    #[serde(default = "default_tls_key")]
    pub tls_key: String,

    /// Port for the loopback-only admin listener (0 disables it)
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Upper bound on a single forwarded exchange, in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Largest request body the proxy will buffer
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl ServerConfig {
    pub fn tls_enabled(&self) -> bool {
        self.tls
    }

    /// Get HTTP port (0 means disabled)
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    /// Get HTTPS port (0 means disabled)
    pub fn https_port(&self) -> u16 {
        if !self.tls_enabled() {
            return 0;
        }
        self.https_port
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            http_port: default_http_port(),
            https_port: default_https_port(),
            tls: true,
            tls_cert: default_tls_cert(),
            tls_key: default_tls_key(),
            admin_port: default_admin_port(),
            request_timeout_secs: default_request_timeout(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AdminConfig {
    /// Host header value that reaches the admin API on the proxy listeners
    #[serde(default = "default_admin_hostname")]
    pub hostname: String,

    /// Require a loopback peer address for admin requests on the proxy listeners.
    /// The Host header can be forged by any client that can reach the listener.
    #[serde(default = "default_true")]
    pub loopback_only: bool,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            hostname: default_admin_hostname(),
            loopback_only: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// JSON file holding the routing table
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

/// How candidate ports are probed during discovery
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryStrategy {
    /// One port at a time in list order (default)
    #[default]
    Sequential,
    /// All ports at once under a shared deadline, first success wins
    Concurrent,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DiscoveryConfig {
    /// Ordered list of local ports to probe
    #[serde(default = "default_discovery_ports")]
    pub ports: Vec<u16>,

    /// Timeout for each probe in milliseconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Scheme used to reach candidate backends
    #[serde(default = "default_discovery_scheme")]
    pub scheme: String,

    /// Host used to reach candidate backends
    #[serde(default = "default_discovery_host")]
    pub host: String,

    #[serde(default)]
    pub strategy: DiscoveryStrategy,
}

impl DiscoveryConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            ports: default_discovery_ports(),
            probe_timeout_ms: default_probe_timeout(),
            scheme: default_discovery_scheme(),
            host: default_discovery_host(),
            strategy: DiscoveryStrategy::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamConfig {
    /// Skip certificate validation for backend connections.
    /// Issuers on localhost typically present self-signed certificates.
    #[serde(default = "default_true")]
    pub accept_invalid_certs: bool,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            accept_invalid_certs: true,
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    80
}

fn default_https_port() -> u16 {
    443
}

fn default_tls_cert() -> String {
    "certs/cert.pem".to_string()
}

fn default_tls_key() -> String {
    "certs/key.pem".to_string()
}

fn default_admin_port() -> u16 {
    9999
}

fn default_request_timeout() -> u64 {
    60
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_admin_hostname() -> String {
    "localhost".to_string()
}

fn default_true() -> bool {
    true
}

fn default_store_path() -> PathBuf {
    PathBuf::from("routes.json")
}

fn default_discovery_ports() -> Vec<u16> {
    vec![5000, 5001, 5002, 5003]
}

fn default_probe_timeout() -> u64 {
    1000
}

fn default_discovery_scheme() -> String {
    "https".to_string()
}

fn default_discovery_host() -> String {
    "localhost".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load the config file, falling back to defaults when it does not exist
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            warn!(path = %path.display(), "Config file not found, using defaults");
            let config = Config::default();
            config.validate()?;
            return Ok(config);
        }
        Self::load(path)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.tls && (self.server.tls_cert.trim().is_empty() || self.server.tls_key.trim().is_empty()) {
            errors.push("server: 'tls_cert' and 'tls_key' are required when 'tls' is enabled".to_string());
        }

        if self.server.request_timeout_secs == 0 {
            errors.push("server: 'request_timeout_secs' must be greater than 0".to_string());
        }

        if self.admin.hostname.trim().is_empty() {
            errors.push("admin: 'hostname' must not be empty".to_string());
        }

        if self.discovery.probe_timeout_ms == 0 {
            errors.push("discovery: 'probe_timeout_ms' must be greater than 0".to_string());
        }

        if self.discovery.ports.contains(&0) {
            errors.push("discovery: 'ports' must not contain 0".to_string());
        }

        if !matches!(self.discovery.scheme.as_str(), "http" | "https") {
            errors.push(format!(
                "discovery: 'scheme' must be \"http\" or \"https\", got \"{}\"",
                self.discovery.scheme
            ));
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
bind = "127.0.0.1"
http_port = 8080
https_port = 8443
tls_cert = "certs/cert.pem"
tls_key = "certs/key.pem"
admin_port = 9000

[admin]
hostname = "proxy.local"
loopback_only = false

[store]
path = "/var/lib/issuer-proxy/routes.json"

[discovery]
ports = [6000, 6001]
probe_timeout_ms = 250
strategy = "concurrent"

[upstream]
accept_invalid_certs = false
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.http_port(), 8080);
        assert_eq!(config.server.https_port(), 8443);
        assert_eq!(config.server.admin_port, 9000);
        assert_eq!(config.admin.hostname, "proxy.local");
        assert!(!config.admin.loopback_only);
        assert_eq!(
            config.store.path,
            PathBuf::from("/var/lib/issuer-proxy/routes.json")
        );
        assert_eq!(config.discovery.ports, vec![6000, 6001]);
        assert_eq!(config.discovery.probe_timeout(), Duration::from_millis(250));
        assert_eq!(config.discovery.strategy, DiscoveryStrategy::Concurrent);
        assert!(!config.upstream.accept_invalid_certs);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();

        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.http_port(), 80);
        assert_eq!(config.server.https_port(), 443);
        assert!(config.server.tls_enabled());
        assert_eq!(config.server.tls_cert, "certs/cert.pem");
        assert_eq!(config.server.tls_key, "certs/key.pem");
        assert_eq!(config.server.admin_port, 9999);
        assert_eq!(config.server.request_timeout(), Duration::from_secs(60));
        assert_eq!(config.server.max_body_bytes, 10 * 1024 * 1024);
        assert_eq!(config.admin.hostname, "localhost");
        assert!(config.admin.loopback_only);
        assert_eq!(config.store.path, PathBuf::from("routes.json"));
        assert_eq!(config.discovery.ports, vec![5000, 5001, 5002, 5003]);
        assert_eq!(config.discovery.probe_timeout(), Duration::from_secs(1));
        assert_eq!(config.discovery.scheme, "https");
        assert_eq!(config.discovery.host, "localhost");
        assert_eq!(config.discovery.strategy, DiscoveryStrategy::Sequential);
        assert!(config.upstream.accept_invalid_certs);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config_serves_https() {
        let config = Config::default();
        assert!(config.server.tls_enabled());
        assert_eq!(config.server.https_port(), 443);
        assert_eq!(config.server.tls_cert, "certs/cert.pem");
        assert_eq!(config.server.tls_key, "certs/key.pem");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_https_disabled_by_explicit_opt_out() {
        let config: Config = toml::from_str("[server]\ntls = false\nhttps_port = 8443\n").unwrap();
        assert!(!config.server.tls_enabled());
        assert_eq!(config.server.https_port(), 0);
        assert_eq!(config.server.http_port(), 80);
    }

    #[test]
    fn test_validate_tls_files_required_when_enabled() {
        let config: Config = toml::from_str("[server]\ntls_key = \"\"\n").unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("'tls_cert' and 'tls_key' are required when 'tls' is enabled"));

        let config: Config = toml::from_str("[server]\ntls = false\ntls_key = \"\"\n").unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_discovery_settings() {
        let toml = r#"
[discovery]
ports = [5000, 0]
probe_timeout_ms = 0
scheme = "ftp"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("'probe_timeout_ms' must be greater than 0"));
        assert!(err.contains("'ports' must not contain 0"));
        assert!(err.contains("'scheme' must be \"http\" or \"https\""));
    }

    #[test]
    fn test_validate_empty_admin_hostname() {
        let config: Config = toml::from_str("[admin]\nhostname = \"  \"\n").unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("admin: 'hostname' must not be empty"));
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        let result: Result<Config, _> = toml::from_str("[discovery]\nstrategy = \"random\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(dir.path().join("missing.toml")).unwrap();
        assert_eq!(config.admin.hostname, "localhost");
    }

    #[test]
    fn test_load_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server\nhttp_port = 1").unwrap();
        let err = Config::load(&path).unwrap_err().to_string();
        assert!(err.contains("Failed to parse config file"));
    }
}
