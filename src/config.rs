use crate::dispatcher::DEFAULT_MAX_BODY_BYTES;
use crate::registry::{DEFAULT_TLS_PORT, RESERVED_HTTP_PORT};
use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Size of the local port range when only the minimum is configured
const LOCAL_PORT_SPAN: u16 = 999;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Subscriber email passed to the certificate manager
    #[serde(default = "default_email")]
    pub email: String,

    /// Port for sites registered without one (default: 443)
    #[serde(default = "default_port")]
    pub default_port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Plain-HTTP development mode with one port per site
    #[serde(default)]
    pub local: bool,

    /// First port handed out in local mode
    #[serde(default = "default_min_local_port")]
    pub min_local_port: u16,

    /// Last port handed out in local mode (default: min_local_port + 999)
    #[serde(default)]
    pub max_local_port: Option<u16>,

    /// Port for the ACME HTTP-01 challenge listener (0 disables it)
    #[serde(default = "default_acme_http_port")]
    pub acme_http_port: u16,

    /// Use the ACME staging environment
    #[serde(default)]
    pub staging: bool,

    /// Passed through to the certificate manager
    #[serde(default)]
    pub cluster: bool,

    /// Root for relative defaults below
    #[serde(default = "default_base_path")]
    pub base_path: String,

    /// Directory with one subdirectory per site (default: <base_path>/www)
    pub www_path: Option<String>,

    /// Certificate store (default: <base_path>/certs)
    pub cert_store: Option<String>,

    /// Largest request body a site will receive
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// How often cached certificates are checked for renewal
    #[serde(default = "default_cert_refresh_interval")]
    pub cert_refresh_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            email: default_email(),
            default_port: default_port(),
            hostname: default_hostname(),
            local: false,
            min_local_port: default_min_local_port(),
            max_local_port: None,
            acme_http_port: default_acme_http_port(),
            staging: false,
            cluster: false,
            base_path: default_base_path(),
            www_path: None,
            cert_store: None,
            max_body_bytes: default_max_body_bytes(),
            cert_refresh_interval_secs: default_cert_refresh_interval(),
        }
    }
}

impl ServerConfig {
    pub fn www_dir(&self) -> PathBuf {
        self.www_path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| Path::new(&self.base_path).join("www"))
    }

    pub fn cert_store_dir(&self) -> PathBuf {
        self.cert_store
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| Path::new(&self.base_path).join("certs"))
    }

    pub fn bind_ip(&self) -> anyhow::Result<IpAddr> {
        self.hostname
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid hostname '{}': {}", self.hostname, e))
    }

    /// Upper bound of the local port range, derived from the minimum when unset
    pub fn local_port_max(&self) -> u16 {
        self.max_local_port
            .unwrap_or_else(|| self.min_local_port.saturating_add(LOCAL_PORT_SPAN))
    }

    pub fn cert_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.cert_refresh_interval_secs)
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !self.local && self.default_port == RESERVED_HTTP_PORT {
            errors.push(
                "default_port 80 is reserved for ACME challenges, use a different port".to_string(),
            );
        }
        if self.default_port == 0 {
            errors.push("default_port must be greater than 0".to_string());
        }
        if self.local && (self.min_local_port == 0 || self.min_local_port > self.local_port_max()) {
            errors.push(format!(
                "invalid local port range {}-{}",
                self.min_local_port,
                self.local_port_max()
            ));
        }
        if let Err(e) = self.bind_ip() {
            errors.push(e.to_string());
        }
        if self.max_body_bytes == 0 {
            errors.push("max_body_bytes must be greater than 0".to_string());
        }
        if self.cert_refresh_interval_secs == 0 {
            errors.push("cert_refresh_interval_secs must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

// Default value functions
fn default_email() -> String {
    "admin@example.com".to_string()
}

fn default_port() -> u16 {
    DEFAULT_TLS_PORT
}

fn default_hostname() -> String {
    "0.0.0.0".to_string()
}

fn default_min_local_port() -> u16 {
    3000
}

fn default_acme_http_port() -> u16 {
    RESERVED_HTTP_PORT
}

fn default_base_path() -> String {
    ".".to_string()
}

fn default_max_body_bytes() -> usize {
    DEFAULT_MAX_BODY_BYTES
}

fn default_cert_refresh_interval() -> u64 {
    3600 // 1 hour
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Err(errors) = self.server.validate() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }
        Ok(())
    }
}
