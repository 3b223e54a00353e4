//! Configuration loading and constants.
//!
//! Loads application configuration from a TOML file and maps the `[http]`
//! section onto one of the launcher presets (development, production or
//! plain). `AppConfig` is the root configuration struct containing all settings.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::http::{
    ServerConfig, TlsSource, DEFAULT_ACME_CACHE_DIR, HTTPS_PORT, HTTP_PORT,
};

// =============================================================================
// Default Paths and Strings
// =============================================================================

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Default log filter when RUST_LOG is not set
pub const DEFAULT_LOG_FILTER: &str = "drawbridge=info,tower_http=info";

/// Default listen host
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default port for manual certificate mode
pub const DEFAULT_MANUAL_PORT: u16 = 8443;

/// Default port when TLS is disabled
pub const DEFAULT_PLAIN_PORT: u16 = 8080;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// HTTP server configuration
    pub http: HttpServerConfig,
    /// Built-in site settings
    #[serde(default)]
    pub site: SiteConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HttpServerConfig {
    #[serde(default = "HttpServerConfig::default_host")]
    pub host: String,
    /// Listen port; defaults depend on the TLS mode
    pub port: Option<u16>,
    /// Graceful shutdown budget in seconds (overrides the mode preset)
    pub drain_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub timeouts: TimeoutOverrides,
    #[serde(default)]
    pub tls: TlsConfig,
}

impl HttpServerConfig {
    fn default_host() -> String {
        DEFAULT_HOST.to_string()
    }

    /// Effective listen port
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(match self.tls.mode {
            TlsMode::Acme => HTTPS_PORT,
            TlsMode::Manual => DEFAULT_MANUAL_PORT,
            TlsMode::None => DEFAULT_PLAIN_PORT,
        })
    }

    /// Listen address as `host:port`
    pub fn addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port())
        } else {
            format!("{}:{}", self.host, self.port())
        }
    }

    /// Build the launcher configuration for the selected TLS mode.
    pub fn server_config(&self) -> Result<ServerConfig, ConfigError> {
        let tls = &self.tls;

        let mut config = match tls.mode {
            TlsMode::Manual => {
                let (Some(cert_path), Some(key_path)) = (&tls.cert_path, &tls.key_path) else {
                    return Err(ConfigError::Validation(
                        "tls.mode = \"manual\" requires tls.cert_path and tls.key_path".to_string(),
                    ));
                };
                ServerConfig::development(self.addr(), cert_path, key_path)
            }
            TlsMode::Acme => {
                if tls.acme_domains.is_empty() {
                    return Err(ConfigError::Validation(
                        "tls.mode = \"acme\" requires at least one entry in tls.acme_domains"
                            .to_string(),
                    ));
                }
                let mut config = ServerConfig::production(tls.acme_domains.iter().cloned());
                config.addr = self.addr();
                if let TlsSource::Acme(acme) = &mut config.tls {
                    acme.cache_dir = tls.acme_cache_dir.clone().into();
                    acme.contact_email = tls.acme_email.clone();
                    acme.production = tls.acme_production;
                }
                config
            }
            TlsMode::None => ServerConfig::plain(self.addr()),
        };

        config.redirect_port = match (tls.mode, tls.redirect_http) {
            (TlsMode::None, _) => None,
            (TlsMode::Acme, None) | (_, Some(true)) => Some(tls.redirect_port),
            (_, _) => None,
        };

        let overrides = &self.timeouts;
        if let Some(secs) = overrides.read_seconds {
            config.timeouts.read = non_zero("timeouts.read_seconds", secs)?;
        }
        if let Some(secs) = overrides.write_seconds {
            config.timeouts.write = non_zero("timeouts.write_seconds", secs)?;
        }
        if let Some(secs) = overrides.idle_seconds {
            config.timeouts.idle = Some(non_zero("timeouts.idle_seconds", secs)?);
        }
        if let Some(secs) = self.drain_timeout_seconds {
            config.drain_timeout = non_zero("drain_timeout_seconds", secs)?;
        }

        Ok(config)
    }
}

fn non_zero(field: &str, secs: u64) -> Result<Duration, ConfigError> {
    if secs == 0 {
        return Err(ConfigError::Validation(format!(
            "http.{} must be greater than zero",
            field
        )));
    }
    Ok(Duration::from_secs(secs))
}

/// Per-field overrides of the preset timeouts, in seconds
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TimeoutOverrides {
    pub read_seconds: Option<u64>,
    pub write_seconds: Option<u64>,
    pub idle_seconds: Option<u64>,
}

/// How the server obtains TLS certificates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// Automatic certificates from Let's Encrypt (production preset)
    #[default]
    Acme,
    /// Certificate and key files (development preset)
    Manual,
    /// Plain HTTP
    None,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub mode: TlsMode,
    /// PEM certificate chain (manual mode)
    pub cert_path: Option<String>,
    /// PEM private key (manual mode)
    pub key_path: Option<String>,
    /// Host names to request certificates for (acme mode)
    #[serde(default)]
    pub acme_domains: Vec<String>,
    /// Contact e-mail registered with Let's Encrypt
    pub acme_email: Option<String>,
    #[serde(default = "TlsConfig::default_cache_dir")]
    pub acme_cache_dir: String,
    /// Use the production directory; false selects staging
    #[serde(default = "TlsConfig::default_acme_production")]
    pub acme_production: bool,
    /// Run the HTTP->HTTPS redirect listener (default: on in acme mode only)
    pub redirect_http: Option<bool>,
    #[serde(default = "TlsConfig::default_redirect_port")]
    pub redirect_port: u16,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            mode: TlsMode::default(),
            cert_path: None,
            key_path: None,
            acme_domains: Vec::new(),
            acme_email: None,
            acme_cache_dir: Self::default_cache_dir(),
            acme_production: Self::default_acme_production(),
            redirect_http: None,
            redirect_port: Self::default_redirect_port(),
        }
    }
}

impl TlsConfig {
    fn default_cache_dir() -> String {
        DEFAULT_ACME_CACHE_DIR.to_string()
    }

    fn default_acme_production() -> bool {
        true
    }

    fn default_redirect_port() -> u16 {
        HTTP_PORT
    }
}

/// Built-in site configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SiteConfig {
    /// Directory served as static files; a plain-text index is served otherwise
    pub root: Option<String>,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(contents)?;

        // Surface mode/field mismatches at load time rather than at launch
        config.http.server_config()?;

        Ok(config)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Configuration error: {0}")]
    Validation(String),
}
