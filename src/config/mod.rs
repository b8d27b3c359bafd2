//! Application configuration.
//!
//! Everything the binary needs is declared in one TOML file: server
//! addresses, HTTP behavior (timeout, rate-limit backoff), the credential
//! database path, and the provider descriptor table. The only value read
//! from the environment is the master encryption key, and that happens once
//! in `main` - never inside constructors.

use crate::manager::HttpOptions;
use crate::provider::ProviderDescriptor;
use serde::Deserialize;
use std::time::Duration;

/// Complete Tether configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TetherConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub store: StoreConfig,
    /// Provider descriptor table.
    #[serde(default)]
    pub providers: Vec<ProviderDescriptor>,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address the API server binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Public base URL used to build OAuth redirect URIs.
    #[serde(default = "default_callback_base_url")]
    pub callback_base_url: String,
    /// When false, requests without a bearer token act as the default user.
    #[serde(default)]
    pub auth_enabled: bool,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_callback_base_url() -> String {
    "http://localhost:3000".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            callback_base_url: default_callback_base_url(),
            auth_enabled: false,
        }
    }
}

/// Outbound HTTP behavior.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Rate-limit backoff schedule in seconds. Providers may override.
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: Vec<u64>,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_backoff_secs() -> Vec<u64> {
    vec![1, 3, 10]
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            backoff_secs: default_backoff_secs(),
        }
    }
}

impl HttpConfig {
    /// Converts into the options managers are constructed with.
    pub fn options(&self) -> HttpOptions {
        HttpOptions {
            timeout: Duration::from_secs(self.timeout_secs),
            backoff: self
                .backoff_secs
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
        }
    }
}

/// Credential store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// SQLite database file for credentials and entities.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_db_path() -> String {
    "tether.db".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

/// Load configuration from a TOML file.
pub fn load_config(path: &str) -> Result<TetherConfig, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: TetherConfig = toml::from_str(&contents)?;
    Ok(config)
}
