//! Configuration module for Tus Uploadr
//!
//! Handles loading and parsing of YAML configuration files with support for
//! environment variable expansion and validation.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

// ============================================================================
// Environment Variable Expansion
// ============================================================================

/// Expand environment variables in a string.
///
/// Supports two syntaxes:
/// - `${VAR_NAME}` - Simple expansion, keeps placeholder if var not found
/// - `${VAR_NAME:-default}` - Expansion with default value
///
/// Variable names must start with a letter or underscore and contain only
/// uppercase letters, digits, and underscores.
///
/// # Examples
///
/// ```ignore
/// std::env::set_var("MY_VAR", "value");
/// let result = expand_env_vars("prefix-${MY_VAR}-suffix");
/// assert_eq!(result, "prefix-value-suffix");
///
/// let result = expand_env_vars("${MISSING:-default}");
/// assert_eq!(result, "default");
/// ```
pub(crate) fn expand_env_vars(s: &str) -> String {
    let re = match regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") {
        Ok(re) => re,
        Err(_) => return s.to_string(),
    };
    let mut last_match = 0;
    let mut result = String::with_capacity(s.len());

    for cap in re.captures_iter(s) {
        let (Some(full_match), Some(var_name)) = (cap.get(0), cap.get(1)) else {
            continue;
        };

        result.push_str(&s[last_match..full_match.start()]);

        let value = match std::env::var(var_name.as_str()) {
            Ok(val) => val,
            Err(_) => match cap.get(2) {
                Some(default) => default.as_str().to_string(),
                // No env var and no default. Keep the original placeholder.
                None => full_match.as_str().to_string(),
            },
        };
        result.push_str(&value);

        last_match = full_match.end();
    }

    result.push_str(&s[last_match..]);

    result
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub tus: TusConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::load(path)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.address.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::ValidationError(format!(
                "Invalid server address '{}'",
                self.server.address
            )));
        }

        let prefix = &self.tus.prefix;
        if !prefix.starts_with('/') || prefix.len() < 2 || prefix.ends_with('/') {
            return Err(ConfigError::ValidationError(format!(
                "Invalid tus prefix '{}': must start with '/', be non-root and have no trailing '/'",
                prefix
            )));
        }

        // Reserved for the glue endpoints served on the same listener
        if ["/health", "/metrics", "/finalize"].contains(&prefix.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "tus prefix '{}' collides with a built-in endpoint",
                prefix
            )));
        }

        if self.tus.storage_dir.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "tus.storage_dir cannot be empty".into(),
            ));
        }

        if self.tus.max_size == Some(0) {
            return Err(ConfigError::ValidationError(
                "tus.max_size must be greater than 0 when set".into(),
            ));
        }

        if self.tus.expiry_secs == Some(0) {
            return Err(ConfigError::ValidationError(
                "tus.expiry_secs must be greater than 0 when set".into(),
            ));
        }

        if self.tus.sweep_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "tus.sweep_interval_secs must be greater than 0".into(),
            ));
        }

        if let Some(ref base_url) = self.tus.base_url {
            if !is_valid_http_url(base_url) || base_url.ends_with('/') {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid base_url '{}': must start with http:// or https:// and have no trailing '/'",
                    base_url
                )));
            }
        }

        Ok(())
    }
}

/// Validate that a URL starts with http:// or https://
fn is_valid_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub address: String,
    /// Attach permissive CORS headers so browser clients can read TUS headers
    #[serde(default = "default_cors")]
    pub cors: bool,
}

fn default_cors() -> bool {
    true
}

/// Resumable upload protocol configuration.
///
/// # Example
///
/// ```yaml
/// tus:
///   prefix: "/files"
///   storage_dir: "${TUS_STORAGE_DIR:-./uploads}"
///   max_size: 10737418240   # 10GB
///   expiry_secs: 432000     # 5 days
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TusConfig {
    /// URL path the upload collection is mounted at. Default: "/files"
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Directory holding partial data files and `.info` side-cars. Default: "./uploads"
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Largest accepted upload in bytes, advertised as `Tus-Max-Size`
    #[serde(default)]
    pub max_size: Option<u64>,

    /// Lifetime of an incomplete upload in seconds. `None` disables expiry.
    #[serde(default = "default_expiry_secs")]
    pub expiry_secs: Option<u64>,

    /// How often the expiry sweeper runs. Default: 3600
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Absolute origin used to build `Location` headers, e.g. "https://up.example.com"
    #[serde(default)]
    pub base_url: Option<String>,
}

impl Default for TusConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            storage_dir: default_storage_dir(),
            max_size: None,
            expiry_secs: default_expiry_secs(),
            sweep_interval_secs: default_sweep_interval(),
            base_url: None,
        }
    }
}

fn default_prefix() -> String {
    "/files".to_string()
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("./uploads")
}

fn default_expiry_secs() -> Option<u64> {
    Some(432000) // 5 days
}

fn default_sweep_interval() -> u64 {
    3600
}

/// Settings for the built-in completion hook
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionConfig {
    /// Directory finished uploads are copied into, named after their `name` metadata
    #[serde(default = "default_target_dir")]
    pub target_dir: PathBuf,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            target_dir: default_target_dir(),
        }
    }
}

fn default_target_dir() -> PathBuf {
    PathBuf::from("./public")
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}
