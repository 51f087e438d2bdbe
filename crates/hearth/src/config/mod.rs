use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{HearthError, Result};

/// Main configuration structure for Hearth
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Inference backend connection settings
    #[serde(default)]
    pub backend: BackendConfig,
    /// Encryption key and persistent data settings
    #[serde(default)]
    pub vault: VaultConfig,
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Bulk model pull settings
    #[serde(default)]
    pub pull: PullConfig,
}

/// Inference backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Base URL of the backend (e.g., "http://127.0.0.1:11434")
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Budget for metadata/control calls in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Budget for calls that may load a model or move large data, in milliseconds
    #[serde(default = "default_long_timeout_ms")]
    pub long_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_ms: default_timeout_ms(),
            long_timeout_ms: default_long_timeout_ms(),
        }
    }
}

impl BackendConfig {
    pub fn standard_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn long_timeout(&self) -> Duration {
        Duration::from_millis(self.long_timeout_ms)
    }
}

fn default_base_url() -> String {
    "http://127.0.0.1:11434".to_string()
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_long_timeout_ms() -> u64 {
    600_000
}

/// Encryption key and persistent-data configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Containerized deployment (None = detect from `/.dockerenv`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_mode: Option<bool>,
    /// Persistent data directory (mounted volume when containerized)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Local environment file a generated key is appended to in bare-process mode
    #[serde(default = "default_env_file")]
    pub env_file: PathBuf,
    /// Explicit 64-character hex key; never written back out
    #[serde(default, skip_serializing)]
    pub encryption_key: Option<String>,
    /// Fail on authentication errors instead of returning the stored value unchanged
    #[serde(default)]
    pub strict_decrypt: bool,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            container_mode: None,
            data_dir: default_data_dir(),
            env_file: default_env_file(),
            encryption_key: None,
            strict_decrypt: false,
        }
    }
}

impl VaultConfig {
    /// Whether the process runs containerized, falling back to detection
    pub fn is_container(&self) -> bool {
        self.container_mode
            .unwrap_or_else(|| Path::new("/.dockerenv").exists())
    }

    /// Location of the generated key inside the persistent-data directory
    pub fn key_file(&self) -> PathBuf {
        self.data_dir.join(".encryption_key")
    }

    /// Root directory of the encrypted record store
    pub fn records_dir(&self) -> PathBuf {
        self.data_dir.join("records")
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".hearth"))
        .unwrap_or_else(|| PathBuf::from(".hearth"))
}

fn default_env_file() -> PathBuf {
    PathBuf::from(".env.local")
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "127.0.0.1:3210")
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:3210".to_string()
}

/// Bulk pull configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullConfig {
    /// Number of pulls in flight at once during a pull-all job
    #[serde(default = "default_pull_concurrency")]
    pub concurrency: usize,
    /// Which progress record ends a pull or create stream
    #[serde(default)]
    pub completion: PullCompletion,
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            concurrency: default_pull_concurrency(),
            completion: PullCompletion::default(),
        }
    }
}

/// End-of-stream rule for pull and create progress
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullCompletion {
    /// `status == "success"`, or a record whose byte counts are equal
    #[default]
    Progress,
    /// Only `status == "success"`; layer completions keep the stream open
    Success,
}

fn default_pull_concurrency() -> usize {
    1
}

impl Config {
    /// Load configuration from an explicit path or the default locations
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = config_path {
            tracing::info!("Loading config from: {}", path.display());
            return Self::from_file(path);
        }

        let default_paths = [
            dirs::home_dir().map(|h| h.join(".hearth").join("config.toml")),
            dirs::config_dir().map(|c| c.join("hearth").join("config.toml")),
            Some(PathBuf::from("config.toml")),
        ];

        for path in default_paths.iter().flatten() {
            if path.exists() {
                tracing::info!("Loading config from: {}", path.display());
                return Self::from_file(path);
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Config::default())
    }

    fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            HearthError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        toml::from_str(&content)
            .map_err(|e| HearthError::Config(format!("Failed to parse config: {e}")))
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable lookup
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("HEARTH_BACKEND_URL").or_else(|| lookup("OLLAMA_URL")) {
            self.backend.base_url = url;
        }
        if let Some(ms) = lookup("HEARTH_TIMEOUT_MS") {
            self.backend.timeout_ms = parse_millis("HEARTH_TIMEOUT_MS", &ms)?;
        }
        if let Some(ms) = lookup("HEARTH_LONG_TIMEOUT_MS") {
            self.backend.long_timeout_ms = parse_millis("HEARTH_LONG_TIMEOUT_MS", &ms)?;
        }
        if let Some(dir) = lookup("HEARTH_DATA_DIR") {
            self.vault.data_dir = PathBuf::from(dir);
        }
        if let Some(flag) = lookup("HEARTH_CONTAINER") {
            self.vault.container_mode = Some(parse_flag("HEARTH_CONTAINER", &flag)?);
        }
        if let Some(key) = lookup("ENCRYPTION_KEY") {
            if !key.trim().is_empty() {
                self.vault.encryption_key = Some(key.trim().to_string());
            }
        }
        if let Some(addr) = lookup("HEARTH_LISTEN_ADDR") {
            self.server.listen_addr = addr;
        }
        Ok(())
    }
}

fn parse_millis(name: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| HearthError::Config(format!("{name} must be a number of milliseconds, got '{value}'")))
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        other => Err(HearthError::Config(format!(
            "{name} must be true or false, got '{other}'"
        ))),
    }
}
