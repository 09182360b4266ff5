//! Configuration management for the Hideaway gateway.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/hideaway/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use access::{DangerDetector, HostLayout};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("base_dir must be an absolute path, got {0}")]
    RelativeBaseDir(PathBuf),

    #[error("token_ttl_secs must be between 1 and 86400, got {0}")]
    InvalidTokenTtl(u64),

    #[error("chunk_size must be between 1 and 16777216, got {0}")]
    InvalidChunkSize(usize),

    #[error("max_file_size must be greater than 0, got {0}")]
    InvalidMaxFileSize(u64),

    #[error("max_depth must be between 1 and 256, got {0}")]
    InvalidMaxDepth(usize),

    #[error("max_entries must be greater than 0, got {0}")]
    InvalidMaxEntries(usize),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Largest accepted streaming chunk (16 MiB).
const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Main configuration structure for the Hideaway gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General configuration.
    pub general: GeneralConfig,

    /// Secure root placement.
    pub root: RootConfig,

    /// Host application layout, protected by the danger detector.
    pub host: HostConfig,

    /// Download link and streaming configuration.
    pub downloads: DownloadConfig,

    /// Limits for recursive deletion.
    pub delete: DeleteConfig,
}

/// General configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GeneralConfig {
    /// Directory holding persisted state (policies, key material, root record).
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Optional log file. Logs go to stderr when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

/// Secure root placement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RootConfig {
    /// Parent directory of the randomly named secure root. Defaults to
    /// `<data_dir>/roots`; must not sit inside a protected directory.
    pub base_dir: PathBuf,
}

/// Host application layout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct HostConfig {
    /// Installation root of the host application.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,

    /// Administration directory. Defaults to `<root>/wp-admin`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_dir: Option<PathBuf>,

    /// Core library directory. Defaults to `<root>/wp-includes`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub core_dir: Option<PathBuf>,

    /// System directories a secure root must never overlap. Replaces the
    /// built-in list when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protected_dirs: Option<Vec<PathBuf>>,
}

/// Download configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DownloadConfig {
    /// Lifetime of a download link in seconds.
    pub token_ttl_secs: u64,

    /// Bytes read per streaming chunk.
    pub chunk_size: usize,

    /// Largest file that may be streamed, in bytes.
    pub max_file_size: u64,
}

/// Recursive deletion limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeleteConfig {
    /// Deepest directory level that will be descended into.
    pub max_depth: usize,

    /// Most entries a single deletion may remove.
    pub max_entries: usize,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl Default for RootConfig {
    fn default() -> Self {
        Self {
            base_dir: default_data_dir().join("roots"),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            token_ttl_secs: 300,                   // 5 minutes
            chunk_size: 64 * 1024,                 // 64KB
            max_file_size: 2 * 1024 * 1024 * 1024, // 2GB
        }
    }
}

impl Default for DeleteConfig {
    fn default() -> Self {
        Self {
            max_depth: 32,
            max_entries: 10_000,
        }
    }
}

impl HostConfig {
    /// The layout handed to the danger detector.
    pub fn layout(&self) -> HostLayout {
        let Some(root) = &self.root else {
            return HostLayout {
                root: None,
                admin_dir: self.admin_dir.clone(),
                core_dir: self.core_dir.clone(),
            };
        };

        let mut layout = HostLayout::wordpress(root);
        if let Some(admin_dir) = &self.admin_dir {
            layout.admin_dir = Some(admin_dir.clone());
        }
        if let Some(core_dir) = &self.core_dir {
            layout.core_dir = Some(core_dir.clone());
        }
        layout
    }

    /// Danger detector for this layout.
    pub fn detector(&self) -> DangerDetector {
        match &self.protected_dirs {
            Some(dirs) => DangerDetector::with_denylist(dirs.clone(), self.layout()),
            None => DangerDetector::new(self.layout()),
        }
    }
}

impl DownloadConfig {
    /// Link lifetime as a `Duration`.
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hideaway")
        .join("config.toml")
}

/// Returns the default data directory path.
///
/// This lives under the invoking user's home. For `root` that is
/// `/root/.local/share/hideaway`, which the built-in protected list covers, so
/// a root-run install starts with downloads blocked until `root.base_dir`
/// points elsewhere (for example `/srv/hideaway`) or `host.protected_dirs`
/// is set.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hideaway")
}

impl Config {
    /// Path of the persisted state document.
    pub fn state_path(&self) -> PathBuf {
        self.general.data_dir.join("state.json")
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - HIDEAWAY_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - HIDEAWAY_ROOT_BASE: Override the secure root base directory
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("HIDEAWAY_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.general.log_level = level;
            }
        }

        if let Ok(base) = std::env::var("HIDEAWAY_ROOT_BASE") {
            if !base.is_empty() {
                tracing::info!("Overriding root base_dir from environment: {}", base);
                self.root.base_dir = PathBuf::from(base);
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let level = self.general.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.general.log_level.clone()));
        }

        if !self.root.base_dir.is_absolute() {
            return Err(ConfigError::RelativeBaseDir(self.root.base_dir.clone()));
        }

        let ttl = self.downloads.token_ttl_secs;
        if !(1..=86_400).contains(&ttl) {
            return Err(ConfigError::InvalidTokenTtl(ttl));
        }

        let chunk = self.downloads.chunk_size;
        if chunk == 0 || chunk > MAX_CHUNK_SIZE {
            return Err(ConfigError::InvalidChunkSize(chunk));
        }

        if self.downloads.max_file_size == 0 {
            return Err(ConfigError::InvalidMaxFileSize(self.downloads.max_file_size));
        }

        let depth = self.delete.max_depth;
        if !(1..=256).contains(&depth) {
            return Err(ConfigError::InvalidMaxDepth(depth));
        }

        if self.delete.max_entries == 0 {
            return Err(ConfigError::InvalidMaxEntries(self.delete.max_entries));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
