//! Host configuration
//!
//! Loads the sideload host configuration from YAML, TOML or JSON files.
//!
//! ## Features
//!
//! - Auto-detection of format from file extension
//! - Environment variable substitution (`${VAR}` and `$VAR` syntax)
//! - Serde defaults for every field, so an empty file is a valid config

use config::{Config as Cfg, File, FileFormat};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration loading error
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parsing error: {0}")]
    Parse(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

// ============================================================================
// Sideload configuration
// ============================================================================

/// Top-level host configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SideloadConfig {
    /// Directory scanned for module archives at startup and watched afterwards
    pub plugin_dir: PathBuf,
    /// File extension identifying module archives (without the dot)
    pub archive_extension: String,
    /// Watcher settings
    pub watch: WatchSettings,
}

impl Default for SideloadConfig {
    fn default() -> Self {
        Self {
            plugin_dir: PathBuf::from("sideload-plugins"),
            archive_extension: std::env::consts::DLL_EXTENSION.to_string(),
            watch: WatchSettings::default(),
        }
    }
}

impl SideloadConfig {
    /// Load from a file, detecting the format from its extension
    pub fn load<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        load_config(path)
    }

    /// Override the plugin directory
    pub fn with_plugin_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.plugin_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Override the archive extension
    pub fn with_archive_extension(mut self, ext: &str) -> Self {
        self.archive_extension = ext.trim_start_matches('.').to_string();
        self
    }

    /// Whether `path` names a module archive
    pub fn is_archive(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.ends_with(&format!(".{}", self.archive_extension)))
            .unwrap_or(false)
    }
}

/// Directory watcher settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchSettings {
    /// Whether to watch the plugin directory after the initial load
    pub enabled: bool,
    /// Delay before the first poll
    pub initial_delay_ms: u64,
    /// Interval between polls
    pub poll_interval_ms: u64,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay_ms: 10_000,
            poll_interval_ms: 5_000,
        }
    }
}

impl WatchSettings {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

// ============================================================================
// Loading helpers
// ============================================================================

/// Detect configuration format from file extension
///
/// # Supported Extensions
///
/// - YAML: `.yaml`, `.yml`
/// - TOML: `.toml`
/// - JSON: `.json`
pub fn detect_format<P: AsRef<Path>>(path: P) -> ConfigResult<FileFormat> {
    let ext = path
        .as_ref()
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| ConfigError::UnsupportedFormat("No file extension found".to_string()))?;

    match ext.to_lowercase().as_str() {
        "yaml" | "yml" => Ok(FileFormat::Yaml),
        "toml" => Ok(FileFormat::Toml),
        "json" => Ok(FileFormat::Json),
        _ => Err(ConfigError::UnsupportedFormat(ext.to_string())),
    }
}

/// Substitute environment variables in a string
///
/// Supports both `${VAR_NAME}` and `$VAR_NAME` syntax. Unknown variables are
/// left untouched.
pub fn substitute_env_vars(content: &str) -> ConfigResult<String> {
    let re_braced = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")
        .map_err(|e| ConfigError::Parse(e.to_string()))?;
    let result = re_braced
        .replace_all(content, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .to_string();

    let re_simple = Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)\b")
        .map_err(|e| ConfigError::Parse(e.to_string()))?;
    let result = re_simple
        .replace_all(&result, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .to_string();

    Ok(result)
}

/// Load configuration from a file
///
/// Detects the format from the file extension and performs environment
/// variable substitution on the loaded content.
pub fn load_config<T, P>(path: P) -> ConfigResult<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let format = detect_format(&path)?;
    let content = std::fs::read_to_string(path.as_ref())?;
    from_str(&content, format)
}

/// Load configuration from a string with explicit format
pub fn from_str<T>(content: &str, format: FileFormat) -> ConfigResult<T>
where
    T: DeserializeOwned,
{
    let substituted_content = substitute_env_vars(content)?;

    let config = Cfg::builder()
        .add_source(File::from_str(&substituted_content, format))
        .build()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    config
        .try_deserialize()
        .map_err(|e| ConfigError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests;
