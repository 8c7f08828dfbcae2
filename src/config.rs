//! Configuration management for Freqlog
//!
//! Configuration is stored as TOML in a platform-specific config file.
//!
//! ## Config File Locations
//!
//! | Platform | Path |
//! |----------|------|
//! | Linux | `~/.config/freqlog/config.toml` |
//! | macOS | `~/Library/Application Support/freqlog/config.toml` |
//! | Windows | `%APPDATA%\freqlog\config.toml` |
//!
//! The store defaults to the platform data directory (`~/.local/share/freqlog`
//! on Linux).
//!
//! ## Example
//!
//! ```no_run
//! use freqlog::Config;
//!
//! let mut config = Config::load().unwrap_or_default();
//! config.classifier.new_word_threshold_ms = 800;
//! config.save().expect("Failed to save config");
//! ```

use crate::backend::BackendKind;
use crate::classifier::ClassifierConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const APP_DIR: &str = "freqlog";

/// Error type for configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Returns the path to the config file.
///
/// Creates the config directory if it doesn't exist.
pub fn config_path() -> Result<PathBuf, ConfigError> {
    let config_dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
    let app_dir = config_dir.join(APP_DIR);

    if !app_dir.exists() {
        fs::create_dir_all(&app_dir)?;
    }

    Ok(app_dir.join("config.toml"))
}

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub keymap: KeymapConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub backend: BackendConfig,
}

/// Key capture settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CaptureConfig {
    /// Keyboard polling interval in milliseconds
    pub poll_interval_ms: u64,
    /// Tag attached to every captured event
    pub source_tag: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2,
            source_tag: "keyboard".to_string(),
        }
    }
}

/// Scancode remapping applied before key lookup
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct KeymapConfig {
    /// `(source_scancode, target_scancode)` pairs
    pub remaps: Vec<(u16, u16)>,
}

impl KeymapConfig {
    /// Add a remap, replacing any existing one for the same source
    pub fn add_remap(&mut self, from: u16, to: u16) {
        self.remaps.retain(|(k, _)| *k != from);
        self.remaps.push((from, to));
    }
}

/// Pipeline sizing and shutdown settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Capacity of each consumer channel
    pub channel_capacity: usize,
    /// Entries parked per consumer before capture suspends
    pub overflow_limit: usize,
    /// Successful appends between aggregate checkpoints
    pub checkpoint_every: u64,
    /// Time allowed for workers to drain on shutdown (milliseconds)
    pub drain_timeout_ms: u64,
    /// Capacity of each subscriber channel
    pub subscriber_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            overflow_limit: 65536,
            checkpoint_every: 256,
            drain_timeout_ms: 5000,
            subscriber_capacity: 256,
        }
    }
}

impl PipelineConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Storage backend selection
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    /// Store location; the platform data directory when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl BackendConfig {
    pub fn new(kind: BackendKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: Some(path.into()),
        }
    }

    pub fn memory() -> Self {
        Self {
            kind: BackendKind::Memory,
            path: None,
        }
    }

    /// Store location for the configured variant
    ///
    /// A database file for SQLite, a directory for the file backend.
    pub fn resolved_path(&self) -> PathBuf {
        if let Some(path) = &self.path {
            return path.clone();
        }
        let base = dirs::data_dir()
            .map(|d| d.join(APP_DIR))
            .unwrap_or_else(|| PathBuf::from("."));
        match self.kind {
            BackendKind::Sqlite => base.join("freqlog.db"),
            BackendKind::File | BackendKind::Memory => base.join("log"),
        }
    }
}

impl Config {
    /// Load configuration from the default config file.
    ///
    /// Returns the default configuration if the file doesn't exist.
    /// Returns an error if the file exists but cannot be parsed.
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path()?;

        if !path.exists() {
            return Ok(Self::default());
        }

        Self::load_from(&path)
    }

    /// Load and validate configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default config file.
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = config_path()?;
        self.save_to(&path)
    }

    /// Save configuration to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Check value ranges and character filters
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        let c = &self.classifier;
        if c.new_word_threshold_ms == 0 {
            return invalid("classifier.new_word_threshold_ms must be greater than 0");
        }
        if c.chord_window_ms == 0 {
            return invalid("classifier.chord_window_ms must be greater than 0");
        }
        if c.max_entry_len == 0 {
            return invalid("classifier.max_entry_len must be greater than 0");
        }
        if c.allowed_chars.is_empty() {
            return invalid("classifier.allowed_chars must not be empty");
        }
        if c.allowed_first_chars.is_empty() {
            return invalid("classifier.allowed_first_chars must not be empty");
        }
        if let Some(ch) = c.allowed_first_chars.chars().find(|ch| !c.allowed_chars.contains(*ch)) {
            return Err(ConfigError::Invalid(format!(
                "allowed first character '{}' is not in classifier.allowed_chars",
                ch
            )));
        }
        if self.capture.poll_interval_ms == 0 {
            return invalid("capture.poll_interval_ms must be greater than 0");
        }
        let p = &self.pipeline;
        if p.channel_capacity == 0 {
            return invalid("pipeline.channel_capacity must be greater than 0");
        }
        if p.overflow_limit == 0 {
            return invalid("pipeline.overflow_limit must be greater than 0");
        }
        if p.checkpoint_every == 0 {
            return invalid("pipeline.checkpoint_every must be greater than 0");
        }
        if p.subscriber_capacity == 0 {
            return invalid("pipeline.subscriber_capacity must be greater than 0");
        }
        Ok(())
    }

    /// Keyboard polling interval as Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.capture.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn config_default_values() {
        let config = Config::default();
        assert_eq!(config.classifier.new_word_threshold_ms, 1000);
        assert_eq!(config.classifier.chord_char_threshold_ms, 5);
        assert_eq!(config.pipeline.channel_capacity, 1024);
        assert_eq!(config.pipeline.checkpoint_every, 256);
        assert_eq!(config.backend.kind, BackendKind::Sqlite);
        assert_eq!(config.poll_interval(), Duration::from_millis(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.classifier.new_word_threshold_ms = 750;
        config.keymap.add_remap(58, 14);
        config.backend = BackendConfig::new(BackendKind::File, dir.path().join("store"));

        config.save_to(&path).expect("Failed to save config");
        let loaded = Config::load_from(&path).expect("Failed to load config");
        assert_eq!(loaded, config);
    }

    #[test]
    fn config_load_missing_file_is_error() {
        let result = Config::load_from(Path::new("/nonexistent/path/config.toml"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn config_serializes_to_toml() {
        let toml_str = toml::to_string_pretty(&Config::default()).expect("Failed to serialize");
        assert!(toml_str.contains("[capture]"));
        assert!(toml_str.contains("[classifier]"));
        assert!(toml_str.contains("[pipeline]"));
        assert!(toml_str.contains("kind = \"sqlite\""));
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let toml_str = r#"
[classifier]
new_word_threshold_ms = 1500

[backend]
kind = "file"
path = "/tmp/freqlog-store"
"#;
        let config: Config = toml::from_str(toml_str).expect("Failed to deserialize");
        assert_eq!(config.classifier.new_word_threshold_ms, 1500);
        assert_eq!(config.classifier.max_entry_len, 64);
        assert_eq!(config.pipeline, PipelineConfig::default());
        assert_eq!(config.backend.kind, BackendKind::File);
        assert_eq!(config.backend.resolved_path(), PathBuf::from("/tmp/freqlog-store"));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = Config::default();
        config.pipeline.channel_capacity = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.classifier.allowed_first_chars = "a!".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("'!'"));

        let mut config = Config::default();
        config.classifier.allowed_chars.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_rejects_invalid_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[pipeline]\ncheckpoint_every = 0\n").unwrap();
        assert!(matches!(Config::load_from(&path), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn default_store_paths_differ_by_kind() {
        let sqlite = BackendConfig::default().resolved_path();
        assert!(sqlite.ends_with("freqlog/freqlog.db") || sqlite.ends_with("freqlog.db"));
        let file = BackendConfig {
            kind: BackendKind::File,
            path: None,
        }
        .resolved_path();
        assert!(file.ends_with("log"));
    }

    #[test]
    fn config_error_display() {
        assert_eq!(ConfigError::NoConfigDir.to_string(), "Could not determine config directory");
        let io_err = ConfigError::Io(io::Error::new(io::ErrorKind::NotFound, "file not found"));
        assert!(io_err.to_string().contains("IO error"));
    }
}
