//! Configuration for the Chime client.
//!
//! Layered with the following priority (highest first):
//! 1. Values the embedding application sets on [`ClientConfig`] directly
//! 2. TOML config file (`~/.config/chime/config.toml`)
//! 3. Compiled defaults
//!
//! A missing config file is not an error (defaults are used). An explicit
//! path that doesn't exist is an error.

use std::path::{Path, PathBuf};

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// Could not determine the user's config directory.
    #[error("could not determine config directory (no HOME or XDG_CONFIG_HOME)")]
    NoConfigDir,
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    service: ServiceFileConfig,
    sync: SyncFileConfig,
}

/// `[service]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServiceFileConfig {
    messaging_url: Option<String>,
    device_channel: Option<String>,
    profile_id: Option<String>,
    display_name: Option<String>,
}

/// `[sync]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SyncFileConfig {
    max_results: Option<u32>,
    event_buffer: Option<usize>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the messaging REST endpoints.
    pub messaging_url: String,
    /// The per-device push channel carrying entity update events.
    pub device_channel: String,
    /// The authenticated user's profile id.
    pub profile_id: String,
    /// The authenticated user's display name.
    pub display_name: String,
    /// Page size for collection and history fetches.
    pub max_results: u32,
    /// Buffer size for the collection and session event channels.
    pub event_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            messaging_url: String::new(),
            device_channel: String::new(),
            profile_id: String::new(),
            display_name: String::new(),
            max_results: 50,
            event_buffer: 256,
        }
    }
}

impl ClientConfig {
    /// Loads configuration from the given TOML file, or from the default
    /// path when `path` is `None`, merging over compiled defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if an explicit config file cannot be read or
    /// parsed, or if the default config directory cannot be determined.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = load_config_file(path)?;
        Ok(Self::resolve(&file))
    }

    /// Resolves a `ClientConfig` from a parsed config file.
    ///
    /// Separated from `load()` to enable unit testing without touching the
    /// filesystem.
    fn resolve(file: &ConfigFile) -> Self {
        let defaults = Self::default();
        Self {
            messaging_url: file
                .service
                .messaging_url
                .clone()
                .unwrap_or(defaults.messaging_url),
            device_channel: file
                .service
                .device_channel
                .clone()
                .unwrap_or(defaults.device_channel),
            profile_id: file
                .service
                .profile_id
                .clone()
                .unwrap_or(defaults.profile_id),
            display_name: file
                .service
                .display_name
                .clone()
                .unwrap_or(defaults.display_name),
            max_results: file.sync.max_results.unwrap_or(defaults.max_results),
            event_buffer: file.sync.event_buffer.unwrap_or(defaults.event_buffer),
        }
    }
}

/// Loads and parses the TOML config file.
///
/// With an explicit path, a missing file is an error. With the default
/// path, a missing file silently yields the empty config.
fn load_config_file(explicit: Option<&Path>) -> Result<ConfigFile, ConfigError> {
    let (path, required) = match explicit {
        Some(path) => (path.to_path_buf(), true),
        None => {
            let dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
            (dir.join("chime").join("config.toml"), false)
        }
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(err) if !required && err.kind() == std::io::ErrorKind::NotFound => {
            Ok(ConfigFile::default())
        }
        Err(source) => Err(ConfigError::ReadFile { path, source }),
    }
}
