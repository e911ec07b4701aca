//! Bridge configuration
//!
//! Produced by the external setup wizard, loaded once at startup and treated
//! as read-only afterwards. The `SYMBRIDGE_CONFIG` environment variable
//! designates the file; absent, `symbridge.toml` in the working directory.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const CONFIG_ENV_VAR: &str = "SYMBRIDGE_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "symbridge.toml";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BridgeConfig {
    /// Ordered server descriptors; first extension match wins
    #[serde(default, rename = "server")]
    pub servers: Vec<ServerConfig>,

    #[serde(default)]
    pub limits: Limits,
}

/// One language server descriptor. Immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// File extensions this server covers, no leading dot
    pub extensions: Vec<String>,

    /// Executable path
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory the process is spawned in (also the LSP root)
    pub working_dir: PathBuf,

    /// Periodic restart, in minutes; absent means never
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_interval_minutes: Option<u64>,

    /// Server-specific options passed through to initialize unmodified
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initialization_options: Option<toml::Value>,
}

impl ServerConfig {
    /// Human-readable description for caller reporting
    pub fn describe(&self) -> String {
        format!("{} ({})", self.command, self.extensions.join(", "))
    }

    pub fn covers_extension(&self, extension: &str) -> bool {
        self.extensions.iter().any(|e| e == extension)
    }

    pub fn restart_interval(&self) -> Option<Duration> {
        self.restart_interval_minutes
            .map(|mins| Duration::from_secs(mins * 60))
    }

    /// Initialization options as JSON for the initialize request
    pub fn initialization_options_json(&self) -> Option<serde_json::Value> {
        self.initialization_options
            .as_ref()
            .and_then(|v| serde_json::to_value(v).ok())
    }
}

/// Request deadlines
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Limits {
    #[serde(default = "defaults::request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "defaults::initialize_timeout_secs")]
    pub initialize_timeout_secs: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            request_timeout_secs: defaults::request_timeout_secs(),
            initialize_timeout_secs: defaults::initialize_timeout_secs(),
        }
    }
}

impl Limits {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn initialize_timeout(&self) -> Duration {
        Duration::from_secs(self.initialize_timeout_secs)
    }
}

mod defaults {
    pub fn request_timeout_secs() -> u64 {
        30
    }
    pub fn initialize_timeout_secs() -> u64 {
        60
    }
}

impl BridgeConfig {
    /// Load from the conventional location: env var, then working directory.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_ENV_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }

        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// The upstream wizard is expected to emit clean files; validate anyway.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen: HashSet<&str> = HashSet::new();
        for server in &self.servers {
            if server.command.trim().is_empty() {
                return Err(ConfigError::EmptyCommand {
                    extensions: server.extensions.clone(),
                });
            }
            for ext in &server.extensions {
                if !seen.insert(ext.as_str()) {
                    return Err(ConfigError::DuplicateExtension {
                        extension: ext.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// First configured server covering the extension, if any
    pub fn server_for_extension(&self, extension: &str) -> Option<&ServerConfig> {
        self.servers.iter().find(|s| s.covers_extension(extension))
    }
}
