//! Configuration for agent and controller.
//!
//! Read from a JSON file named by `--config` or the `CMDLINK_CONFIG`
//! environment variable. Every field has a default, so an empty object (or
//! no file at all) is a valid configuration.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "CMDLINK_CONFIG";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Settings for the executing side.
    #[serde(default)]
    pub agent: AgentConfig,

    /// Settings for the initiating side.
    #[serde(default)]
    pub session: SessionConfigFile,
}

/// Agent-side handler settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Confine all paths to this directory.
    #[serde(default)]
    pub root: Option<PathBuf>,

    /// Refuse `wf` requests.
    #[serde(default)]
    pub read_only: bool,

    /// Directory entries starting with this prefix count as hidden.
    #[serde(default = "default_hidden_prefix")]
    pub hidden_prefix: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            root: None,
            read_only: false,
            hidden_prefix: default_hidden_prefix(),
        }
    }
}

/// Controller session settings (as read from JSON).
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfigFile {
    /// Sequence number assigned to the first request.
    #[serde(default = "default_first_sequence")]
    pub first_sequence: u64,

    /// Minimum delay between consecutive sends, in milliseconds.
    #[serde(default)]
    pub send_spacing_ms: u64,

    /// How long the controller waits for a batch to complete.
    #[serde(default = "default_response_timeout")]
    pub response_timeout_seconds: u64,
}

impl Default for SessionConfigFile {
    fn default() -> Self {
        Self {
            first_sequence: default_first_sequence(),
            send_spacing_ms: 0,
            response_timeout_seconds: default_response_timeout(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Load from the file named by `CMDLINK_CONFIG`, or defaults when unset.
    pub fn from_env() -> Result<Self> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    /// Explicit path wins over the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        path.map_or_else(Self::from_env, Self::from_file)
    }

    /// Create a config from a JSON string (for testing).
    #[cfg(test)]
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse JSON")?;
        Ok(config)
    }
}

fn default_hidden_prefix() -> String {
    ".".into()
}

const fn default_first_sequence() -> u64 {
    1000
}

const fn default_response_timeout() -> u64 {
    30
}
