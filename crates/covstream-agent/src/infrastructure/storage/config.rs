//! TOML configuration for the agent.
//!
//! Default location:
//! - Windows:  `%APPDATA%\covstream\agent.toml`
//! - Linux:    `~/.config/covstream/agent.toml`
//! - macOS:    `~/Library/Application Support/covstream/agent.toml`
//!
//! ```toml
//! [server]
//! address = "*"
//! port = 6300
//!
//! [registry]
//! url = "http://registry.internal/apps/42"
//! connect_timeout_secs = 60
//!
//! [agent]
//! session_id = "ci-runner-7"
//! log_level = "info"
//! dump_on_exit = true
//! ```
//!
//! Every field has a default, so an empty or partial file is valid and older
//! files keep loading when new fields are added.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::infrastructure::network::server::{ServerSettings, DEFAULT_ADDRESS, DEFAULT_PORT};
use crate::infrastructure::registry::DEFAULT_CONNECT_TIMEOUT;

/// File name used inside the platform config directory.
pub const CONFIG_FILE_NAME: &str = "agent.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub agent: AgentSection,
}

/// Listening socket settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// `"*"` for every interface, an IP literal, or a host name.
    #[serde(default = "default_address")]
    pub address: String,
    /// First port to try; the next one is used if it is taken.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Where port changes are announced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistryConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

/// Runtime behaviour of the agent process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSection {
    /// Session id written into snapshots; generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// `tracing` filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Push a final snapshot to the connected collector before shutting down.
    #[serde(default = "default_true")]
    pub dump_on_exit: bool,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_address() -> String {
    DEFAULT_ADDRESS.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT.as_secs()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url: None,
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            session_id: None,
            log_level: default_log_level(),
            dump_on_exit: default_true(),
        }
    }
}

impl AgentConfig {
    pub fn server_settings(&self) -> ServerSettings {
        ServerSettings {
            address: self.server.address.clone(),
            port: self.server.port,
            registry_url: self.registry.url.clone(),
        }
    }

    pub fn registry_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.registry.connect_timeout_secs)
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Full path of the config file in the platform config directory.
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    platform_config_dir()
        .map(|dir| dir.join(CONFIG_FILE_NAME))
        .ok_or(ConfigError::NoPlatformConfigDir)
}

/// Loads the config at `path`, returning defaults if the file does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<AgentConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AgentConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Writes `config` to `path`, creating parent directories as needed.
pub fn save_config(path: &Path, config: &AgentConfig) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("covstream"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("covstream"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("covstream")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
