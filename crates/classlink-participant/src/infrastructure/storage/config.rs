//! TOML configuration for the participant.
//!
//! Stored as `participant.toml` in the same platform config directory the
//! presenter uses (`%APPDATA%\ClassLink`, `~/.config/classlink`,
//! `~/Library/Application Support/ClassLink`).
//!
//! ```toml
//! [participant]
//! name = "Alex"
//! machine_id = "5f0c1e9a-3c1b-4f7e-9f55-2d1f4a8c7b10"
//! log_level = "info"
//!
//! [network]
//! presenter = "192.168.1.20:9999"   # omit to discover presenters
//! heartbeat_interval_secs = 3
//! ```
//!
//! The machine id is generated on first start and written back, so the
//! presenter sees the same identity across restarts.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use classlink_core::transport::{EndpointConfig, FanoutConfig, PresenceConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::infrastructure::network::ClientConfig;

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
pub struct ParticipantFileConfig {
    #[serde(default)]
    pub participant: ParticipantSection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub presence: PresenceSection,
    #[serde(default)]
    pub fanout: FanoutSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParticipantSection {
    #[serde(default = "default_name")]
    pub name: String,
    /// Generated on first start when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkSection {
    /// Fixed presenter address.  Discovery is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presenter: Option<SocketAddr>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresenceSection {
    #[serde(default = "default_presence_group")]
    pub group: Ipv4Addr,
    #[serde(default = "default_presence_port")]
    pub port: u16,
    /// Presenters silent this long drop out of the list.
    #[serde(default = "default_presenter_expiry_secs")]
    pub presenter_expiry_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FanoutSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_fanout_group")]
    pub group: Ipv4Addr,
    #[serde(default = "default_fanout_port")]
    pub port: u16,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_name() -> String {
    "Participant".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_connect_timeout_secs() -> u64 {
    5
}
fn default_handshake_timeout_secs() -> u64 {
    5
}
fn default_heartbeat_interval_secs() -> u64 {
    3
}
fn default_presence_group() -> Ipv4Addr {
    PresenceConfig::default().group
}
fn default_presence_port() -> u16 {
    PresenceConfig::default().port
}
fn default_presenter_expiry_secs() -> u64 {
    PresenceConfig::default().announce_interval.as_secs() * 3
}
fn default_fanout_group() -> Ipv4Addr {
    FanoutConfig::default().group
}
fn default_fanout_port() -> u16 {
    FanoutConfig::default().port
}

impl Default for ParticipantSection {
    fn default() -> Self {
        Self {
            name: default_name(),
            machine_id: None,
            log_level: default_log_level(),
        }
    }
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            presenter: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
        }
    }
}

impl Default for PresenceSection {
    fn default() -> Self {
        Self {
            group: default_presence_group(),
            port: default_presence_port(),
            presenter_expiry_secs: default_presenter_expiry_secs(),
        }
    }
}

impl Default for FanoutSection {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            group: default_fanout_group(),
            port: default_fanout_port(),
        }
    }
}

// ── Conversion to runtime settings ────────────────────────────────────────────

impl ParticipantFileConfig {
    /// Returns the machine id, generating and storing a new one if missing.
    ///
    /// Returns `true` in the second position when a new id was generated and
    /// the config should be saved.
    pub fn ensure_machine_id(&mut self) -> (String, bool) {
        match &self.participant.machine_id {
            Some(id) if !id.trim().is_empty() => (id.clone(), false),
            _ => {
                let id = Uuid::new_v4().to_string();
                self.participant.machine_id = Some(id.clone());
                (id, true)
            }
        }
    }

    /// Builds the session client settings.  Call
    /// [`ensure_machine_id`](Self::ensure_machine_id) first; otherwise the
    /// presenter rejects the registration.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            name: self.participant.name.clone(),
            machine_id: self.participant.machine_id.clone().unwrap_or_default(),
            connect_timeout: Duration::from_secs(self.network.connect_timeout_secs.max(1)),
            handshake_timeout: Duration::from_secs(self.network.handshake_timeout_secs.max(1)),
            heartbeat_interval: Duration::from_secs(self.network.heartbeat_interval_secs.max(1)),
            presenter_expiry: Duration::from_secs(self.presence.presenter_expiry_secs.max(1)),
            endpoint: EndpointConfig::default(),
            presence: self.presence_config(),
            ..ClientConfig::default()
        }
    }

    pub fn presence_config(&self) -> PresenceConfig {
        PresenceConfig {
            group: self.presence.group,
            port: self.presence.port,
            ..PresenceConfig::default()
        }
    }

    pub fn fanout_config(&self) -> FanoutConfig {
        FanoutConfig {
            group: self.fanout.group,
            port: self.fanout.port,
            ..FanoutConfig::default()
        }
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Resolves the default path of the participant config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when no config base directory
/// can be determined from the environment.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    platform_config_dir()
        .map(|dir| dir.join("participant.toml"))
        .ok_or(ConfigError::NoPlatformConfigDir)
}

/// Loads the config from `path`, or from [`config_file_path`] when `None`.
/// A missing file yields the defaults.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: Option<&Path>) -> Result<ParticipantFileConfig, ConfigError> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => config_file_path()?,
    };

    match std::fs::read_to_string(&path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ParticipantFileConfig::default()),
        Err(e) => Err(ConfigError::Io { path, source: e }),
    }
}

/// Writes `config` to `path`, creating the directory if needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] or [`ConfigError::Serialize`].
pub fn save_config(config: &ParticipantFileConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
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
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("ClassLink"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("classlink"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("ClassLink")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}
