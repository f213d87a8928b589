//! TOML-based configuration for the presenter.
//!
//! Looked up at an explicit `--config` path, or else in the platform config
//! directory:
//! - Windows:  `%APPDATA%\ClassLink\presenter.toml`
//! - Linux:    `~/.config/classlink/presenter.toml`
//! - macOS:    `~/Library/Application Support/ClassLink/presenter.toml`
//!
//! ```toml
//! [presenter]
//! name = "Room 204"
//! channel = 3
//! log_level = "info"
//!
//! [network]
//! port = 9999
//! bind_address = "0.0.0.0"
//! heartbeat_timeout_secs = 15
//! max_participants = 50
//!
//! [presence]
//! group = "239.255.255.250"
//! port = 10000
//!
//! [fanout]
//! group = "239.255.1.1"
//! port = 5005
//! ttl = 32
//! ```
//!
//! Every field has a `#[serde(default = "...")]` fallback, so a missing file
//! or a file with only some keys still yields a complete configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use classlink_core::transport::{EndpointConfig, FanoutConfig, PresenceConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::infrastructure::network::ServerConfig;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level presenter configuration stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PresenterFileConfig {
    #[serde(default)]
    pub presenter: PresenterSection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub presence: PresenceSection,
    #[serde(default)]
    pub fanout: FanoutSection,
}

/// Who this presenter is.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresenterSection {
    /// Name shown to participants in the presenter list.
    #[serde(default = "default_name")]
    pub name: String,
    /// Classroom channel number announced with the name.
    #[serde(default = "default_channel")]
    pub channel: u32,
    /// `tracing` log level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Session listener and liveness settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkSection {
    #[serde(default = "default_port")]
    pub port: u16,
    /// `"0.0.0.0"` binds all interfaces.
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    #[serde(default = "default_heartbeat_check_secs")]
    pub heartbeat_check_secs: u64,
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
    #[serde(default = "default_registration_timeout_secs")]
    pub registration_timeout_secs: u64,
    #[serde(default = "default_max_participants")]
    pub max_participants: usize,
}

/// Presence announcement settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresenceSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_presence_group")]
    pub group: Ipv4Addr,
    #[serde(default = "default_presence_port")]
    pub port: u16,
    #[serde(default = "default_broadcast")]
    pub broadcast: Ipv4Addr,
    #[serde(default = "default_presence_ttl")]
    pub ttl: u32,
    #[serde(default = "default_announce_interval_secs")]
    pub announce_interval_secs: u64,
}

/// Fan-out media channel settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FanoutSection {
    #[serde(default = "default_fanout_group")]
    pub group: Ipv4Addr,
    #[serde(default = "default_fanout_port")]
    pub port: u16,
    #[serde(default = "default_fanout_ttl")]
    pub ttl: u32,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_name() -> String {
    "Presenter".to_string()
}
fn default_channel() -> u32 {
    1
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_port() -> u16 {
    9999
}
fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_heartbeat_check_secs() -> u64 {
    3
}
fn default_heartbeat_timeout_secs() -> u64 {
    15
}
fn default_registration_timeout_secs() -> u64 {
    10
}
fn default_max_participants() -> usize {
    50
}
fn default_presence_group() -> Ipv4Addr {
    PresenceConfig::default().group
}
fn default_presence_port() -> u16 {
    PresenceConfig::default().port
}
fn default_broadcast() -> Ipv4Addr {
    PresenceConfig::default().broadcast
}
fn default_presence_ttl() -> u32 {
    PresenceConfig::default().ttl
}
fn default_announce_interval_secs() -> u64 {
    PresenceConfig::default().announce_interval.as_secs()
}
fn default_fanout_group() -> Ipv4Addr {
    FanoutConfig::default().group
}
fn default_fanout_port() -> u16 {
    FanoutConfig::default().port
}
fn default_fanout_ttl() -> u32 {
    FanoutConfig::default().ttl
}

impl Default for PresenterSection {
    fn default() -> Self {
        Self {
            name: default_name(),
            channel: default_channel(),
            log_level: default_log_level(),
        }
    }
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: default_bind_address(),
            heartbeat_check_secs: default_heartbeat_check_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            registration_timeout_secs: default_registration_timeout_secs(),
            max_participants: default_max_participants(),
        }
    }
}

impl Default for PresenceSection {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            group: default_presence_group(),
            port: default_presence_port(),
            broadcast: default_broadcast(),
            ttl: default_presence_ttl(),
            announce_interval_secs: default_announce_interval_secs(),
        }
    }
}

impl Default for FanoutSection {
    fn default() -> Self {
        Self {
            group: default_fanout_group(),
            port: default_fanout_port(),
            ttl: default_fanout_ttl(),
        }
    }
}

// ── Conversion to runtime settings ────────────────────────────────────────────

impl PresenterFileConfig {
    /// Builds the session server settings.
    pub fn server_config(&self) -> ServerConfig {
        let heartbeat_check = Duration::from_secs(self.network.heartbeat_check_secs.max(1));
        ServerConfig {
            bind_addr: SocketAddr::new(self.network.bind_address, self.network.port),
            presenter_name: self.presenter.name.clone(),
            channel: self.presenter.channel,
            heartbeat_check_interval: heartbeat_check,
            heartbeat_timeout: Duration::from_secs(self.network.heartbeat_timeout_secs),
            stale_after: heartbeat_check * 2,
            registration_timeout: Duration::from_secs(self.network.registration_timeout_secs),
            max_participants: self.network.max_participants,
            announce_presence: self.presence.enabled,
            endpoint: EndpointConfig::default(),
            presence: self.presence_config(),
            ..ServerConfig::default()
        }
    }

    pub fn presence_config(&self) -> PresenceConfig {
        PresenceConfig {
            group: self.presence.group,
            port: self.presence.port,
            broadcast: self.presence.broadcast,
            ttl: self.presence.ttl,
            announce_interval: Duration::from_secs(self.presence.announce_interval_secs.max(1)),
            ..PresenceConfig::default()
        }
    }

    pub fn fanout_config(&self) -> FanoutConfig {
        FanoutConfig {
            group: self.fanout.group,
            port: self.fanout.port,
            ttl: self.fanout.ttl,
            ..FanoutConfig::default()
        }
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Resolves the default path of the presenter config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform config base
/// directory cannot be determined from the environment.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    platform_config_dir()
        .map(|dir| dir.join("presenter.toml"))
        .ok_or(ConfigError::NoPlatformConfigDir)
}

/// Loads the config from `path`, or from [`config_file_path`] when `None`.
/// A missing file yields the defaults.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: Option<&Path>) -> Result<PresenterFileConfig, ConfigError> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => config_file_path()?,
    };

    match std::fs::read_to_string(&path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PresenterFileConfig::default()),
        Err(e) => Err(ConfigError::Io { path, source: e }),
    }
}

/// Writes `config` to `path`, creating the directory if needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(config: &PresenterFileConfig, path: &Path) -> Result<(), ConfigError> {
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

// ── Tests ─────────────────────────────────────────────────────────────────────
