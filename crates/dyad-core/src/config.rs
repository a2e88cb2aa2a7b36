//! Configuration system for Dyad.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $DYAD_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/dyad/config.toml
//!   3. ~/.config/dyad/config.toml

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::wire::{validate_condition, PeerRole, WireError, DEFAULT_CONDITION};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DyadConfig {
    pub session: SessionConfig,
    pub network: NetworkConfig,
    pub timing: TimingConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Which side this station plays.
    pub role: PeerRole,
    /// Trials the initiator runs before sending end_experiment.
    pub total_trials: u32,
    /// 64-cell condition arrays the initiator draws from.
    pub conditions: Vec<Vec<u8>>,
    /// JSON file whose `top_layouts_array_fixed_64` replaces `conditions`.
    /// Relative paths are resolved against the config file's directory.
    pub conditions_file: Option<PathBuf>,
    /// Seed of the first trial. Absent = random per session.
    pub base_seed: Option<u64>,
    /// Screen size used for the logged spatial layout.
    pub screen_width: u32,
    pub screen_height: u32,
    /// Where local gaze comes from when no tracker is attached.
    pub gaze_source: GazeSourceKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GazeSourceKind {
    /// Generated motion around the screen centre.
    Synthetic,
    /// No local gaze at all.
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind both channels to. Falls back to the wildcard address
    /// if this one is not available.
    pub local_addr: IpAddr,
    /// The other station.
    pub remote_addr: IpAddr,
    /// Control channel port this station binds.
    pub control_port: u16,
    /// Control port of the other station. 0 = same as `control_port`.
    pub control_remote_port: u16,
    /// Port this station receives gaze samples on.
    pub gaze_listen_port: u16,
    /// Port the other station receives gaze samples on.
    pub gaze_remote_port: u16,
    /// SO_SNDBUF / SO_RCVBUF for the control socket. 0 = OS default.
    pub socket_buffer_bytes: usize,
}

/// All durations in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// How long to wait for the other station to join.
    pub session_start_timeout_ms: u64,
    /// Follower: longest gap between consecutive stage messages.
    pub stage_timeout_ms: u64,
    /// Initiator: how long to wait for each stage_sync_ack.
    pub ack_timeout_ms: u64,
    pub grid_display_ms: u64,
    /// Initiator: how long to wait for both answers before scoring anyway.
    pub response_timeout_ms: u64,
    pub feedback_ms: u64,
    /// Foreground loop period.
    pub frame_interval_ms: u64,
    /// Receive timeout of both background loops.
    pub recv_timeout_ms: u64,
    pub send_attempts: u32,
    pub retry_backoff_ms: u64,
    /// Remote gaze older than this is shown as delayed.
    pub stale_after_ms: u64,
    /// How long close() waits for a receive loop before aborting it.
    pub close_join_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory trial logs are written to at session end.
    pub log_dir: PathBuf,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for DyadConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            network: NetworkConfig::default(),
            timing: TimingConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            role: PeerRole::Follower,
            total_trials: 5,
            conditions: vec![DEFAULT_CONDITION.to_vec()],
            conditions_file: None,
            base_seed: None,
            screen_width: 1920,
            screen_height: 1080,
            gaze_source: GazeSourceKind::Synthetic,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            local_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            remote_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            control_port: 5555,
            control_remote_port: 0,
            gaze_listen_port: 8889,
            gaze_remote_port: 8888,
            socket_buffer_bytes: 65536,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            session_start_timeout_ms: 60_000,
            stage_timeout_ms: 30_000,
            ack_timeout_ms: 5_000,
            grid_display_ms: 7_000,
            response_timeout_ms: 15_000,
            feedback_ms: 1_000,
            frame_interval_ms: 16,
            recv_timeout_ms: 100,
            send_attempts: 3,
            retry_backoff_ms: 100,
            stale_after_ms: 100,
            close_join_ms: 1_000,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            log_dir: data_dir().join("trials"),
        }
    }
}

impl NetworkConfig {
    pub fn control_local(&self) -> SocketAddr {
        SocketAddr::new(self.local_addr, self.control_port)
    }

    pub fn control_remote(&self) -> SocketAddr {
        let port = match self.control_remote_port {
            0 => self.control_port,
            p => p,
        };
        SocketAddr::new(self.remote_addr, port)
    }

    pub fn gaze_local(&self) -> SocketAddr {
        SocketAddr::new(self.local_addr, self.gaze_listen_port)
    }

    pub fn gaze_remote(&self) -> SocketAddr {
        SocketAddr::new(self.remote_addr, self.gaze_remote_port)
    }
}

impl TimingConfig {
    pub fn session_start_timeout(&self) -> Duration {
        Duration::from_millis(self.session_start_timeout_ms)
    }
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_timeout_ms)
    }
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
    pub fn grid_display(&self) -> Duration {
        Duration::from_millis(self.grid_display_ms)
    }
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
    pub fn feedback(&self) -> Duration {
        Duration::from_millis(self.feedback_ms)
    }
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms.max(1))
    }
    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms.max(1))
    }
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }
    pub fn close_join(&self) -> Duration {
        Duration::from_millis(self.close_join_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("dyad")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("dyad")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Conditions file ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ConditionsFile {
    top_layouts_array_fixed_64: Vec<Vec<u8>>,
}

/// Read the condition arrays out of a conditions JSON file. Other keys in
/// the file are ignored.
pub fn load_conditions_file(path: &Path) -> Result<Vec<Vec<u8>>, ConfigError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
    let file: ConditionsFile = serde_json::from_str(&text)
        .map_err(|e| ConfigError::ConditionsParseFailed(path.to_path_buf(), e))?;
    Ok(file.top_layouts_array_fixed_64)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid condition #{0}: {1}")]
    BadCondition(usize, WireError),
    #[error("failed to parse conditions file {0}: {1}")]
    ConditionsParseFailed(PathBuf, serde_json::Error),
    #[error("{0}")]
    Invalid(&'static str),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl DyadConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::file_path())
    }

    /// Load from `path`. Only a missing file means defaults; a file that
    /// cannot be read, parsed or validated is an error.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?
        } else {
            DyadConfig::default()
        };
        config.apply_env_overrides();
        if let Some(file) = &config.session.conditions_file {
            let file = match path.parent() {
                Some(dir) if file.is_relative() => dir.join(file),
                _ => file.clone(),
            };
            config.session.conditions = load_conditions_file(&file)?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("DYAD_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&DyadConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text)
                .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Reject configs the session could not run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.total_trials == 0 {
            return Err(ConfigError::Invalid("session.total_trials must be > 0"));
        }
        if self.session.conditions.is_empty() {
            return Err(ConfigError::Invalid("session.conditions must not be empty"));
        }
        for (i, condition) in self.session.conditions.iter().enumerate() {
            validate_condition(condition).map_err(|e| ConfigError::BadCondition(i, e))?;
        }
        let n = &self.network;
        if n.gaze_listen_port == n.control_port || n.gaze_remote_port == n.control_port {
            return Err(ConfigError::Invalid(
                "gaze ports must differ from network.control_port",
            ));
        }
        Ok(())
    }

    /// Apply DYAD_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("DYAD_SESSION__ROLE") {
            if let Ok(role) = v.parse() {
                self.session.role = role;
            }
        }
        if let Ok(v) = std::env::var("DYAD_SESSION__TOTAL_TRIALS") {
            if let Ok(n) = v.parse() {
                self.session.total_trials = n;
            }
        }
        if let Ok(v) = std::env::var("DYAD_NETWORK__LOCAL_ADDR") {
            if let Ok(a) = v.parse() {
                self.network.local_addr = a;
            }
        }
        if let Ok(v) = std::env::var("DYAD_NETWORK__REMOTE_ADDR") {
            if let Ok(a) = v.parse() {
                self.network.remote_addr = a;
            }
        }
        if let Ok(v) = std::env::var("DYAD_NETWORK__CONTROL_PORT") {
            if let Ok(p) = v.parse() {
                self.network.control_port = p;
            }
        }
        if let Ok(v) = std::env::var("DYAD_OUTPUT__LOG_DIR") {
            self.output.log_dir = PathBuf::from(v);
        }
    }
}
