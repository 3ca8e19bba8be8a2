//! TOML configuration for the host daemon.
//!
//! Example:
//!
//! ```toml
//! [engine]
//! poll_interval_secs = 5
//! command_timeout_secs = 20
//! late_reply_grace_ms = 2000
//! reconnect_initial_ms = 1000
//! reconnect_max_ms = 30000
//! log_capacity = 50
//!
//! [logging]
//! level = "info"
//!
//! [[controllers]]
//! id = "ctrl_bench"
//! name = "Bench"
//! port = "/dev/ttyUSB0"
//! polling_enabled = true
//! has_can_interface = true
//! ```
//!
//! Every field has a serde default, so an empty file (or no file at all)
//! yields a working configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use ledlink_core::{ControllerInput, FrameLog, DEFAULT_BAUDRATE};

use crate::application::session::SessionConfig;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
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

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Controllers seeded into the registry at start-up.
    #[serde(default)]
    pub controllers: Vec<ControllerEntry>,
}

/// Session timing and buffer sizes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    /// How long the slot stays closed after a timeout, waiting for the late
    /// reply of the timed-out command.
    #[serde(default = "default_late_reply_grace_ms")]
    pub late_reply_grace_ms: u64,
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    /// Frames retained per controller for the diagnostics readout.
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// `tracing` level used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// One `[[controllers]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControllerEntry {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
    #[serde(default)]
    pub polling_enabled: bool,
    #[serde(default)]
    pub has_can_interface: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_sender_id: Option<u32>,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_poll_interval_secs() -> u64 {
    5
}
fn default_command_timeout_secs() -> u64 {
    20
}
fn default_late_reply_grace_ms() -> u64 {
    2_000
}
fn default_reconnect_initial_ms() -> u64 {
    1_000
}
fn default_reconnect_max_ms() -> u64 {
    30_000
}
fn default_log_capacity() -> usize {
    ledlink_core::protocol::log::DEFAULT_LOG_CAPACITY
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_baudrate() -> u32 {
    DEFAULT_BAUDRATE
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            command_timeout_secs: default_command_timeout_secs(),
            late_reply_grace_ms: default_late_reply_grace_ms(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            log_capacity: default_log_capacity(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl EngineConfig {
    /// Session timings derived from this section.  Zero intervals are raised
    /// to the smallest usable value.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs.max(1)),
            command_timeout: Duration::from_secs(self.command_timeout_secs.max(1)),
            late_reply_grace: Duration::from_millis(self.late_reply_grace_ms),
            reconnect_initial: Duration::from_millis(self.reconnect_initial_ms.max(1)),
            reconnect_max: Duration::from_millis(self.reconnect_max_ms.max(self.reconnect_initial_ms).max(1)),
            log_capacity: FrameLog::new(self.log_capacity).capacity(),
        }
    }
}

impl From<&ControllerEntry> for ControllerInput {
    fn from(entry: &ControllerEntry) -> Self {
        ControllerInput {
            id: Some(entry.id.clone()),
            name: entry.name.clone(),
            port: entry.port.clone(),
            baudrate: Some(entry.baudrate),
            has_can_interface: Some(entry.has_can_interface),
            polling_enabled: Some(entry.polling_enabled),
            can_sender_id: entry.can_sender_id,
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

/// Loads `AppConfig` from `path`, returning `AppConfig::default()` if the file
/// does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Renders `config` as TOML, for `--print-config`.
///
/// # Errors
///
/// Returns [`ConfigError::Serialize`] if serialization fails.
pub fn render_config(config: &AppConfig) -> Result<String, ConfigError> {
    Ok(toml::to_string_pretty(config)?)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_defaults_match_controller_timings() {
        // Arrange / Act
        let cfg = AppConfig::default();

        // Assert
        assert_eq!(cfg.engine.poll_interval_secs, 5);
        assert_eq!(cfg.engine.command_timeout_secs, 20);
        assert_eq!(cfg.engine.reconnect_initial_ms, 1_000);
        assert_eq!(cfg.engine.reconnect_max_ms, 30_000);
        assert_eq!(cfg.engine.log_capacity, 50);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn test_empty_file_yields_defaults() {
        let cfg: AppConfig = toml::from_str("").expect("parse");
        assert_eq!(cfg, AppConfig::default());
    }

    #[test]
    fn test_controller_entries_parse_with_defaults() {
        // Arrange
        let text = r#"
            [engine]
            poll_interval_secs = 2

            [[controllers]]
            id = "a"
            port = "/dev/ttyUSB0"
            has_can_interface = true
        "#;

        // Act
        let cfg: AppConfig = toml::from_str(text).expect("parse");

        // Assert
        assert_eq!(cfg.engine.poll_interval_secs, 2);
        assert_eq!(cfg.engine.command_timeout_secs, 20);
        let entry = &cfg.controllers[0];
        assert_eq!(entry.baudrate, 115_200);
        assert!(!entry.polling_enabled);
        let input = ControllerInput::from(entry);
        assert_eq!(input.has_can_interface, Some(true));
        assert_eq!(input.port.as_deref(), Some("/dev/ttyUSB0"));
    }

    #[test]
    fn test_session_config_raises_zero_values() {
        let engine = EngineConfig {
            poll_interval_secs: 0,
            command_timeout_secs: 0,
            late_reply_grace_ms: 0,
            reconnect_initial_ms: 500,
            reconnect_max_ms: 100,
            log_capacity: 0,
        };
        let session = engine.session_config();
        assert_eq!(session.poll_interval, Duration::from_secs(1));
        assert_eq!(session.reconnect_max, Duration::from_millis(500));
        assert_eq!(session.log_capacity, 1);
    }

    #[test]
    fn test_missing_file_returns_default() {
        let path = std::env::temp_dir().join("ledlink-host-config-that-does-not-exist.toml");
        let cfg = load_config(&path).expect("defaults");
        assert_eq!(cfg, AppConfig::default());
    }

    #[test]
    fn test_render_config_parses_back() {
        let mut cfg = AppConfig::default();
        cfg.controllers.push(ControllerEntry {
            id: "x".into(),
            name: None,
            port: None,
            baudrate: 9_600,
            polling_enabled: true,
            has_can_interface: false,
            can_sender_id: None,
        });
        let text = render_config(&cfg).expect("render");
        let parsed: AppConfig = toml::from_str(&text).expect("parse");
        assert_eq!(parsed, cfg);
    }
}
