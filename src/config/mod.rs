//! Configuration for both roles, loaded from a TOML file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::protocol::framing::MAX_PAYLOAD;
use crate::screen::{EncodeSettings, DEFAULT_JPEG_QUALITY, DEFAULT_MAX_WIDTH};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub viewer: ViewerConfig,
    pub logging: LoggingConfig,
}

/// Capture server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// WebSocket control listener.
    pub control_addr: String,
    /// UDP socket frames are sent from.
    pub data_addr: String,
    /// Target frames per second (1-120).
    pub fps: u32,
    /// Display to capture: 0 = primary, n = n-th display.
    pub monitor: usize,
    /// JPEG quality (1-100).
    pub jpeg_quality: u8,
    /// Frames wider than this are downscaled.
    pub max_width: u32,
    /// Compressed frame ceiling in bytes (clamped to one UDP datagram).
    pub max_payload: usize,
    /// How long a tick waits for the display to produce a frame.
    pub capture_timeout_ms: u64,
    /// Stop streaming when the registering viewer's control connection closes.
    pub clear_on_disconnect: bool,
}

/// Viewer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    /// Server host for the control connection.
    pub server_host: String,
    /// Server WebSocket control port.
    pub control_port: u16,
    /// Local UDP address frames are received on. Port 0 picks a free port.
    pub listen_addr: String,
    /// Write the latest frame here (JPEG), at most once per second.
    pub snapshot: Option<PathBuf>,
    /// Read commands from stdin, one per line.
    pub stdin_commands: bool,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or filter directive; `RUST_LOG` takes precedence.
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            control_addr: "0.0.0.0:8765".into(),
            data_addr: "0.0.0.0:9999".into(),
            fps: 30,
            monitor: 0,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            max_width: DEFAULT_MAX_WIDTH,
            max_payload: MAX_PAYLOAD,
            capture_timeout_ms: 100,
            clear_on_disconnect: true,
        }
    }
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            server_host: "127.0.0.1".into(),
            control_port: 8765,
            listen_addr: "0.0.0.0:10000".into(),
            snapshot: None,
            stdin_commands: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl Config {
    /// Load configuration from a TOML file. A missing file means defaults;
    /// an unreadable or invalid one is an error for the caller to report.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

impl ServerConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps.clamp(1, 120) as f64)
    }

    pub fn encode_settings(&self) -> EncodeSettings {
        EncodeSettings {
            monitor: self.monitor,
            max_width: self.max_width,
            quality: self.jpeg_quality.clamp(1, 100),
            max_payload: self.max_payload.min(MAX_PAYLOAD),
            capture_timeout: Duration::from_millis(self.capture_timeout_ms),
        }
    }
}

impl ViewerConfig {
    pub fn control_url(&self) -> String {
        if self.server_host.contains(':') && !self.server_host.starts_with('[') {
            format!("ws://[{}]:{}", self.server_host, self.control_port)
        } else {
            format!("ws://{}:{}", self.server_host, self.control_port)
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
