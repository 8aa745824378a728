//! Configuration for the host peer.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vdi_core::{Capabilities, Codec, HostConfig};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostFileConfig {
    /// Network settings.
    pub network: NetworkConfig,
    /// Offered capabilities.
    pub capabilities: CapabilityConfig,
    /// Synthetic display stream.
    pub frames: FrameConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to listen on.
    pub listen_address: String,
    /// Token clients must present. Empty accepts any token.
    pub token: String,
    /// Time allowed for a client to complete the handshake.
    pub handshake_timeout_ms: u64,
    /// Upper bound on draining writes when a connection closes.
    pub close_timeout_ms: u64,
}

/// Capabilities offered in `Welcome`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityConfig {
    pub codecs: Vec<Codec>,
    pub clipboard: bool,
    pub device_redirection: bool,
    pub compression: bool,
}

/// Synthetic display updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    /// Target updates per second. 0 disables the stream.
    pub fps: u8,
    /// Payload bytes per update.
    pub size: usize,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Optional log file path. If empty, logs to stderr.
    pub file: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for HostFileConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            capabilities: CapabilityConfig::default(),
            frames: FrameConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:7400".into(),
            token: String::new(),
            handshake_timeout_ms: 10_000,
            close_timeout_ms: 3_000,
        }
    }
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        let caps = Capabilities::default();
        Self {
            codecs: caps.codecs,
            clipboard: caps.clipboard,
            device_redirection: caps.device_redirection,
            compression: caps.compression,
        }
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self { fps: 30, size: 1024 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            file: String::new(),
        }
    }
}

impl LoggingConfig {
    /// Open `file` for appending, creating it if missing. `None` when no
    /// file is configured.
    pub fn open_file(&self) -> std::io::Result<Option<std::fs::File>> {
        if self.file.is_empty() {
            return Ok(None);
        }
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file)
            .map(Some)
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl HostFileConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    /// Convert into the core `HostConfig`.
    pub fn to_host_config(&self) -> HostConfig {
        let c = &self.capabilities;
        let mut capabilities = Capabilities {
            clipboard: c.clipboard,
            device_redirection: c.device_redirection,
            compression: c.compression,
            ..Capabilities::default()
        };
        if !c.codecs.is_empty() {
            capabilities.codecs = c.codecs.clone();
        }

        let frame_interval = match self.frames.fps.min(120) {
            0 => None,
            fps => Some(Duration::from_secs(1) / u32::from(fps)),
        };

        HostConfig {
            capabilities,
            frame_interval,
            frame_size: self.frames.size.clamp(1, 1 << 20),
            expected_token: (!self.network.token.is_empty()).then(|| self.network.token.clone()),
            handshake_timeout: Duration::from_millis(self.network.handshake_timeout_ms.max(1)),
            close_timeout: Duration::from_millis(self.network.close_timeout_ms),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
