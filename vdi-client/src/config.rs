//! Client configuration.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vdi_core::{
    Capabilities, Codec, ConnectError, Connector, ReconnectPolicy, SessionConfig, StaticResolver,
    TcpConnector, TlsConnector,
};

/// Top-level configuration for the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Resource name to `host:port`.
    pub resources: BTreeMap<String, String>,
    /// Which resource to open and how.
    pub connection: ConnectionConfig,
    /// Session timings.
    pub session: SessionTuning,
    /// Preferences sent to and kept for the session.
    pub display: DisplayConfig,
    /// Logging.
    pub logging: LoggingConfig,
}

/// Connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Key into `resources`.
    pub resource: String,
    /// Opaque token presented to the host.
    pub token: String,
    /// Connect over TLS.
    pub tls: bool,
    /// DER certificate to trust exclusively. Required when `tls` is set.
    pub pinned_cert: String,
    /// Name to verify the certificate against. Empty uses the address host.
    pub server_name: String,
}

/// Session timings, all in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionTuning {
    pub connect_timeout_ms: u64,
    pub negotiation_timeout_ms: u64,
    pub close_timeout_ms: u64,
    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
    /// Consecutive lost probes before the link is considered down.
    pub probe_failure_limit: u32,
    /// Pointer-move coalescing window.
    pub input_tick_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_cap_ms: u64,
    pub reconnect_attempts: u32,
}

/// Display and input preferences.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Codecs in order of preference.
    pub codecs: Vec<Codec>,
    pub clipboard: bool,
    pub device_redirection: bool,
    pub compression: bool,
    pub keyboard_layout: String,
    /// 0..=100.
    pub pointer_sensitivity: u8,
}

/// Logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level.
    pub level: String,
    /// Optional log file.
    pub file: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for ClientConfig {
    fn default() -> Self {
        let mut resources = BTreeMap::new();
        resources.insert("desktop".to_string(), "127.0.0.1:7400".to_string());
        Self {
            resources,
            connection: ConnectionConfig::default(),
            session: SessionTuning::default(),
            display: DisplayConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            resource: "desktop".into(),
            token: String::new(),
            tls: false,
            pinned_cert: String::new(),
            server_name: String::new(),
        }
    }
}

impl Default for SessionTuning {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            negotiation_timeout_ms: 10_000,
            close_timeout_ms: 3_000,
            probe_interval_ms: 1_000,
            probe_timeout_ms: 2_000,
            probe_failure_limit: 3,
            input_tick_ms: 16,
            reconnect_base_ms: 500,
            reconnect_cap_ms: 8_000,
            reconnect_attempts: 5,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        let caps = Capabilities::default();
        Self {
            codecs: caps.codecs,
            clipboard: caps.clipboard,
            device_redirection: caps.device_redirection,
            compression: caps.compression,
            keyboard_layout: "en-US".into(),
            pointer_sensitivity: 50,
        }
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

impl ClientConfig {
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

    /// Session settings with out-of-range values clamped.
    pub fn to_session_config(&self) -> SessionConfig {
        let s = &self.session;
        let d = &self.display;
        let base = Duration::from_millis(s.reconnect_base_ms.max(1));

        let mut capabilities = Capabilities {
            clipboard: d.clipboard,
            device_redirection: d.device_redirection,
            compression: d.compression,
            ..Capabilities::default()
        };
        if !d.codecs.is_empty() {
            capabilities.codecs = d.codecs.clone();
        }

        SessionConfig {
            connect_timeout: Duration::from_millis(s.connect_timeout_ms.max(1)),
            negotiation_timeout: Duration::from_millis(s.negotiation_timeout_ms.max(1)),
            close_timeout: Duration::from_millis(s.close_timeout_ms),
            probe_interval: Duration::from_millis(s.probe_interval_ms.max(10)),
            probe_timeout: Duration::from_millis(s.probe_timeout_ms.max(10)),
            probe_failure_limit: s.probe_failure_limit.max(1),
            input_tick: Duration::from_millis(s.input_tick_ms.max(1)),
            reconnect: ReconnectPolicy {
                base,
                cap: Duration::from_millis(s.reconnect_cap_ms).max(base),
                max_attempts: s.reconnect_attempts.max(1),
            },
            capabilities,
            keyboard_layout: d.keyboard_layout.clone(),
            pointer_sensitivity: d.pointer_sensitivity.min(100),
            ..SessionConfig::default()
        }
    }

    /// Resolver over the `resources` table.
    pub fn resolver(&self) -> StaticResolver {
        self.resources
            .iter()
            .map(|(name, addr)| (name.as_str(), addr.as_str()))
            .collect()
    }

    /// Plain TCP, or TLS trusting only the pinned certificate.
    pub fn connector(&self) -> Result<Arc<dyn Connector>, ConnectError> {
        let c = &self.connection;
        if !c.tls {
            return Ok(Arc::new(TcpConnector));
        }
        if c.pinned_cert.is_empty() {
            return Err(ConnectError::TlsFailure(
                "tls enabled but no pinned_cert configured".into(),
            ));
        }
        let der = std::fs::read(&c.pinned_cert).map_err(|e| {
            ConnectError::TlsFailure(format!("cannot read {}: {e}", c.pinned_cert))
        })?;
        let mut tls = TlsConnector::pinned(rustls::pki_types::CertificateDer::from(der))?;
        if !c.server_name.is_empty() {
            tls = tls.with_server_name(c.server_name.as_str());
        }
        Ok(Arc::new(tls))
    }
}

// ── Tests ────────────────────────────────────────────────────────
