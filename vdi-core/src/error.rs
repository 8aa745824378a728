//! Domain-specific error types for the VDI session core.
//!
//! Fallible operations return `Result<T, VdiError>`. Errors that must be
//! observed by several parties (the caller waiting on a connect, the UI
//! inspecting a failed session) are `Clone` so they can be published
//! through `watch` channels.

use std::time::Duration;
use thiserror::Error;

use crate::state::SessionState;

// ── ConnectError ─────────────────────────────────────────────────

/// Failure to establish (or re-establish) a session with a remote host.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    /// The transport or the negotiation did not complete in time.
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),

    /// The host refused the connection, or the resource could not be
    /// resolved to an address.
    #[error("connection refused: {0}")]
    Refused(String),

    /// The TLS handshake failed.
    #[error("tls handshake failed: {0}")]
    TlsFailure(String),

    /// The peers could not agree on a protocol version or feature set.
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),
}

// ── ChannelError ─────────────────────────────────────────────────

/// Failure on an already-open transport channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// The channel has been closed, locally or by the peer.
    #[error("channel closed")]
    Closed,

    /// Writing to the underlying socket failed.
    #[error("write failed: {0}")]
    WriteFailed(String),
}

// ── SessionFailure ───────────────────────────────────────────────

/// Reason a session reached `Failed`, kept on the session for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionFailure {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Every reconnection attempt failed.
    #[error("reconnect gave up after {attempts} attempts: {last}")]
    ReconnectExhausted { attempts: u32, last: String },
}

// ── VdiError ─────────────────────────────────────────────────────

/// The canonical error type for the VDI core.
#[derive(Debug, Error)]
pub enum VdiError {
    // ── Session Errors ───────────────────────────────────────────
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Session(#[from] SessionFailure),

    /// An active session already exists for this resource.
    #[error("resource {resource_id} already has an active session")]
    AlreadyConnected { resource_id: String },

    /// The requested option needs peer acknowledgment, which is only
    /// possible while streaming.
    #[error("option requires renegotiation; session is {state}")]
    RequiresRenegotiation { state: SessionState },

    /// No session with this id is known to the manager.
    #[error("unknown session {0}")]
    UnknownSession(String),

    /// The state machine rejected an event in its current state.
    #[error("invalid transition: {event} while {from}")]
    InvalidTransition {
        from: SessionState,
        event: &'static str,
    },

    /// A reconfiguration option failed local validation.
    #[error("invalid option: {0}")]
    InvalidOption(String),

    /// The peer declined a reconfiguration request.
    #[error("peer rejected reconfiguration")]
    ReconfigureRejected,

    // ── Protocol Errors ──────────────────────────────────────────
    /// Received bytes that do not start with the VDI magic sequence.
    #[error("invalid magic bytes: expected VDI1")]
    InvalidMagic,

    /// The packet payload failed checksum verification.
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// A numeric value did not map to any known enum variant.
    #[error("unknown {type_name} discriminant: {value:#x}")]
    UnknownVariant { type_name: &'static str, value: u64 },

    /// The payload exceeds the configured maximum size.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    // ── I/O and Encoding ─────────────────────────────────────────
    /// The socket layer reported an error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding or decoding of a payload failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),
}

// ── Convenient From implementations ──────────────────────────────

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for ChannelError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        ChannelError::Closed
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for VdiError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        VdiError::Channel(ChannelError::Closed)
    }
}

impl From<Box<bincode::ErrorKind>> for VdiError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        VdiError::Encoding(e.to_string())
    }
}
