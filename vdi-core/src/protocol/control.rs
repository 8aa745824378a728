//! Session control messages.

use serde::{Deserialize, Serialize};

use crate::error::VdiError;
use crate::message::MessageKind;
use crate::packet::Packet;
use crate::state::Capabilities;
use crate::state::capabilities::Codec;
use crate::types::{SessionId, SessionToken};

/// Remote display resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Resolution {
    /// Follow the local window size.
    #[default]
    MatchClient,
    Fixed { width: u32, height: u32 },
}

/// Settings change that the host has to acknowledge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ConfigChange {
    pub codec: Option<Codec>,
    pub resolution: Option<Resolution>,
    pub clipboard: Option<bool>,
    pub device_redirection: Option<bool>,
}

impl ConfigChange {
    pub fn is_empty(&self) -> bool {
        self.codec.is_none()
            && self.resolution.is_none()
            && self.clipboard.is_none()
            && self.device_redirection.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// First message from the client. `resume` carries the previously
    /// negotiated capabilities when re-attaching to an existing session.
    Hello {
        version: u16,
        token: SessionToken,
        capabilities: Capabilities,
        resume: Option<Capabilities>,
    },
    /// Host answer to a fresh `Hello`.
    Welcome { capabilities: Capabilities },
    /// Client confirms the negotiated intersection.
    Accept { capabilities: Capabilities },
    /// Host confirms `Accept`; streaming starts.
    Ready,
    /// Host accepted a resume `Hello`.
    Resumed,
    /// Host refused the handshake.
    Reject { reason: String },
    /// Round-trip probe.
    Probe { nonce: u64 },
    /// Echo of a probe.
    ProbeEcho { nonce: u64 },
    Reconfigure { request_id: u64, change: ConfigChange },
    ReconfigureAck { request_id: u64, accepted: bool },
    /// Graceful end of session.
    Goodbye,
}

impl ControlMessage {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "Hello",
            Self::Welcome { .. } => "Welcome",
            Self::Accept { .. } => "Accept",
            Self::Ready => "Ready",
            Self::Resumed => "Resumed",
            Self::Reject { .. } => "Reject",
            Self::Probe { .. } => "Probe",
            Self::ProbeEcho { .. } => "ProbeEcho",
            Self::Reconfigure { .. } => "Reconfigure",
            Self::ReconfigureAck { .. } => "ReconfigureAck",
            Self::Goodbye => "Goodbye",
        }
    }

    /// Serialize to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, VdiError> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, VdiError> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Build a control `Packet`.
    pub fn into_packet(&self, session_id: SessionId, sequence: u64) -> Result<Packet, VdiError> {
        Packet::new(MessageKind::Control, session_id, sequence, self.to_bytes()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_survives_the_wire() {
        let hello = ControlMessage::Hello {
            version: 1,
            token: SessionToken::new("opaque"),
            capabilities: Capabilities::default(),
            resume: None,
        };
        let id = SessionId::new();
        let pkt = hello.into_packet(id, 0).unwrap();
        assert_eq!(pkt.session_id(), id);
        assert_eq!(ControlMessage::from_bytes(pkt.payload()).unwrap(), hello);
    }

    #[test]
    fn garbage_fails_to_decode() {
        assert!(matches!(
            ControlMessage::from_bytes(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF]),
            Err(VdiError::Encoding(_))
        ));
    }

    #[test]
    fn empty_change() {
        assert!(ConfigChange::default().is_empty());
        let change = ConfigChange {
            clipboard: Some(false),
            ..Default::default()
        };
        assert!(!change.is_empty());
    }
}
