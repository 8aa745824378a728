//! Capabilities exchanged during negotiation.
//!
//! Both peers advertise what they support; the session runs with the
//! intersection, which is immutable for the rest of the session.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::ConnectError;
use crate::packet::MAX_PAYLOAD_SIZE;

/// Wire protocol version spoken by this build.
pub const PROTOCOL_VERSION: u16 = 1;

// ── Codec ────────────────────────────────────────────────────────

/// Display codecs a peer may decode. The payloads themselves are opaque
/// to this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Codec {
    Raw,
    Jpeg,
    H264,
    Hevc,
    Av1,
}

// ── InputKinds ───────────────────────────────────────────────────

bitflags! {
    /// Input event classes a host accepts.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct InputKinds: u8 {
        const KEYBOARD = 0b001;
        const POINTER  = 0b010;
        const SCROLL   = 0b100;
    }
}

// ── Capabilities ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Supported codecs in order of preference.
    pub codecs: Vec<Codec>,
    /// Accepted input classes.
    pub input: InputKinds,
    /// Clipboard synchronisation.
    pub clipboard: bool,
    /// USB / device redirection.
    pub device_redirection: bool,
    /// zstd compression of frame payloads.
    pub compression: bool,
    /// Maximum payload size the peer will accept.
    pub max_payload_size: u64,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            codecs: vec![Codec::H264, Codec::Jpeg, Codec::Raw],
            input: InputKinds::all(),
            clipboard: true,
            device_redirection: true,
            compression: true,
            max_payload_size: MAX_PAYLOAD_SIZE as u64,
        }
    }
}

impl Capabilities {
    /// Intersect with the remote peer's capabilities.
    ///
    /// Codec order follows the local preference. Fails with
    /// `ProtocolMismatch` when no codec is common to both sides.
    pub fn negotiate(&self, remote: &Self) -> Result<Self, ConnectError> {
        let codecs: Vec<Codec> = self
            .codecs
            .iter()
            .copied()
            .filter(|c| remote.codecs.contains(c))
            .collect();

        if codecs.is_empty() {
            return Err(ConnectError::ProtocolMismatch(format!(
                "no common codec: local {:?}, remote {:?}",
                self.codecs, remote.codecs
            )));
        }

        Ok(Self {
            codecs,
            input: self.input & remote.input,
            clipboard: self.clipboard && remote.clipboard,
            device_redirection: self.device_redirection && remote.device_redirection,
            compression: self.compression && remote.compression,
            max_payload_size: self.max_payload_size.min(remote.max_payload_size),
        })
    }

    /// Whether every feature in `self` is also present in `offer`.
    pub fn is_within(&self, offer: &Self) -> bool {
        self.codecs.iter().all(|c| offer.codecs.contains(c))
            && offer.input.contains(self.input)
            && (!self.clipboard || offer.clipboard)
            && (!self.device_redirection || offer.device_redirection)
            && (!self.compression || offer.compression)
            && self.max_payload_size <= offer.max_payload_size
    }

    /// The codec used when streaming starts.
    pub fn preferred_codec(&self) -> Option<Codec> {
        self.codecs.first().copied()
    }
}
