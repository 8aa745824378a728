//! Message kinds carried in the packet header.
//!
//! Uses a proper enum with `TryFrom`; no panics on unknown values. The
//! header keeps the raw byte so that the demultiplexer can drop unknown
//! kinds instead of failing the whole stream.

use crate::error::VdiError;
use std::fmt;

/// Which logical stream a packet belongs to.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Session control: handshake, probes, reconfiguration, goodbye.
    Control = 0x1,
    /// Client → host input events.
    Input = 0x2,
    /// Host → client display updates.
    Frame = 0x3,
}

impl TryFrom<u8> for MessageKind {
    type Error = VdiError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x1 => Ok(MessageKind::Control),
            0x2 => Ok(MessageKind::Input),
            0x3 => Ok(MessageKind::Frame),
            _ => Err(VdiError::UnknownVariant {
                type_name: "MessageKind",
                value: value as u64,
            }),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
