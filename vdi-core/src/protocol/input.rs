//! Input events relayed from the local client to the remote host.

use serde::{Deserialize, Serialize};

use crate::error::VdiError;
use crate::message::MessageKind;
use crate::packet::Packet;
use crate::state::capabilities::InputKinds;
use crate::types::SessionId;

/// Pointer buttons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PointerButton {
    Left,
    Right,
    Middle,
    X1,
    X2,
}

/// A local input event, independent of any OS representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputEvent {
    KeyPress { code: u32, modifiers: u8 },
    KeyRelease { code: u32, modifiers: u8 },
    /// Absolute pointer position in remote desktop coordinates.
    PointerMove { x: i32, y: i32 },
    PointerButton { button: PointerButton, pressed: bool },
    ScrollDelta { dx: i32, dy: i32 },
}

impl InputEvent {
    pub fn is_pointer_move(&self) -> bool {
        matches!(self, Self::PointerMove { .. })
    }

    /// The input class a host must accept for this event.
    pub fn required_kind(&self) -> InputKinds {
        match self {
            Self::KeyPress { .. } | Self::KeyRelease { .. } => InputKinds::KEYBOARD,
            Self::PointerMove { .. } | Self::PointerButton { .. } => InputKinds::POINTER,
            Self::ScrollDelta { .. } => InputKinds::SCROLL,
        }
    }
}

/// An input event stamped with its session and input sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputMessage {
    pub session_id: SessionId,
    pub sequence: u64,
    pub event: InputEvent,
}

impl InputMessage {
    /// Build an input `Packet`.
    pub fn into_packet(&self) -> Result<Packet, VdiError> {
        let payload = bincode::serialize(&self.event)?;
        Packet::new(MessageKind::Input, self.session_id, self.sequence, payload)
    }

    /// Parse an input `Packet`.
    pub fn from_packet(packet: &Packet) -> Result<Self, VdiError> {
        let event = bincode::deserialize(packet.payload())?;
        Ok(Self {
            session_id: packet.session_id(),
            sequence: packet.sequence(),
            event,
        })
    }
}
