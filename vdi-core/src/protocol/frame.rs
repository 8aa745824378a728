//! Display updates streamed from the host.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::VdiError;
use crate::message::MessageKind;
use crate::packet::Packet;
use crate::types::SessionId;

/// Screen rectangle touched by an update, in remote pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RegionBounds {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Serialize, Deserialize)]
struct FrameBody {
    region: RegionBounds,
    payload: Vec<u8>,
}

/// One encoded display update. The payload belongs to whichever codec was
/// negotiated; this crate never looks inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameUpdate {
    pub session_id: SessionId,
    pub sequence: u64,
    pub region: RegionBounds,
    pub payload: Bytes,
}

impl FrameUpdate {
    /// Build a frame `Packet`, zstd-compressing the body when `compress`
    /// is set.
    pub fn into_packet(&self, compress: bool) -> Result<Packet, VdiError> {
        let body = bincode::serialize(&FrameBody {
            region: self.region,
            payload: self.payload.to_vec(),
        })?;
        if compress {
            Packet::new_compressed(MessageKind::Frame, self.session_id, self.sequence, &body)
        } else {
            Packet::new(MessageKind::Frame, self.session_id, self.sequence, body)
        }
    }

    /// Parse a frame `Packet`, undoing transport compression.
    pub fn from_packet(packet: &Packet) -> Result<Self, VdiError> {
        let raw = packet.decoded_payload()?;
        let body: FrameBody = bincode::deserialize(&raw)?;
        Ok(Self {
            session_id: packet.session_id(),
            sequence: packet.sequence(),
            region: body.region,
            payload: Bytes::from(body.payload),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(compressible: bool) -> FrameUpdate {
        FrameUpdate {
            session_id: SessionId::new(),
            sequence: 5,
            region: RegionBounds {
                x: 0,
                y: 0,
                width: 64,
                height: 64,
            },
            payload: Bytes::from(if compressible {
                vec![0u8; 4096]
            } else {
                (0..=255u8).collect()
            }),
        }
    }

    #[test]
    fn plain_frame_packet() {
        let f = update(false);
        let pkt = f.into_packet(false).unwrap();
        assert_eq!(FrameUpdate::from_packet(&pkt).unwrap(), f);
    }

    #[test]
    fn compressed_frame_packet_is_smaller() {
        let f = update(true);
        let pkt = f.into_packet(true).unwrap();
        assert!(pkt.payload().len() < 4096);
        assert_eq!(FrameUpdate::from_packet(&pkt).unwrap(), f);
    }
}
