//! A framed unit on the wire: header plus opaque payload.

use std::borrow::Cow;

use bytes::Bytes;

use crate::error::VdiError;
use crate::flags::PacketFlags;
use crate::header::{HEADER_SIZE, PacketHeader};
use crate::message::MessageKind;
use crate::types::SessionId;

/// Largest payload a packet may carry.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Largest buffered frame the codec will accept before failing the stream.
pub const MAX_FRAME_SIZE: usize = HEADER_SIZE + MAX_PAYLOAD_SIZE;

/// zstd level used for frame payloads.
const COMPRESSION_LEVEL: i32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    header: PacketHeader,
    payload: Bytes,
}

impl Packet {
    /// Build a packet, filling in the length and checksum.
    pub fn new(
        kind: MessageKind,
        session_id: SessionId,
        sequence: u64,
        payload: impl Into<Bytes>,
    ) -> Result<Self, VdiError> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(VdiError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let mut header = PacketHeader::new(kind, session_id, sequence);
        header.payload_len = payload.len() as u32;
        header.checksum = checksum(&payload);
        Ok(Self { header, payload })
    }

    /// Build a packet whose payload is zstd-compressed on the wire.
    pub fn new_compressed(
        kind: MessageKind,
        session_id: SessionId,
        sequence: u64,
        payload: &[u8],
    ) -> Result<Self, VdiError> {
        let compressed = zstd::bulk::compress(payload, COMPRESSION_LEVEL)?;
        let mut packet = Self::new(kind, session_id, sequence, compressed)?;
        packet.header.flags |= PacketFlags::COMPRESSED;
        Ok(packet)
    }

    /// Reassemble a packet from a decoded header and its payload bytes.
    pub fn from_parts(header: PacketHeader, payload: Bytes) -> Result<Self, VdiError> {
        if header.payload_len as usize != payload.len() {
            return Err(VdiError::Encoding(format!(
                "payload length mismatch: header says {}, got {}",
                header.payload_len,
                payload.len()
            )));
        }
        Ok(Self { header, payload })
    }

    pub fn header(&self) -> &PacketHeader {
        &self.header
    }

    pub fn session_id(&self) -> SessionId {
        self.header.session_id
    }

    pub fn sequence(&self) -> u64 {
        self.header.sequence
    }

    /// Raw payload as carried on the wire.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload with any transport compression removed.
    pub fn decoded_payload(&self) -> Result<Cow<'_, [u8]>, VdiError> {
        if self.header.flags.contains(PacketFlags::COMPRESSED) {
            let raw = zstd::bulk::decompress(&self.payload, MAX_PAYLOAD_SIZE)?;
            Ok(Cow::Owned(raw))
        } else {
            Ok(Cow::Borrowed(&self.payload))
        }
    }

    /// Returns `true` when the header checksum matches the payload.
    pub fn validate(&self) -> bool {
        self.header.checksum == checksum(&self.payload)
    }

    /// Serialize header and payload into one buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&self.header.encode());
        buf.extend_from_slice(&self.payload);
        buf
    }
}

/// First four bytes of the blake3 digest, or zero for an empty payload.
pub fn checksum(payload: &[u8]) -> u32 {
    if payload.is_empty() {
        return 0;
    }
    let digest = blake3::hash(payload);
    let mut b = [0u8; 4];
    b.copy_from_slice(&digest.as_bytes()[0..4]);
    u32::from_le_bytes(b)
}
