//! Fixed-size packet header.
//!
//! ## Wire format (40 bytes, little-endian)
//!
//! ```text
//! magic:        [u8; 4]  "VDI1"
//! checksum:     u32      first 4 bytes of blake3(payload), 0 when empty
//! kind:         u8       MessageKind discriminant (kept raw)
//! flags:        u8       PacketFlags
//! reserved:     u16
//! session_id:   [u8; 16]
//! sequence:     u64      per-stream, strictly increasing
//! payload_len:  u32
//! ```

use crate::error::VdiError;
use crate::flags::PacketFlags;
use crate::message::MessageKind;
use crate::types::SessionId;

/// Magic bytes at the start of every packet.
pub const MAGIC: [u8; 4] = *b"VDI1";

/// Encoded header size on the wire.
pub const HEADER_SIZE: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub checksum: u32,
    /// Raw kind byte; see [`PacketHeader::kind`].
    pub kind: u8,
    pub flags: PacketFlags,
    pub session_id: SessionId,
    pub sequence: u64,
    pub payload_len: u32,
}

impl PacketHeader {
    pub fn new(kind: MessageKind, session_id: SessionId, sequence: u64) -> Self {
        Self {
            checksum: 0,
            kind: kind as u8,
            flags: PacketFlags::empty(),
            session_id,
            sequence,
            payload_len: 0,
        }
    }

    /// Typed message kind, or an error for kinds this build does not know.
    pub fn kind(&self) -> Result<MessageKind, VdiError> {
        MessageKind::try_from(self.kind)
    }

    /// Serialize to bytes.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        buf[8] = self.kind;
        buf[9] = self.flags.bits();
        buf[12..28].copy_from_slice(self.session_id.as_bytes());
        buf[28..36].copy_from_slice(&self.sequence.to_le_bytes());
        buf[36..40].copy_from_slice(&self.payload_len.to_le_bytes());
        buf
    }

    /// Deserialize from the first [`HEADER_SIZE`] bytes of `data`.
    pub fn decode(data: &[u8]) -> Result<Self, VdiError> {
        if data.len() < HEADER_SIZE {
            return Err(VdiError::Encoding(format!(
                "header too short: {} < {HEADER_SIZE}",
                data.len()
            )));
        }
        if data[0..4] != MAGIC {
            return Err(VdiError::InvalidMagic);
        }

        let mut session = [0u8; 16];
        session.copy_from_slice(&data[12..28]);

        Ok(Self {
            checksum: read_u32(data, 4),
            kind: data[8],
            flags: PacketFlags::from_bits_truncate(data[9]),
            session_id: SessionId::from_bytes(session),
            sequence: read_u64(data, 28),
            payload_len: read_u32(data, 36),
        })
    }
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&data[at..at + 4]);
    u32::from_le_bytes(b)
}

fn read_u64(data: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let id = SessionId::new();
        let mut hdr = PacketHeader::new(MessageKind::Frame, id, 42);
        hdr.flags = PacketFlags::COMPRESSED;
        hdr.payload_len = 1024;
        hdr.checksum = 0xDEADBEEF;

        let decoded = PacketHeader::decode(&hdr.encode()).unwrap();
        assert_eq!(decoded, hdr);
        assert_eq!(decoded.kind().unwrap(), MessageKind::Frame);
    }

    #[test]
    fn bad_magic_rejected() {
        let mut bytes = PacketHeader::new(MessageKind::Control, SessionId::NIL, 0).encode();
        bytes[0] = b'X';
        assert!(matches!(
            PacketHeader::decode(&bytes),
            Err(VdiError::InvalidMagic)
        ));
    }

    #[test]
    fn too_short() {
        assert!(PacketHeader::decode(&[0u8; 10]).is_err());
    }

    #[test]
    fn unknown_kind_survives_decode() {
        let mut bytes = PacketHeader::new(MessageKind::Control, SessionId::NIL, 0).encode();
        bytes[8] = 0x42;
        let hdr = PacketHeader::decode(&bytes).unwrap();
        assert_eq!(hdr.kind, 0x42);
        assert!(hdr.kind().is_err());
    }
}
