//! Per-packet flag bits carried in the header.

use bitflags::bitflags;

bitflags! {
    /// Flags describing how a packet payload was encoded.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PacketFlags: u8 {
        /// Payload is zstd-compressed.
        const COMPRESSED = 0b0000_0001;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_bits_are_truncated() {
        let flags = PacketFlags::from_bits_truncate(0xFF);
        assert_eq!(flags, PacketFlags::COMPRESSED);
    }
}
