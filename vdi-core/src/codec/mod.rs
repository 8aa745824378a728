//! `tokio_util` codec for framed packet I/O.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::VdiError;
use crate::header::{HEADER_SIZE, PacketHeader};
use crate::packet::{MAX_FRAME_SIZE, MAX_PAYLOAD_SIZE, Packet};

/// Length-prefixed packet codec.
///
/// The decoder validates magic, length limits and checksum; it does not
/// interpret the message kind, so unknown kinds reach the demultiplexer.
#[derive(Debug, Default, Clone, Copy)]
pub struct VdiCodec;

impl Decoder for VdiCodec {
    type Item = Packet;
    type Error = VdiError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let header = PacketHeader::decode(&src[..HEADER_SIZE])?;
        let payload_len = header.payload_len as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(VdiError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let frame_len = HEADER_SIZE + payload_len;
        if src.len() < frame_len {
            if src.capacity() < frame_len && frame_len <= MAX_FRAME_SIZE {
                src.reserve(frame_len - src.len());
            }
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(payload_len).freeze();
        let packet = Packet::from_parts(header, payload)?;

        if !packet.validate() {
            return Err(VdiError::ChecksumMismatch);
        }

        Ok(Some(packet))
    }
}

impl Encoder<Packet> for VdiCodec {
    type Error = VdiError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload().len() > MAX_PAYLOAD_SIZE {
            return Err(VdiError::PayloadTooLarge {
                size: item.payload().len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        dst.reserve(HEADER_SIZE + item.payload().len());
        dst.extend_from_slice(&item.header().encode());
        dst.extend_from_slice(item.payload());
        Ok(())
    }
}
