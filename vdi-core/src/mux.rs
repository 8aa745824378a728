//! Frame stream multiplexer.
//!
//! All logical streams of a session share one transport channel. Outbound
//! messages are stamped with the session id and their stream's sequence
//! and queued without waiting on the socket; inbound packets are routed by
//! their kind and session tag. Inbound frames are delivered in strictly
//! increasing sequence order, and skipped sequences are reported as
//! [`FrameGapDetected`] without holding back later frames.

use tracing::warn;

use crate::error::{ChannelError, VdiError};
use crate::message::MessageKind;
use crate::packet::{MAX_PAYLOAD_SIZE, Packet};
use crate::protocol::control::ControlMessage;
use crate::protocol::frame::FrameUpdate;
use crate::protocol::input::InputMessage;
use crate::transport::ChannelSender;
use crate::types::SessionId;

// ── Outbound ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum Outbound {
    Control(ControlMessage),
    /// Already sequenced by the input relay.
    Input(InputMessage),
    /// Already sequenced by the frame producer.
    Frame(FrameUpdate),
}

/// Sending half of the multiplexer. Survives transport replacement: a new
/// channel is attached after every reconnect while sequence state is kept.
#[derive(Debug)]
pub struct Multiplexer {
    session_id: SessionId,
    sender: Option<ChannelSender>,
    control_sequence: u64,
    compress_frames: bool,
    max_payload: usize,
}

impl Multiplexer {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            sender: None,
            control_sequence: 0,
            compress_frames: false,
            max_payload: MAX_PAYLOAD_SIZE,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Route outbound traffic to a freshly opened channel.
    pub fn attach(&mut self, sender: ChannelSender) {
        self.sender = Some(sender);
    }

    pub fn detach(&mut self) {
        self.sender = None;
    }

    pub fn set_frame_compression(&mut self, enabled: bool) {
        self.compress_frames = enabled;
    }

    /// Apply the negotiated payload limit to everything sent from now on.
    pub fn set_max_payload(&mut self, limit: u64) {
        self.max_payload = clamp_limit(limit);
    }

    /// Encode and enqueue. Returns as soon as the packet is queued.
    ///
    /// Payloads above the negotiated limit fail with `PayloadTooLarge` and
    /// consume no sequence number.
    pub fn submit_outbound(&mut self, message: Outbound) -> Result<(), VdiError> {
        let sender = self.sender.as_ref().ok_or(ChannelError::Closed)?;
        let is_control = matches!(message, Outbound::Control(_));
        let packet = match message {
            Outbound::Control(msg) => msg.into_packet(self.session_id, self.control_sequence)?,
            Outbound::Input(msg) => msg.into_packet()?,
            Outbound::Frame(update) => update.into_packet(self.compress_frames)?,
        };
        let size = packet.payload().len();
        if size > self.max_payload {
            return Err(VdiError::PayloadTooLarge {
                size,
                max: self.max_payload,
            });
        }
        sender.send(packet)?;
        if is_control {
            self.control_sequence += 1;
        }
        Ok(())
    }

    /// Shorthand for control messages.
    pub fn control(&mut self, message: ControlMessage) -> Result<(), VdiError> {
        self.submit_outbound(Outbound::Control(message))
    }
}

// ── Inbound ──────────────────────────────────────────────────────

/// Frames between the last delivered one and `received` never arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGapDetected {
    pub expected: u64,
    pub received: u64,
}

impl FrameGapDetected {
    pub fn missing(&self) -> u64 {
        self.received - self.expected
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    UnknownKind(u8),
    ForeignSession(SessionId),
    /// Sequence at or below the last delivered one.
    Stale { kind: MessageKind, sequence: u64 },
    /// Payload above the negotiated limit.
    TooLarge { size: usize, max: usize },
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Demuxed {
    Frame {
        update: FrameUpdate,
        gap: Option<FrameGapDetected>,
    },
    Control {
        sequence: u64,
        message: ControlMessage,
    },
    Input(InputMessage),
    Dropped(DropReason),
}

/// Receiving half of the multiplexer.
#[derive(Debug, Default)]
pub struct Demultiplexer {
    /// `None` accepts any session id (host side before the handshake).
    session_id: Option<SessionId>,
    last_control: Option<u64>,
    last_frame: Option<u64>,
    last_input: Option<u64>,
    /// `None` means the codec limit.
    max_payload: Option<usize>,
    dropped: u64,
}

impl Demultiplexer {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id: Some(session_id),
            ..Default::default()
        }
    }

    /// A demultiplexer that has not yet learned its session id.
    pub fn unbound() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, session_id: SessionId) {
        self.session_id = Some(session_id);
    }

    /// Control sequences restart with every connection.
    pub fn reset_control(&mut self) {
        self.last_control = None;
    }

    pub fn set_max_payload(&mut self, limit: u64) {
        self.max_payload = Some(clamp_limit(limit));
    }

    pub fn last_frame(&self) -> Option<u64> {
        self.last_frame
    }

    /// Packets dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn demux(&mut self, packet: Packet) -> Demuxed {
        let result = self.route(&packet);
        if let Demuxed::Dropped(reason) = &result {
            self.dropped += 1;
            warn!(
                session_id = %packet.session_id(),
                sequence = packet.sequence(),
                "dropping inbound packet: {reason:?}"
            );
        }
        result
    }

    fn route(&mut self, packet: &Packet) -> Demuxed {
        let kind = match packet.header().kind() {
            Ok(k) => k,
            Err(_) => return Demuxed::Dropped(DropReason::UnknownKind(packet.header().kind)),
        };

        if let Some(own) = self.session_id
            && packet.session_id() != own
        {
            return Demuxed::Dropped(DropReason::ForeignSession(packet.session_id()));
        }

        let size = packet.payload().len();
        if let Some(max) = self.max_payload
            && size > max
        {
            return Demuxed::Dropped(DropReason::TooLarge { size, max });
        }

        let sequence = packet.sequence();
        match kind {
            MessageKind::Control => {
                if self.last_control.is_some_and(|last| sequence <= last) {
                    return Demuxed::Dropped(DropReason::Stale { kind, sequence });
                }
                match ControlMessage::from_bytes(packet.payload()) {
                    Ok(message) => {
                        self.last_control = Some(sequence);
                        Demuxed::Control { sequence, message }
                    }
                    Err(e) => Demuxed::Dropped(DropReason::Malformed(e.to_string())),
                }
            }
            MessageKind::Input => {
                if self.last_input.is_some_and(|last| sequence <= last) {
                    return Demuxed::Dropped(DropReason::Stale { kind, sequence });
                }
                match InputMessage::from_packet(packet) {
                    Ok(msg) => {
                        self.last_input = Some(sequence);
                        Demuxed::Input(msg)
                    }
                    Err(e) => Demuxed::Dropped(DropReason::Malformed(e.to_string())),
                }
            }
            MessageKind::Frame => {
                let expected = match self.last_frame {
                    Some(last) if sequence <= last => {
                        return Demuxed::Dropped(DropReason::Stale { kind, sequence });
                    }
                    Some(last) => last + 1,
                    None => 0,
                };
                match FrameUpdate::from_packet(packet) {
                    Ok(update) => {
                        self.last_frame = Some(sequence);
                        let gap = (sequence > expected).then_some(FrameGapDetected {
                            expected,
                            received: sequence,
                        });
                        Demuxed::Frame { update, gap }
                    }
                    Err(e) => Demuxed::Dropped(DropReason::Malformed(e.to_string())),
                }
            }
        }
    }
}

fn clamp_limit(limit: u64) -> usize {
    usize::try_from(limit).map_or(MAX_PAYLOAD_SIZE, |l| l.min(MAX_PAYLOAD_SIZE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::PacketHeader;
    use crate::protocol::frame::RegionBounds;
    use crate::protocol::input::InputEvent;
    use bytes::Bytes;

    fn frame(id: SessionId, seq: u64) -> Packet {
        FrameUpdate {
            session_id: id,
            sequence: seq,
            region: RegionBounds::default(),
            payload: Bytes::from_static(b"px"),
        }
        .into_packet(false)
        .unwrap()
    }

    #[test]
    fn frames_in_order_have_no_gap() {
        let id = SessionId::new();
        let mut demux = Demultiplexer::new(id);
        for seq in 0..3 {
            match demux.demux(frame(id, seq)) {
                Demuxed::Frame { update, gap } => {
                    assert_eq!(update.sequence, seq);
                    assert!(gap.is_none());
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn gap_is_reported_and_frame_still_delivered() {
        let id = SessionId::new();
        let mut demux = Demultiplexer::new(id);
        demux.demux(frame(id, 0));
        match demux.demux(frame(id, 4)) {
            Demuxed::Frame { update, gap } => {
                assert_eq!(update.sequence, 4);
                let gap = gap.unwrap();
                assert_eq!(gap.expected, 1);
                assert_eq!(gap.missing(), 3);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(demux.last_frame(), Some(4));
    }

    #[test]
    fn stale_and_duplicate_frames_dropped() {
        let id = SessionId::new();
        let mut demux = Demultiplexer::new(id);
        demux.demux(frame(id, 5));
        assert!(matches!(
            demux.demux(frame(id, 5)),
            Demuxed::Dropped(DropReason::Stale { .. })
        ));
        assert!(matches!(
            demux.demux(frame(id, 2)),
            Demuxed::Dropped(DropReason::Stale { .. })
        ));
        assert_eq!(demux.dropped(), 2);
    }

    #[test]
    fn foreign_session_dropped() {
        let mut demux = Demultiplexer::new(SessionId::new());
        assert!(matches!(
            demux.demux(frame(SessionId::new(), 0)),
            Demuxed::Dropped(DropReason::ForeignSession(_))
        ));
    }

    #[test]
    fn unknown_kind_dropped_not_fatal() {
        let id = SessionId::new();
        let mut demux = Demultiplexer::new(id);
        let mut header = PacketHeader::new(MessageKind::Control, id, 0);
        header.kind = 0x66;
        let pkt = Packet::from_parts(header, Bytes::new()).unwrap();
        assert_eq!(
            demux.demux(pkt),
            Demuxed::Dropped(DropReason::UnknownKind(0x66))
        );
        // The stream continues.
        assert!(matches!(demux.demux(frame(id, 0)), Demuxed::Frame { .. }));
    }

    #[test]
    fn control_and_input_routed() {
        let id = SessionId::new();
        let mut demux = Demultiplexer::unbound();
        let ctrl = ControlMessage::Probe { nonce: 3 }.into_packet(id, 0).unwrap();
        assert!(matches!(
            demux.demux(ctrl),
            Demuxed::Control {
                message: ControlMessage::Probe { nonce: 3 },
                ..
            }
        ));

        let input = InputMessage {
            session_id: id,
            sequence: 0,
            event: InputEvent::ScrollDelta { dx: 1, dy: 0 },
        };
        assert!(matches!(
            demux.demux(input.into_packet().unwrap()),
            Demuxed::Input(_)
        ));
        assert!(matches!(
            demux.demux(input.into_packet().unwrap()),
            Demuxed::Dropped(DropReason::Stale { .. })
        ));
    }

    #[tokio::test]
    async fn submit_preserves_order_and_sequences_control() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let left = crate::transport::Channel::new(Box::new(a), "left");
        let mut right = crate::transport::Channel::new(Box::new(b), "right");

        let id = SessionId::new();
        let mut mux = Multiplexer::new(id);
        assert!(mux.control(ControlMessage::Ready).is_err());

        mux.attach(left.sender());
        for nonce in 0..4 {
            mux.control(ControlMessage::Probe { nonce }).unwrap();
        }

        let mut demux = Demultiplexer::new(id);
        for nonce in 0..4 {
            match demux.demux(right.receive().await.unwrap()) {
                Demuxed::Control { sequence, message } => {
                    assert_eq!(sequence, nonce);
                    assert_eq!(message, ControlMessage::Probe { nonce });
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn stale_control_dropped_until_reset() {
        let id = SessionId::new();
        let mut demux = Demultiplexer::new(id);
        let ready = |seq| ControlMessage::Ready.into_packet(id, seq).unwrap();

        assert!(matches!(demux.demux(ready(0)), Demuxed::Control { .. }));
        assert!(matches!(demux.demux(ready(1)), Demuxed::Control { .. }));
        assert!(matches!(
            demux.demux(ready(1)),
            Demuxed::Dropped(DropReason::Stale {
                kind: MessageKind::Control,
                sequence: 1
            })
        ));

        // A new connection numbers its control stream from zero again.
        demux.reset_control();
        assert!(matches!(demux.demux(ready(0)), Demuxed::Control { .. }));
    }

    #[test]
    fn payload_above_negotiated_limit_dropped() {
        let id = SessionId::new();
        let mut demux = Demultiplexer::new(id);
        let size = frame(id, 0).payload().len();
        demux.set_max_payload(size as u64 - 1);
        assert_eq!(
            demux.demux(frame(id, 0)),
            Demuxed::Dropped(DropReason::TooLarge {
                size,
                max: size - 1
            })
        );
        demux.set_max_payload(size as u64);
        assert!(matches!(demux.demux(frame(id, 1)), Demuxed::Frame { .. }));
    }

    #[tokio::test]
    async fn oversized_outbound_rejected_without_using_a_sequence() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let left = crate::transport::Channel::new(Box::new(a), "left");
        let mut right = crate::transport::Channel::new(Box::new(b), "right");

        let id = SessionId::new();
        let mut mux = Multiplexer::new(id);
        mux.attach(left.sender());
        mux.set_max_payload(4);

        let update = FrameUpdate {
            session_id: id,
            sequence: 0,
            region: RegionBounds::default(),
            payload: Bytes::from(vec![7u8; 64]),
        };
        assert!(matches!(
            mux.submit_outbound(Outbound::Frame(update)),
            Err(VdiError::PayloadTooLarge { max: 4, .. })
        ));
        assert!(matches!(
            mux.control(ControlMessage::Probe { nonce: 1 }),
            Err(VdiError::PayloadTooLarge { .. })
        ));

        mux.set_max_payload(u64::MAX);
        mux.control(ControlMessage::Ready).unwrap();
        assert_eq!(right.receive().await.unwrap().sequence(), 0);
    }
}
