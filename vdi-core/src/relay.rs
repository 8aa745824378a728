//! Input relay: sequencing and pointer-move coalescing.
//!
//! The relay owns the session's input sequence counter. Pointer moves are
//! held back and only the newest one per input tick is emitted; every other
//! event is emitted immediately, after flushing a held move so that
//! relative order on the wire matches submission order.

use crate::protocol::input::{InputEvent, InputMessage};
use crate::types::SessionId;

#[derive(Debug)]
pub struct InputRelay {
    session_id: SessionId,
    next_sequence: u64,
    pending_move: Option<InputEvent>,
    coalesced: u64,
}

impl InputRelay {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            next_sequence: 0,
            pending_move: None,
            coalesced: 0,
        }
    }

    /// Accept an event. Returns the messages that are ready to send now,
    /// in wire order.
    pub fn submit(&mut self, event: InputEvent) -> Vec<InputMessage> {
        if event.is_pointer_move() {
            if self.pending_move.replace(event).is_some() {
                self.coalesced += 1;
            }
            return Vec::new();
        }

        let mut ready = Vec::with_capacity(2);
        if let Some(held) = self.pending_move.take() {
            ready.push(self.stamp(held));
        }
        ready.push(self.stamp(event));
        ready
    }

    /// End of an input tick: emit the held pointer move, if any.
    pub fn tick(&mut self) -> Option<InputMessage> {
        let held = self.pending_move.take()?;
        Some(self.stamp(held))
    }

    /// Pointer moves replaced by a newer one before their tick.
    pub fn coalesced(&self) -> u64 {
        self.coalesced
    }

    /// Sequence the next emitted message will carry.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    fn stamp(&mut self, event: InputEvent) -> InputMessage {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        InputMessage {
            session_id: self.session_id,
            sequence,
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::input::PointerButton;

    fn mv(x: i32) -> InputEvent {
        InputEvent::PointerMove { x, y: x }
    }

    #[test]
    fn hundred_moves_in_one_tick_emit_one() {
        let mut relay = InputRelay::new(SessionId::new());
        for x in 0..100 {
            assert!(relay.submit(mv(x)).is_empty());
        }
        let sent = relay.tick().unwrap();
        assert_eq!(sent.event, mv(99));
        assert_eq!(sent.sequence, 0);
        assert!(relay.tick().is_none());
        assert_eq!(relay.coalesced(), 99);
    }

    #[test]
    fn other_events_pass_through_in_order() {
        let mut relay = InputRelay::new(SessionId::new());
        let key = InputEvent::KeyPress {
            code: 30,
            modifiers: 0,
        };
        let sent = relay.submit(key);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].event, key);

        let scroll = InputEvent::ScrollDelta { dx: 0, dy: 1 };
        let sent2 = relay.submit(scroll);
        assert_eq!(sent2[0].sequence, sent[0].sequence + 1);
    }

    #[test]
    fn held_move_flushes_before_button() {
        let mut relay = InputRelay::new(SessionId::new());
        relay.submit(mv(1));
        relay.submit(mv(2));
        let click = InputEvent::PointerButton {
            button: PointerButton::Left,
            pressed: true,
        };
        let sent = relay.submit(click);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].event, mv(2));
        assert_eq!(sent[1].event, click);
        assert!(sent[0].sequence < sent[1].sequence);
        assert!(relay.tick().is_none());
    }

    #[test]
    fn sequences_strictly_increase() {
        let mut relay = InputRelay::new(SessionId::new());
        let mut seen = Vec::new();
        for i in 0..50 {
            if i % 3 == 0 {
                seen.extend(relay.submit(InputEvent::KeyRelease {
                    code: i,
                    modifiers: 0,
                }));
            } else {
                relay.submit(mv(i as i32));
            }
            if i % 5 == 0 {
                seen.extend(relay.tick());
            }
        }
        assert!(seen.windows(2).all(|w| w[0].sequence < w[1].sequence));
        assert_eq!(relay.next_sequence(), seen.len() as u64);
    }
}
