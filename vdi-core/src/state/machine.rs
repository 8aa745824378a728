//! Session lifecycle state machine.
//!
//! [`SessionMachine`] is a plain value: it performs no I/O and is driven by
//! the session task, one event at a time. Every transition is validated;
//! an event that makes no sense in the current state is rejected with
//! [`VdiError::InvalidTransition`] and leaves the state untouched.

use std::fmt;
use std::time::{Duration, Instant};

use crate::error::VdiError;
use crate::quality::Classification;

// ── SessionState ─────────────────────────────────────────────────

/// Lifecycle state of one session.
///
/// ```text
///  Idle ──► Handshaking ──► Negotiating ──► Streaming ◄──► Degraded
///               │                │              │  ▲          │
///               ▼                ▼              ▼  │          ▼
///             Failed ◄────────────────────── Reconnecting ◄───┘
///
///  any non-terminal ──► Closing ──► Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Handshaking,
    Negotiating,
    Streaming,
    Degraded,
    Reconnecting,
    Closing,
    Closed,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    /// States that count against the one-session-per-resource rule.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Idle
                | Self::Handshaking
                | Self::Negotiating
                | Self::Streaming
                | Self::Degraded
                | Self::Reconnecting
        )
    }

    /// Streaming or Degraded: a negotiated link is in use.
    pub fn is_established(&self) -> bool {
        matches!(self, Self::Streaming | Self::Degraded)
    }
}

// ── SessionEvent ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The manager started the session.
    Connect,
    /// The transport channel is open.
    TransportOpened,
    /// Establishing the session failed (transport, TLS, negotiation).
    ConnectFailed,
    /// Both peers acknowledged the negotiated capabilities.
    Negotiated,
    /// A quality sample was produced.
    Quality(Classification),
    /// The link dropped without a local request.
    TransportLost,
    /// One reconnection attempt failed.
    ReconnectFailed,
    /// The session was resumed on a new transport.
    Reconnected,
    /// The user asked to disconnect.
    Disconnect,
    /// The channel finished closing (or the close deadline passed).
    CloseConfirmed,
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect => "Connect",
            Self::TransportOpened => "TransportOpened",
            Self::ConnectFailed => "ConnectFailed",
            Self::Negotiated => "Negotiated",
            Self::Quality(_) => "Quality",
            Self::TransportLost => "TransportLost",
            Self::ReconnectFailed => "ReconnectFailed",
            Self::Reconnected => "Reconnected",
            Self::Disconnect => "Disconnect",
            Self::CloseConfirmed => "CloseConfirmed",
        }
    }
}

// ── Policies ─────────────────────────────────────────────────────

/// Consecutive-sample thresholds for entering and leaving `Degraded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hysteresis {
    pub degrade_after: u32,
    pub recover_after: u32,
}

impl Default for Hysteresis {
    fn default() -> Self {
        Self {
            degrade_after: 3,
            recover_after: 2,
        }
    }
}

/// Bounded exponential backoff between reconnection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(8),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.pow(attempt.saturating_sub(1).min(16));
        self.base.saturating_mul(factor).min(self.cap)
    }
}

// ── SessionMachine ───────────────────────────────────────────────

#[derive(Debug)]
pub struct SessionMachine {
    state: SessionState,
    entered_at: Instant,
    hysteresis: Hysteresis,
    policy: ReconnectPolicy,
    poor_streak: u32,
    good_streak: u32,
    /// Failed attempts in the current reconnection episode.
    reconnect_failures: u32,
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self::new(Hysteresis::default(), ReconnectPolicy::default())
    }
}

impl SessionMachine {
    pub fn new(hysteresis: Hysteresis, policy: ReconnectPolicy) -> Self {
        Self {
            state: SessionState::Idle,
            entered_at: Instant::now(),
            hysteresis,
            policy,
            poor_streak: 0,
            good_streak: 0,
            reconnect_failures: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Time spent in the current state.
    pub fn in_state_for(&self) -> Duration {
        self.entered_at.elapsed()
    }

    pub fn reconnect_failures(&self) -> u32 {
        self.reconnect_failures
    }

    /// Backoff before the next reconnection attempt, or `None` when the
    /// machine is not reconnecting or the attempts are used up.
    pub fn next_backoff(&self) -> Option<Duration> {
        if self.state != SessionState::Reconnecting
            || self.reconnect_failures >= self.policy.max_attempts
        {
            return None;
        }
        Some(self.policy.delay(self.reconnect_failures + 1))
    }

    /// Apply one event. Returns the (possibly unchanged) state.
    pub fn apply(&mut self, event: SessionEvent) -> Result<SessionState, VdiError> {
        use SessionEvent as E;
        use SessionState as S;

        let next = match (self.state, event) {
            (S::Idle, E::Connect) => S::Handshaking,
            (S::Handshaking, E::TransportOpened) => S::Negotiating,
            (S::Handshaking | S::Negotiating, E::ConnectFailed | E::TransportLost) => S::Failed,
            (S::Negotiating, E::Negotiated) => S::Streaming,

            (S::Streaming | S::Degraded, E::Quality(class)) => self.observe(class),

            (S::Streaming | S::Degraded, E::TransportLost) => {
                self.reconnect_failures = 0;
                S::Reconnecting
            }
            (S::Reconnecting, E::ReconnectFailed) => {
                self.reconnect_failures += 1;
                if self.reconnect_failures >= self.policy.max_attempts {
                    S::Failed
                } else {
                    S::Reconnecting
                }
            }
            (S::Reconnecting, E::Reconnected) => S::Streaming,

            (from, E::Disconnect) if !from.is_terminal() && from != S::Closing => S::Closing,
            (S::Closing, E::CloseConfirmed) => S::Closed,

            (from, event) => {
                return Err(VdiError::InvalidTransition {
                    from,
                    event: event.name(),
                });
            }
        };

        if next != self.state {
            if matches!(next, S::Streaming | S::Degraded) {
                self.poor_streak = 0;
                self.good_streak = 0;
            }
            self.state = next;
            self.entered_at = Instant::now();
        }
        Ok(next)
    }

    fn observe(&mut self, class: Classification) -> SessionState {
        match class {
            Classification::Poor => {
                self.poor_streak += 1;
                self.good_streak = 0;
            }
            Classification::Good | Classification::Excellent => {
                self.good_streak += 1;
                self.poor_streak = 0;
            }
        }

        match self.state {
            SessionState::Streaming if self.poor_streak >= self.hysteresis.degrade_after => {
                SessionState::Degraded
            }
            SessionState::Degraded if self.good_streak >= self.hysteresis.recover_after => {
                SessionState::Streaming
            }
            state => state,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
