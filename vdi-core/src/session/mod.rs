//! Per-session handle, configuration and diagnostics.
//!
//! A [`Session`] is a cheap, cloneable handle onto one session task. The
//! task (see `driver`) owns the state machine, channel, multiplexer,
//! quality monitor and input relay; the handle only observes published
//! state and queues commands.

mod driver;
pub mod manager;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;

use crate::error::{ChannelError, SessionFailure, VdiError};
use crate::protocol::control::{ConfigChange, Resolution};
use crate::protocol::frame::FrameUpdate;
use crate::protocol::input::InputEvent;
use crate::quality::{QualitySample, QualityThresholds};
use crate::state::{Capabilities, Codec, Hysteresis, ReconnectPolicy, SessionState};
use crate::types::{ResourceId, SessionId};

pub(crate) use driver::spawn;
pub use manager::SessionManager;

// ── SessionConfig ────────────────────────────────────────────────

/// Timing and policy knobs for every session a manager creates.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
    pub negotiation_timeout: Duration,
    /// Upper bound on draining queued writes during close.
    pub close_timeout: Duration,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    /// Consecutive probe timeouts that count as a lost transport.
    pub probe_failure_limit: u32,
    pub input_tick: Duration,
    pub reconnect: ReconnectPolicy,
    pub hysteresis: Hysteresis,
    pub thresholds: QualityThresholds,
    /// EWMA weight of the newest loss observation.
    pub loss_alpha: f64,
    /// Frames buffered per `frames()` subscriber.
    pub frame_buffer: usize,
    /// Capabilities advertised in the handshake.
    pub capabilities: Capabilities,
    pub keyboard_layout: String,
    pub pointer_sensitivity: u8,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            negotiation_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(3),
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(2),
            probe_failure_limit: 3,
            input_tick: Duration::from_millis(16),
            reconnect: ReconnectPolicy::default(),
            hysteresis: Hysteresis::default(),
            thresholds: QualityThresholds::default(),
            loss_alpha: 0.3,
            frame_buffer: 64,
            capabilities: Capabilities::default(),
            keyboard_layout: "en-US".into(),
            pointer_sensitivity: 50,
        }
    }
}

// ── Settings ─────────────────────────────────────────────────────

/// Options for [`Session::reconfigure`].
///
/// `keyboard_layout` and `pointer_sensitivity` are local and apply
/// immediately. Everything in `change` has to be acknowledged by the host
/// and is only possible while the session is `Streaming`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconfigureOptions {
    pub keyboard_layout: Option<String>,
    /// 0..=100
    pub pointer_sensitivity: Option<u8>,
    pub change: ConfigChange,
}

impl ReconfigureOptions {
    fn validate(&self) -> Result<(), VdiError> {
        if let Some(s) = self.pointer_sensitivity
            && s > 100
        {
            return Err(VdiError::InvalidOption(format!(
                "pointer sensitivity {s} outside 0..=100"
            )));
        }
        if let Some(layout) = &self.keyboard_layout
            && layout.trim().is_empty()
        {
            return Err(VdiError::InvalidOption("empty keyboard layout".into()));
        }
        Ok(())
    }
}

/// Effective settings of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub keyboard_layout: String,
    pub pointer_sensitivity: u8,
    /// `None` until negotiation completes.
    pub codec: Option<Codec>,
    pub resolution: Resolution,
    pub clipboard: bool,
    pub device_redirection: bool,
}

impl SessionSettings {
    fn from_config(config: &SessionConfig) -> Self {
        Self {
            keyboard_layout: config.keyboard_layout.clone(),
            pointer_sensitivity: config.pointer_sensitivity.min(100),
            codec: None,
            resolution: Resolution::MatchClient,
            clipboard: false,
            device_redirection: false,
        }
    }

    /// Adopt the negotiated feature set.
    pub(crate) fn negotiated(&mut self, caps: &Capabilities) {
        self.codec = caps.preferred_codec();
        self.clipboard = caps.clipboard;
        self.device_redirection = caps.device_redirection;
    }

    pub(crate) fn apply_change(&mut self, change: &ConfigChange) {
        if let Some(codec) = change.codec {
            self.codec = Some(codec);
        }
        if let Some(resolution) = change.resolution {
            self.resolution = resolution;
        }
        if let Some(clipboard) = change.clipboard {
            self.clipboard = clipboard;
        }
        if let Some(redirect) = change.device_redirection {
            self.device_redirection = redirect;
        }
    }
}

// ── Diagnostics ──────────────────────────────────────────────────

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub inputs_discarded: AtomicU64,
    pub pointer_moves_coalesced: AtomicU64,
    pub frames_delivered: AtomicU64,
    pub frames_missing: AtomicU64,
    pub packets_dropped: AtomicU64,
    pub reconnect_attempts: AtomicU64,
    pub probe_timeouts: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn snapshot(&self) -> Diagnostics {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        Diagnostics {
            inputs_discarded: get(&self.inputs_discarded),
            pointer_moves_coalesced: get(&self.pointer_moves_coalesced),
            frames_delivered: get(&self.frames_delivered),
            frames_missing: get(&self.frames_missing),
            packets_dropped: get(&self.packets_dropped),
            reconnect_attempts: get(&self.reconnect_attempts),
            probe_timeouts: get(&self.probe_timeouts),
        }
    }
}

/// Point-in-time copy of a session's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Diagnostics {
    /// Input submitted while not `Streaming`, or of a kind the host does
    /// not accept.
    pub inputs_discarded: u64,
    pub pointer_moves_coalesced: u64,
    pub frames_delivered: u64,
    pub frames_missing: u64,
    /// Unknown, foreign, stale or malformed inbound packets.
    pub packets_dropped: u64,
    pub reconnect_attempts: u64,
    pub probe_timeouts: u64,
}

// ── Shared state ─────────────────────────────────────────────────

#[derive(Debug)]
pub(crate) enum Command {
    Input(InputEvent),
    Reconfigure {
        change: ConfigChange,
        reply: oneshot::Sender<Result<(), VdiError>>,
    },
}

/// State published by the session task and read by handles.
#[derive(Debug)]
pub(crate) struct Shared {
    pub id: SessionId,
    pub resource: ResourceId,
    pub state: watch::Sender<SessionState>,
    pub quality: watch::Sender<Option<QualitySample>>,
    pub capabilities: watch::Sender<Option<Capabilities>>,
    pub last_error: Mutex<Option<SessionFailure>>,
    pub settings: Mutex<SessionSettings>,
    pub counters: Counters,
    pub frames: broadcast::Sender<FrameUpdate>,
    /// Cancelled by `disconnect`; stops reconnects, probes and streaming.
    pub cancel: CancellationToken,
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    pub fn new(resource: ResourceId, config: &SessionConfig) -> Self {
        Self {
            id: SessionId::new(),
            resource,
            state: watch::Sender::new(SessionState::Idle),
            quality: watch::Sender::new(None),
            capabilities: watch::Sender::new(None),
            last_error: Mutex::new(None),
            settings: Mutex::new(SessionSettings::from_config(config)),
            counters: Counters::default(),
            frames: broadcast::channel(config.frame_buffer.max(1)).0,
            cancel: CancellationToken::new(),
        }
    }
}

// ── Session ──────────────────────────────────────────────────────

/// Handle onto one session. Clones share the same session.
#[derive(Debug, Clone)]
pub struct Session {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Session {
    pub(crate) fn from_parts(shared: Arc<Shared>, commands: mpsc::UnboundedSender<Command>) -> Self {
        Self { shared, commands }
    }

    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    pub fn resource(&self) -> &ResourceId {
        &self.shared.resource
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// A `watch` receiver over the state, for callers that prefer it to a
    /// stream.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// The current state followed by every change. Ends after the terminal
    /// state has been yielded. Intermediate states may be skipped by a
    /// slow consumer; the final state never is.
    pub fn state_stream(&self) -> impl Stream<Item = SessionState> + Send + use<> {
        let rx = self.shared.state.subscribe();
        futures::stream::unfold(Some(rx), |rx| async move {
            let mut rx = rx?;
            let state = *rx.borrow_and_update();
            if state.is_terminal() {
                return Some((state, None));
            }
            let next = rx.changed().await.ok().map(|_| rx);
            Some((state, next))
        })
    }

    /// Quality samples produced from now on. Ends when the session reaches
    /// a terminal state.
    pub fn quality_stream(&self) -> impl Stream<Item = QualitySample> + Send + use<> {
        let mut quality = self.shared.quality.subscribe();
        quality.borrow_and_update();
        let state = self.shared.state.subscribe();

        futures::stream::unfold((quality, state), |(mut quality, mut state)| async move {
            loop {
                if state.borrow_and_update().is_terminal() {
                    return None;
                }
                tokio::select! {
                    changed = quality.changed() => {
                        changed.ok()?;
                        let sample = *quality.borrow_and_update();
                        if let Some(sample) = sample {
                            return Some((sample, (quality, state)));
                        }
                    }
                    changed = state.changed() => changed.ok()?,
                }
            }
        })
    }

    /// Most recent quality sample.
    pub fn quality(&self) -> Option<QualitySample> {
        *self.shared.quality.borrow()
    }

    /// Negotiated capabilities; `None` before negotiation completes.
    pub fn capabilities(&self) -> Option<Capabilities> {
        self.shared.capabilities.borrow().clone()
    }

    /// Why the session failed, if it did.
    pub fn last_error(&self) -> Option<SessionFailure> {
        lock(&self.shared.last_error).clone()
    }

    pub fn settings(&self) -> SessionSettings {
        lock(&self.shared.settings).clone()
    }

    pub fn diagnostics(&self) -> Diagnostics {
        self.shared.counters.snapshot()
    }

    /// Subscribe to delivered display updates.
    pub fn frames(&self) -> broadcast::Receiver<FrameUpdate> {
        self.shared.frames.subscribe()
    }

    /// Delivered display updates as a stream. Updates missed by a lagging
    /// subscriber are skipped.
    pub fn frame_stream(&self) -> impl Stream<Item = FrameUpdate> + Send + use<> {
        BroadcastStream::new(self.frames()).filter_map(|r| futures::future::ready(r.ok()))
    }

    /// Wait for the connect outcome: the negotiated capabilities once the
    /// session streams, or the error that ended it.
    pub async fn established(&self) -> Result<Capabilities, VdiError> {
        let mut rx = self.shared.state.subscribe();
        let state = *rx
            .wait_for(|s| s.is_established() || s.is_terminal() || *s == SessionState::Closing)
            .await
            .map_err(|_| ChannelError::Closed)?;

        if state.is_established()
            && let Some(caps) = self.capabilities()
        {
            return Ok(caps);
        }
        let mut rx = self.shared.state.subscribe();
        let _ = rx.wait_for(|s| s.is_terminal()).await;
        Err(match self.last_error() {
            Some(failure) => failure.into(),
            None => ChannelError::Closed.into(),
        })
    }

    /// Queue an input event. Events submitted while the session is not
    /// `Streaming` are discarded and counted.
    pub fn submit(&self, event: InputEvent) {
        let streaming = self.state() == SessionState::Streaming;
        if !streaming || self.commands.send(Command::Input(event)).is_err() {
            Counters::bump(&self.shared.counters.inputs_discarded, 1);
        }
    }

    /// Change session settings. Local options apply at once; peer options
    /// wait for the host's acknowledgment.
    pub async fn reconfigure(&self, options: ReconfigureOptions) -> Result<(), VdiError> {
        options.validate()?;

        if !options.change.is_empty() {
            let state = self.state();
            if state != SessionState::Streaming {
                return Err(VdiError::RequiresRenegotiation { state });
            }
            let (reply, rx) = oneshot::channel();
            self.commands
                .send(Command::Reconfigure {
                    change: options.change.clone(),
                    reply,
                })
                .map_err(|_| ChannelError::Closed)?;
            rx.await.map_err(|_| VdiError::from(ChannelError::Closed))??;
        }

        let mut settings = lock(&self.shared.settings);
        if let Some(layout) = options.keyboard_layout {
            settings.keyboard_layout = layout;
        }
        if let Some(sensitivity) = options.pointer_sensitivity {
            settings.pointer_sensitivity = sensitivity;
        }
        Ok(())
    }

    /// Close the session. Cancels reconnection and probing, drains queued
    /// writes for at most the close timeout, and waits for the terminal
    /// state. Calling it again is a no-op.
    pub async fn disconnect(&self) {
        self.shared.cancel.cancel();
        let mut rx = self.shared.state.subscribe();
        let _ = rx.wait_for(|s| s.is_terminal()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_protocol_constants() {
        let c = SessionConfig::default();
        assert_eq!(c.negotiation_timeout, Duration::from_secs(10));
        assert_eq!(c.probe_interval, Duration::from_secs(1));
        assert_eq!(c.probe_timeout, Duration::from_secs(2));
        assert_eq!(c.probe_failure_limit, 3);
        assert_eq!(c.input_tick, Duration::from_millis(16));
        assert_eq!(c.close_timeout, Duration::from_secs(3));
        assert_eq!(c.reconnect.max_attempts, 5);
        assert_eq!(c.hysteresis, Hysteresis::default());
    }

    #[test]
    fn sensitivity_is_validated() {
        let opts = ReconfigureOptions {
            pointer_sensitivity: Some(101),
            ..Default::default()
        };
        assert!(matches!(opts.validate(), Err(VdiError::InvalidOption(_))));

        let opts = ReconfigureOptions {
            pointer_sensitivity: Some(100),
            keyboard_layout: Some("de-DE".into()),
            ..Default::default()
        };
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn settings_follow_negotiation_and_changes() {
        let mut s = SessionSettings::from_config(&SessionConfig::default());
        assert_eq!(s.codec, None);
        s.negotiated(&Capabilities::default());
        assert_eq!(s.codec, Some(Codec::H264));
        assert!(s.clipboard);

        s.apply_change(&ConfigChange {
            codec: Some(Codec::Jpeg),
            clipboard: Some(false),
            resolution: Some(Resolution::Fixed {
                width: 1920,
                height: 1080,
            }),
            ..Default::default()
        });
        assert_eq!(s.codec, Some(Codec::Jpeg));
        assert!(!s.clipboard);
        assert!(s.device_redirection);
        assert_eq!(
            s.resolution,
            Resolution::Fixed {
                width: 1920,
                height: 1080
            }
        );
    }

    #[tokio::test]
    async fn streams_end_at_terminal_state() {
        let shared = Arc::new(Shared::new("r".into(), &SessionConfig::default()));
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = Session::from_parts(Arc::clone(&shared), tx);

        let states = session.state_stream();
        let quality = session.quality_stream();
        shared.state.send_replace(SessionState::Handshaking);
        shared.state.send_replace(SessionState::Failed);

        let seen: Vec<_> = states.collect().await;
        assert_eq!(seen.last(), Some(&SessionState::Failed));
        let samples: Vec<_> = quality.collect().await;
        assert!(samples.is_empty());
    }

    #[tokio::test]
    async fn submit_outside_streaming_is_counted() {
        let shared = Arc::new(Shared::new("r".into(), &SessionConfig::default()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = Session::from_parts(shared, tx);

        session.submit(InputEvent::KeyPress {
            code: 1,
            modifiers: 0,
        });
        assert_eq!(session.diagnostics().inputs_discarded, 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn peer_option_needs_streaming() {
        let shared = Arc::new(Shared::new("r".into(), &SessionConfig::default()));
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = Session::from_parts(Arc::clone(&shared), tx);
        shared.state.send_replace(SessionState::Degraded);

        let err = session
            .reconfigure(ReconfigureOptions {
                pointer_sensitivity: Some(10),
                change: ConfigChange {
                    clipboard: Some(false),
                    ..Default::default()
                },
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            VdiError::RequiresRenegotiation {
                state: SessionState::Degraded
            }
        ));
        // Rejected as a whole: local option untouched.
        assert_eq!(session.settings().pointer_sensitivity, 50);

        session
            .reconfigure(ReconfigureOptions {
                keyboard_layout: Some("fr-FR".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(session.settings().keyboard_layout, "fr-FR");
    }
}
