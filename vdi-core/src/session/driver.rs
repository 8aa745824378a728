//! The per-session task.
//!
//! One task per session owns the state machine, the transport channel,
//! both halves of the multiplexer, the quality monitor and the input
//! relay. Handles talk to it through an unbounded command queue and read
//! what it publishes in [`Shared`]. Events are processed one at a time, so
//! state transitions are serialised.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Command, Counters, Session, SessionConfig, Shared, lock};
use crate::error::{ChannelError, ConnectError, SessionFailure, VdiError};
use crate::mux::{Demultiplexer, Demuxed, Multiplexer, Outbound};
use crate::protocol::control::{ConfigChange, ControlMessage, Resolution};
use crate::quality::QualityMonitor;
use crate::relay::InputRelay;
use crate::state::{Capabilities, PROTOCOL_VERSION, SessionEvent, SessionMachine, SessionState};
use crate::transport::{Channel, Connector, Resolver};
use crate::types::{ResourceId, SessionToken};

/// Why a phase of the session task stopped early.
enum Halt {
    /// `disconnect` was requested.
    Cancelled,
    Failed(SessionFailure),
}

impl From<ConnectError> for Halt {
    fn from(e: ConnectError) -> Self {
        Halt::Failed(e.into())
    }
}

impl From<ChannelError> for Halt {
    fn from(e: ChannelError) -> Self {
        Halt::Failed(e.into())
    }
}

/// How a streaming period ended.
enum LinkEnd {
    Disconnect,
    Lost(ChannelError),
}

struct PendingReconfigure {
    change: ConfigChange,
    reply: oneshot::Sender<Result<(), VdiError>>,
    sent_at: Instant,
}

/// Race `fut` against the cancellation token.
async fn cancellable<F: Future>(cancel: &CancellationToken, fut: F) -> Result<F::Output, Halt> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Halt::Cancelled),
        out = fut => Ok(out),
    }
}

/// Create a session and start its task.
pub(crate) fn spawn(
    resource: ResourceId,
    token: SessionToken,
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    resolver: Arc<dyn Resolver>,
) -> Session {
    let shared = Arc::new(Shared::new(resource, &config));
    let (tx, rx) = mpsc::unbounded_channel();

    let driver = Driver {
        machine: SessionMachine::new(config.hysteresis, config.reconnect),
        mux: Multiplexer::new(shared.id),
        demux: Demultiplexer::new(shared.id),
        monitor: QualityMonitor::new(config.thresholds, config.loss_alpha, config.probe_timeout),
        relay: InputRelay::new(shared.id),
        channel: None,
        capabilities: None,
        next_request_id: 0,
        pending: HashMap::new(),
        cancel: shared.cancel.clone(),
        shared: Arc::clone(&shared),
        commands: rx,
        connector,
        resolver,
        token,
        config,
    };
    tokio::spawn(driver.run());

    Session::from_parts(shared, tx)
}

struct Driver {
    shared: Arc<Shared>,
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    resolver: Arc<dyn Resolver>,
    token: SessionToken,
    commands: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,

    machine: SessionMachine,
    mux: Multiplexer,
    demux: Demultiplexer,
    monitor: QualityMonitor,
    relay: InputRelay,
    channel: Option<Channel>,
    capabilities: Option<Capabilities>,

    next_request_id: u64,
    pending: HashMap<u64, PendingReconfigure>,
}

impl Driver {
    async fn run(mut self) {
        info!(
            session_id = %self.shared.id,
            resource_id = %self.shared.resource,
            "session starting"
        );
        self.transition(SessionEvent::Connect);

        match self.establish().await {
            Ok(()) => {}
            Err(Halt::Cancelled) => return self.close().await,
            Err(Halt::Failed(failure)) => return self.fail(failure).await,
        }

        loop {
            match self.stream().await {
                LinkEnd::Disconnect => return self.close().await,
                LinkEnd::Lost(cause) => {
                    warn!(session_id = %self.shared.id, "transport lost: {cause}");
                    self.drop_link();
                    self.transition(SessionEvent::TransportLost);
                    match self.reconnect().await {
                        Ok(()) => continue,
                        Err(Halt::Cancelled) => return self.close().await,
                        Err(Halt::Failed(failure)) => return self.fail(failure).await,
                    }
                }
            }
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    fn transition(&mut self, event: SessionEvent) {
        let from = self.machine.state();
        match self.machine.apply(event) {
            Ok(to) if to != from => {
                info!(
                    session_id = %self.shared.id,
                    resource_id = %self.shared.resource,
                    %from,
                    state = %to,
                    "session state changed"
                );
                self.shared.state.send_replace(to);
            }
            Ok(_) => {}
            Err(e) => warn!(session_id = %self.shared.id, "{e}"),
        }
    }

    async fn fail(&mut self, failure: SessionFailure) {
        error!(
            session_id = %self.shared.id,
            resource_id = %self.shared.resource,
            "session failed: {failure}"
        );
        *lock(&self.shared.last_error) = Some(failure);
        if let Some(mut channel) = self.channel.take() {
            channel.close(Duration::ZERO).await;
        }
        self.reject_pending(|| ChannelError::Closed.into());
        let event = match self.machine.state() {
            SessionState::Reconnecting => SessionEvent::ReconnectFailed,
            _ => SessionEvent::ConnectFailed,
        };
        self.transition(event);
    }

    async fn close(&mut self) {
        self.transition(SessionEvent::Disconnect);
        if let Some(mut channel) = self.channel.take() {
            if let Err(e) = self.mux.control(ControlMessage::Goodbye) {
                debug!(session_id = %self.shared.id, "goodbye not sent: {e}");
            }
            channel.close(self.config.close_timeout).await;
        }
        self.mux.detach();
        self.reject_pending(|| ChannelError::Closed.into());
        self.transition(SessionEvent::CloseConfirmed);
    }

    // ── Establishment ────────────────────────────────────────────

    async fn open_channel(&mut self) -> Result<(), ConnectError> {
        let address = self.resolver.resolve(&self.shared.resource).ok_or_else(|| {
            ConnectError::Refused(format!("no address for resource {}", self.shared.resource))
        })?;
        debug!(session_id = %self.shared.id, %address, "opening channel");
        let channel =
            Channel::open(self.connector.as_ref(), &address, self.config.connect_timeout).await?;
        self.mux.attach(channel.sender());
        self.demux.reset_control();
        self.channel = Some(channel);
        Ok(())
    }

    fn drop_link(&mut self) {
        self.channel = None;
        self.mux.detach();
        self.monitor.reset_probes();
        self.reject_pending(|| ChannelError::Closed.into());
    }

    async fn establish(&mut self) -> Result<(), Halt> {
        let cancel = self.cancel.clone();

        cancellable(&cancel, self.open_channel()).await??;
        self.transition(SessionEvent::TransportOpened);

        let limit = self.config.negotiation_timeout;
        let negotiated = cancellable(&cancel, tokio::time::timeout(limit, self.negotiate()))
            .await?
            .map_err(|_| ConnectError::Timeout(limit))??;

        info!(
            session_id = %self.shared.id,
            codec = ?negotiated.preferred_codec(),
            "capabilities negotiated"
        );
        self.adopt(negotiated);
        self.transition(SessionEvent::Negotiated);
        Ok(())
    }

    fn adopt(&mut self, caps: Capabilities) {
        self.mux.set_frame_compression(caps.compression);
        self.mux.set_max_payload(caps.max_payload_size);
        self.demux.set_max_payload(caps.max_payload_size);
        lock(&self.shared.settings).negotiated(&caps);
        self.shared.capabilities.send_replace(Some(caps.clone()));
        self.capabilities = Some(caps);
    }

    /// Hello → Welcome → Accept → Ready.
    async fn negotiate(&mut self) -> Result<Capabilities, Halt> {
        let local = self.config.capabilities.clone();
        self.mux.control(ControlMessage::Hello {
            version: PROTOCOL_VERSION,
            token: self.token.clone(),
            capabilities: local.clone(),
            resume: None,
        })
        .map_err(handshake_send_failure)?;

        let remote = match self.next_control().await? {
            ControlMessage::Welcome { capabilities } => capabilities,
            other => return Err(unexpected(other).into()),
        };
        let negotiated = local.negotiate(&remote)?;

        self.mux
            .control(ControlMessage::Accept {
                capabilities: negotiated.clone(),
            })
            .map_err(handshake_send_failure)?;

        match self.next_control().await? {
            ControlMessage::Ready => Ok(negotiated),
            other => Err(unexpected(other).into()),
        }
    }

    /// Hello(resume) → Resumed.
    async fn resume(&mut self) -> Result<(), Halt> {
        self.open_channel().await?;
        let caps = self.capabilities.clone();
        self.mux
            .control(ControlMessage::Hello {
                version: PROTOCOL_VERSION,
                token: self.token.clone(),
                capabilities: self.config.capabilities.clone(),
                resume: caps,
            })
            .map_err(handshake_send_failure)?;

        match self.next_control().await? {
            ControlMessage::Resumed => Ok(()),
            other => Err(unexpected(other).into()),
        }
    }

    /// Wait for the next control message during a handshake. Anything else
    /// that arrives is handled as usual.
    async fn next_control(&mut self) -> Result<ControlMessage, Halt> {
        loop {
            let Some(channel) = self.channel.as_mut() else {
                return Err(ChannelError::Closed.into());
            };
            let Some(packet) = channel.receive().await else {
                return Err(channel.failure().unwrap_or(ChannelError::Closed).into());
            };
            match self.demux.demux(packet) {
                Demuxed::Control { message, .. } => return Ok(message),
                other => {
                    if self.absorb(other).is_some() {
                        return Err(ChannelError::Closed.into());
                    }
                }
            }
        }
    }

    // ── Reconnection ─────────────────────────────────────────────

    async fn reconnect(&mut self) -> Result<(), Halt> {
        let cancel = self.cancel.clone();
        let mut last = String::from("transport lost");

        while let Some(delay) = self.machine.next_backoff() {
            let attempt = self.machine.reconnect_failures() + 1;
            Counters::bump(&self.shared.counters.reconnect_attempts, 1);
            info!(
                session_id = %self.shared.id,
                attempt,
                ?delay,
                "reconnecting"
            );
            cancellable(&cancel, tokio::time::sleep(delay)).await?;

            let limit = self.config.negotiation_timeout;
            let outcome = match cancellable(&cancel, tokio::time::timeout(limit, self.resume()))
                .await?
            {
                Ok(result) => result,
                Err(_) => Err(ConnectError::Timeout(limit).into()),
            };

            match outcome {
                Ok(()) => {
                    info!(session_id = %self.shared.id, attempt, "session resumed");
                    self.transition(SessionEvent::Reconnected);
                    return Ok(());
                }
                Err(Halt::Cancelled) => return Err(Halt::Cancelled),
                Err(Halt::Failed(failure)) => {
                    warn!(session_id = %self.shared.id, attempt, "reconnect failed: {failure}");
                    last = failure.to_string();
                    self.drop_link();
                    let failures = self.machine.reconnect_failures() + 1;
                    if failures >= self.config.reconnect.max_attempts {
                        // The final transition happens in `fail`, after the
                        // error is recorded.
                        return Err(Halt::Failed(SessionFailure::ReconnectExhausted {
                            attempts: failures,
                            last,
                        }));
                    }
                    self.transition(SessionEvent::ReconnectFailed);
                }
            }
        }

        Err(Halt::Failed(SessionFailure::ReconnectExhausted {
            attempts: self.machine.reconnect_failures(),
            last,
        }))
    }

    // ── Streaming ────────────────────────────────────────────────

    async fn stream(&mut self) -> LinkEnd {
        let cancel = self.cancel.clone();

        let mut probe = tokio::time::interval(self.config.probe_interval);
        probe.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut input = tokio::time::interval(self.config.input_tick);
        input.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let Some(channel) = self.channel.as_mut() else {
                return LinkEnd::Lost(ChannelError::Closed);
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return LinkEnd::Disconnect,
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    // Every handle is gone.
                    None => return LinkEnd::Disconnect,
                },
                packet = channel.receive() => match packet {
                    Some(packet) => {
                        let demuxed = self.demux.demux(packet);
                        if let Some(end) = self.absorb(demuxed) {
                            return end;
                        }
                    }
                    None => {
                        let cause = channel_failure(self.channel.as_ref());
                        return LinkEnd::Lost(cause);
                    }
                },
                _ = probe.tick() => {
                    if let Err(cause) = self.probe_tick() {
                        return LinkEnd::Lost(cause);
                    }
                }
                _ = input.tick() => self.flush_input(),
            }
        }
    }

    /// Handle one demultiplexed inbound message.
    fn absorb(&mut self, demuxed: Demuxed) -> Option<LinkEnd> {
        let counters = &self.shared.counters;
        match demuxed {
            Demuxed::Frame { update, gap } => {
                if let Some(gap) = gap {
                    debug!(
                        session_id = %self.shared.id,
                        expected = gap.expected,
                        received = gap.received,
                        "frame gap"
                    );
                    self.monitor.record_gap(gap.missing());
                    Counters::bump(&counters.frames_missing, gap.missing());
                }
                self.monitor.record_frames(1);
                Counters::bump(&counters.frames_delivered, 1);
                // No subscribers is fine.
                let _ = self.shared.frames.send(update);
            }
            Demuxed::Control { message, .. } => return self.on_control(message),
            Demuxed::Input(msg) => {
                debug!(session_id = %self.shared.id, sequence = msg.sequence, "ignoring inbound input");
            }
            Demuxed::Dropped(_) => Counters::bump(&counters.packets_dropped, 1),
        }
        None
    }

    fn on_control(&mut self, message: ControlMessage) -> Option<LinkEnd> {
        match message {
            ControlMessage::ProbeEcho { nonce } => {
                if let Some(rtt) = self.monitor.record_echo(nonce, Instant::now()) {
                    debug!(session_id = %self.shared.id, nonce, ?rtt, "probe echo");
                }
            }
            ControlMessage::Probe { nonce } => {
                let _ = self.mux.control(ControlMessage::ProbeEcho { nonce });
            }
            ControlMessage::ReconfigureAck {
                request_id,
                accepted,
            } => {
                let Some(pending) = self.pending.remove(&request_id) else {
                    debug!(session_id = %self.shared.id, request_id, "stale reconfigure ack");
                    return None;
                };
                let result = if accepted {
                    lock(&self.shared.settings).apply_change(&pending.change);
                    info!(session_id = %self.shared.id, request_id, "reconfiguration applied");
                    Ok(())
                } else {
                    Err(VdiError::ReconfigureRejected)
                };
                let _ = pending.reply.send(result);
            }
            ControlMessage::Goodbye => {
                info!(session_id = %self.shared.id, "host closed the session");
                return Some(LinkEnd::Lost(ChannelError::Closed));
            }
            other => {
                debug!(session_id = %self.shared.id, "ignoring {} while streaming", other.name());
            }
        }
        None
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Input(event) => {
                let accepted = self.machine.state() == SessionState::Streaming
                    && self
                        .capabilities
                        .as_ref()
                        .is_some_and(|c| c.input.contains(event.required_kind()));
                if !accepted {
                    Counters::bump(&self.shared.counters.inputs_discarded, 1);
                    return;
                }

                let before = self.relay.coalesced();
                for msg in self.relay.submit(event) {
                    self.send_input(msg);
                }
                Counters::bump(
                    &self.shared.counters.pointer_moves_coalesced,
                    self.relay.coalesced() - before,
                );
            }
            Command::Reconfigure { change, reply } => {
                let state = self.machine.state();
                if state != SessionState::Streaming {
                    let _ = reply.send(Err(VdiError::RequiresRenegotiation { state }));
                    return;
                }
                if let Err(e) = self.check_change(&change) {
                    let _ = reply.send(Err(e));
                    return;
                }

                let request_id = self.next_request_id;
                self.next_request_id += 1;
                let sent = self.mux.control(ControlMessage::Reconfigure {
                    request_id,
                    change: change.clone(),
                });
                match sent {
                    Ok(()) => {
                        self.pending.insert(
                            request_id,
                            PendingReconfigure {
                                change,
                                reply,
                                sent_at: Instant::now(),
                            },
                        );
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
        }
    }

    /// A peer option may only select what was negotiated.
    fn check_change(&self, change: &ConfigChange) -> Result<(), VdiError> {
        let Some(caps) = self.capabilities.as_ref() else {
            return Err(VdiError::RequiresRenegotiation {
                state: self.machine.state(),
            });
        };
        if let Some(codec) = change.codec
            && !caps.codecs.contains(&codec)
        {
            return Err(VdiError::InvalidOption(format!(
                "codec {codec:?} was not negotiated"
            )));
        }
        if change.clipboard == Some(true) && !caps.clipboard {
            return Err(VdiError::InvalidOption("clipboard was not negotiated".into()));
        }
        if change.device_redirection == Some(true) && !caps.device_redirection {
            return Err(VdiError::InvalidOption(
                "device redirection was not negotiated".into(),
            ));
        }
        if let Some(Resolution::Fixed { width, height }) = change.resolution
            && (width == 0 || height == 0)
        {
            return Err(VdiError::InvalidOption(format!(
                "invalid resolution {width}x{height}"
            )));
        }
        Ok(())
    }

    fn send_input(&mut self, msg: crate::protocol::input::InputMessage) {
        if let Err(e) = self.mux.submit_outbound(Outbound::Input(msg)) {
            debug!(session_id = %self.shared.id, sequence = msg.sequence, "input not sent: {e}");
        }
    }

    fn flush_input(&mut self) {
        if let Some(msg) = self.relay.tick() {
            self.send_input(msg);
        }
    }

    /// Expire probes, publish a sample, send the next probe.
    fn probe_tick(&mut self) -> Result<(), ChannelError> {
        let now = Instant::now();

        let expired = self.monitor.expire_probes(now);
        if expired > 0 {
            Counters::bump(&self.shared.counters.probe_timeouts, expired as u64);
            debug!(
                session_id = %self.shared.id,
                consecutive = self.monitor.consecutive_timeouts(),
                "probe timed out"
            );
        }
        if self.monitor.consecutive_timeouts() >= self.config.probe_failure_limit {
            return Err(ChannelError::Closed);
        }

        if let Some(sample) = self.monitor.close_interval(now) {
            debug!(
                session_id = %self.shared.id,
                latency_ms = sample.latency_ms,
                loss = sample.loss_rate,
                class = %sample.classification,
                "quality sample"
            );
            self.shared.quality.send_replace(Some(sample));
            self.transition(SessionEvent::Quality(sample.classification));
        }

        self.expire_reconfigures(now);

        let nonce = self.monitor.start_probe(now);
        self.mux
            .control(ControlMessage::Probe { nonce })
            .map_err(|_| ChannelError::Closed)
    }

    fn expire_reconfigures(&mut self, now: Instant) {
        let limit = self.config.negotiation_timeout;
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.sent_at) >= limit)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(p) = self.pending.remove(&id) {
                let _ = p.reply.send(Err(VdiError::Timeout(limit)));
            }
        }
    }

    fn reject_pending(&mut self, err: impl Fn() -> VdiError) {
        for (_, p) in self.pending.drain() {
            let _ = p.reply.send(Err(err()));
        }
    }
}

fn channel_failure(channel: Option<&Channel>) -> ChannelError {
    channel
        .and_then(Channel::failure)
        .unwrap_or(ChannelError::Closed)
}

fn handshake_send_failure(e: VdiError) -> Halt {
    match e {
        VdiError::Channel(c) => c.into(),
        other => ConnectError::ProtocolMismatch(other.to_string()).into(),
    }
}

fn unexpected(message: ControlMessage) -> ConnectError {
    match message {
        ControlMessage::Reject { reason } => ConnectError::ProtocolMismatch(reason),
        other => ConnectError::ProtocolMismatch(format!("unexpected {}", other.name())),
    }
}
