//! One client connection on the host.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;

use bytes::Bytes;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{HostSession, HostShared};
use crate::mux::{Demultiplexer, Demuxed, Multiplexer, Outbound};
use crate::protocol::control::{ConfigChange, ControlMessage};
use crate::protocol::frame::{FrameUpdate, RegionBounds};
use crate::session::lock;
use crate::state::{Capabilities, PROTOCOL_VERSION};
use crate::transport::Channel;
use crate::types::{SessionId, SessionToken};

pub(super) async fn serve(mut channel: Channel, shared: &HostShared, cancel: CancellationToken) {
    let peer = channel.peer().to_string();
    let mut demux = Demultiplexer::unbound();

    let first = tokio::select! {
        _ = cancel.cancelled() => return,
        first = tokio::time::timeout(
            shared.config.handshake_timeout,
            first_control(&mut channel, &mut demux),
        ) => first,
    };
    let Ok(Some((session_id, hello))) = first else {
        warn!(%peer, "no Hello received");
        return;
    };

    demux.bind(session_id);
    let mut mux = Multiplexer::new(session_id);
    mux.attach(channel.sender());

    let admitted = tokio::select! {
        _ = cancel.cancelled() => return,
        admitted = admit(shared, session_id, hello, &mut channel, &mut demux, &mut mux) => admitted,
    };
    let Some(caps) = admitted else {
        channel.close(shared.config.close_timeout).await;
        return;
    };
    mux.set_frame_compression(caps.compression);
    mux.set_max_payload(caps.max_payload_size);
    demux.set_max_payload(caps.max_payload_size);

    let mut frames = shared.config.frame_interval.map(|period| {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval
    });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(%peer, %session_id, "connection cut");
                return;
            }
            packet = channel.receive() => {
                let Some(packet) = packet else {
                    info!(%peer, %session_id, "client went away");
                    return;
                };
                match demux.demux(packet) {
                    Demuxed::Control { message: ControlMessage::Goodbye, .. } => {
                        info!(%peer, %session_id, "client said goodbye");
                        lock(&shared.sessions).remove(&session_id);
                        channel.close(shared.config.close_timeout).await;
                        return;
                    }
                    Demuxed::Control { message, .. } => {
                        on_control(shared, session_id, message, &mut mux);
                    }
                    Demuxed::Input(msg) => {
                        if let Some(record) = lock(&shared.sessions).get_mut(&session_id) {
                            record.record_input(msg);
                        }
                    }
                    Demuxed::Frame { .. } | Demuxed::Dropped(_) => {}
                }
            }
            _ = next_tick(&mut frames) => {
                if let Err(e) = send_frame(shared, session_id, &mut mux) {
                    debug!(%peer, %session_id, "frame not sent: {e}");
                }
            }
        }
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// First control message and the session id it was tagged with.
async fn first_control(
    channel: &mut Channel,
    demux: &mut Demultiplexer,
) -> Option<(SessionId, ControlMessage)> {
    loop {
        let packet = channel.receive().await?;
        let session_id = packet.session_id();
        if let Demuxed::Control { message, .. } = demux.demux(packet) {
            return Some((session_id, message));
        }
    }
}

async fn next_control(channel: &mut Channel, demux: &mut Demultiplexer) -> Option<ControlMessage> {
    first_control(channel, demux).await.map(|(_, message)| message)
}

/// Run the handshake. Returns the session's capabilities once streaming
/// may start.
async fn admit(
    shared: &HostShared,
    session_id: SessionId,
    hello: ControlMessage,
    channel: &mut Channel,
    demux: &mut Demultiplexer,
    mux: &mut Multiplexer,
) -> Option<Capabilities> {
    let name = hello.name();
    let ControlMessage::Hello {
        version,
        token,
        capabilities: offered,
        resume,
    } = hello
    else {
        reject(mux, format!("expected Hello, got {name}"));
        return None;
    };

    if let Some(reason) = lock(&shared.reject).clone() {
        reject(mux, reason);
        return None;
    }
    if version != PROTOCOL_VERSION {
        reject(
            mux,
            format!("unsupported protocol version {version}, expected {PROTOCOL_VERSION}"),
        );
        return None;
    }
    if let Some(expected) = &shared.config.expected_token
        && token.as_str() != expected
    {
        reject(mux, "invalid session token".into());
        return None;
    }

    if let Some(previous) = resume {
        return resume_session(shared, session_id, previous, mux);
    }

    mux.control(ControlMessage::Welcome {
        capabilities: shared.config.capabilities.clone(),
    })
    .ok()?;

    let timeout = shared.config.handshake_timeout;
    let negotiated = match tokio::time::timeout(timeout, next_control(channel, demux)).await {
        Ok(Some(ControlMessage::Accept { capabilities })) => capabilities,
        Ok(Some(other)) => {
            reject(mux, format!("expected Accept, got {}", other.name()));
            return None;
        }
        Ok(None) | Err(_) => {
            debug!(%session_id, "client left during negotiation");
            return None;
        }
    };

    // The client must not pick anything this host never offered.
    if !negotiated.is_within(&shared.config.capabilities) || !negotiated.is_within(&offered) {
        reject(mux, "accepted capabilities exceed the offer".into());
        return None;
    }

    lock(&shared.sessions).insert(session_id, new_record(session_id, token, &negotiated, &offered));
    mux.control(ControlMessage::Ready).ok()?;
    info!(%session_id, codec = ?negotiated.preferred_codec(), "session ready");
    Some(negotiated)
}

fn new_record(
    id: SessionId,
    token: SessionToken,
    negotiated: &Capabilities,
    offered: &Capabilities,
) -> HostSession {
    debug!(%id, ?offered, "recording new session");
    HostSession {
        id,
        token,
        capabilities: negotiated.clone(),
        next_frame: 0,
        frames_sent: 0,
        inputs: VecDeque::new(),
        changes: Vec::new(),
        resumes: 0,
    }
}

fn resume_session(
    shared: &HostShared,
    session_id: SessionId,
    previous: Capabilities,
    mux: &mut Multiplexer,
) -> Option<Capabilities> {
    let caps = {
        let mut sessions = lock(&shared.sessions);
        match sessions.get_mut(&session_id) {
            Some(record) if record.capabilities == previous => {
                record.resumes += 1;
                Some(record.capabilities.clone())
            }
            _ => None,
        }
    };

    match caps {
        Some(caps) => {
            mux.control(ControlMessage::Resumed).ok()?;
            info!(%session_id, "session resumed");
            Some(caps)
        }
        None => {
            reject(mux, format!("cannot resume session {session_id}"));
            None
        }
    }
}

fn reject(mux: &mut Multiplexer, reason: String) {
    warn!(session_id = %mux.session_id(), %reason, "rejecting handshake");
    let _ = mux.control(ControlMessage::Reject { reason });
}

fn on_control(
    shared: &HostShared,
    session_id: SessionId,
    message: ControlMessage,
    mux: &mut Multiplexer,
) {
    match message {
        ControlMessage::Probe { nonce } => {
            if shared.echo_probes.load(Ordering::SeqCst) {
                let _ = mux.control(ControlMessage::ProbeEcho { nonce });
            }
        }
        ControlMessage::Reconfigure { request_id, change } => {
            let accepted = {
                let mut sessions = lock(&shared.sessions);
                match sessions.get_mut(&session_id) {
                    Some(record) if allowed(&record.capabilities, &change) => {
                        record.changes.push(change);
                        true
                    }
                    _ => false,
                }
            };
            info!(%session_id, request_id, accepted, "reconfigure");
            let _ = mux.control(ControlMessage::ReconfigureAck {
                request_id,
                accepted,
            });
        }
        other => debug!(%session_id, "ignoring {}", other.name()),
    }
}

fn allowed(caps: &Capabilities, change: &ConfigChange) -> bool {
    change.codec.is_none_or(|c| caps.codecs.contains(&c))
        && (change.clipboard != Some(true) || caps.clipboard)
        && (change.device_redirection != Some(true) || caps.device_redirection)
}

fn send_frame(
    shared: &HostShared,
    session_id: SessionId,
    mux: &mut Multiplexer,
) -> Result<(), crate::error::VdiError> {
    let sequence = {
        let mut sessions = lock(&shared.sessions);
        let Some(record) = sessions.get_mut(&session_id) else {
            return Ok(());
        };
        let skip = shared.skip_frames.swap(0, Ordering::SeqCst);
        let sequence = record.next_frame + skip;
        record.next_frame = sequence + 1;
        record.frames_sent += 1;
        sequence
    };

    let fill = (sequence % 251) as u8;
    let update = FrameUpdate {
        session_id,
        sequence,
        region: RegionBounds {
            x: 0,
            y: 0,
            width: 64,
            height: 64,
        },
        payload: Bytes::from(vec![fill; shared.config.frame_size]),
    };
    mux.submit_outbound(Outbound::Frame(update))
}
