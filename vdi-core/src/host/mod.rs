//! Host side of the protocol.
//!
//! A small but complete remote end: accepts connections, answers fresh and
//! resume handshakes, echoes probes, acknowledges reconfiguration, streams
//! synthetic display updates and records the input it receives. Sessions
//! outlive their connections, so a client can drop and resume.
//!
//! [`HostHandle`] exposes controls to misbehave on purpose (drop links,
//! refuse handshakes, lose frames, ignore probes) for testing the client.

mod connection;

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpListener, ToSocketAddrs};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::protocol::control::ConfigChange;
use crate::protocol::input::InputMessage;
use crate::session::lock;
use crate::state::Capabilities;
use crate::transport::Channel;
use crate::types::{SessionId, SessionToken};

// ── HostConfig ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Capabilities offered in `Welcome`.
    pub capabilities: Capabilities,
    /// Pace of synthetic display updates; `None` sends none.
    pub frame_interval: Option<Duration>,
    /// Payload bytes per synthetic update.
    pub frame_size: usize,
    /// When set, `Hello` must carry exactly this token.
    pub expected_token: Option<String>,
    pub handshake_timeout: Duration,
    pub close_timeout: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            capabilities: Capabilities::default(),
            frame_interval: Some(Duration::from_millis(33)),
            frame_size: 1024,
            expected_token: None,
            handshake_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(3),
        }
    }
}

// ── Per-session record ───────────────────────────────────────────

/// What the host knows about one session.
#[derive(Debug, Clone)]
pub struct HostSession {
    pub id: SessionId,
    pub token: SessionToken,
    pub capabilities: Capabilities,
    /// Sequence of the next display update.
    pub next_frame: u64,
    pub frames_sent: u64,
    /// The most recent input, oldest first, at most [`MAX_RECORDED_INPUTS`].
    pub inputs: VecDeque<InputMessage>,
    /// Accepted reconfigurations, oldest first.
    pub changes: Vec<ConfigChange>,
    pub resumes: u32,
}

/// Input kept per session before the oldest entries are discarded.
pub const MAX_RECORDED_INPUTS: usize = 4096;

impl HostSession {
    pub(crate) fn record_input(&mut self, msg: InputMessage) {
        if self.inputs.len() == MAX_RECORDED_INPUTS {
            self.inputs.pop_front();
        }
        self.inputs.push_back(msg);
    }
}

// ── Shared state ─────────────────────────────────────────────────

#[derive(Debug)]
struct HostShared {
    config: HostConfig,
    stop: CancellationToken,
    accepting: AtomicBool,
    echo_probes: AtomicBool,
    reject: Mutex<Option<String>>,
    skip_frames: AtomicU64,
    sessions: Mutex<HashMap<SessionId, HostSession>>,
    connections: Mutex<HashMap<u64, CancellationToken>>,
    next_connection: AtomicU64,
}

// ── HostService ──────────────────────────────────────────────────

pub struct HostService {
    listener: TcpListener,
    shared: Arc<HostShared>,
}

impl HostService {
    pub async fn bind(addr: impl ToSocketAddrs, config: HostConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            shared: Arc::new(HostShared {
                config,
                stop: CancellationToken::new(),
                accepting: AtomicBool::new(true),
                echo_probes: AtomicBool::new(true),
                reject: Mutex::new(None),
                skip_frames: AtomicU64::new(0),
                sessions: Mutex::new(HashMap::new()),
                connections: Mutex::new(HashMap::new()),
                next_connection: AtomicU64::new(0),
            }),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> HostHandle {
        HostHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Run the accept loop on a background task.
    pub fn spawn(self) -> HostHandle {
        let handle = self.handle();
        tokio::spawn(self.run());
        handle
    }

    /// Accept connections until stopped.
    pub async fn run(self) {
        let shared = self.shared;
        if let Ok(addr) = self.listener.local_addr() {
            info!("host listening on {addr}");
        }

        loop {
            let accept = tokio::select! {
                _ = shared.stop.cancelled() => break,
                result = self.listener.accept() => result,
            };

            let (stream, peer) = match accept {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept error: {e}");
                    continue;
                }
            };

            if !shared.accepting.load(Ordering::SeqCst) {
                debug!(%peer, "not accepting; closing connection");
                drop(stream);
                continue;
            }
            let _ = stream.set_nodelay(true);
            info!(%peer, "client connected");

            let id = shared.next_connection.fetch_add(1, Ordering::SeqCst);
            let cancel = shared.stop.child_token();
            lock(&shared.connections).insert(id, cancel.clone());

            let channel = Channel::new(Box::new(stream), peer.to_string());
            let conn_shared = Arc::clone(&shared);
            tokio::spawn(async move {
                connection::serve(channel, &conn_shared, cancel).await;
                lock(&conn_shared.connections).remove(&id);
                debug!(%peer, "connection finished");
            });
        }

        info!("host stopped");
    }
}

// ── HostHandle ───────────────────────────────────────────────────

/// Control and inspection handle for a running host.
#[derive(Debug, Clone)]
pub struct HostHandle {
    shared: Arc<HostShared>,
}

impl HostHandle {
    /// Stop accepting and close every connection.
    pub fn stop(&self) {
        self.shared.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stop.is_cancelled()
    }

    /// Abruptly cut every live connection without a `Goodbye`. Sessions
    /// are kept and can be resumed.
    pub fn drop_connections(&self) {
        let dropped: Vec<_> = lock(&self.shared.connections).drain().collect();
        info!(count = dropped.len(), "dropping live connections");
        for (_, cancel) in dropped {
            cancel.cancel();
        }
    }

    /// While `false`, new connections are closed as soon as they are
    /// accepted.
    pub fn set_accepting(&self, accepting: bool) {
        self.shared.accepting.store(accepting, Ordering::SeqCst);
    }

    /// Answer every `Hello` with `Reject { reason }`, or stop doing so.
    pub fn set_reject(&self, reason: Option<String>) {
        *lock(&self.shared.reject) = reason;
    }

    /// Skip `count` frame sequence numbers before the next update.
    pub fn skip_frames(&self, count: u64) {
        self.shared.skip_frames.fetch_add(count, Ordering::SeqCst);
    }

    pub fn set_echo_probes(&self, echo: bool) {
        self.shared.echo_probes.store(echo, Ordering::SeqCst);
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.shared.connections).len()
    }

    pub fn session(&self, id: SessionId) -> Option<HostSession> {
        lock(&self.shared.sessions).get(&id).cloned()
    }

    pub fn sessions(&self) -> Vec<HostSession> {
        lock(&self.shared.sessions).values().cloned().collect()
    }

    /// Input received for `id`, in arrival order.
    pub fn received_input(&self, id: SessionId) -> Vec<InputMessage> {
        lock(&self.shared.sessions)
            .get(&id)
            .map(|s| s.inputs.iter().copied().collect())
            .unwrap_or_default()
    }
}
