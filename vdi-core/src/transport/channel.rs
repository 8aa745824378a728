//! Framed transport channel.
//!
//! Splits one stream into a writer task and a reader task connected to
//! the caller by channels, with graceful close and a bounded drain.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::codec::VdiCodec;
use crate::error::{ChannelError, ConnectError};
use crate::packet::Packet;
use crate::transport::connector::{BoxedStream, Connector};

/// Inbound packets buffered between the reader task and the consumer.
const INBOUND_BUFFER: usize = 256;

/// Lower bound on waiting for the reader task during close.
const READER_JOIN: Duration = Duration::from_millis(100);

type FailureSlot = Arc<Mutex<Option<ChannelError>>>;

fn record(slot: &FailureSlot, err: ChannelError) {
    if let Ok(mut guard) = slot.lock() {
        guard.get_or_insert(err);
    }
}

fn recorded(slot: &FailureSlot) -> Option<ChannelError> {
    slot.lock().ok().and_then(|guard| guard.clone())
}

// ── ChannelSender ────────────────────────────────────────────────

/// Cloneable, non-blocking handle for queueing outbound packets.
#[derive(Debug, Clone)]
pub struct ChannelSender {
    tx: mpsc::UnboundedSender<Packet>,
    shutdown: CancellationToken,
    failure: FailureSlot,
}

impl ChannelSender {
    /// Queue a packet for the writer task. Never waits on the socket.
    pub fn send(&self, packet: Packet) -> Result<(), ChannelError> {
        if self.shutdown.is_cancelled() {
            return Err(recorded(&self.failure).unwrap_or(ChannelError::Closed));
        }
        self.tx
            .send(packet)
            .map_err(|_| recorded(&self.failure).unwrap_or(ChannelError::Closed))
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.tx.is_closed()
    }
}

// ── Channel ──────────────────────────────────────────────────────

/// One open transport stream. Owns the socket exclusively through its
/// reader and writer tasks.
#[derive(Debug)]
pub struct Channel {
    sender: ChannelSender,
    rx: mpsc::Receiver<Packet>,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
    /// Set by `close`; the writer drains its queue and shuts the sink.
    closing: CancellationToken,
    /// Set when either task stops; everything tears down.
    shutdown: CancellationToken,
    failure: FailureSlot,
    peer: String,
}

impl Channel {
    /// Connect to `address` and start framing.
    pub async fn open(
        connector: &dyn Connector,
        address: &str,
        timeout: Duration,
    ) -> Result<Self, ConnectError> {
        let stream = tokio::time::timeout(timeout, connector.connect(address))
            .await
            .map_err(|_| ConnectError::Timeout(timeout))??;
        Ok(Self::new(stream, address))
    }

    /// Wrap an established stream (client or accepted server side).
    pub fn new(stream: BoxedStream, peer: impl Into<String>) -> Self {
        let peer = peer.into();
        let (mut net_writer, mut net_reader) = Framed::new(stream, VdiCodec).split();

        // User -> Network
        let (user_tx, mut network_rx) = mpsc::unbounded_channel::<Packet>();
        // Network -> User
        let (network_tx, user_rx) = mpsc::channel(INBOUND_BUFFER);

        let closing = CancellationToken::new();
        let shutdown = CancellationToken::new();
        let failure: FailureSlot = Arc::new(Mutex::new(None));

        // Writer task: User -> Network
        let writer = tokio::spawn({
            let closing = closing.clone();
            let shutdown = shutdown.clone();
            let failure = Arc::clone(&failure);
            let peer = peer.clone();
            async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => return,
                        _ = closing.cancelled() => break,
                        next = network_rx.recv() => match next {
                            Some(packet) => {
                                if let Err(e) = net_writer.send(packet).await {
                                    warn!(%peer, "channel write failed: {e}");
                                    record(&failure, ChannelError::WriteFailed(e.to_string()));
                                    shutdown.cancel();
                                    return;
                                }
                            }
                            None => break,
                        },
                    }
                }

                // Drain whatever was queued before close, then shut down the
                // write half so the peer sees EOF.
                network_rx.close();
                while let Some(packet) = network_rx.recv().await {
                    if net_writer.send(packet).await.is_err() {
                        break;
                    }
                }
                let _ = net_writer.close().await;
                debug!(%peer, "channel writer drained");
            }
        });

        // Reader task: Network -> User
        let reader = tokio::spawn({
            let shutdown = shutdown.clone();
            let failure = Arc::clone(&failure);
            let peer = peer.clone();
            async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        next = net_reader.next() => match next {
                            Some(Ok(packet)) => {
                                // A full buffer must not outlive shutdown.
                                tokio::select! {
                                    _ = shutdown.cancelled() => break,
                                    sent = network_tx.send(packet) => {
                                        if sent.is_err() {
                                            // Consumer dropped the channel.
                                            break;
                                        }
                                    }
                                }
                            }
                            Some(Err(e)) => {
                                warn!(%peer, "channel read failed: {e}");
                                record(&failure, ChannelError::Closed);
                                break;
                            }
                            None => {
                                debug!(%peer, "peer closed the stream");
                                record(&failure, ChannelError::Closed);
                                break;
                            }
                        },
                    }
                }
                shutdown.cancel();
            }
        });

        Self {
            sender: ChannelSender {
                tx: user_tx,
                shutdown: shutdown.clone(),
                failure: Arc::clone(&failure),
            },
            rx: user_rx,
            writer: Some(writer),
            reader: Some(reader),
            closing,
            shutdown,
            failure,
            peer,
        }
    }

    /// Queue a packet for sending.
    pub fn send(&self, packet: Packet) -> Result<(), ChannelError> {
        self.sender.send(packet)
    }

    /// A cloneable sender for the multiplexer.
    pub fn sender(&self) -> ChannelSender {
        self.sender.clone()
    }

    /// Next inbound packet; `None` once the channel is closed or broken.
    pub async fn receive(&mut self) -> Option<Packet> {
        self.rx.recv().await
    }

    /// Why the channel stopped, if it did.
    pub fn failure(&self) -> Option<ChannelError> {
        recorded(&self.failure)
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.closing.is_cancelled()
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Close the channel. Queued writes get up to `drain` to flush before
    /// the tasks are torn down. Safe to call repeatedly.
    pub async fn close(&mut self, drain: Duration) {
        self.closing.cancel();

        if let Some(writer) = self.writer.take() {
            let abort = writer.abort_handle();
            if tokio::time::timeout(drain, writer).await.is_err() {
                warn!(peer = %self.peer, "channel drain timed out after {drain:?}");
                abort.abort();
            }
        }

        self.shutdown.cancel();
        self.rx.close();
        if let Some(reader) = self.reader.take() {
            let abort = reader.abort_handle();
            if tokio::time::timeout(drain.max(READER_JOIN), reader).await.is_err() {
                warn!(peer = %self.peer, "channel reader did not stop; aborting");
                abort.abort();
            }
        }
        record(&self.failure, ChannelError::Closed);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
