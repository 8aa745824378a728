//! # vdi-core
//!
//! Session transport and adaptive streaming core for a VDI client.
//!
//! This crate contains:
//! - **Wire format**: `PacketHeader`, `Packet`, `MessageKind`, `PacketFlags`
//! - **Codec**: `VdiCodec` for framed I/O via `tokio_util`
//! - **Transport**: `Channel` over pluggable TCP/TLS `Connector`s and a `Resolver`
//! - **Protocol payloads**: control, input and frame messages
//! - **Multiplexer**: per-session outbound sequencing and inbound routing
//! - **Quality**: echo-probe latency, EWMA loss and classification
//! - **Input relay**: sequencing and pointer-move coalescing
//! - **State**: capabilities and the session lifecycle machine
//! - **Session**: one task per session and the `SessionManager` API
//! - **Host**: the remote end of the protocol, for tests and demos
//! - **Error**: `VdiError`, `ConnectError`, `ChannelError`

pub mod codec;
pub mod error;
pub mod flags;
pub mod header;
pub mod host;
pub mod message;
pub mod mux;
pub mod packet;
pub mod protocol;
pub mod quality;
pub mod relay;
pub mod session;
pub mod state;
pub mod transport;
pub mod types;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use codec::VdiCodec;
pub use error::{ChannelError, ConnectError, SessionFailure, VdiError};
pub use flags::PacketFlags;
pub use header::{HEADER_SIZE, PacketHeader};
pub use host::{HostConfig, HostHandle, HostService, HostSession, MAX_RECORDED_INPUTS};
pub use message::MessageKind;
pub use mux::{Demultiplexer, Demuxed, FrameGapDetected, Multiplexer, Outbound};
pub use packet::{MAX_FRAME_SIZE, MAX_PAYLOAD_SIZE, Packet};
pub use protocol::{
    ConfigChange, ControlMessage, FrameUpdate, InputEvent, InputMessage, PointerButton,
    RegionBounds, Resolution,
};
pub use quality::{Classification, QualityMonitor, QualitySample, QualityThresholds};
pub use relay::InputRelay;
pub use session::{
    Diagnostics, ReconfigureOptions, Session, SessionConfig, SessionManager, SessionSettings,
};
pub use state::{
    Capabilities, Codec, Hysteresis, InputKinds, PROTOCOL_VERSION, ReconnectPolicy, SessionEvent,
    SessionMachine, SessionState,
};
pub use transport::{Channel, Connector, Resolver, StaticResolver, TcpConnector, TlsConnector};
pub use types::{ResourceId, SessionId, SessionToken};
