//! Transport channel: one reliable, ordered, optionally encrypted byte
//! stream per session, framed into [`Packet`]s.
//!
//! | Module      | Purpose                                            |
//! |-------------|----------------------------------------------------|
//! | `connector` | Pluggable stream establishment (TCP, TLS)          |
//! | `resolver`  | Resource id → network address lookup               |
//! | `channel`   | Framed reader/writer tasks around one stream       |
//!
//! [`Packet`]: crate::packet::Packet

pub mod channel;
pub mod connector;
pub mod resolver;

pub use channel::{Channel, ChannelSender};
pub use connector::{AsyncStream, BoxedStream, Connector, TcpConnector, TlsConnector};
pub use resolver::{Resolver, StaticResolver};
