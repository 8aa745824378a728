//! Typed payloads carried inside [`Packet`] bodies.
//!
//! Each sub-module defines one logical stream of the multiplexed channel.
//! Payloads are serialized with `serde` + `bincode`; the stream kind,
//! session id and sequence travel in the packet header.
//!
//! ## Handshake
//! ```text
//! Client ──[Hello{version, token, caps}]──► Host
//! Client ◄──[Welcome{caps}]──────────────── Host
//! Client ──[Accept{negotiated}]───────────► Host
//! Client ◄──[Ready]──────────────────────── Host      → Streaming
//! ```
//!
//! ## Resume after a transport drop
//! ```text
//! Client ──[Hello{.., resume: Some(negotiated)}]──► Host
//! Client ◄──[Resumed]───────────────────────────── Host
//! ```
//!
//! [`Packet`]: crate::packet::Packet

pub mod control;
pub mod frame;
pub mod input;

pub use control::{ConfigChange, ControlMessage, Resolution};
pub use frame::{FrameUpdate, RegionBounds};
pub use input::{InputEvent, InputMessage, PointerButton};
