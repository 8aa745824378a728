//! # vdi-host: Remote Desktop Host Peer
//!
//! Runs the host end of the session protocol on a TCP port: answers fresh
//! and resume handshakes, echoes quality probes, acknowledges
//! reconfiguration and streams synthetic display updates. Useful for
//! exercising clients against a real peer.

pub mod config;
