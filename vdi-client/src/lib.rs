//! # vdi-client: Remote Desktop Session Client
//!
//! Connects to one remote desktop resource through `vdi-core`, follows the
//! session through reconnects and reports state changes and link quality
//! until interrupted.
//!
//! Resources are named in the config file and resolved to `host:port`
//! addresses locally. Set `connection.tls = true` to connect over TLS,
//! optionally pinning the host certificate.

pub mod config;
