//! tlsplex - TLS integration for non-blocking socket servers
//!
//! This crate turns raw, non-blocking sockets into secured byte streams:
//! per-vhost TLS contexts, SNI dispatch, server and client handshakes driven
//! by readiness, plaintext fallback on secure listeners, and tracking of
//! plaintext the TLS engine has decrypted but the poller cannot see.

pub mod conn;
pub mod event;
pub mod net;
pub mod tls;
pub mod worker;
