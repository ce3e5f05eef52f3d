//! TLS integration for non-blocking sockets
//!
//! This module turns raw, non-blocking sockets into secured byte streams
//! and drives the handshake without ever blocking the worker thread.
//!
//! # Architecture
//!
//! 1. [`TlsLibrary`] performs the process-wide bootstrap (or records that
//!    TLS is disabled, in which case every vhost runs plaintext)
//! 2. [`VhostRegistry`] builds one server context per virtual host, one
//!    shared client context for non-listening hosts, and answers SNI
//! 3. [`TlsEngine`] is the backend seam; [`OpensslEngine`] is the OpenSSL
//!    variant
//! 4. The capability layer ([`capable`]) maps engine results onto
//!    done / more-service / error and keeps the buffered-plaintext list
//!    current
//! 5. [`server`] and [`client`] hold the handshake state machines, driven
//!    by [`crate::worker::Worker`] on readiness
//!
//! # Examples
//!
//! ```no_run
//! use tlsplex::tls::{TlsLibrary, VhostConfig, VhostRegistry, DefaultCallbacks};
//! use std::sync::Arc;
//!
//! let lib = TlsLibrary::global_init(true).unwrap();
//! let registry = VhostRegistry::new();
//!
//! let config = VhostConfig::builder("example.com")
//!     .port(443)
//!     .cert_file("server.pem")
//!     .private_key_file("server.key")
//!     .build();
//!
//! let vhost = registry
//!     .create(&lib, config, Arc::new(DefaultCallbacks))
//!     .unwrap();
//! assert!(vhost.use_ssl());
//! ```

pub mod buffered;
pub mod callbacks;
pub mod capable;
pub mod cert;
pub mod client;
pub mod config;
pub mod context;
pub mod engine;
pub mod server;
pub mod sni;
pub mod vhost;

#[cfg(test)]
pub(crate) mod testutil;

pub use buffered::BufferedList;
pub use callbacks::{DefaultCallbacks, EstablishedInfo, HostCaps, VhostCallbacks};
pub use capable::CapableIo;
pub use cert::CertInfo;
pub use config::{ClientConnectInfo, PeerVerify, VhostConfig, VhostConfigBuilder};
pub use context::{ClientContext, TlsLibrary, VhostTls};
pub use engine::{EngineError, EngineIo, Handshake, OpensslEngine, PeerVerification, TlsEngine};
pub use sni::SniResolver;
pub use vhost::{Vhost, VhostRegistry};

use log::error;
use openssl::error::ErrorStack;
use std::path::PathBuf;

/// Result type for TLS operations
pub type Result<T> = std::result::Result<T, TlsError>;

/// TLS errors
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] ErrorStack),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(#[from] crate::net::Error),

    #[error("problem creating ssl context: {0}")]
    Context(ErrorStack),

    #[error("problem getting cert '{}': {source}", path.display())]
    Certificate { path: PathBuf, source: ErrorStack },

    #[error("problem getting key '{}': {source}", path.display())]
    PrivateKey { path: PathBuf, source: ErrorStack },

    #[error("Private SSL key doesn't match cert")]
    KeyMismatch,

    #[error("ssl private key not set")]
    PrivateKeyRequired,

    #[error("Unknown curve name '{0}'")]
    UnknownCurve(String),

    #[error("vhost '{0}' has no {1} context")]
    NoContext(String, &'static str),

    #[error("Handshake failed: {0}")]
    Handshake(EngineError),

    #[error("server's cert didn't look good, X509_V_ERR = {}: {}", .0.code, .0.reason)]
    PeerVerification(PeerVerification),

    #[error("vhost '{0}' still has live connections")]
    VhostInUse(String),

    #[error("vhost '{0}' is not registered")]
    UnknownVhost(String),

    #[error("unknown connection {0}")]
    UnknownConnection(crate::conn::ConnId),
}

/// Log and drain everything queued on the OpenSSL error stack
pub fn decode_ssl_error() {
    for err in ErrorStack::get().errors() {
        error!("*** {} {}", err.code(), err);
    }
}
