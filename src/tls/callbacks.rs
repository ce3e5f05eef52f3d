//! Hooks the application protocol layer provides to the TLS layer
//!
//! Every hook receives a [`HostCaps`]: the identity of the vhost the call is
//! made for, and nothing that could be half-initialized.

use super::cert::CertInfo;
use super::{Result, TlsError};
use crate::conn::{ConnId, Role};
use openssl::ssl::SslContextBuilder;
use openssl::x509::X509StoreContextRef;

/// Narrow view of a virtual host handed to hooks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCaps<'a> {
    pub name: &'a str,
    pub listen_port: Option<u16>,
}

/// What a connection looks like once data may flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EstablishedInfo {
    pub role: Role,
    /// Secure listener accepted a plaintext client
    pub plaintext: bool,
    /// Downgraded connection should be redirected to the secure scheme
    pub redirect_to_https: bool,
    /// Negotiated ALPN protocol
    pub alpn: Option<String>,
    /// Peer certificate, when one was presented
    pub peer: Option<CertInfo>,
}

/// Collaborator capability set
pub trait VhostCallbacks: Send + Sync {
    /// Decide on a peer certificate during the handshake
    ///
    /// `preverify_ok` is the engine's own verdict for the certificate at the
    /// current chain depth.
    fn verify_peer_certificate(
        &self,
        _host: HostCaps<'_>,
        preverify_ok: bool,
        _store: &mut X509StoreContextRef,
    ) -> bool {
        preverify_ok
    }

    /// Add trust material a server uses to check client certificates
    fn load_extra_server_verify_certs(
        &self,
        _host: HostCaps<'_>,
        _ctx: &mut SslContextBuilder,
    ) -> Result<()> {
        Ok(())
    }

    /// Add trust material a client uses to check server certificates
    fn load_extra_client_verify_certs(
        &self,
        _host: HostCaps<'_>,
        _ctx: &mut SslContextBuilder,
    ) -> Result<()> {
        Ok(())
    }

    /// Install a private key when none is configured by path
    ///
    /// Returning an error aborts the vhost setup.
    fn require_private_key(&self, _host: HostCaps<'_>, _ctx: &mut SslContextBuilder) -> Result<()> {
        Err(TlsError::PrivateKeyRequired)
    }

    /// Connection finished its handshake (or was downgraded to plaintext)
    fn on_established(&self, _host: HostCaps<'_>, _id: ConnId, _info: &EstablishedInfo) {}
}

/// Callbacks that keep every engine default
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCallbacks;

impl VhostCallbacks for DefaultCallbacks {}
