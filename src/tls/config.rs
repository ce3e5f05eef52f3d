//! Virtual host TLS configuration
//!
//! This module provides the configuration builder for a virtual host and the
//! per-connection options of an outbound (client) connection.

use openssl::ssl::SslContext;
use std::fmt;
use std::path::PathBuf;

/// ECDH curve used when none is configured
pub const DEFAULT_ECDH_CURVE: &str = "prime256v1";

/// Seconds a connection may spend in a pending state
pub const DEFAULT_TIMEOUT_SECS: u64 = 20;

/// How strictly a client checks the server certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerVerify {
    /// Only a fully valid chain is accepted
    #[default]
    Required,
    /// A self-signed certificate (leaf or in chain) is also accepted
    AllowSelfSigned,
}

/// Options for one outbound connection
///
/// The default is a plaintext connection; [`ClientConnectInfo::new`] asks
/// for TLS.
#[derive(Debug, Clone, Default)]
pub struct ClientConnectInfo {
    pub use_ssl: bool,
    /// Host name sent as SNI
    pub server_name: Option<String>,
    pub verify: PeerVerify,
    /// Protocols offered through ALPN, in preference order
    pub alpn: Vec<String>,
}

impl ClientConnectInfo {
    pub fn new(server_name: impl Into<String>) -> Self {
        ClientConnectInfo {
            use_ssl: true,
            server_name: Some(server_name.into()),
            verify: PeerVerify::Required,
            alpn: Vec::new(),
        }
    }

    pub fn allow_self_signed(mut self) -> Self {
        self.verify = PeerVerify::AllowSelfSigned;
        self
    }

    /// Skip TLS for this connection
    pub fn plaintext(mut self) -> Self {
        self.use_ssl = false;
        self
    }

    pub fn alpn(mut self, protocols: &[&str]) -> Self {
        self.alpn = protocols.iter().map(|p| p.to_string()).collect();
        self
    }
}

/// Virtual host configuration (immutable after building)
#[derive(Clone)]
pub struct VhostConfig {
    pub(crate) name: String,
    pub(crate) port: Option<u16>,
    pub(crate) cipher_list: Option<String>,
    pub(crate) ca_file: Option<PathBuf>,
    pub(crate) client_ca_dir: Option<PathBuf>,
    pub(crate) cert_file: Option<PathBuf>,
    pub(crate) private_key_file: Option<PathBuf>,
    pub(crate) private_key_password: Option<String>,
    pub(crate) require_client_cert: bool,
    pub(crate) peer_cert_not_required: bool,
    pub(crate) ecdh_curve: Option<String>,
    pub(crate) ecdh_from_cert: bool,
    pub(crate) allow_non_ssl_on_ssl_port: bool,
    pub(crate) redirect_http_to_https: bool,
    pub(crate) disable_os_ca_certs: bool,
    pub(crate) provided_client_ctx: Option<SslContext>,
    pub(crate) alpn: Vec<String>,
    pub(crate) timeout_secs: u64,
}

impl VhostConfig {
    /// Create a new configuration builder
    pub fn builder(name: impl Into<String>) -> VhostConfigBuilder {
        VhostConfigBuilder::new(name.into())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// A vhost terminates TLS when it listens and has a certificate
    pub fn use_ssl(&self) -> bool {
        self.port.is_some() && self.cert_file.is_some()
    }

    pub fn ecdh_curve(&self) -> &str {
        self.ecdh_curve.as_deref().unwrap_or(DEFAULT_ECDH_CURVE)
    }
}

impl fmt::Debug for VhostConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VhostConfig")
            .field("name", &self.name)
            .field("port", &self.port)
            .field("cipher_list", &self.cipher_list)
            .field("cert_file", &self.cert_file)
            .field("private_key_file", &self.private_key_file)
            .field("private_key_password", &self.private_key_password.as_ref().map(|_| "***"))
            .field("require_client_cert", &self.require_client_cert)
            .field("allow_non_ssl_on_ssl_port", &self.allow_non_ssl_on_ssl_port)
            .field("provided_client_ctx", &self.provided_client_ctx.is_some())
            .finish_non_exhaustive()
    }
}

/// Virtual host configuration builder
pub struct VhostConfigBuilder {
    config: VhostConfig,
}

impl VhostConfigBuilder {
    fn new(name: String) -> Self {
        VhostConfigBuilder {
            config: VhostConfig {
                name,
                port: None,
                cipher_list: None,
                ca_file: None,
                client_ca_dir: None,
                cert_file: None,
                private_key_file: None,
                private_key_password: None,
                require_client_cert: false,
                peer_cert_not_required: false,
                ecdh_curve: None,
                ecdh_from_cert: false,
                allow_non_ssl_on_ssl_port: false,
                redirect_http_to_https: false,
                disable_os_ca_certs: false,
                provided_client_ctx: None,
                alpn: Vec::new(),
                timeout_secs: DEFAULT_TIMEOUT_SECS,
            },
        }
    }

    /// Listen on this port (vhosts without a port only make client connections)
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = Some(port);
        self
    }

    /// Set cipher list (for TLS <= 1.2)
    pub fn cipher_list(mut self, ciphers: impl Into<String>) -> Self {
        self.config.cipher_list = Some(ciphers.into());
        self
    }

    /// Trusted CA material (client certs on servers, server certs on clients)
    pub fn ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.ca_file = Some(path.into());
        self
    }

    /// Hashed CA directory used by clients when no CA file is given
    pub fn client_ca_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.client_ca_dir = Some(path.into());
        self
    }

    /// Local certificate chain in PEM format
    pub fn cert_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.cert_file = Some(path.into());
        self
    }

    /// Private key in PEM format
    pub fn private_key_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.private_key_file = Some(path.into());
        self
    }

    /// Passphrase for an encrypted private key
    pub fn private_key_password(mut self, password: impl Into<String>) -> Self {
        self.config.private_key_password = Some(password.into());
        self
    }

    /// Require clients to present a valid certificate
    pub fn require_client_cert(mut self, require: bool) -> Self {
        self.config.require_client_cert = require;
        self
    }

    /// With client certs required, still accept peers that send none
    pub fn peer_cert_not_required(mut self, allow: bool) -> Self {
        self.config.peer_cert_not_required = allow;
        self
    }

    /// Named curve for ephemeral ECDH
    pub fn ecdh_curve(mut self, curve: impl Into<String>) -> Self {
        self.config.ecdh_curve = Some(curve.into());
        self
    }

    /// Use the curve of an EC certificate key instead of the named curve
    pub fn ecdh_from_cert(mut self, enable: bool) -> Self {
        self.config.ecdh_from_cert = enable;
        self
    }

    /// Accept plaintext clients on the secure port
    pub fn allow_non_ssl_on_ssl_port(mut self, allow: bool) -> Self {
        self.config.allow_non_ssl_on_ssl_port = allow;
        self
    }

    /// Flag downgraded connections for a redirect to the secure scheme
    pub fn redirect_http_to_https(mut self, redirect: bool) -> Self {
        self.config.redirect_http_to_https = redirect;
        self
    }

    /// Do not load the OS trust store into the client context
    pub fn disable_os_ca_certs(mut self, disable: bool) -> Self {
        self.config.disable_os_ca_certs = disable;
        self
    }

    /// Use a caller-owned client context; the vhost never frees it
    pub fn provided_client_ctx(mut self, ctx: SslContext) -> Self {
        self.config.provided_client_ctx = Some(ctx);
        self
    }

    /// ALPN protocols offered by the server, in preference order
    pub fn alpn(mut self, protocols: &[&str]) -> Self {
        self.config.alpn = protocols.iter().map(|p| p.to_string()).collect();
        self
    }

    /// Seconds allowed for the handshake and for the protocol to take over
    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.config.timeout_secs = secs;
        self
    }

    /// Build the configuration
    pub fn build(self) -> VhostConfig {
        self.config
    }
}
