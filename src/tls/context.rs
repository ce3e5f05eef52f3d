//! TLS context lifecycle
//!
//! One server context per virtual host, plus one client context for hosts
//! that do not listen (or a caller-provided one, which the vhost never
//! owns). Contexts are read-only once built; connections only borrow them
//! to create sessions.

use super::callbacks::{HostCaps, VhostCallbacks};
use super::config::VhostConfig;
use super::sni::SniResolver;
use super::{Result, TlsError};
use log::{debug, error, info, warn};
use openssl::error::ErrorStack;
use openssl::pkey::{Id, PKey};
use openssl::ssl::{
    AlpnError, SslContext, SslContextBuilder, SslFiletype, SslMethod, SslMode, SslOptions,
    SslVerifyMode, SslVersion,
};
use openssl::x509::store::X509Lookup;
use openssl::x509::X509;
use std::path::Path;
use std::sync::Arc;

/// Longest session id context OpenSSL accepts
const MAX_SID_CTX_LENGTH: usize = 32;

/// Process-wide TLS bootstrap
#[derive(Debug, Clone, Copy)]
pub struct TlsLibrary {
    enabled: bool,
}

impl TlsLibrary {
    /// Initialize the TLS library, or record that TLS is disabled
    ///
    /// With TLS disabled every vhost built against this library runs
    /// plaintext and owns no contexts.
    pub fn global_init(enabled: bool) -> Result<Self> {
        info!(" Compiled with OpenSSL support ({})", openssl::version::version());

        if !enabled {
            info!(" SSL disabled: no global init requested");
            return Ok(TlsLibrary { enabled: false });
        }

        openssl::init();
        Ok(TlsLibrary { enabled: true })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

/// Client context with its ownership flag
#[derive(Clone)]
pub struct ClientContext {
    ctx: SslContext,
    owned: bool,
}

impl ClientContext {
    fn owned(ctx: SslContext) -> Self {
        ClientContext { ctx, owned: true }
    }

    fn external(ctx: SslContext) -> Self {
        ClientContext { ctx, owned: false }
    }

    pub fn ctx(&self) -> &SslContext {
        &self.ctx
    }

    /// False for a context supplied by the caller
    pub fn is_owned(&self) -> bool {
        self.owned
    }
}

/// The contexts of one virtual host
pub struct VhostTls {
    enabled: bool,
    server: Option<SslContext>,
    client: Option<ClientContext>,
}

impl VhostTls {
    /// Build every context the configuration asks for
    pub fn build(
        lib: &TlsLibrary,
        config: &VhostConfig,
        sni: SniResolver,
        callbacks: &Arc<dyn VhostCallbacks>,
    ) -> Result<Self> {
        let server = create_server_context(lib, config, sni, callbacks)?;
        let client = create_client_context(lib, config, callbacks.as_ref())?;
        Ok(VhostTls {
            enabled: lib.is_enabled(),
            server,
            client,
        })
    }

    /// No TLS at all
    pub fn disabled() -> Self {
        VhostTls {
            enabled: false,
            server: None,
            client: None,
        }
    }

    pub fn server_ctx(&self) -> Option<&SslContext> {
        self.server.as_ref()
    }

    pub fn client_ctx(&self) -> Option<&ClientContext> {
        self.client.as_ref()
    }

    /// Release the contexts this vhost owns
    ///
    /// Returns how many owned contexts were released. A caller-provided
    /// client context only loses the vhost's reference; the caller's handle
    /// stays valid. Calling this again releases nothing.
    pub fn destroy(&mut self) -> usize {
        if !self.enabled {
            return 0;
        }

        let mut released = 0;
        if self.server.take().is_some() {
            released += 1;
        }
        match self.client.take() {
            Some(client) if client.owned => released += 1,
            Some(_) => debug!("leaving caller-provided client context alone"),
            None => {}
        }
        released
    }
}

/// Build the server context of a vhost
///
/// Certificate, key, curve and ALPN setup only happen when the vhost
/// listens and has a certificate; otherwise the context only carries the
/// verification policy and the SNI hook.
pub fn create_server_context(
    lib: &TlsLibrary,
    config: &VhostConfig,
    sni: SniResolver,
    callbacks: &Arc<dyn VhostCallbacks>,
) -> Result<Option<SslContext>> {
    if !lib.is_enabled() {
        return Ok(None);
    }

    let host = HostCaps {
        name: &config.name,
        listen_port: config.port,
    };
    let cert_file = config.cert_file.as_deref().filter(|_| config.port.is_some());

    if config.port.is_some() {
        if cert_file.is_some() {
            if let Some(ciphers) = &config.cipher_list {
                info!(" SSL ciphers: '{}'", ciphers);
            }
            info!(" Using SSL mode");
        } else {
            info!(" Using non-SSL mode");
        }
    }

    let mut builder = SslContextBuilder::new(SslMethod::tls_server()).map_err(|e| {
        error!("problem creating ssl context {}", e);
        TlsError::Context(e)
    })?;

    builder.set_options(
        SslOptions::NO_SSLV2
            | SslOptions::NO_SSLV3
            | SslOptions::NO_COMPRESSION
            | SslOptions::SINGLE_DH_USE
            | SslOptions::CIPHER_SERVER_PREFERENCE,
    );
    builder.set_min_proto_version(Some(SslVersion::TLS1_2))?;
    builder.set_mode(SslMode::ACCEPT_MOVING_WRITE_BUFFER);
    set_cipher_list(&mut builder, config)?;

    if config.require_client_cert {
        let mut mode = SslVerifyMode::PEER;
        if !config.peer_cert_not_required {
            mode |= SslVerifyMode::FAIL_IF_NO_PEER_CERT;
        }

        let sid_ctx = config.name.as_bytes();
        builder.set_session_id_context(&sid_ctx[..sid_ctx.len().min(MAX_SID_CTX_LENGTH)])?;

        let callbacks = callbacks.clone();
        let name = config.name.clone();
        let listen_port = config.port;
        builder.set_verify_callback(mode, move |preverify_ok, store| {
            let host = HostCaps {
                name: &name,
                listen_port,
            };
            callbacks.verify_peer_certificate(host, preverify_ok, store)
        });
    }

    builder.set_servername_callback(move |ssl, _alert| sni.on_servername(ssl));

    if let Some(ca_file) = &config.ca_file {
        if let Err(e) = builder.set_ca_file(ca_file) {
            warn!(
                "{}: loading CA file '{}' failed: {}",
                config.name,
                ca_file.display(),
                e
            );
        }
    }

    let Some(cert_file) = cert_file else {
        return Ok(Some(builder.build()));
    };

    init_ecdh_curve(&mut builder, config.ecdh_curve())?;
    callbacks.load_extra_server_verify_certs(host, &mut builder)?;

    builder
        .set_certificate_chain_file(cert_file)
        .map_err(|source| cert_error(cert_file, source))?;

    match &config.private_key_file {
        Some(key_file) => {
            load_private_key(
                &mut builder,
                key_file,
                config.private_key_password.as_deref(),
                Some(cert_file),
            )?
        }
        None => callbacks.require_private_key(host, &mut builder).map_err(|e| {
            error!("ssl private key not set");
            e
        })?,
    }

    check_private_key(&builder)?;

    if config.ecdh_from_cert {
        init_ecdh_from_cert(&mut builder, cert_file)?;
    }

    if !config.alpn.is_empty() {
        set_alpn_select(&mut builder, &config.alpn);
    }

    Ok(Some(builder.build()))
}

/// Build the client context of a vhost
///
/// A caller-provided context is used as is and flagged as not owned.
/// Listening vhosts get no client context of their own.
pub fn create_client_context(
    lib: &TlsLibrary,
    config: &VhostConfig,
    callbacks: &dyn VhostCallbacks,
) -> Result<Option<ClientContext>> {
    if !lib.is_enabled() {
        return Ok(None);
    }

    if let Some(ctx) = &config.provided_client_ctx {
        return Ok(Some(ClientContext::external(ctx.clone())));
    }

    if config.port.is_some() {
        return Ok(None);
    }

    let mut builder = SslContextBuilder::new(SslMethod::tls_client()).map_err(|e| {
        error!("problem creating ssl context {}", e);
        TlsError::Context(e)
    })?;

    builder.set_options(SslOptions::NO_COMPRESSION | SslOptions::CIPHER_SERVER_PREFERENCE);
    builder.set_min_proto_version(Some(SslVersion::TLS1_2))?;
    builder.set_mode(SslMode::ACCEPT_MOVING_WRITE_BUFFER);
    set_cipher_list(&mut builder, config)?;

    if !config.disable_os_ca_certs {
        if let Err(e) = builder.set_default_verify_paths() {
            warn!("{}: loading OS CA certs failed: {}", config.name, e);
        }
    }

    match (&config.ca_file, &config.client_ca_dir) {
        (Some(ca_file), _) => match builder.set_ca_file(ca_file) {
            Ok(()) => info!("loaded ssl_ca_filepath"),
            Err(e) => error!(
                "Unable to load SSL Client certs file from {} -- client ssl isn't going to work: {}",
                ca_file.display(),
                e
            ),
        },
        (None, Some(ca_dir)) => {
            if let Err(e) = load_ca_dir(&mut builder, ca_dir) {
                error!(
                    "Unable to load SSL Client certs from {} -- client ssl isn't going to work: {}",
                    ca_dir.display(),
                    e
                );
            }
        }
        (None, None) => {}
    }

    if let Some(cert_file) = &config.cert_file {
        builder
            .set_certificate_chain_file(cert_file)
            .map_err(|source| cert_error(cert_file, source))?;
    }

    if let Some(key_file) = &config.private_key_file {
        load_private_key(
            &mut builder,
            key_file,
            config.private_key_password.as_deref(),
            config.cert_file.as_deref(),
        )?;
        check_private_key(&builder)?;
    }

    let host = HostCaps {
        name: &config.name,
        listen_port: config.port,
    };
    callbacks.load_extra_client_verify_certs(host, &mut builder)?;

    Ok(Some(ClientContext::owned(builder.build())))
}

fn set_cipher_list(builder: &mut SslContextBuilder, config: &VhostConfig) -> Result<()> {
    if let Some(ciphers) = &config.cipher_list {
        if let Err(e) = builder.set_cipher_list(ciphers) {
            warn!("{}: cipher list '{}' rejected: {}", config.name, ciphers, e);
        }
    }
    Ok(())
}

fn cert_error(path: &Path, source: ErrorStack) -> TlsError {
    let code = source.errors().first().map(|e| e.code()).unwrap_or(0);
    error!("problem getting cert '{}' {}: {}", path.display(), code, source);
    TlsError::Certificate {
        path: path.to_path_buf(),
        source,
    }
}

/// Load a PEM private key, answering a passphrase prompt from `password`
///
/// The key is compared with the leaf of `cert_file` before it is installed,
/// so a mismatch is reported as such rather than as a key load failure.
fn load_private_key(
    builder: &mut SslContextBuilder,
    path: &Path,
    password: Option<&str>,
    cert_file: Option<&Path>,
) -> Result<()> {
    let key_error = |source: ErrorStack| {
        let code = source.errors().first().map(|e| e.code()).unwrap_or(0);
        error!("ssl problem getting key '{}' {}: {}", path.display(), code, source);
        TlsError::PrivateKey {
            path: path.to_path_buf(),
            source,
        }
    };

    let pem = std::fs::read(path)?;
    let key = PKey::private_key_from_pem_callback(&pem, |buf| {
        let Some(password) = password else {
            return Ok(0);
        };
        let n = password.len().min(buf.len().saturating_sub(1));
        buf[..n].copy_from_slice(&password.as_bytes()[..n]);
        Ok(n)
    })
    .map_err(key_error)?;

    if let Some(cert_file) = cert_file {
        let leaf = leaf_certificate(cert_file)?;
        if !leaf.public_key()?.public_eq(&key) {
            error!("Private SSL key doesn't match cert");
            return Err(TlsError::KeyMismatch);
        }
    }

    builder.set_private_key(&key).map_err(key_error)
}

/// First certificate of a PEM chain file
fn leaf_certificate(cert_file: &Path) -> Result<X509> {
    let pem = std::fs::read(cert_file)?;
    let chain = X509::stack_from_pem(&pem).map_err(|source| cert_error(cert_file, source))?;
    chain.into_iter().next().ok_or_else(|| {
        error!("no certificate in '{}'", cert_file.display());
        TlsError::Certificate {
            path: cert_file.to_path_buf(),
            source: ErrorStack::get(),
        }
    })
}

fn check_private_key(builder: &SslContextBuilder) -> Result<()> {
    builder.check_private_key().map_err(|_| {
        error!("Private SSL key doesn't match cert");
        TlsError::KeyMismatch
    })
}

fn init_ecdh_curve(builder: &mut SslContextBuilder, curve: &str) -> Result<()> {
    builder.set_groups_list(curve).map_err(|_| {
        error!("SSL: Unknown curve name '{}'", curve);
        TlsError::UnknownCurve(curve.to_string())
    })?;
    builder.set_options(SslOptions::SINGLE_ECDH_USE);
    info!(" SSL ECDH curve '{}'", curve);
    Ok(())
}

/// Switch ECDH to the curve of an EC certificate key
fn init_ecdh_from_cert(builder: &mut SslContextBuilder, cert_file: &Path) -> Result<()> {
    info!(" Using ECDH certificate support");

    let pkey = leaf_certificate(cert_file)?.public_key()?;
    if pkey.id() != Id::EC {
        info!("Key type is not EC");
        return Ok(());
    }

    let ec = pkey.ec_key()?;
    let Some(nid) = ec.group().curve_name() else {
        info!("EC key has no named curve");
        return Ok(());
    };
    let curve = nid.short_name()?;
    init_ecdh_curve(builder, curve)
}

fn load_ca_dir(builder: &mut SslContextBuilder, dir: &Path) -> Result<()> {
    let Some(dir) = dir.to_str() else {
        return Err(TlsError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "CA directory path is not UTF-8",
        )));
    };
    let lookup = builder.cert_store_mut().add_lookup(X509Lookup::hash_dir())?;
    lookup.add_dir(dir, SslFiletype::PEM)?;
    Ok(())
}

/// Select the first of our protocols the client offers
fn set_alpn_select(builder: &mut SslContextBuilder, protocols: &[String]) {
    let ours: Vec<Vec<u8>> = protocols.iter().map(|p| p.as_bytes().to_vec()).collect();
    builder.set_alpn_select_callback(move |_ssl, client_protos| {
        ours.iter()
            .find_map(|wanted| find_protocol(client_protos, wanted))
            .ok_or(AlpnError::NOACK)
    });
}

/// Look `wanted` up in a length-prefixed ALPN list
fn find_protocol<'a>(client_protos: &'a [u8], wanted: &[u8]) -> Option<&'a [u8]> {
    let mut rest = client_protos;
    while let Some((&len, tail)) = rest.split_first() {
        let len = len as usize;
        if tail.len() < len {
            return None;
        }
        let (proto, next) = tail.split_at(len);
        if proto == wanted {
            return Some(proto);
        }
        rest = next;
    }
    None
}
