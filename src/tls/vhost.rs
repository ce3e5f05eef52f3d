//! Virtual hosts and the SNI-visible registry

use super::callbacks::{DefaultCallbacks, HostCaps, VhostCallbacks};
use super::config::{VhostConfig, DEFAULT_TIMEOUT_SECS};
use super::context::{TlsLibrary, VhostTls};
use super::sni::SniResolver;
use super::{Result, TlsError};
use log::info;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// Ordered list of registered hosts, shared with SNI resolvers
pub(crate) type HostList = Arc<RwLock<Vec<Arc<Vhost>>>>;

/// A named listening identity with its TLS contexts
pub struct Vhost {
    name: String,
    listen_port: Option<u16>,
    use_ssl: bool,
    allow_non_ssl_on_ssl_port: bool,
    redirect_http_to_https: bool,
    timeout_secs: u64,
    tls: VhostTls,
    callbacks: Arc<dyn VhostCallbacks>,
}

impl Vhost {
    fn build(
        lib: &TlsLibrary,
        config: &VhostConfig,
        sni: SniResolver,
        callbacks: Arc<dyn VhostCallbacks>,
    ) -> Result<Self> {
        let tls = VhostTls::build(lib, config, sni, &callbacks)?;
        Ok(Vhost {
            name: config.name.clone(),
            listen_port: config.port,
            use_ssl: lib.is_enabled() && config.use_ssl(),
            allow_non_ssl_on_ssl_port: config.allow_non_ssl_on_ssl_port,
            redirect_http_to_https: config.redirect_http_to_https,
            timeout_secs: config.timeout_secs,
            tls,
            callbacks,
        })
    }

    /// Plaintext host with no contexts, outside any registry
    pub fn plain(name: impl Into<String>, listen_port: Option<u16>) -> Self {
        Vhost {
            name: name.into(),
            listen_port,
            use_ssl: false,
            allow_non_ssl_on_ssl_port: false,
            redirect_http_to_https: false,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            tls: VhostTls::disabled(),
            callbacks: Arc::new(DefaultCallbacks),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn listen_port(&self) -> Option<u16> {
        self.listen_port
    }

    /// True when accepted connections on this host run TLS
    pub fn use_ssl(&self) -> bool {
        self.use_ssl
    }

    pub fn allow_non_ssl_on_ssl_port(&self) -> bool {
        self.allow_non_ssl_on_ssl_port
    }

    pub fn redirect_http_to_https(&self) -> bool {
        self.redirect_http_to_https
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }

    pub fn tls(&self) -> &VhostTls {
        &self.tls
    }

    pub fn callbacks(&self) -> &dyn VhostCallbacks {
        self.callbacks.as_ref()
    }

    /// The view of this host handed to collaborator hooks
    pub fn caps(&self) -> HostCaps<'_> {
        HostCaps {
            name: &self.name,
            listen_port: self.listen_port,
        }
    }
}

impl fmt::Debug for Vhost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vhost")
            .field("name", &self.name)
            .field("listen_port", &self.listen_port)
            .field("use_ssl", &self.use_ssl)
            .field("server_ctx", &self.tls.server_ctx().is_some())
            .field("client_ctx", &self.tls.client_ctx().is_some())
            .finish_non_exhaustive()
    }
}

/// Registry of virtual hosts in creation order
///
/// Server contexts built here answer SNI from this registry. Connections
/// hold their vhost by `Arc`, and a session moved by SNI holds the host it
/// was moved to, so a host can only be torn down once every connection
/// (and every other handle) on it is gone.
#[derive(Default)]
pub struct VhostRegistry {
    hosts: HostList,
}

impl VhostRegistry {
    pub fn new() -> Self {
        VhostRegistry::default()
    }

    /// Resolver bound to this registry
    pub fn sni_resolver(&self) -> SniResolver {
        SniResolver::new(Arc::downgrade(&self.hosts))
    }

    /// Build a vhost from `config` and register it
    ///
    /// A setup error aborts only this host; the registry is left unchanged.
    pub fn create(
        &self,
        lib: &TlsLibrary,
        config: VhostConfig,
        callbacks: Arc<dyn VhostCallbacks>,
    ) -> Result<Arc<Vhost>> {
        let vhost = Arc::new(Vhost::build(lib, &config, self.sni_resolver(), callbacks)?);
        info!(
            "Creating Vhost '{}' port {:?}, ssl {}",
            vhost.name,
            vhost.listen_port,
            vhost.use_ssl
        );

        self.hosts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(vhost.clone());
        Ok(vhost)
    }

    /// First registered host called `name`
    pub fn get(&self, name: &str) -> Option<Arc<Vhost>> {
        self.hosts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|v| v.name == name)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.hosts.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unregister `name` and release its owned contexts
    ///
    /// Fails with [`TlsError::VhostInUse`] (leaving the host registered)
    /// while anything else still holds it. Returns the number of contexts
    /// released.
    pub fn destroy(&self, name: &str) -> Result<usize> {
        let mut hosts = self.hosts.write().unwrap_or_else(PoisonError::into_inner);
        let pos = hosts
            .iter()
            .position(|v| v.name == name)
            .ok_or_else(|| TlsError::UnknownVhost(name.to_string()))?;

        let vhost = hosts.remove(pos);
        match Arc::try_unwrap(vhost) {
            Ok(mut vhost) => Ok(vhost.tls.destroy()),
            Err(vhost) => {
                hosts.insert(pos, vhost);
                Err(TlsError::VhostInUse(name.to_string()))
            }
        }
    }
}
