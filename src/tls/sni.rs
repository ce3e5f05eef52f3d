//! Server Name Indication dispatch
//!
//! Runs inside the server handshake, before any application data. A
//! requested name is matched against the hosts that share the listening
//! port of the host whose context the session was created on; on a match
//! the session is moved onto that host's context, and the host is attached
//! to the session so it stays alive for as long as the session does.

use super::vhost::{HostList, Vhost};
use log::{debug, error, info};
use openssl::ex_data::Index;
use openssl::ssl::{NameType, SniError, Ssl, SslContext, SslContextRef, SslRef};
use std::sync::{Arc, OnceLock, PoisonError, RwLock, Weak};

/// Session slot holding the host a session was moved to
fn host_index() -> Option<Index<Ssl, Arc<Vhost>>> {
    static INDEX: OnceLock<Option<Index<Ssl, Arc<Vhost>>>> = OnceLock::new();
    *INDEX.get_or_init(|| {
        Ssl::new_ex_index()
            .map_err(|e| error!("SNI: no session slot for the vhost: {}", e))
            .ok()
    })
}

/// Host attached to `ssl` by a servername match
pub(crate) fn sni_host(ssl: &SslRef) -> Option<&Arc<Vhost>> {
    ssl.ex_data(host_index()?)
}

/// Registry view held by every server context
///
/// Holds the registry weakly: contexts live inside the hosts the registry
/// owns.
#[derive(Clone, Default)]
pub struct SniResolver {
    hosts: Weak<RwLock<Vec<Arc<Vhost>>>>,
}

impl SniResolver {
    pub(crate) fn new(hosts: Weak<RwLock<Vec<Arc<Vhost>>>>) -> Self {
        SniResolver { hosts }
    }

    /// Resolver that knows no hosts and keeps every session where it is
    pub fn detached() -> Self {
        SniResolver::default()
    }

    fn registry(&self) -> Option<HostList> {
        self.hosts.upgrade()
    }

    /// Context of the first TLS host on `listen_port` named `name`
    pub fn resolve(&self, listen_port: Option<u16>, name: &str) -> Option<SslContext> {
        let hosts = self.registry()?;
        let hosts = hosts.read().unwrap_or_else(PoisonError::into_inner);
        select(&hosts, listen_port, name).map(|(ctx, _)| ctx)
    }

    /// Servername hook installed on every server context
    pub(crate) fn on_servername(&self, ssl: &mut SslRef) -> Result<(), SniError> {
        let Some(hosts) = self.registry() else {
            return Ok(());
        };
        let hosts = hosts.read().unwrap_or_else(PoisonError::into_inner);

        let Some(owner) = host_for_context(&hosts, ssl.ssl_context()) else {
            error!("SNI: session context belongs to no registered vhost");
            return Err(SniError::ALERT_FATAL);
        };

        let Some(name) = ssl.servername(NameType::HOST_NAME).map(str::to_owned) else {
            debug!("SNI: no servername, staying on '{}'", owner.name());
            return Ok(());
        };

        match select(&hosts, owner.listen_port(), &name) {
            Some((ctx, vhost)) => {
                info!("SNI: Found: {} (port {:?})", vhost.name(), vhost.listen_port());
                ssl.set_ssl_context(&ctx).map_err(|e| {
                    error!("SNI: switching to '{}' failed: {}", vhost.name(), e);
                    SniError::ALERT_FATAL
                })?;
                let Some(index) = host_index() else {
                    return Err(SniError::ALERT_FATAL);
                };
                ssl.set_ex_data(index, vhost.clone());
                Ok(())
            }
            None => {
                error!("SNI: Unknown ServerName: {}", name);
                Ok(())
            }
        }
    }
}

/// Host whose server context is `ctx`
fn host_for_context<'a>(hosts: &'a [Arc<Vhost>], ctx: &SslContextRef) -> Option<&'a Arc<Vhost>> {
    hosts.iter().find(|vhost| {
        vhost
            .tls()
            .server_ctx()
            .map_or(false, |own| std::ptr::eq::<SslContextRef>(&**own, ctx))
    })
}

fn select<'a>(
    hosts: &'a [Arc<Vhost>],
    listen_port: Option<u16>,
    name: &str,
) -> Option<(SslContext, &'a Arc<Vhost>)> {
    hosts
        .iter()
        .filter(|vhost| vhost.use_ssl() && vhost.listen_port() == listen_port)
        .find(|vhost| vhost.name().eq_ignore_ascii_case(name))
        .and_then(|vhost| Some((vhost.tls().server_ctx()?.clone(), vhost)))
}
