//! Client certificates: required, optional, and vetoed by the vhost hook

mod common;

use common::{ca, client_vhost, lib, server_vhost, signed_by, Harness, Identity};
use openssl::x509::X509StoreContextRef;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tlsplex::tls::{
    ClientConnectInfo, DefaultCallbacks, HostCaps, Vhost, VhostCallbacks, VhostConfig,
    VhostRegistry,
};
use tlsplex::worker::CloseReason;

/// Counts certificate checks and optionally overrules the engine
struct Gatekeeper {
    checks: AtomicUsize,
    accept: bool,
}

impl Gatekeeper {
    fn new(accept: bool) -> Arc<Self> {
        Arc::new(Gatekeeper {
            checks: AtomicUsize::new(0),
            accept,
        })
    }
}

impl VhostCallbacks for Gatekeeper {
    fn verify_peer_certificate(
        &self,
        _host: HostCaps<'_>,
        preverify_ok: bool,
        _store: &mut X509StoreContextRef,
    ) -> bool {
        self.checks.fetch_add(1, Ordering::SeqCst);
        preverify_ok && self.accept
    }
}

fn mutual_server(
    registry: &VhostRegistry,
    dir: &Path,
    port: u16,
    authority: &Identity,
    optional: bool,
    gate: Arc<Gatekeeper>,
) -> Arc<Vhost> {
    let (cert, key) = signed_by("server.test", authority).write(dir, "server");
    let (ca_file, _) = authority.write(dir, "server-trust");
    let config = VhostConfig::builder("server.test")
        .port(port)
        .cert_file(cert)
        .private_key_file(key)
        .ca_file(ca_file)
        .require_client_cert(true)
        .peer_cert_not_required(optional)
        .build();
    registry.create(&lib(), config, gate).unwrap()
}

/// Client-only vhost presenting a certificate signed by `authority`
fn client_with_cert(registry: &VhostRegistry, dir: &Path, authority: &Identity) -> Arc<Vhost> {
    let (cert, key) = signed_by("client.test", authority).write(dir, "client-id");
    let (ca_file, _) = authority.write(dir, "client-trust");
    let config = VhostConfig::builder("client")
        .ca_file(ca_file)
        .disable_os_ca_certs(true)
        .cert_file(cert)
        .private_key_file(key)
        .build();
    registry
        .create(&lib(), config, Arc::new(DefaultCallbacks))
        .unwrap()
}

#[test]
fn test_mutual_auth_handshake() {
    let dir = tempfile::tempdir().unwrap();
    let authority = ca("test ca");
    let registry = VhostRegistry::new();
    let mut h = Harness::new();
    let gate = Gatekeeper::new(true);

    let server = mutual_server(&registry, dir.path(), h.port, &authority, false, gate.clone());
    let client = client_with_cert(&registry, dir.path(), &authority);
    h.serve(server);

    let cid = h.connect(client, &ClientConnectInfo::new("server.test"));
    assert!(h.run_until(|h| {
        h.established(cid).is_some() && h.server_id().and_then(|s| h.established(s)).is_some()
    }));

    let sid = h.server_id().unwrap();
    let peer = h.established(sid).unwrap().peer.clone().unwrap();
    assert_eq!(peer.subject, "client.test");
    assert_eq!(peer.issuer, "test ca");
    assert!(gate.checks.load(Ordering::SeqCst) > 0);
}

#[test]
fn test_missing_client_cert_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let authority = ca("test ca");
    let registry = VhostRegistry::new();
    let mut h = Harness::new();

    let gate = Gatekeeper::new(true);
    let server = mutual_server(&registry, dir.path(), h.port, &authority, false, gate);
    let client = client_vhost(&registry, dir.path(), &authority);
    h.serve(server);

    h.connect(client, &ClientConnectInfo::new("server.test"));
    assert!(h.run_until(|h| h.server_id().and_then(|s| h.closed(s)).is_some()));
    let sid = h.server_id().unwrap();
    assert_eq!(h.closed(sid), Some(CloseReason::Handshake));
    assert!(h.established(sid).is_none());
}

#[test]
fn test_optional_client_cert() {
    let dir = tempfile::tempdir().unwrap();
    let authority = ca("test ca");
    let registry = VhostRegistry::new();
    let mut h = Harness::new();

    let gate = Gatekeeper::new(true);
    let server = mutual_server(&registry, dir.path(), h.port, &authority, true, gate);
    let client = client_vhost(&registry, dir.path(), &authority);
    h.serve(server);

    let cid = h.connect(client, &ClientConnectInfo::new("server.test"));
    assert!(h.run_until(|h| {
        h.established(cid).is_some() && h.server_id().and_then(|s| h.established(s)).is_some()
    }));
    let sid = h.server_id().unwrap();
    assert!(h.established(sid).unwrap().peer.is_none());
}

#[test]
fn test_verify_hook_can_refuse() {
    let dir = tempfile::tempdir().unwrap();
    let authority = ca("test ca");
    let registry = VhostRegistry::new();
    let mut h = Harness::new();
    let gate = Gatekeeper::new(false);

    let server = mutual_server(&registry, dir.path(), h.port, &authority, false, gate.clone());
    let client = client_with_cert(&registry, dir.path(), &authority);
    h.serve(server);

    h.connect(client, &ClientConnectInfo::new("server.test"));
    assert!(h.run_until(|h| h.server_id().and_then(|s| h.closed(s)).is_some()));
    let sid = h.server_id().unwrap();
    assert_eq!(h.closed(sid), Some(CloseReason::Handshake));
    assert!(gate.checks.load(Ordering::SeqCst) > 0);
}

#[test]
fn test_client_trusts_hashed_ca_dir() {
    let dir = tempfile::tempdir().unwrap();
    let authority = ca("dir ca");
    let registry = VhostRegistry::new();
    let mut h = Harness::new();

    let server = server_vhost(
        &registry,
        dir.path(),
        "localhost",
        h.port,
        &signed_by("localhost", &authority),
        |b| b,
    );
    h.serve(server);

    let ca_dir = dir.path().join("cas");
    std::fs::create_dir(&ca_dir).unwrap();
    std::fs::write(
        ca_dir.join(format!("{:08x}.0", authority.cert.subject_name_hash())),
        authority.cert.to_pem().unwrap(),
    )
    .unwrap();
    let config = VhostConfig::builder("client")
        .client_ca_dir(&ca_dir)
        .disable_os_ca_certs(true)
        .build();
    let client = registry
        .create(&lib(), config, Arc::new(DefaultCallbacks))
        .unwrap();

    let cid = h.connect(client, &ClientConnectInfo::new("localhost"));
    assert!(h.run_until(|h| h.established(cid).is_some() || h.closed(cid).is_some()));
    assert!(h.established(cid).is_some());
}
