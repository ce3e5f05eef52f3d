//! Shared helpers for integration tests: certificates minted at test time
//! and a loopback harness driving one poll-based worker.

#![allow(dead_code)]

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::extension::{BasicConstraints, SubjectAlternativeName};
use openssl::x509::{X509NameBuilder, X509};
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tlsplex::conn::ConnId;
use tlsplex::event::PollLoop;
use tlsplex::net;
use tlsplex::tls::{
    ClientConnectInfo, DefaultCallbacks, EstablishedInfo, TlsLibrary, Vhost, VhostConfig,
    VhostRegistry,
};
use tlsplex::worker::{CloseReason, ServiceEvent, Worker};

pub struct Identity {
    pub cert: X509,
    pub key: PKey<Private>,
}

impl Identity {
    /// Write `<stem>.pem` and `<stem>.key` under `dir`
    pub fn write(&self, dir: &Path, stem: &str) -> (PathBuf, PathBuf) {
        let cert = dir.join(format!("{}.pem", stem));
        let key = dir.join(format!("{}.key", stem));
        std::fs::write(&cert, self.cert.to_pem().unwrap()).unwrap();
        std::fs::write(&key, self.key.private_key_to_pem_pkcs8().unwrap()).unwrap();
        (cert, key)
    }
}

fn mint(cn: &str, issuer: Option<&Identity>, ca: bool) -> Identity {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    let key = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_nid(Nid::COMMONNAME, cn).unwrap();
    let name = name.build();

    let mut serial = BigNum::new().unwrap();
    serial.rand(64, MsbOption::MAYBE_ZERO, false).unwrap();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    builder
        .set_serial_number(&serial.to_asn1_integer().unwrap())
        .unwrap();
    builder.set_subject_name(&name).unwrap();
    match issuer {
        Some(issuer) => builder.set_issuer_name(issuer.cert.subject_name()).unwrap(),
        None => builder.set_issuer_name(&name).unwrap(),
    }
    builder.set_pubkey(&key).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(30).unwrap())
        .unwrap();

    if ca {
        builder
            .append_extension(BasicConstraints::new().critical().ca().build().unwrap())
            .unwrap();
    } else {
        let san = SubjectAlternativeName::new()
            .dns(cn)
            .build(&builder.x509v3_context(issuer.map(|i| &*i.cert), None))
            .unwrap();
        builder.append_extension(san).unwrap();
    }

    let signer = issuer.map(|i| &i.key).unwrap_or(&key);
    builder.sign(signer, MessageDigest::sha256()).unwrap();
    Identity {
        cert: builder.build(),
        key,
    }
}

pub fn self_signed(cn: &str) -> Identity {
    mint(cn, None, false)
}

pub fn ca(cn: &str) -> Identity {
    mint(cn, None, true)
}

pub fn signed_by(cn: &str, issuer: &Identity) -> Identity {
    mint(cn, Some(issuer), false)
}

pub fn lib() -> TlsLibrary {
    TlsLibrary::global_init(true).unwrap()
}

/// Register a TLS vhost serving `identity` on `port`
pub fn server_vhost(
    registry: &VhostRegistry,
    dir: &Path,
    name: &str,
    port: u16,
    identity: &Identity,
    tweak: impl FnOnce(tlsplex::tls::VhostConfigBuilder) -> tlsplex::tls::VhostConfigBuilder,
) -> Arc<Vhost> {
    let (cert, key) = identity.write(dir, &format!("{}-{}", name, port));
    let config = tweak(
        VhostConfig::builder(name)
            .port(port)
            .cert_file(cert)
            .private_key_file(key),
    )
    .build();
    registry
        .create(&lib(), config, Arc::new(DefaultCallbacks))
        .unwrap()
}

/// Register a client-only vhost trusting `ca`
pub fn client_vhost(registry: &VhostRegistry, dir: &Path, ca: &Identity) -> Arc<Vhost> {
    let (ca_file, _) = ca.write(dir, "client-trust");
    let config = VhostConfig::builder("client")
        .ca_file(ca_file)
        .disable_os_ca_certs(true)
        .build();
    registry
        .create(&lib(), config, Arc::new(DefaultCallbacks))
        .unwrap()
}

/// Listener plus a single worker serving both ends of every connection
pub struct Harness {
    pub worker: Worker<PollLoop>,
    pub listener: TcpListener,
    pub port: u16,
    pub events: Vec<ServiceEvent>,
    pub accepted: Vec<ConnId>,
    serving: Option<Arc<Vhost>>,
}

impl Harness {
    pub fn new() -> Self {
        let listener = net::listen("127.0.0.1:0".parse().unwrap()).unwrap();
        let port = listener.local_addr().unwrap().port();
        Harness {
            worker: Worker::new(0, PollLoop::new()),
            listener,
            port,
            events: Vec::new(),
            accepted: Vec::new(),
            serving: None,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.listener.local_addr().unwrap()
    }

    /// Accepted sockets are adopted on `vhost`
    pub fn serve(&mut self, vhost: Arc<Vhost>) {
        self.serving = Some(vhost);
    }

    pub fn stop_serving(&mut self) {
        self.serving = None;
    }

    pub fn connect(&mut self, vhost: Arc<Vhost>, info: &ClientConnectInfo) -> ConnId {
        let stream = net::connect(self.addr(), Duration::from_secs(1)).unwrap();
        self.worker.adopt_client(vhost, stream, info).unwrap()
    }

    /// Accept what is waiting, then run one worker iteration
    pub fn step(&mut self) -> Vec<ServiceEvent> {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    let vhost = self.serving.clone().expect("no vhost being served");
                    let id = self.worker.adopt_accepted(vhost, stream).unwrap();
                    self.accepted.push(id);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => panic!("accept failed: {}", e),
            }
        }

        let events = self
            .worker
            .run_once(Some(Duration::from_millis(10)))
            .unwrap();
        self.events.extend(events.iter().cloned());
        events
    }

    /// Step until `done` holds; false after five seconds
    pub fn run_until(&mut self, done: impl Fn(&Harness) -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(self) {
            if Instant::now() > deadline {
                return false;
            }
            self.step();
        }
        true
    }

    pub fn server_id(&self) -> Option<ConnId> {
        self.accepted.first().copied()
    }

    pub fn established(&self, id: ConnId) -> Option<&EstablishedInfo> {
        self.events.iter().find_map(|e| match e {
            ServiceEvent::Established { id: e, info } if *e == id => Some(info),
            _ => None,
        })
    }

    pub fn closed(&self, id: ConnId) -> Option<CloseReason> {
        self.events.iter().find_map(|e| match e {
            ServiceEvent::Closed { id: e, reason } if *e == id => Some(*reason),
            _ => None,
        })
    }

    pub fn saw_readable(&self, id: ConnId) -> bool {
        self.events
            .iter()
            .any(|e| matches!(e, ServiceEvent::Readable(r) if *r == id))
    }
}
