//! Certificates, sockets and loops for unit tests

use crate::conn::{ConnId, Connection, Role};
use crate::event::{EventLoop, PendingTimeout, PollEvents};
use crate::tls::engine::scripted::{Script, ScriptedEngine};
use crate::tls::vhost::Vhost;
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::symm::Cipher;
use openssl::x509::extension::{BasicConstraints, SubjectAlternativeName};
use openssl::x509::{X509NameBuilder, X509};
use std::collections::HashMap;
use std::io;
use std::net::{TcpListener, TcpStream};
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

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

    /// Like [`Identity::write`], with the key encrypted under `passphrase`
    pub fn write_encrypted(&self, dir: &Path, stem: &str, passphrase: &str) -> (PathBuf, PathBuf) {
        let (cert, key) = self.write(dir, stem);
        let pem = self
            .key
            .private_key_to_pem_pkcs8_passphrase(Cipher::aes_128_cbc(), passphrase.as_bytes())
            .unwrap();
        std::fs::write(&key, pem).unwrap();
        (cert, key)
    }
}

fn ec_key() -> PKey<Private> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap()
}

fn build(cn: &str, key: &PKey<Private>, issuer: Option<&Identity>, ca: bool) -> X509 {
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
    builder.set_pubkey(key).unwrap();
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

    let signer = issuer.map(|i| &i.key).unwrap_or(key);
    builder.sign(signer, MessageDigest::sha256()).unwrap();
    builder.build()
}

/// Self-signed leaf for `cn`
pub fn self_signed(cn: &str) -> Identity {
    let key = ec_key();
    let cert = build(cn, &key, None, false);
    Identity { cert, key }
}

/// Self-signed CA
pub fn ca(cn: &str) -> Identity {
    let key = ec_key();
    let cert = build(cn, &key, None, true);
    Identity { cert, key }
}

/// Leaf for `cn` signed by `issuer`
pub fn signed_by(cn: &str, issuer: &Identity) -> Identity {
    let key = ec_key();
    let cert = build(cn, &key, Some(issuer), false);
    Identity { cert, key }
}

/// Connected loopback pair: (client side, server side)
pub fn socket_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (server, _) = listener.accept().unwrap();
    (client, server)
}

/// Connection on the server end of a fresh pair, driven by a scripted engine
///
/// Returns the connection, the engine script and the peer socket.
pub fn scripted_conn(vhost: Arc<Vhost>, role: Role) -> (Connection, Arc<Script>, TcpStream) {
    let (peer, local) = socket_pair();
    local.set_nonblocking(true).unwrap();
    let mut conn = Connection::new(ConnId::new(0, 0), 0, vhost, local, role);
    let (engine, script) = ScriptedEngine::new();
    conn.engine = Some(Box::new(engine));
    (conn, script, peer)
}

/// Event loop that only records what it was asked to do
#[derive(Debug, Default)]
pub struct RecordingLoop {
    pub interest: HashMap<ConnId, PollEvents>,
    pub writable_requests: Vec<ConnId>,
    pub timeouts: HashMap<ConnId, (PendingTimeout, u64)>,
    pub removed: Vec<ConnId>,
}

impl EventLoop for RecordingLoop {
    fn insert(&mut self, id: ConnId, _fd: RawFd, events: PollEvents) -> io::Result<()> {
        self.interest.insert(id, events);
        Ok(())
    }

    fn set_interest(&mut self, id: ConnId, events: PollEvents) -> io::Result<()> {
        self.interest.insert(id, events);
        Ok(())
    }

    fn request_writable(&mut self, id: ConnId) {
        self.writable_requests.push(id);
    }

    fn set_timeout(&mut self, id: ConnId, reason: PendingTimeout, secs: u64) {
        self.timeouts.insert(id, (reason, secs));
    }

    fn clear_timeout(&mut self, id: ConnId) {
        self.timeouts.remove(&id);
    }

    fn remove(&mut self, id: ConnId) {
        self.interest.remove(&id);
        self.timeouts.remove(&id);
        self.removed.push(id);
    }
}
