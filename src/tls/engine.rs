//! TLS engine backends
//!
//! The rest of the crate only sees [`TlsEngine`]: a non-blocking session
//! whose every step reports done, wants-read, wants-write or failed. The
//! OpenSSL variant lives here; another backend only has to implement the
//! trait.

use super::cert::CertInfo;
use super::vhost::Vhost;
use openssl::error::ErrorStack;
use openssl::ssl::{self, ErrorCode, Ssl, SslContextRef};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

/// X.509 verification finished without error
pub const X509_V_OK: i32 = 0;
/// Peer sent a self-signed leaf certificate
pub const X509_V_ERR_DEPTH_ZERO_SELF_SIGNED_CERT: i32 = 18;
/// Chain ends in a self-signed certificate that is not trusted
pub const X509_V_ERR_SELF_SIGNED_CERT_IN_CHAIN: i32 = 19;

/// Engine error with its numeric code and text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineError {
    pub code: u64,
    pub message: String,
}

impl EngineError {
    pub fn new(code: u64, message: impl Into<String>) -> Self {
        EngineError {
            code,
            message: message.into(),
        }
    }

    fn from_ssl(err: &ssl::Error) -> Self {
        let code = err
            .ssl_error()
            .and_then(|stack| stack.errors().first())
            .map(|e| e.code() as u64)
            .unwrap_or(err.code().as_raw() as u64);
        EngineError::new(code, err.to_string())
    }

    fn from_stack(stack: &ErrorStack) -> Self {
        let code = stack.errors().first().map(|e| e.code() as u64).unwrap_or(0);
        EngineError::new(code, stack.to_string())
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl From<ErrorStack> for EngineError {
    fn from(stack: ErrorStack) -> Self {
        EngineError::from_stack(&stack)
    }
}

/// Outcome of one accept or connect step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handshake {
    Done,
    WantRead,
    WantWrite,
    Failed(EngineError),
}

/// Outcome of one read or write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineIo {
    Done(usize),
    WantRead,
    WantWrite,
    /// Peer shut the session down
    Closed,
    Failed(EngineError),
}

/// Result of the peer certificate chain check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerVerification {
    pub code: i32,
    pub reason: String,
}

impl PeerVerification {
    pub fn ok() -> Self {
        PeerVerification {
            code: X509_V_OK,
            reason: "ok".to_string(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == X509_V_OK
    }

    pub fn is_self_signed(&self) -> bool {
        self.code == X509_V_ERR_DEPTH_ZERO_SELF_SIGNED_CERT
            || self.code == X509_V_ERR_SELF_SIGNED_CERT_IN_CHAIN
    }
}

/// A non-blocking TLS session bound to one socket
pub trait TlsEngine: Send {
    /// Drive the server side handshake one step
    fn accept(&mut self) -> Handshake;

    /// Drive the client side handshake one step
    fn connect(&mut self) -> Handshake;

    fn read(&mut self, buf: &mut [u8]) -> EngineIo;

    fn write(&mut self, buf: &[u8]) -> EngineIo;

    /// Decrypted bytes held inside the engine
    fn pending(&self) -> usize;

    /// Protocol level close notify; never fails
    fn shutdown(&mut self);

    fn verify_result(&self) -> PeerVerification;

    fn peer_certificate(&self) -> Option<CertInfo> {
        None
    }

    fn selected_alpn(&self) -> Option<String> {
        None
    }

    /// Host the session was moved to by SNI, if any
    fn sni_vhost(&self) -> Option<Arc<Vhost>> {
        None
    }
}

/// Shared handle on the connection socket
///
/// The connection keeps its own reference, so dropping the engine (as a
/// plaintext downgrade does) leaves the descriptor open.
pub struct SocketIo(Arc<TcpStream>);

impl Read for SocketIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&*self.0).read(buf)
    }
}

impl Write for SocketIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&*self.0).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (&*self.0).flush()
    }
}

/// OpenSSL backed engine
pub struct OpensslEngine {
    stream: ssl::SslStream<SocketIo>,
}

impl OpensslEngine {
    /// Create an accept-side session on `ctx`
    pub fn server(ctx: &SslContextRef, socket: Arc<TcpStream>) -> Result<Self, EngineError> {
        let mut ssl = Ssl::new(ctx)?;
        ssl.set_accept_state();
        Self::with_ssl(ssl, socket)
    }

    /// Create a connect-side session on `ctx`, sending `server_name` as SNI
    /// and offering `alpn` in preference order
    pub fn client(
        ctx: &SslContextRef,
        socket: Arc<TcpStream>,
        server_name: Option<&str>,
        alpn: &[String],
    ) -> Result<Self, EngineError> {
        let mut ssl = Ssl::new(ctx)?;
        if let Some(name) = server_name {
            ssl.set_hostname(name)?;
        }
        if !alpn.is_empty() {
            ssl.set_alpn_protos(&alpn_wire(alpn))?;
        }
        ssl.set_connect_state();
        Self::with_ssl(ssl, socket)
    }

    fn with_ssl(ssl: Ssl, socket: Arc<TcpStream>) -> Result<Self, EngineError> {
        socket
            .set_nonblocking(true)
            .map_err(|e| EngineError::new(e.raw_os_error().unwrap_or(0) as u64, e.to_string()))?;
        let stream = ssl::SslStream::new(ssl, SocketIo(socket))?;
        Ok(OpensslEngine { stream })
    }

    pub fn ssl(&self) -> &ssl::SslRef {
        self.stream.ssl()
    }
}

/// Length-prefixed ALPN protocol list
fn alpn_wire(protocols: &[String]) -> Vec<u8> {
    let mut wire = Vec::new();
    for proto in protocols.iter().filter(|p| !p.is_empty() && p.len() <= 255) {
        wire.push(proto.len() as u8);
        wire.extend_from_slice(proto.as_bytes());
    }
    wire
}

fn handshake_step(result: Result<(), ssl::Error>) -> Handshake {
    match result {
        Ok(()) => Handshake::Done,
        Err(e) => match e.code() {
            ErrorCode::WANT_READ => Handshake::WantRead,
            ErrorCode::WANT_WRITE => Handshake::WantWrite,
            _ => Handshake::Failed(EngineError::from_ssl(&e)),
        },
    }
}

fn io_step(result: Result<usize, ssl::Error>, requested: usize) -> EngineIo {
    match result {
        Ok(0) if requested > 0 => EngineIo::Closed,
        Ok(n) => EngineIo::Done(n),
        Err(e) => match e.code() {
            ErrorCode::WANT_READ => EngineIo::WantRead,
            ErrorCode::WANT_WRITE => EngineIo::WantWrite,
            ErrorCode::ZERO_RETURN => EngineIo::Closed,
            ErrorCode::SYSCALL if e.io_error().is_none() && e.ssl_error().is_none() => {
                EngineIo::Closed
            }
            _ => EngineIo::Failed(EngineError::from_ssl(&e)),
        },
    }
}

impl TlsEngine for OpensslEngine {
    fn accept(&mut self) -> Handshake {
        handshake_step(self.stream.accept())
    }

    fn connect(&mut self) -> Handshake {
        handshake_step(self.stream.connect())
    }

    fn read(&mut self, buf: &mut [u8]) -> EngineIo {
        let requested = buf.len();
        io_step(self.stream.ssl_read(buf), requested)
    }

    fn write(&mut self, buf: &[u8]) -> EngineIo {
        io_step(self.stream.ssl_write(buf), buf.len())
    }

    fn pending(&self) -> usize {
        self.stream.ssl().pending()
    }

    fn shutdown(&mut self) {
        let _ = self.stream.shutdown();
    }

    fn verify_result(&self) -> PeerVerification {
        let result = self.stream.ssl().verify_result();
        PeerVerification {
            code: result.as_raw(),
            reason: result.error_string().to_string(),
        }
    }

    fn peer_certificate(&self) -> Option<CertInfo> {
        self.stream
            .ssl()
            .peer_certificate()
            .map(|cert| CertInfo::from_x509(&cert))
    }

    fn selected_alpn(&self) -> Option<String> {
        self.stream
            .ssl()
            .selected_alpn_protocol()
            .map(|p| String::from_utf8_lossy(p).into_owned())
    }

    fn sni_vhost(&self) -> Option<Arc<Vhost>> {
        super::sni::sni_host(self.stream.ssl()).cloned()
    }
}
