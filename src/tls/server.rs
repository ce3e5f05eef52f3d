//! Server side handshake
//!
//! `Init` attaches a session and registers the socket, then falls straight
//! into `AcceptPending`, which every later readiness re-enters until the
//! connection is `Established`, downgraded to `PlaintextFallback`, or torn
//! down by the caller on error.

use super::engine::{Handshake, OpensslEngine, TlsEngine};
use super::{decode_ssl_error, Result, TlsError};
use crate::conn::{Connection, HandshakeMode};
use crate::event::{EventLoop, PendingTimeout, PollEvents};
use log::{debug, error, info};
use std::io;
use std::sync::Arc;

/// Where the server handshake stands after one service call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStep {
    /// Waiting on readiness or the accept timeout
    Pending,
    /// Application data may flow (secured or downgraded)
    Accepted,
}

/// Service one readiness notification on an accepted connection
///
/// `peek_buf` is worker scratch space for the plaintext-fallback check. An
/// error means the connection has to be closed.
pub fn service<L: EventLoop + ?Sized>(
    conn: &mut Connection,
    ev: &mut L,
    peek_buf: &mut [u8],
) -> Result<ServerStep> {
    if conn.mode == HandshakeMode::Init {
        let engine = new_session(conn)?;
        attach(conn, ev, Box::new(engine))?;
        info!("{}: inserted SSL accept into fds, trying SSL_accept", conn.id);
    }

    match conn.mode {
        HandshakeMode::AcceptPending => accept_pending(conn, ev, peek_buf),
        HandshakeMode::Established | HandshakeMode::PlaintextFallback => Ok(ServerStep::Accepted),
        mode => {
            debug!("{}: server service in {:?}", conn.id, mode);
            Ok(ServerStep::Pending)
        }
    }
}

fn new_session(conn: &Connection) -> Result<OpensslEngine> {
    let Some(ctx) = conn.vhost.tls().server_ctx() else {
        return Err(TlsError::NoContext(conn.vhost.name().to_string(), "server"));
    };

    OpensslEngine::server(ctx, conn.stream.clone()).map_err(|e| {
        error!("SSL_new failed: {}", e);
        decode_ssl_error();
        TlsError::Handshake(e)
    })
}

/// Bind `engine` to the connection and enter `AcceptPending`
pub(crate) fn attach<L: EventLoop + ?Sized>(
    conn: &mut Connection,
    ev: &mut L,
    engine: Box<dyn TlsEngine>,
) -> Result<()> {
    conn.engine = Some(engine);
    conn.mode = HandshakeMode::AcceptPending;
    ev.insert(conn.id, conn.fd(), PollEvents::Read)?;
    ev.set_timeout(conn.id, PendingTimeout::SslAccept, conn.vhost.timeout_secs());
    Ok(())
}

fn accept_pending<L: EventLoop + ?Sized>(
    conn: &mut Connection,
    ev: &mut L,
    peek_buf: &mut [u8],
) -> Result<ServerStep> {
    if conn.vhost.allow_non_ssl_on_ssl_port() {
        match conn.stream.peek(peek_buf) {
            // TLS records start with a content type below 0x20 (handshake
            // is 0x16); a plaintext request line starts with a method name
            Ok(n) if n >= 1 && peek_buf[0] >= b' ' => {
                downgrade(conn);
                return Ok(accepted(conn, ev));
            }
            // gone or nothing yet; the accept timeout covers a dead peer
            Ok(0) => return Ok(ServerStep::Pending),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                ev.set_interest(conn.id, PollEvents::Read)?;
                return Ok(ServerStep::Pending);
            }
            _ => {}
        }
    }

    let Some(engine) = conn.engine.as_mut() else {
        return Err(TlsError::NoContext(conn.vhost.name().to_string(), "session"));
    };

    match engine.accept() {
        Handshake::Done => {
            if let Some(vhost) = engine.sni_vhost() {
                if !Arc::ptr_eq(&vhost, &conn.vhost) {
                    debug!("{}: served by vhost '{}'", conn.id, vhost.name());
                    conn.vhost = vhost;
                }
            }
            Ok(accepted(conn, ev))
        }
        Handshake::WantRead => {
            ev.set_interest(conn.id, PollEvents::Read)?;
            debug!("{}: SSL_ERROR_WANT_READ", conn.id);
            Ok(ServerStep::Pending)
        }
        Handshake::WantWrite => {
            ev.set_interest(conn.id, PollEvents::Write)?;
            debug!("{}: SSL_ERROR_WANT_WRITE", conn.id);
            Ok(ServerStep::Pending)
        }
        Handshake::Failed(e) => {
            debug!("{}: SSL_accept failed {}", conn.id, e);
            Err(TlsError::Handshake(e))
        }
    }
}

/// Drop the session and carry on in plaintext
fn downgrade(conn: &mut Connection) {
    if let Some(mut engine) = conn.engine.take() {
        engine.shutdown();
    }
    conn.mode = HandshakeMode::PlaintextFallback;
    conn.redirect_to_https = conn.vhost.redirect_http_to_https();
    info!(
        "{}: plaintext client on SSL port, redirect {}",
        conn.id, conn.redirect_to_https
    );
}

fn accepted<L: EventLoop + ?Sized>(conn: &mut Connection, ev: &mut L) -> ServerStep {
    ev.set_timeout(
        conn.id,
        PendingTimeout::EstablishWithServer,
        conn.vhost.timeout_secs(),
    );
    if conn.mode != HandshakeMode::PlaintextFallback {
        conn.mode = HandshakeMode::Established;
    }
    if let Err(e) = ev.set_interest(conn.id, PollEvents::Read) {
        debug!("{}: set_interest after accept: {}", conn.id, e);
    }
    debug!("{}: accepted new SSL conn", conn.id);
    ServerStep::Accepted
}
