//! Client side handshake and server certificate check

use super::config::{ClientConnectInfo, PeerVerify};
use super::engine::{Handshake, OpensslEngine, TlsEngine};
use super::{decode_ssl_error, Result, TlsError};
use crate::conn::{Connection, HandshakeMode};
use crate::event::{EventLoop, PendingTimeout, PollEvents};
use log::{debug, error, info};

/// Where the client handshake stands after one service call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStep {
    /// Waiting on readiness or the connection timeout
    Pending,
    /// Handshake done and the server certificate accepted
    Verified,
}

/// Attach a client session to a freshly connected socket
///
/// Uses the vhost's client context, sends the configured SNI name, and
/// arms the client handshake timeout.
pub fn start<L: EventLoop + ?Sized>(
    conn: &mut Connection,
    ev: &mut L,
    info: &ClientConnectInfo,
) -> Result<()> {
    let Some(client) = conn.vhost.tls().client_ctx() else {
        return Err(TlsError::NoContext(conn.vhost.name().to_string(), "client"));
    };

    let engine = OpensslEngine::client(
        client.ctx(),
        conn.stream.clone(),
        info.server_name.as_deref(),
        &info.alpn,
    )
    .map_err(|e| {
        error!("SSL_new failed: {}", e);
        decode_ssl_error();
        TlsError::Handshake(e)
    })?;

    conn.verify = info.verify;
    attach(conn, ev, Box::new(engine))
}

pub(crate) fn attach<L: EventLoop + ?Sized>(
    conn: &mut Connection,
    ev: &mut L,
    engine: Box<dyn TlsEngine>,
) -> Result<()> {
    conn.engine = Some(engine);
    conn.mode = HandshakeMode::ClientIssueHandshake;
    ev.insert(conn.id, conn.fd(), PollEvents::Read)?;
    ev.set_timeout(conn.id, PendingTimeout::ClientHandshake, conn.vhost.timeout_secs());
    Ok(())
}

/// Drive the connect step once
///
/// Engine failures other than want-read/want-write are logged and retried
/// on later readiness until the handshake timeout fires. Only a rejected
/// server certificate is an error here.
pub fn service<L: EventLoop + ?Sized>(conn: &mut Connection, ev: &mut L) -> Result<ClientStep> {
    match conn.mode {
        HandshakeMode::ClientIssueHandshake | HandshakeMode::ClientWaiting => {}
        HandshakeMode::Established => return Ok(ClientStep::Verified),
        mode => {
            debug!("{}: client service in {:?}", conn.id, mode);
            return Ok(ClientStep::Pending);
        }
    }

    let Some(engine) = conn.engine.as_mut() else {
        return Err(TlsError::NoContext(conn.vhost.name().to_string(), "session"));
    };

    match engine.connect() {
        Handshake::Done => verify(conn, ev),
        Handshake::WantRead => {
            ev.set_interest(conn.id, PollEvents::Read)?;
            Ok(ClientStep::Pending)
        }
        Handshake::WantWrite => {
            // a write stalled inside the engine gets no readable event to
            // retry on
            info!("{}: SSL_connect WANT_WRITE... retrying", conn.id);
            ev.request_writable(conn.id);
            conn.mode = HandshakeMode::ClientWaiting;
            Ok(ClientStep::Pending)
        }
        Handshake::Failed(e) => {
            error!("{}: SSL connect error {}", conn.id, e);
            Ok(ClientStep::Pending)
        }
    }
}

fn verify<L: EventLoop + ?Sized>(conn: &mut Connection, ev: &mut L) -> Result<ClientStep> {
    let Some(engine) = conn.engine.as_ref() else {
        return Err(TlsError::NoContext(conn.vhost.name().to_string(), "session"));
    };

    let result = engine.verify_result();
    if !result.is_ok() {
        if result.is_self_signed() && conn.verify == PeerVerify::AllowSelfSigned {
            info!("{}: accepting self-signed certificate", conn.id);
        } else {
            error!(
                "{}: server's cert didn't look good, X509_V_ERR = {}: {}",
                conn.id, result.code, result.reason
            );
            return Err(TlsError::PeerVerification(result));
        }
    }

    conn.mode = HandshakeMode::Established;
    ev.clear_timeout(conn.id);
    ev.set_interest(conn.id, PollEvents::Read)?;
    Ok(ClientStep::Verified)
}
