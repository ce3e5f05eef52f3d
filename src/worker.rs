//! Per-thread service worker
//!
//! A worker owns a disjoint set of connections, their buffered-plaintext
//! list and its event loop, and is only ever driven from one thread. It
//! runs the handshake state machines on readiness and reports what the
//! application protocol layer has to do next as [`ServiceEvent`]s.

use crate::conn::{ConnArena, ConnId, Connection, HandshakeMode, Role};
use crate::event::{EventLoop, PendingTimeout, PollEvents, PollLoop, Readiness};
use crate::net;
use crate::tls::callbacks::EstablishedInfo;
use crate::tls::capable::{self, CapableIo};
use crate::tls::client::{self, ClientStep};
use crate::tls::config::ClientConnectInfo;
use crate::tls::server::{self, ServerStep};
use crate::tls::vhost::Vhost;
use crate::tls::{BufferedList, Result, TlsError};
use log::{debug, info, warn};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Size of the per-worker scratch buffer
pub const SERV_BUF_SIZE: usize = 4096;

/// Why the worker closed a connection on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Timeout(PendingTimeout),
    Handshake,
    Verification,
    Hangup,
}

/// Work for the application protocol layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    /// Handshake finished (or the connection was downgraded); data may flow
    Established { id: ConnId, info: EstablishedInfo },
    /// Data (or end of stream) is waiting, possibly inside the engine
    Readable(ConnId),
    /// A forced or requested writable notification arrived
    Writable(ConnId),
    Closed { id: ConnId, reason: CloseReason },
}

/// Service worker over an event loop
pub struct Worker<L: EventLoop> {
    tsi: usize,
    conns: ConnArena,
    buffered: BufferedList,
    serv_buf: Vec<u8>,
    events: Vec<ServiceEvent>,
    ev: L,
}

impl<L: EventLoop> Worker<L> {
    /// Create worker number `tsi` over `ev`
    pub fn new(tsi: usize, ev: L) -> Self {
        Worker {
            tsi,
            conns: ConnArena::new(),
            buffered: BufferedList::new(),
            serv_buf: vec![0u8; SERV_BUF_SIZE],
            events: Vec::new(),
            ev,
        }
    }

    pub fn tsi(&self) -> usize {
        self.tsi
    }

    pub fn event_loop(&self) -> &L {
        &self.ev
    }

    pub fn event_loop_mut(&mut self) -> &mut L {
        &mut self.ev
    }

    /// Number of open connections
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn connection(&self, id: ConnId) -> Option<&Connection> {
        self.conns.get(id)
    }

    pub fn mode(&self, id: ConnId) -> Option<HandshakeMode> {
        self.conns.get(id).map(|c| c.mode())
    }

    /// Connections with plaintext waiting inside their engine
    pub fn buffered(&self) -> &BufferedList {
        &self.buffered
    }

    /// Everything reported since the last call
    pub fn take_events(&mut self) -> Vec<ServiceEvent> {
        std::mem::take(&mut self.events)
    }

    /// Take over a socket accepted on a listener of `vhost`
    ///
    /// A TLS vhost starts the server handshake right away; a plaintext one
    /// is established immediately. Errors mean the connection was never
    /// registered.
    pub fn adopt_accepted(&mut self, vhost: Arc<Vhost>, stream: TcpStream) -> Result<ConnId> {
        net::prepare_stream(&stream)?;
        let use_ssl = vhost.use_ssl();
        let id = self.conns.next_id();
        self.conns
            .insert(Connection::new(id, self.tsi, vhost, stream, Role::Server));

        if !use_ssl {
            self.adopt_plain(id)?;
            return Ok(id);
        }

        self.drive(id)?;
        Ok(id)
    }

    /// Take over a socket connected on behalf of `vhost`
    pub fn adopt_client(
        &mut self,
        vhost: Arc<Vhost>,
        stream: TcpStream,
        info: &ClientConnectInfo,
    ) -> Result<ConnId> {
        net::prepare_stream(&stream)?;
        let id = self.conns.next_id();
        self.conns
            .insert(Connection::new(id, self.tsi, vhost, stream, Role::Client));

        if !info.use_ssl {
            self.adopt_plain(id)?;
            return Ok(id);
        }

        let started = match self.conns.get_mut(id) {
            Some(conn) => client::start(conn, &mut self.ev, info),
            None => Err(TlsError::UnknownConnection(id)),
        };
        if let Err(e) = started {
            self.discard(id);
            return Err(e);
        }

        // issue the handshake right after the connect
        self.drive(id)?;
        Ok(id)
    }

    fn adopt_plain(&mut self, id: ConnId) -> Result<()> {
        let Some(conn) = self.conns.get_mut(id) else {
            return Err(TlsError::UnknownConnection(id));
        };
        if let Err(e) = self.ev.insert(id, conn.fd(), PollEvents::Read) {
            self.discard(id);
            return Err(e.into());
        }
        conn.mode = HandshakeMode::Established;
        self.establish(id);
        Ok(())
    }

    /// Drop a connection that never made it into the event loop
    fn discard(&mut self, id: ConnId) {
        self.ev.remove(id);
        if let Some(mut conn) = self.conns.remove(id) {
            capable::close(&mut conn);
        }
    }

    /// Run one handshake step
    ///
    /// Errors only for a connection that failed before its session
    /// existed; it is removed again. Every later failure closes the
    /// connection and is reported as [`ServiceEvent::Closed`].
    fn drive(&mut self, id: ConnId) -> Result<()> {
        let Some(conn) = self.conns.get_mut(id) else {
            return Ok(());
        };

        let outcome = match conn.role {
            Role::Server => server::service(conn, &mut self.ev, &mut self.serv_buf)
                .map(|step| step == ServerStep::Accepted),
            Role::Client => {
                client::service(conn, &mut self.ev).map(|step| step == ClientStep::Verified)
            }
        };
        let setup_failed = conn.mode == HandshakeMode::Init;

        match outcome {
            Ok(true) => self.establish(id),
            Ok(false) => {}
            Err(e) if setup_failed => {
                self.discard(id);
                return Err(e);
            }
            Err(e) => {
                let reason = match e {
                    TlsError::PeerVerification(_) => CloseReason::Verification,
                    _ => CloseReason::Handshake,
                };
                info!("{}: closing: {}", id, e);
                self.close_with(id, reason);
            }
        }
        Ok(())
    }

    fn establish(&mut self, id: ConnId) {
        let Some(conn) = self.conns.get(id) else {
            return;
        };

        let engine = conn.engine.as_deref();
        let info = EstablishedInfo {
            role: conn.role(),
            plaintext: engine.is_none(),
            redirect_to_https: conn.redirect_to_https(),
            alpn: engine.and_then(|e| e.selected_alpn()),
            peer: engine.and_then(|e| e.peer_certificate()),
        };
        conn.vhost
            .callbacks()
            .on_established(conn.vhost.caps(), id, &info);
        self.events.push(ServiceEvent::Established { id, info });
    }

    /// React to readiness reported by the event loop
    pub fn handle_readiness(&mut self, id: ConnId, readiness: Readiness) {
        let Some(conn) = self.conns.get_mut(id) else {
            debug!("{}: readiness for a closed connection", id);
            return;
        };

        if conn.mode.is_ready() {
            if readiness.writable {
                conn.blocking_send = false;
                // writable notifications are one-shot
                if let Err(e) = self.ev.set_interest(id, PollEvents::Read) {
                    debug!("{}: set_interest: {}", id, e);
                }
                self.events.push(ServiceEvent::Writable(id));
            }
            if readiness.readable || readiness.hangup {
                self.events.push(ServiceEvent::Readable(id));
            }
            return;
        }

        if readiness.hangup {
            debug!("{}: hangup during handshake", id);
            self.close_with(id, CloseReason::Hangup);
            return;
        }

        if let Err(e) = self.drive(id) {
            warn!("{}: handshake step: {}", id, e);
        }
    }

    /// Read application data
    pub fn read(&mut self, id: ConnId, buf: &mut [u8]) -> CapableIo {
        match self.conns.get_mut(id) {
            Some(conn) if conn.mode.is_ready() => capable::read(conn, &mut self.buffered, buf),
            Some(_) => CapableIo::MoreService,
            None => CapableIo::Error,
        }
    }

    /// Write application data
    pub fn write(&mut self, id: ConnId, buf: &[u8]) -> CapableIo {
        match self.conns.get_mut(id) {
            Some(conn) if conn.mode.is_ready() => capable::write(conn, &mut self.ev, buf),
            Some(_) => CapableIo::MoreService,
            None => CapableIo::Error,
        }
    }

    /// Plaintext held inside the engine of `id`
    pub fn pending(&self, id: ConnId) -> usize {
        self.conns.get(id).map_or(0, capable::pending)
    }

    /// The application protocol took over; stop the pending deadline
    pub fn clear_timeout(&mut self, id: ConnId) {
        if self.conns.get(id).is_some() {
            self.ev.clear_timeout(id);
        }
    }

    /// Close `id`
    ///
    /// Safe from any state and from any path; returns false when the
    /// connection was already gone.
    pub fn close(&mut self, id: ConnId) -> bool {
        let Some(mut conn) = self.conns.remove(id) else {
            return false;
        };

        self.buffered.remove(id);
        self.ev.remove(id);
        if !capable::close(&mut conn) {
            if let Err(e) = conn.stream.shutdown(Shutdown::Both) {
                debug!("{}: socket shutdown: {}", id, e);
            }
        }
        debug!("{}: closed", id);
        true
    }

    fn close_with(&mut self, id: ConnId, reason: CloseReason) {
        if self.close(id) {
            self.events.push(ServiceEvent::Closed { id, reason });
        }
    }

    /// A deadline armed through the event loop passed
    pub fn expire(&mut self, id: ConnId, reason: PendingTimeout) {
        info!("{}: timed out waiting for {:?}", id, reason);
        self.close_with(id, CloseReason::Timeout(reason));
    }

    /// Close every connection
    pub fn close_all(&mut self) {
        for id in self.conns.ids() {
            self.close(id);
        }
    }
}

impl Worker<PollLoop> {
    /// One service iteration
    ///
    /// While the buffered-plaintext list is non-empty the poll does not
    /// wait, and every listed connection is reported readable.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> Result<Vec<ServiceEvent>> {
        let timeout = if self.buffered.is_empty() {
            timeout
        } else {
            Some(Duration::ZERO)
        };

        let ready = self.ev.wait(timeout)?;

        for (id, reason) in self.ev.expired(Instant::now()) {
            self.expire(id, reason);
        }

        for (id, readiness) in ready {
            self.handle_readiness(id, readiness);
        }

        for id in self.buffered.snapshot() {
            let reported = self
                .events
                .iter()
                .any(|e| matches!(e, ServiceEvent::Readable(r) if *r == id));
            if !reported && self.conns.get(id).is_some() {
                self.events.push(ServiceEvent::Readable(id));
            }
        }

        Ok(self.take_events())
    }
}

impl<L: EventLoop> Drop for Worker<L> {
    fn drop(&mut self) {
        self.close_all();
    }
}
