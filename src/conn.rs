//! Connections and the per-worker connection arena

use crate::tls::config::PeerVerify;
use crate::tls::engine::TlsEngine;
use crate::tls::vhost::Vhost;
use std::fmt;
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

/// Arena identifier of a connection
///
/// The generation makes ids of closed connections stale, so a late
/// close or readiness report never lands on a reused slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId {
    index: u32,
    generation: u32,
}

impl ConnId {
    pub fn new(index: u32, generation: u32) -> Self {
        ConnId { index, generation }
    }

    pub fn index(&self) -> usize {
        self.index as usize
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.index, self.generation)
    }
}

/// Where a connection is in its TLS lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeMode {
    /// Accepted, no TLS session yet
    Init,
    /// Server handshake in progress
    AcceptPending,
    /// Secure listener downgraded the connection to plaintext
    PlaintextFallback,
    /// Client handshake issued right after the TCP connect
    ClientIssueHandshake,
    /// Client handshake waiting on readiness
    ClientWaiting,
    /// Handshake finished (or no TLS on this vhost)
    Established,
}

impl HandshakeMode {
    /// True once application data may flow
    pub fn is_ready(&self) -> bool {
        matches!(self, HandshakeMode::Established | HandshakeMode::PlaintextFallback)
    }
}

/// Which side of the handshake a connection plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

/// One accepted or initiated socket
pub struct Connection {
    pub(crate) id: ConnId,
    /// Index of the owning worker
    pub(crate) tsi: usize,
    pub(crate) vhost: Arc<Vhost>,
    pub(crate) stream: Arc<TcpStream>,
    pub(crate) engine: Option<Box<dyn TlsEngine>>,
    pub(crate) mode: HandshakeMode,
    pub(crate) role: Role,
    pub(crate) redirect_to_https: bool,
    pub(crate) verify: PeerVerify,
    /// Engine asked for a write the transport has not signalled yet
    pub(crate) blocking_send: bool,
}

impl Connection {
    pub(crate) fn new(
        id: ConnId,
        tsi: usize,
        vhost: Arc<Vhost>,
        stream: TcpStream,
        role: Role,
    ) -> Self {
        Connection {
            id,
            tsi,
            vhost,
            stream: Arc::new(stream),
            engine: None,
            mode: HandshakeMode::Init,
            role,
            redirect_to_https: false,
            verify: PeerVerify::Required,
            blocking_send: false,
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn tsi(&self) -> usize {
        self.tsi
    }

    pub fn mode(&self) -> HandshakeMode {
        self.mode
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn vhost(&self) -> &Arc<Vhost> {
        &self.vhost
    }

    /// True when a TLS session is attached
    pub fn has_session(&self) -> bool {
        self.engine.is_some()
    }

    pub fn redirect_to_https(&self) -> bool {
        self.redirect_to_https
    }

    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

struct Slot {
    generation: u32,
    conn: Option<Connection>,
}

/// Generation-checked slot arena
#[derive(Default)]
pub struct ConnArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl ConnArena {
    pub fn new() -> Self {
        ConnArena::default()
    }

    /// Reserve an id for a connection about to be built
    pub fn next_id(&self) -> ConnId {
        match self.free.last() {
            Some(&index) => ConnId::new(index, self.slots[index as usize].generation),
            None => ConnId::new(self.slots.len() as u32, 0),
        }
    }

    /// Store a connection under the id returned by [`ConnArena::next_id`]
    pub fn insert(&mut self, conn: Connection) -> ConnId {
        let id = conn.id;
        if self.free.last() == Some(&(id.index)) {
            self.free.pop();
            let slot = &mut self.slots[id.index()];
            debug_assert_eq!(slot.generation, id.generation);
            slot.conn = Some(conn);
        } else {
            debug_assert_eq!(id.index(), self.slots.len());
            self.slots.push(Slot {
                generation: id.generation,
                conn: Some(conn),
            });
        }
        self.live += 1;
        id
    }

    pub fn get(&self, id: ConnId) -> Option<&Connection> {
        self.slots
            .get(id.index())
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.conn.as_ref())
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.slots
            .get_mut(id.index())
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.conn.as_mut())
    }

    /// Take a connection out, retiring its id
    pub fn remove(&mut self, id: ConnId) -> Option<Connection> {
        let slot = self.slots.get_mut(id.index())?;
        if slot.generation != id.generation {
            return None;
        }
        let conn = slot.conn.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        Some(conn)
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn ids(&self) -> Vec<ConnId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.conn.is_some())
            .map(|(index, slot)| ConnId::new(index as u32, slot.generation))
            .collect()
    }
}
