//! Capability I/O over a connection
//!
//! One read/write surface for both kinds of connection: with a TLS session
//! the engine is used, otherwise the socket directly. Results collapse to
//! done, more-service (retry on a later readiness) or error (close).

use super::buffered::BufferedList;
use super::engine::EngineIo;
use crate::conn::Connection;
use crate::event::EventLoop;
use log::debug;
use std::io::{self, Read, Write};
use std::net::Shutdown;

/// Outcome of a capability read or write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapableIo {
    Done(usize),
    /// Not fatal; try again on the next readiness
    MoreService,
    /// The connection has to be closed
    Error,
}

/// Read into `buf`
///
/// After a TLS read the connection's membership in `buffered` is brought up
/// to date: it is linked when the read filled `buf` and the engine still
/// holds plaintext, and unlinked otherwise.
pub fn read(conn: &mut Connection, buffered: &mut BufferedList, buf: &mut [u8]) -> CapableIo {
    let id = conn.id;
    let Some(engine) = conn.engine.as_mut() else {
        return plain_read(conn, buf);
    };

    match engine.read(buf) {
        EngineIo::Done(n) => {
            if n == buf.len() && engine.pending() > 0 {
                buffered.insert(id);
            } else {
                buffered.remove(id);
            }
            CapableIo::Done(n)
        }
        EngineIo::WantRead | EngineIo::WantWrite => CapableIo::MoreService,
        EngineIo::Closed => {
            debug!("{}: peer closed the session", id);
            buffered.remove(id);
            CapableIo::Error
        }
        EngineIo::Failed(e) => {
            debug!("{}: read failed {}", id, e);
            buffered.remove(id);
            CapableIo::Error
        }
    }
}

fn plain_read(conn: &Connection, buf: &mut [u8]) -> CapableIo {
    match (&*conn.stream).read(buf) {
        Ok(n) => CapableIo::Done(n),
        Err(e) if would_block(&e) => CapableIo::MoreService,
        Err(e) => {
            debug!("{}: read failed {}", conn.id, e);
            CapableIo::Error
        }
    }
}

/// Write `buf`
///
/// When the engine needs the transport writable before it can progress, a
/// writable notification is forced through `ev`, once per blocked send.
pub fn write<L: EventLoop + ?Sized>(conn: &mut Connection, ev: &mut L, buf: &[u8]) -> CapableIo {
    let id = conn.id;
    let Some(engine) = conn.engine.as_mut() else {
        return plain_write(conn, ev, buf);
    };

    match engine.write(buf) {
        EngineIo::Done(n) => {
            conn.blocking_send = false;
            CapableIo::Done(n)
        }
        EngineIo::WantWrite => {
            block_send(conn, ev);
            CapableIo::MoreService
        }
        EngineIo::WantRead => CapableIo::MoreService,
        EngineIo::Closed => CapableIo::Error,
        EngineIo::Failed(e) => {
            debug!("{}: write failed {}", id, e);
            CapableIo::Error
        }
    }
}

fn plain_write<L: EventLoop + ?Sized>(conn: &mut Connection, ev: &mut L, buf: &[u8]) -> CapableIo {
    match (&*conn.stream).write(buf) {
        Ok(n) => {
            conn.blocking_send = false;
            CapableIo::Done(n)
        }
        Err(e) if would_block(&e) => {
            block_send(conn, ev);
            CapableIo::MoreService
        }
        Err(e) => {
            debug!("{}: write failed {}", conn.id, e);
            CapableIo::Error
        }
    }
}

/// Ask for a writable notification unless one is already outstanding
fn block_send<L: EventLoop + ?Sized>(conn: &mut Connection, ev: &mut L) {
    if !conn.blocking_send {
        conn.blocking_send = true;
        ev.request_writable(conn.id);
    }
}

fn would_block(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
}

/// Plaintext held inside the engine; 0 without a session
pub fn pending(conn: &Connection) -> usize {
    conn.engine.as_ref().map_or(0, |engine| engine.pending())
}

/// Tear down the TLS session of `conn`
///
/// Sends close notify, frees the session and shuts the socket down.
/// Returns false when there was no session, leaving the plain close to the
/// caller.
pub fn close(conn: &mut Connection) -> bool {
    let Some(mut engine) = conn.engine.take() else {
        return false;
    };

    engine.shutdown();
    drop(engine);
    if let Err(e) = conn.stream.shutdown(Shutdown::Both) {
        debug!("{}: socket shutdown: {}", conn.id, e);
    }
    true
}
