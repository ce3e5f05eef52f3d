//! Event loop boundary
//!
//! The TLS layer never owns descriptor registration. It talks to whatever
//! poller the embedding server runs through the [`EventLoop`] trait, and
//! [`PollLoop`] is a small level-triggered implementation over `poll(2)`
//! for servers that have nothing better.

use crate::conn::ConnId;
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

/// Requested readiness
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvents {
    Read,
    Write,
    Both,
}

impl PollEvents {
    fn to_poll_bits(self) -> libc::c_short {
        match self {
            PollEvents::Read => libc::POLLIN,
            PollEvents::Write => libc::POLLOUT,
            PollEvents::Both => libc::POLLIN | libc::POLLOUT,
        }
    }

    fn with_write(self) -> Self {
        match self {
            PollEvents::Read | PollEvents::Both => PollEvents::Both,
            PollEvents::Write => PollEvents::Write,
        }
    }
}

/// Readiness reported by the poller for one connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    /// Peer hung up or the descriptor is in error
    pub hangup: bool,
}

impl Readiness {
    pub const READABLE: Readiness = Readiness {
        readable: true,
        writable: false,
        hangup: false,
    };

    pub const WRITABLE: Readiness = Readiness {
        readable: false,
        writable: true,
        hangup: false,
    };
}

/// Why a connection has a deadline armed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PendingTimeout {
    /// Server side handshake has not completed
    SslAccept,
    /// Handshake done, application protocol has not taken over yet
    EstablishWithServer,
    /// Client side handshake has not completed
    ClientHandshake,
}

/// Descriptor registration as seen by the TLS layer
pub trait EventLoop {
    /// Start watching a descriptor on behalf of a connection
    fn insert(&mut self, id: ConnId, fd: RawFd, events: PollEvents) -> io::Result<()>;

    /// Replace the readiness the connection waits for
    fn set_interest(&mut self, id: ConnId, events: PollEvents) -> io::Result<()>;

    /// Ask for a writable notification even if nothing else needs one
    fn request_writable(&mut self, id: ConnId);

    /// Arm (or re-arm) the connection deadline
    fn set_timeout(&mut self, id: ConnId, reason: PendingTimeout, secs: u64);

    /// Disarm the connection deadline
    fn clear_timeout(&mut self, id: ConnId);

    /// Forget the connection
    fn remove(&mut self, id: ConnId);
}

/// Level-triggered `poll(2)` event loop
#[derive(Default)]
pub struct PollLoop {
    fds: Vec<libc::pollfd>,
    ids: Vec<ConnId>,
    index: HashMap<ConnId, usize>,
    deadlines: HashMap<ConnId, (PendingTimeout, Instant)>,
}

impl PollLoop {
    pub fn new() -> Self {
        PollLoop::default()
    }

    /// Number of registered descriptors
    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Current interest of a connection, if registered
    pub fn interest(&self, id: ConnId) -> Option<PollEvents> {
        let slot = *self.index.get(&id)?;
        let bits = self.fds[slot].events;
        match (bits & libc::POLLIN != 0, bits & libc::POLLOUT != 0) {
            (true, true) => Some(PollEvents::Both),
            (false, true) => Some(PollEvents::Write),
            _ => Some(PollEvents::Read),
        }
    }

    /// Wait for readiness
    ///
    /// `None` waits until a descriptor is ready or the nearest deadline.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Vec<(ConnId, Readiness)>> {
        let timeout = self.bounded_timeout(timeout);
        let timeout_ms = timeout
            .map(|d| d.as_millis().min(i32::MAX as u128) as i32)
            .unwrap_or(-1);

        if self.fds.is_empty() {
            if let Some(d) = timeout {
                std::thread::sleep(d);
            }
            return Ok(Vec::new());
        }

        for pfd in &mut self.fds {
            pfd.revents = 0;
        }

        let result = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout_ms,
            )
        };

        if result < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }

        let mut ready = Vec::with_capacity(result as usize);
        for (pfd, id) in self.fds.iter().zip(&self.ids) {
            if pfd.revents == 0 {
                continue;
            }
            ready.push((
                *id,
                Readiness {
                    readable: pfd.revents & libc::POLLIN != 0,
                    writable: pfd.revents & libc::POLLOUT != 0,
                    hangup: pfd.revents & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0,
                },
            ));
        }
        Ok(ready)
    }

    /// Take every deadline that passed before `now`
    pub fn expired(&mut self, now: Instant) -> Vec<(ConnId, PendingTimeout)> {
        let expired: Vec<_> = self
            .deadlines
            .iter()
            .filter(|(_, (_, at))| *at <= now)
            .map(|(id, (reason, _))| (*id, *reason))
            .collect();
        for (id, _) in &expired {
            self.deadlines.remove(id);
        }
        expired
    }

    fn bounded_timeout(&self, timeout: Option<Duration>) -> Option<Duration> {
        let nearest = self
            .deadlines
            .values()
            .map(|(_, at)| at.saturating_duration_since(Instant::now()))
            .min();
        match (timeout, nearest) {
            (Some(t), Some(n)) => Some(t.min(n)),
            (None, n) => n,
            (t, None) => t,
        }
    }
}

impl EventLoop for PollLoop {
    fn insert(&mut self, id: ConnId, fd: RawFd, events: PollEvents) -> io::Result<()> {
        if self.index.contains_key(&id) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("connection {} already registered", id),
            ));
        }
        self.index.insert(id, self.fds.len());
        self.fds.push(libc::pollfd {
            fd,
            events: events.to_poll_bits(),
            revents: 0,
        });
        self.ids.push(id);
        Ok(())
    }

    fn set_interest(&mut self, id: ConnId, events: PollEvents) -> io::Result<()> {
        let slot = *self.index.get(&id).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("connection {} not registered", id))
        })?;
        self.fds[slot].events = events.to_poll_bits();
        Ok(())
    }

    fn request_writable(&mut self, id: ConnId) {
        if let Some(current) = self.interest(id) {
            let _ = self.set_interest(id, current.with_write());
        }
    }

    fn set_timeout(&mut self, id: ConnId, reason: PendingTimeout, secs: u64) {
        self.deadlines
            .insert(id, (reason, Instant::now() + Duration::from_secs(secs)));
    }

    fn clear_timeout(&mut self, id: ConnId) {
        self.deadlines.remove(&id);
    }

    fn remove(&mut self, id: ConnId) {
        self.deadlines.remove(&id);
        let Some(slot) = self.index.remove(&id) else {
            return;
        };
        self.fds.swap_remove(slot);
        self.ids.swap_remove(slot);
        if let Some(moved) = self.ids.get(slot) {
            self.index.insert(*moved, slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::AsRawFd;

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_poll_reports_readable() {
        let (mut client, server) = pair();
        let mut ev = PollLoop::new();
        let id = ConnId::new(0, 0);
        ev.insert(id, server.as_raw_fd(), PollEvents::Read).unwrap();

        let ready = ev.wait(Some(Duration::from_millis(10))).unwrap();
        assert!(ready.is_empty());

        client.write_all(b"x").unwrap();
        let ready = ev.wait(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].0, id);
        assert!(ready[0].1.readable);
    }

    #[test]
    fn test_request_writable_adds_pollout() {
        let (_client, server) = pair();
        let mut ev = PollLoop::new();
        let id = ConnId::new(3, 1);
        ev.insert(id, server.as_raw_fd(), PollEvents::Read).unwrap();
        ev.request_writable(id);
        assert_eq!(ev.interest(id), Some(PollEvents::Both));

        let ready = ev.wait(Some(Duration::from_secs(1))).unwrap();
        assert!(ready[0].1.writable);
    }

    #[test]
    fn test_remove_keeps_index_consistent() {
        let (_c1, s1) = pair();
        let (_c2, s2) = pair();
        let mut ev = PollLoop::new();
        let a = ConnId::new(0, 0);
        let b = ConnId::new(1, 0);
        ev.insert(a, s1.as_raw_fd(), PollEvents::Read).unwrap();
        ev.insert(b, s2.as_raw_fd(), PollEvents::Write).unwrap();

        ev.remove(a);
        ev.remove(a);
        assert_eq!(ev.len(), 1);
        assert_eq!(ev.interest(b), Some(PollEvents::Write));
        ev.set_interest(b, PollEvents::Read).unwrap();
        assert_eq!(ev.interest(b), Some(PollEvents::Read));
    }

    #[test]
    fn test_deadlines_expire() {
        let mut ev = PollLoop::new();
        let id = ConnId::new(0, 0);
        ev.set_timeout(id, PendingTimeout::SslAccept, 0);
        let expired = ev.expired(Instant::now());
        assert_eq!(expired, vec![(id, PendingTimeout::SslAccept)]);
        assert!(ev.expired(Instant::now()).is_empty());

        ev.set_timeout(id, PendingTimeout::EstablishWithServer, 60);
        ev.clear_timeout(id);
        assert!(ev.expired(Instant::now() + Duration::from_secs(120)).is_empty());
    }
}
