//! Socket helpers
//!
//! Listening and connecting sockets are created through `socket2` so the
//! options the TLS layer depends on (non-blocking mode, address reuse,
//! `TCP_NODELAY`) are set before the descriptor is handed to a worker.

use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::Duration;

/// Result type for socket setup
pub type Result<T> = std::result::Result<T, Error>;

/// Socket setup errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to create socket: {0}")]
    Socket(std::io::Error),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("Failed to listen on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("Failed to set socket option: {0}")]
    SockOpt(std::io::Error),
}

/// Default listen backlog
pub const LISTEN_BACKLOG: i32 = 128;

/// Create a non-blocking listening socket
pub fn listen(addr: SocketAddr) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(Error::Socket)?;
    socket.set_reuse_address(true).map_err(Error::SockOpt)?;
    socket
        .bind(&addr.into())
        .map_err(|source| Error::Bind { addr, source })?;
    socket
        .listen(LISTEN_BACKLOG)
        .map_err(|source| Error::Listen { addr, source })?;
    socket.set_nonblocking(true).map_err(Error::SockOpt)?;
    Ok(socket.into())
}

/// Connect to a peer, then switch the socket to non-blocking mode
///
/// The TCP connect itself is bounded by `timeout`; everything after it
/// (the TLS handshake included) runs without blocking.
pub fn connect(addr: SocketAddr, timeout: Duration) -> Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(Error::Socket)?;
    socket
        .connect_timeout(&addr.into(), timeout)
        .map_err(|source| Error::Connect { addr, source })?;
    socket.set_nodelay(true).map_err(Error::SockOpt)?;
    socket.set_nonblocking(true).map_err(Error::SockOpt)?;
    Ok(socket.into())
}

/// Force the options a worker expects on a socket it did not create
pub fn prepare_stream(stream: &TcpStream) -> Result<()> {
    let socket = socket2::SockRef::from(stream);
    socket.set_nonblocking(true).map_err(Error::SockOpt)?;
    socket.set_nodelay(true).map_err(Error::SockOpt)?;
    Ok(())
}
