//! Abstraction of Tcp and Unix client socket types

#[cfg(unix)]
use std::os::unix::net as unix_net;
use std::{
    net::{Shutdown, SocketAddr, TcpStream},
    time::Duration,
};

/// Unified client stream. Either a [`TcpStream`] or [`std::os::unix::net::UnixStream`].
///
/// A connection handed off through [`detach`](crate::HttpServer) keeps this
/// type; the server never reads, writes or closes a detached stream again.
#[derive(Debug)]
pub enum ConnectionStream {
    /// Plain TCP client socket
    Tcp(TcpStream),
    /// Unix domain client socket
    #[cfg(unix)]
    Unix(unix_net::UnixStream),
}

impl ConnectionStream {
    /// Gets the peer's address. `Some` for TCP, `None` for Unix sockets.
    ///
    /// # Errors
    ///
    /// `std::io::Error` when the socket is gone
    pub fn peer_addr(&self) -> std::io::Result<Option<SocketAddr>> {
        match self {
            Self::Tcp(s) => s.peer_addr().map(Some),
            #[cfg(unix)]
            Self::Unix(_) => Ok(None),
        }
    }

    /// Applies a read timeout to the underlying socket.
    ///
    /// # Errors
    ///
    /// `std::io::Error` when the option cannot be set
    pub fn set_read_timeout(&self, dur: Option<Duration>) -> std::io::Result<()> {
        match self {
            Self::Tcp(s) => s.set_read_timeout(dur),
            #[cfg(unix)]
            Self::Unix(s) => s.set_read_timeout(dur),
        }
    }

    /// Shuts down the read, write or both halves of the connection.
    ///
    /// # Errors
    ///
    /// `std::io::Error` when the socket is gone
    pub fn shutdown(&self, how: Shutdown) -> std::io::Result<()> {
        match self {
            Self::Tcp(s) => s.shutdown(how),
            #[cfg(unix)]
            Self::Unix(s) => s.shutdown(how),
        }
    }

    pub(crate) fn try_clone(&self) -> std::io::Result<Self> {
        match self {
            Self::Tcp(s) => s.try_clone().map(Self::from),
            #[cfg(unix)]
            Self::Unix(s) => s.try_clone().map(Self::from),
        }
    }
}

impl std::io::Read for ConnectionStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            Self::Unix(s) => s.read(buf),
        }
    }
}

impl std::io::Write for ConnectionStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            Self::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Tcp(s) => s.flush(),
            #[cfg(unix)]
            Self::Unix(s) => s.flush(),
        }
    }
}

impl From<TcpStream> for ConnectionStream {
    fn from(s: TcpStream) -> Self {
        Self::Tcp(s)
    }
}

#[cfg(unix)]
impl From<unix_net::UnixStream> for ConnectionStream {
    fn from(s: unix_net::UnixStream) -> Self {
        Self::Unix(s)
    }
}
