//! Abstractions of Tcp and Unix listen socket types

#[cfg(unix)]
use std::os::unix::net as unix_net;
use std::{
    net::{SocketAddr, TcpListener, ToSocketAddrs},
    path::PathBuf,
};

use crate::connection_stream::ConnectionStream;
use crate::log;

/// Receive timeout applied to an inherited listen socket so `accept()`
/// unblocks periodically and the acceptor can observe shutdown.
#[cfg(unix)]
const INHERITED_ACCEPT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(1);

/// First file descriptor passed by a socket-activation service manager.
#[cfg(unix)]
const LISTEN_FDS_START: std::os::unix::io::RawFd = 3;

/// Unified listener. Either a [`TcpListener`] or [`std::os::unix::net::UnixListener`]
#[allow(missing_debug_implementations)]
pub enum Listener {
    /// [`TcpListener`] socket
    Tcp(TcpListener),
    /// [`unix_net::UnixListener`] socket
    #[cfg(unix)]
    Unix(unix_net::UnixListener),
}

impl Listener {
    pub(crate) fn local_addr(&self) -> std::io::Result<ListenAddr> {
        match self {
            Self::Tcp(l) => l.local_addr().map(ListenAddr::from),
            #[cfg(unix)]
            Self::Unix(l) => l.local_addr().map(ListenAddr::from),
        }
    }

    pub(crate) fn accept(&self) -> std::io::Result<(ConnectionStream, Option<SocketAddr>)> {
        match self {
            Self::Tcp(l) => l
                .accept()
                .map(|(stream, addr)| (ConnectionStream::from(stream), Some(addr))),
            #[cfg(unix)]
            Self::Unix(l) => l
                .accept()
                .map(|(stream, _)| (ConnectionStream::from(stream), None)),
        }
    }
}

impl From<TcpListener> for Listener {
    fn from(s: TcpListener) -> Self {
        Self::Tcp(s)
    }
}

#[cfg(unix)]
impl From<unix_net::UnixListener> for Listener {
    fn from(s: unix_net::UnixListener) -> Self {
        Self::Unix(s)
    }
}

/// Address the server is asked to listen on.
///
/// Usually built with [`ConfigListenAddr::parse`] from a port/address string:
///
/// - `"8080"` or `"0.0.0.0:8080"` binds a TCP socket
/// - `"unix:/run/app.sock"` binds a Unix domain socket
/// - `""` (Linux) inherits the listen socket from the process environment
///   (socket activation)
#[derive(Debug, Clone)]
pub enum ConfigListenAddr {
    /// [`SocketAddr`] candidates for an IP listener
    IP(Vec<SocketAddr>),
    /// [`PathBuf`] for a Unix socket
    #[cfg(unix)]
    Unix(PathBuf),
    /// Inherit the listen socket from the service manager (Linux)
    #[cfg(unix)]
    Inherited,
}

impl ConfigListenAddr {
    /// Create [`ConfigListenAddr`] from IP addresses
    ///
    /// # Errors
    ///
    /// `std::io::Error` when `addrs` are no socket addresses
    pub fn from_socket_addrs<A: ToSocketAddrs>(addrs: A) -> std::io::Result<Self> {
        addrs.to_socket_addrs().map(|it| Self::IP(it.collect()))
    }

    /// Create [`ConfigListenAddr`] from `path`
    #[cfg(unix)]
    pub fn unix_from_path<P: Into<PathBuf>>(path: P) -> Self {
        Self::Unix(path.into())
    }

    /// Parses a port/address string.
    ///
    /// A bare port number listens on all interfaces. A `unix:` prefix selects
    /// a Unix domain socket. An empty string selects socket inheritance.
    ///
    /// # Errors
    ///
    /// `std::io::Error` when the string resolves to no socket address
    pub fn parse(port: &str) -> std::io::Result<Self> {
        #[cfg(unix)]
        if port.is_empty() {
            return Ok(Self::Inherited);
        }
        #[cfg(unix)]
        if let Some(path) = port.strip_prefix("unix:") {
            return Ok(Self::unix_from_path(path));
        }

        if port.contains(':') {
            Self::from_socket_addrs(port)
        } else {
            Self::from_socket_addrs(("0.0.0.0", port.parse::<u16>().map_err(|err| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, err)
            })?))
        }
    }

    pub(crate) fn bind(&self) -> std::io::Result<Listener> {
        match self {
            Self::IP(addresses) => {
                log::debug!("addresses: {addresses:?}");

                let mut found_socket = Err(None);

                for address in addresses {
                    let socket = socket2::Socket::new(
                        socket2::Domain::for_address(*address),
                        socket2::Type::STREAM,
                        None,
                    )?;
                    socket.set_reuse_address(true)?;

                    if let Err(e) = socket.bind(&(*address).into()) {
                        found_socket = Err(Some(e));
                        continue;
                    }
                    if let Err(e) = socket.listen(1024) {
                        found_socket = Err(Some(e));
                        continue;
                    }

                    found_socket = Ok(socket);
                    break;
                }

                let socket = match found_socket {
                    Ok(socket) => socket,
                    Err(err) => {
                        let err = err.unwrap_or_else(|| {
                            std::io::Error::new(
                                std::io::ErrorKind::AddrNotAvailable,
                                "no listen address",
                            )
                        });
                        log::error!("socket bind fail: {err:?}");
                        return Err(err);
                    }
                };

                Ok(Listener::Tcp(socket.into()))
            }
            #[cfg(unix)]
            Self::Unix(path) => unix_net::UnixListener::bind(path).map(Listener::from),
            #[cfg(unix)]
            Self::Inherited => Self::inherited(),
        }
    }

    /// Takes over the first listen socket passed by the service manager.
    #[cfg(unix)]
    fn inherited() -> std::io::Result<Listener> {
        use std::os::unix::io::FromRawFd;

        let fds = std::env::var("LISTEN_FDS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0);
        if fds == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no inherited listen socket",
            ));
        }

        // fd 3 is the first socket passed by the service manager and is owned
        // by this process from here on
        #[allow(unsafe_code)]
        let socket = unsafe { socket2::Socket::from_raw_fd(LISTEN_FDS_START) };
        socket.set_read_timeout(Some(INHERITED_ACCEPT_TIMEOUT))?;

        Ok(Listener::Tcp(socket.into()))
    }
}

/// Unified listen socket address. Either a [`SocketAddr`] or [`std::os::unix::net::SocketAddr`].
#[derive(Debug, Clone)]
pub enum ListenAddr {
    /// [`SocketAddr`] for IP net
    IP(SocketAddr),
    /// Unix [`unix_net::SocketAddr`]
    #[cfg(unix)]
    Unix(unix_net::SocketAddr),
}

impl ListenAddr {
    /// Get [`SocketAddr`] if it is an `IP` else `None`
    #[must_use]
    pub fn to_ip(&self) -> Option<SocketAddr> {
        match self {
            Self::IP(s) => Some(*s),
            #[cfg(unix)]
            Self::Unix(_) => None,
        }
    }
}

impl From<SocketAddr> for ListenAddr {
    fn from(s: SocketAddr) -> Self {
        Self::IP(s)
    }
}

#[cfg(unix)]
impl From<unix_net::SocketAddr> for ListenAddr {
    fn from(s: unix_net::SocketAddr) -> Self {
        Self::Unix(s)
    }
}

impl std::fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IP(s) => s.fmt(f),
            #[cfg(unix)]
            Self::Unix(s) => std::fmt::Debug::fmt(s, f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ConfigListenAddr;

    #[test]
    fn parse_bare_port() {
        match ConfigListenAddr::parse("8080").unwrap() {
            ConfigListenAddr::IP(addrs) => {
                assert!(addrs.iter().all(|a| a.port() == 8080));
            }
            #[cfg(unix)]
            _ => panic!("expected IP listener"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn parse_unix_prefix() {
        match ConfigListenAddr::parse("unix:/tmp/app.sock").unwrap() {
            ConfigListenAddr::Unix(path) => {
                assert_eq!(path, std::path::Path::new("/tmp/app.sock"));
            }
            _ => panic!("expected unix listener"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn parse_empty_inherits() {
        assert!(matches!(
            ConfigListenAddr::parse("").unwrap(),
            ConfigListenAddr::Inherited
        ));
    }
}
