//! Listening and Connected Sockets
//!
//! The server accepts clients over TCP or a Unix domain socket. Both kinds
//! are plain blocking-capable std sockets: a connection moves between the
//! event loop (non-blocking, readiness driven) and pool threads (blocking
//! reads with a short timeout), so it cannot be tied to one runtime.
//!
//! ## Bind Syntax
//!
//! - `8384` → TCP on every interface
//! - `127.0.0.1:8384`, `*:8384`, `:8384` → TCP on the given address
//! - anything else → path of a Unix domain socket

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while binding the listening socket.
#[derive(Debug, Error)]
pub enum BindError {
    /// The address could not be resolved
    #[error("failed to resolve {endpoint}: {source}")]
    Resolve {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    /// Resolution succeeded but yielded nothing
    #[error("no address found for {0}")]
    NoAddress(String),

    /// bind/listen failed
    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: io::Error,
    },
}

/// Where the server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Unix { path: PathBuf },
}

impl Endpoint {
    /// Parses `port`, `host:port` or a socket path.
    pub fn parse(spec: &str) -> Self {
        if let Ok(port) = spec.parse::<u16>() {
            return Endpoint::Tcp {
                host: Ipv4Addr::UNSPECIFIED.to_string(),
                port,
            };
        }
        if let Some((host, port)) = spec.rsplit_once(':') {
            if let Ok(port) = port.parse::<u16>() {
                let host = match host {
                    "" | "*" | "0" => Ipv4Addr::UNSPECIFIED.to_string(),
                    other => other.to_string(),
                };
                return Endpoint::Tcp { host, port };
            }
        }
        Endpoint::Unix {
            path: PathBuf::from(spec),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "{host}:{port}"),
            Endpoint::Unix { path } => write!(f, "{}", path.display()),
        }
    }
}

/// The listening socket, bound once and shared by every worker process.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener, PathBuf),
}

impl Listener {
    /// Binds the endpoint and switches the socket to non-blocking mode.
    ///
    /// A stale Unix socket file at the target path is removed first.
    pub fn bind(endpoint: &Endpoint) -> Result<Self, BindError> {
        let bind_err = |source| BindError::Bind {
            endpoint: endpoint.to_string(),
            source,
        };

        let listener = match endpoint {
            Endpoint::Tcp { host, port } => {
                let addr = resolve(host, *port)?;
                Listener::Tcp(TcpListener::bind(addr).map_err(bind_err)?)
            }
            Endpoint::Unix { path } => {
                let _ = std::fs::remove_file(path);
                Listener::Unix(UnixListener::bind(path).map_err(bind_err)?, path.clone())
            }
        };
        listener.set_nonblocking(true).map_err(bind_err)?;
        Ok(listener)
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Listener::Tcp(l) => l.set_nonblocking(nonblocking),
            Listener::Unix(l, _) => l.set_nonblocking(nonblocking),
        }
    }

    /// Duplicates the socket handle; both refer to the same listening socket.
    pub fn try_clone(&self) -> io::Result<Self> {
        match self {
            Listener::Tcp(l) => Ok(Listener::Tcp(l.try_clone()?)),
            Listener::Unix(l, path) => Ok(Listener::Unix(l.try_clone()?, path.clone())),
        }
    }

    /// Accepts one pending client. Returns `WouldBlock` when none is queued.
    pub fn accept(&self) -> io::Result<Stream> {
        match self {
            Listener::Tcp(l) => {
                let (stream, _) = l.accept()?;
                stream.set_nodelay(true)?;
                Ok(Stream::Tcp(stream))
            }
            Listener::Unix(l, _) => {
                let (stream, _) = l.accept()?;
                Ok(Stream::Unix(stream))
            }
        }
    }

    /// Address of a TCP listener (useful when bound to port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Listener::Tcp(l) => l.local_addr().ok(),
            Listener::Unix(..) => None,
        }
    }

    /// Removes the socket file of a Unix listener.
    pub fn cleanup(&self) {
        if let Listener::Unix(_, path) = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Listener::Tcp(l) => l.as_raw_fd(),
            Listener::Unix(l, _) => l.as_raw_fd(),
        }
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, BindError> {
    let endpoint = format!("{host}:{port}");
    (host, port)
        .to_socket_addrs()
        .map_err(|source| BindError::Resolve {
            endpoint: endpoint.clone(),
            source,
        })?
        .next()
        .ok_or(BindError::NoAddress(endpoint))
}

/// A connected client socket.
#[derive(Debug)]
pub enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Stream {
    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.set_nonblocking(nonblocking),
            Stream::Unix(s) => s.set_nonblocking(nonblocking),
        }
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.set_read_timeout(timeout),
            Stream::Unix(s) => s.set_read_timeout(timeout),
        }
    }

    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.set_write_timeout(timeout),
            Stream::Unix(s) => s.set_write_timeout(timeout),
        }
    }

    /// Peer description for logs.
    pub fn peer(&self) -> String {
        match self {
            Stream::Tcp(s) => s
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "tcp:?".to_string()),
            Stream::Unix(_) => "unix".to_string(),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            Stream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            Stream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush(),
            Stream::Unix(s) => s.flush(),
        }
    }
}

impl AsRawFd for Stream {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Stream::Tcp(s) => s.as_raw_fd(),
            Stream::Unix(s) => s.as_raw_fd(),
        }
    }
}
