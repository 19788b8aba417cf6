//! Move-only TCP socket handle.
//!
//! Thin wrapper around [`socket2::Socket`] exposing exactly what the managers
//! and the server need. Dropping a `Socket` closes the descriptor.

use std::io::{self, Read};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use socket2::{Domain, Protocol, Type};

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

/// Exclusive owner of one OS socket.
#[derive(Debug)]
pub struct Socket {
    inner: socket2::Socket,
}

impl Socket {
    /// Bind a non-blocking listening socket.
    ///
    /// `reuse_port` lets other sockets bind the same port and share its
    /// connections; it is ignored where `SO_REUSEPORT` does not exist.
    pub fn listen(
        addr: SocketAddr,
        backlog: i32,
        reuse_address: bool,
        reuse_port: bool,
    ) -> io::Result<Self> {
        let socket = socket2::Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        if reuse_address {
            socket.set_reuse_address(true)?;
        }
        #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
        if reuse_port {
            socket.set_reuse_port(true)?;
        }
        #[cfg(any(target_os = "solaris", target_os = "illumos"))]
        let _ = reuse_port;
        socket.bind(&addr.into())?;
        socket.listen(backlog)?;
        socket.set_nonblocking(true)?;
        Ok(Self { inner: socket })
    }

    /// Blocking connect.
    pub fn connect(addr: SocketAddr) -> io::Result<Self> {
        let socket = socket2::Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.connect(&addr.into())?;
        Ok(Self { inner: socket })
    }

    /// Accept one pending connection; `None` when nothing is waiting.
    pub fn accept(&self) -> io::Result<Option<(Self, Option<SocketAddr>)>> {
        match self.inner.accept() {
            Ok((socket, addr)) => Ok(Some((Self { inner: socket }, addr.as_socket()))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        self.inner.set_nonblocking(nonblocking)
    }

    /// Disable Nagle's algorithm.
    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.inner.set_nodelay(nodelay)
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.inner.set_read_timeout(timeout)
    }

    /// Receive into `buf`. `Ok(0)` means the peer closed.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.inner).read(buf)
    }

    /// Send from `buf`, never raising `SIGPIPE`.
    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.inner.send_with_flags(buf, SEND_FLAGS)
    }

    /// Send all of `buf`, looping over partial writes.
    pub fn send_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match self.send(buf) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        self.inner.shutdown(how)
    }

    /// Pending `SO_ERROR`, if any.
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        self.inner.take_error()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner
            .local_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "not an inet socket"))
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner
            .peer_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "not an inet socket"))
    }

    /// Raw descriptor, used as the socket id in logs.
    #[must_use]
    pub fn id(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

impl From<TcpStream> for Socket {
    fn from(stream: TcpStream) -> Self {
        Self {
            inner: socket2::Socket::from(stream),
        }
    }
}
