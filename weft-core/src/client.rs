//! Blocking framed client.
//!
//! Speaks the same delimiter framing as the server. Meant for tools, demos
//! and tests rather than high connection counts.

use std::collections::VecDeque;
use std::net::{Shutdown, SocketAddr};
use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

use crate::buffer::{BufferPool, DEFAULT_BUFFER_SIZE};
use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::framing::{self, Messages, Reassembler};
use crate::socket::Socket;

/// One blocking connection to a server.
pub struct Client {
    socket: Socket,
    reassembler: Reassembler,
    ready: VecDeque<Bytes>,
}

impl Client {
    pub fn connect(addr: impl Into<Endpoint>) -> Result<Self> {
        Self::connect_with(addr, DEFAULT_BUFFER_SIZE)
    }

    /// Connect using receive buffers of `buffer_size` bytes.
    pub fn connect_with(addr: impl Into<Endpoint>, buffer_size: usize) -> Result<Self> {
        let addr = addr.into().addr();
        let socket = Socket::connect(addr)?;
        socket.set_nodelay(true)?;
        let pool = BufferPool::new(buffer_size.max(1), 2);
        debug!("[Client] connected to {}", addr);
        Ok(Self {
            socket,
            reassembler: Reassembler::new(&pool),
            ready: VecDeque::new(),
        })
    }

    /// Frame and send `payload`, blocking until it is written.
    pub fn send(&mut self, payload: impl AsRef<[u8]>) -> Result<()> {
        let wire = framing::encode(payload.as_ref())?;
        self.socket.send_all(&wire)?;
        Ok(())
    }

    /// Next message from the server; `None` once the server closed.
    ///
    /// With a read timeout set, an expired wait surfaces as an I/O error of
    /// kind `WouldBlock` or `TimedOut`.
    pub fn recv(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(message) = self.ready.pop_front() {
                return Ok(Some(message));
            }
            let socket = &self.socket;
            let n = self.reassembler.receive_with(|buf| socket.recv(buf))?;
            if n == 0 {
                debug!("[Client] server closed the connection");
                return Ok(None);
            }
            let mut messages = Messages::new();
            let outcome = self.reassembler.complete(n, &mut messages);
            self.ready.extend(messages);
            outcome?;
        }
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.socket.set_read_timeout(timeout)?;
        Ok(())
    }

    /// Half-close the sending side; the server sees a disconnect.
    pub fn shutdown(&self) -> Result<()> {
        self.socket.shutdown(Shutdown::Write)?;
        Ok(())
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.peer_addr()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    #[test]
    fn frames_outbound_and_splits_inbound() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = Client::connect_with(listener.local_addr().unwrap(), 4).unwrap();
        let (mut peer, _) = listener.accept().unwrap();

        client.send("hello").unwrap();
        let mut wire = [0u8; 6];
        peer.read_exact(&mut wire).unwrap();
        assert_eq!(&wire, b"hello\0");

        peer.write_all(b"one\0two\0thr").unwrap();
        assert_eq!(client.recv().unwrap().unwrap(), "one");
        assert_eq!(client.recv().unwrap().unwrap(), "two");

        peer.write_all(b"ee\0").unwrap();
        assert_eq!(client.recv().unwrap().unwrap(), "three");

        drop(peer);
        assert_eq!(client.recv().unwrap(), None);
    }

    #[test]
    fn rejects_embedded_terminator() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = Client::connect(listener.local_addr().unwrap()).unwrap();
        assert!(client.send(b"a\0b").is_err());
    }
}
