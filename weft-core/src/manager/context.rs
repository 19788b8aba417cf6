//! Per-socket state shared by both orchestration loops.
//!
//! A [`SocketContext`] ties a socket to its connection and carries one
//! context per direction: the receive side owns the reassembly chain, the
//! send side owns the cursor over the message being written. The
//! `in_flight` flags only matter to the completion loop.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use crate::buffer::BufferPool;
use crate::config::ManagerConfig;
use crate::connection::Connection;
use crate::error::Result;
use crate::framing::{Messages, OutboundFrame, Reassembler};
use crate::socket::Socket;

pub(crate) struct ReceiveContext {
    pub(crate) reassembler: Reassembler,
    pub(crate) in_flight: bool,
}

pub(crate) struct SendContext {
    pub(crate) frame: Option<OutboundFrame>,
    pub(crate) in_flight: bool,
}

pub(crate) struct SocketContext {
    pub(crate) socket: Socket,
    pub(crate) connection: Arc<Connection>,
    pub(crate) receive: ReceiveContext,
    pub(crate) send: SendContext,
    chunk_size: usize,
}

impl SocketContext {
    pub(crate) fn new(
        socket: Socket,
        connection: Arc<Connection>,
        pool: &BufferPool,
        config: &ManagerConfig,
    ) -> Self {
        Self {
            socket,
            connection,
            receive: ReceiveContext {
                reassembler: Reassembler::new(pool)
                    .with_max_message_size(config.max_message_size),
                in_flight: false,
            },
            send: SendContext {
                frame: None,
                in_flight: false,
            },
            chunk_size: pool.buffer_size(),
        }
    }

    pub(crate) fn id(&self) -> RawFd {
        self.socket.id()
    }

    /// One receive straight from the socket into the chain tail.
    pub(crate) fn receive(&mut self) -> io::Result<usize> {
        let socket = &self.socket;
        self.receive
            .reassembler
            .receive_with(|buf| socket.recv(buf))
    }

    /// Account for `n` received bytes; finished messages go to the
    /// connection's inbound queue. Returns how many finished.
    ///
    /// Messages finished ahead of an oversized one are queued before the
    /// error is returned.
    pub(crate) fn complete_receive(&mut self, n: usize) -> Result<usize> {
        let mut messages = Messages::new();
        let outcome = self.receive.reassembler.complete(n, &mut messages);
        let count = messages.len();
        for message in messages {
            self.connection.push_received(message);
        }
        outcome.map(|()| count)
    }

    /// Make sure a frame is ready to write. `false` when nothing is queued.
    pub(crate) fn start_send(&mut self) -> bool {
        if self.send.frame.is_some() {
            return true;
        }
        match self.connection.begin_send() {
            Some(wire) => {
                self.send.frame = Some(OutboundFrame::new(wire, self.chunk_size));
                true
            }
            None => false,
        }
    }

    /// Outbound data is waiting, either mid-frame or queued.
    pub(crate) fn wants_send(&self) -> bool {
        self.send.frame.is_some() || self.connection.has_unsent()
    }

    /// Bytes of the next chunk; empty when nothing is being sent.
    pub(crate) fn send_chunk(&self) -> &[u8] {
        match &self.send.frame {
            Some(frame) => frame.chunk(),
            None => &[],
        }
    }

    /// One send of the next chunk straight to the socket.
    ///
    /// `Ok(None)` when nothing is queued.
    pub(crate) fn send(&mut self) -> io::Result<Option<usize>> {
        if !self.start_send() {
            return Ok(None);
        }
        self.socket.send(self.send_chunk()).map(Some)
    }

    /// Account for `n` written bytes. Returns `true` while more is pending.
    pub(crate) fn complete_send(&mut self, n: usize) -> bool {
        if let Some(frame) = self.send.frame.as_mut() {
            if frame.advance(n) {
                self.send.frame = None;
                self.connection.complete_send();
            }
        }
        self.start_send()
    }
}
