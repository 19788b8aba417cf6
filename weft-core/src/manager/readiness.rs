//! Readiness-driven orchestration loop.
//!
//! The manager keeps its socket contexts in a list parallel to the backend's
//! descriptor list. Each iteration waits once, then walks the list in order
//! and, for every socket with a reported condition, handles read, write,
//! hangup and exception in that order. A socket removed mid-walk leaves both
//! lists at the same time, so the next socket slides into the current index.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, trace, warn};

use super::context::SocketContext;
use super::Rejected;
use crate::buffer::BufferPool;
use crate::config::ManagerConfig;
use crate::connection::Connection;
use crate::errno;
use crate::error::{classify, IoDisposition, Result, WeftError};
use crate::poller::{EventFlags, ReadinessBackend};
use crate::socket::Socket;

/// Event manager over a select or poll backend.
pub struct ReadinessManager<B: ReadinessBackend> {
    index: usize,
    backend: B,
    contexts: Vec<SocketContext>,
    pool: BufferPool,
    config: ManagerConfig,
}

impl<B: ReadinessBackend> ReadinessManager<B> {
    pub fn new(index: usize, backend: B, config: ManagerConfig) -> Self {
        let pool = BufferPool::new(config.buffer_size, config.initial_buffers);
        debug!(
            "[Manager {}] {} backend, {} byte buffers",
            index,
            backend.name(),
            config.buffer_size
        );
        Self {
            index,
            backend,
            contexts: Vec::new(),
            pool,
            config,
        }
    }

    /// Register `socket` and start serving `connection` on it.
    ///
    /// On failure the socket and connection are handed back untouched.
    pub fn add_connection(
        &mut self,
        socket: Socket,
        connection: Arc<Connection>,
    ) -> std::result::Result<(), Rejected> {
        if let Err(e) = socket.set_nonblocking(true) {
            let error = WeftError::registration(socket.id(), self.backend.name(), e);
            return Err(Rejected {
                socket,
                connection,
                error,
            });
        }

        let fd = socket.id();
        let index = match self.backend.add(fd) {
            Ok(index) => index,
            Err(error) => {
                return Err(Rejected {
                    socket,
                    connection,
                    error,
                })
            }
        };
        debug_assert_eq!(index, self.contexts.len());

        connection.mark_opened();
        debug!(
            "[Manager {}] connection {} on socket {} ({} total)",
            self.index,
            connection.id(),
            fd,
            self.contexts.len() + 1
        );
        self.contexts
            .push(SocketContext::new(socket, connection, &self.pool, &self.config));
        Ok(())
    }

    /// One loop iteration with the configured timeout.
    pub fn handle_events(&mut self) -> Result<usize> {
        self.handle_events_with(self.config.poll_timeout)
    }

    /// One loop iteration: wait up to `timeout`, then service every socket
    /// the backend reported. Returns the number of reported sockets.
    pub fn handle_events_with(&mut self, timeout: Option<Duration>) -> Result<usize> {
        self.reap_closed();
        if self.contexts.is_empty() {
            return Ok(0);
        }
        self.update_write_interest();

        let reported = self.backend.wait_for_events(timeout).map_err(|e| {
            error!(
                "[Manager {}] {} wait failed: {}",
                self.index,
                self.backend.name(),
                errno::describe(&e)
            );
            WeftError::Io(e)
        })?;
        if reported == 0 {
            return Ok(0);
        }
        self.backend.log_state();

        let mut remaining = reported;
        let mut index = 0;
        while index < self.contexts.len() && remaining > 0 {
            let flags = self.backend.at(index);
            if !flags.changed() {
                index += 1;
                continue;
            }
            remaining -= 1;
            if self.process(index, flags) {
                index += 1;
            }
        }
        Ok(reported)
    }

    /// Close every socket and mark its connection for close.
    pub fn disconnect_all(&mut self) {
        let count = self.contexts.len();
        while let Some(context) = self.contexts.pop() {
            self.backend.remove(self.contexts.len());
            context.connection.mark_for_close();
        }
        if count > 0 {
            debug!("[Manager {}] disconnected {} sockets", self.index, count);
        }
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.contexts.len()
    }

    #[must_use]
    pub fn has_connections(&self) -> bool {
        !self.contexts.is_empty()
    }

    #[must_use]
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Service one reported socket. Returns `false` if it was removed.
    fn process(&mut self, index: usize, flags: EventFlags) -> bool {
        trace!(
            "[Manager {}] socket {} {}",
            self.index,
            self.contexts[index].id(),
            flags
        );

        if flags.read && !self.read(index) {
            return false;
        }
        if flags.write && !self.write(index) {
            return false;
        }

        if flags.hangup {
            debug!(
                "[Manager {}] socket {} hung up",
                self.index,
                self.contexts[index].id()
            );
            self.remove_connection(index);
            return false;
        }

        if flags.except {
            return self.exception(index);
        }

        true
    }

    /// `select` also flags out-of-band data as an exception, so the socket
    /// only goes when an error is actually pending.
    fn exception(&mut self, index: usize) -> bool {
        let context = &self.contexts[index];
        match context.socket.take_error() {
            Ok(None) => {
                trace!(
                    "[Manager {}] socket {} exception without pending error",
                    self.index,
                    context.id()
                );
                return true;
            }
            Ok(Some(e)) if classify(&e) == IoDisposition::Disconnect => {
                debug!(
                    "[Manager {}] socket {} reset: {}",
                    self.index,
                    context.id(),
                    errno::describe(&e)
                );
            }
            Ok(Some(e)) => error!(
                "[Manager {}] socket {} error: {}",
                self.index,
                context.id(),
                errno::describe(&e)
            ),
            Err(e) => error!(
                "[Manager {}] socket {} error query failed: {}",
                self.index,
                context.id(),
                errno::describe(&e)
            ),
        }
        self.remove_connection(index);
        false
    }

    fn read(&mut self, index: usize) -> bool {
        let context = &mut self.contexts[index];
        match context.receive() {
            Ok(0) => {
                debug!(
                    "[Manager {}] socket {} closed by peer",
                    self.index,
                    context.id()
                );
                self.remove_connection(index);
                false
            }
            Ok(n) => match context.complete_receive(n) {
                Ok(_) => true,
                Err(e) => {
                    warn!(
                        "[Manager {}] dropping connection {}: {}",
                        self.index,
                        context.connection.id(),
                        e
                    );
                    self.remove_connection(index);
                    false
                }
            },
            Err(e) => self.handle_io_error(index, &e, "receive"),
        }
    }

    fn write(&mut self, index: usize) -> bool {
        let context = &mut self.contexts[index];
        match context.send() {
            Ok(None) => {
                self.backend.reset_write_flag(index);
                true
            }
            Ok(Some(0)) => {
                debug!(
                    "[Manager {}] socket {} accepted no bytes, closing",
                    self.index,
                    context.id()
                );
                self.remove_connection(index);
                false
            }
            Ok(Some(n)) => {
                trace!("[Manager {}] socket {} sent {} bytes", self.index, context.id(), n);
                if !context.complete_send(n) {
                    self.backend.reset_write_flag(index);
                }
                true
            }
            Err(e) => self.handle_io_error(index, &e, "send"),
        }
    }

    /// Returns `false` if the socket was removed.
    fn handle_io_error(&mut self, index: usize, err: &io::Error, op: &str) -> bool {
        let fd = self.contexts[index].id();
        match classify(err) {
            IoDisposition::Retry => true,
            IoDisposition::Disconnect => {
                debug!(
                    "[Manager {}] {} on socket {}: peer gone ({})",
                    self.index,
                    op,
                    fd,
                    errno::describe(err)
                );
                self.remove_connection(index);
                false
            }
            IoDisposition::Fatal => {
                error!(
                    "[Manager {}] {} failed on socket {}: {}",
                    self.index,
                    op,
                    fd,
                    errno::describe(err)
                );
                self.remove_connection(index);
                false
            }
        }
    }

    /// Drop sockets whose connection was closed from the user side.
    fn reap_closed(&mut self) {
        let mut index = 0;
        while index < self.contexts.len() {
            if self.contexts[index].connection.is_open() {
                index += 1;
            } else {
                debug!(
                    "[Manager {}] closing socket {} on request",
                    self.index,
                    self.contexts[index].id()
                );
                self.remove_connection(index);
            }
        }
    }

    fn update_write_interest(&mut self) {
        for index in 0..self.contexts.len() {
            if self.contexts[index].wants_send() {
                self.backend.set_write_flag(index);
            }
        }
    }

    fn remove_connection(&mut self, index: usize) {
        let context = self.contexts.remove(index);
        self.backend.remove(index);
        context.connection.mark_for_close();
        debug!(
            "[Manager {}] removed connection {} ({} left)",
            self.index,
            context.connection.id(),
            self.contexts.len()
        );
    }
}
