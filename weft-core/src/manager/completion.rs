//! Completion-driven orchestration loop.
//!
//! Every socket always has one receive outstanding and, while it has
//! outbound data, one send. Each iteration issues sends for sockets that
//! have data but no send in flight, dequeues a single completion and
//! continues the operation it belongs to.
//!
//! A removed socket cannot be freed while the kernel may still touch its
//! buffers. Its in-flight operations are cancelled and the context is parked
//! in `draining` until their completions arrive.

#![allow(unsafe_code)]

use std::net::Shutdown;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use smallvec::SmallVec;
use tracing::{debug, error, trace, warn};

use super::context::SocketContext;
use super::Rejected;
use crate::buffer::BufferPool;
use crate::completion::{Completion, CompletionPort, Event, Operation, MAX_KEY};
use crate::config::ManagerConfig;
use crate::connection::Connection;
use crate::errno;
use crate::error::{classify, IoDisposition, Result, WeftError};
use crate::socket::Socket;

const DRAIN_WAIT: Duration = Duration::from_millis(10);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Event manager over the completion backend.
pub struct CompletionManager {
    index: usize,
    port: CompletionPort,
    contexts: HashMap<u64, SocketContext>,
    draining: HashMap<u64, SocketContext>,
    next_key: u64,
    pool: BufferPool,
    config: ManagerConfig,
}

impl CompletionManager {
    pub fn new(index: usize, config: ManagerConfig) -> Result<Self> {
        let port = CompletionPort::new(config.ring_entries).map_err(|e| {
            error!(
                "[Manager {}] completion port unavailable: {}",
                index,
                errno::describe(&e)
            );
            WeftError::Io(e)
        })?;
        let pool = BufferPool::new(config.buffer_size, config.initial_buffers);
        debug!(
            "[Manager {}] completion backend, {} byte buffers",
            index, config.buffer_size
        );
        Ok(Self {
            index,
            port,
            contexts: HashMap::new(),
            draining: HashMap::new(),
            next_key: 0,
            pool,
            config,
        })
    }

    /// Register `socket` and issue its first receive.
    pub fn add_connection(
        &mut self,
        socket: Socket,
        connection: Arc<Connection>,
    ) -> std::result::Result<(), Rejected> {
        let key = self.next_key;
        self.next_key = (self.next_key + 1) & MAX_KEY;

        let fd = socket.id();
        let mut context = SocketContext::new(socket, connection, &self.pool, &self.config);
        if let Err(e) = issue_receive(&mut self.port, key, &mut context) {
            let SocketContext {
                socket, connection, ..
            } = context;
            return Err(Rejected {
                socket,
                connection,
                error: WeftError::registration(fd, "completion", e),
            });
        }

        context.connection.mark_opened();
        debug!(
            "[Manager {}] connection {} on socket {} key {} ({} total)",
            self.index,
            context.connection.id(),
            fd,
            key,
            self.contexts.len() + 1
        );
        self.contexts.insert(key, context);
        Ok(())
    }

    /// One loop iteration with the configured timeout.
    pub fn handle_events(&mut self) -> Result<usize> {
        self.handle_events_with(self.config.completion_timeout)
    }

    /// One loop iteration: issue pending sends, then dequeue and handle a
    /// single completion. Returns 1 if a completion was handled.
    pub fn handle_events_with(&mut self, timeout: Option<Duration>) -> Result<usize> {
        self.reap_closed();
        if self.contexts.is_empty() && self.draining.is_empty() {
            return Ok(0);
        }
        self.process_sends();

        match self.port.wait(timeout) {
            Ok(Event::Completed(completion)) => {
                self.dispatch(completion);
                Ok(1)
            }
            Ok(Event::Closed | Event::TimedOut) => Ok(0),
            Err(e) => {
                error!(
                    "[Manager {}] completion wait failed: {}",
                    self.index,
                    errno::describe(&e)
                );
                Err(WeftError::Io(e))
            }
        }
    }

    /// Wake the loop, close every socket and wait for cancelled operations.
    pub fn disconnect_all(&mut self) -> Result<()> {
        self.port.post_close()?;
        loop {
            match self.port.wait(Some(DRAIN_WAIT))? {
                Event::Completed(completion) => self.dispatch(completion),
                Event::Closed | Event::TimedOut => break,
            }
        }

        let keys: SmallVec<[u64; 16]> = self.contexts.keys().copied().collect();
        let count = keys.len();
        for key in keys {
            self.remove_connection(key);
        }
        self.drain();
        if count > 0 {
            debug!("[Manager {}] disconnected {} sockets", self.index, count);
        }
        Ok(())
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

    fn process_sends(&mut self) {
        let mut failed = SmallVec::<[u64; 4]>::new();
        for (&key, context) in &mut self.contexts {
            if let Err(e) = issue_send(&mut self.port, key, context) {
                error!(
                    "[Manager {}] send submission for socket {} failed: {}",
                    self.index,
                    context.id(),
                    errno::describe(&e)
                );
                failed.push(key);
            }
        }
        for key in failed {
            self.remove_connection(key);
        }
    }

    fn dispatch(&mut self, completion: Completion) {
        let Completion {
            key,
            operation,
            result,
        } = completion;

        if let Some(context) = self.draining.get_mut(&key) {
            finish(context, operation);
            if !context.receive.in_flight && !context.send.in_flight {
                self.draining.remove(&key);
                trace!("[Manager {}] key {} drained", self.index, key);
            }
            return;
        }

        let Some(context) = self.contexts.get_mut(&key) else {
            trace!("[Manager {}] stale completion for key {}", self.index, key);
            return;
        };
        finish(context, operation);

        let n = match result {
            Ok(0) => {
                debug!(
                    "[Manager {}] zero-byte {:?} on socket {}, closing",
                    self.index,
                    operation,
                    context.id()
                );
                self.remove_connection(key);
                return;
            }
            Ok(n) => n,
            Err(e) => {
                match classify(&e) {
                    IoDisposition::Retry => {
                        let reissued = match operation {
                            Operation::Receive => issue_receive(&mut self.port, key, context),
                            Operation::Send => issue_send(&mut self.port, key, context).map(|_| ()),
                        };
                        if reissued.is_ok() {
                            return;
                        }
                        error!(
                            "[Manager {}] could not reissue {:?} on socket {}",
                            self.index,
                            operation,
                            context.id()
                        );
                    }
                    IoDisposition::Disconnect => debug!(
                        "[Manager {}] {:?} on socket {}: peer gone ({})",
                        self.index,
                        operation,
                        context.id(),
                        errno::describe(&e)
                    ),
                    IoDisposition::Fatal => error!(
                        "[Manager {}] {:?} failed on socket {}: {}",
                        self.index,
                        operation,
                        context.id(),
                        errno::describe(&e)
                    ),
                }
                self.remove_connection(key);
                return;
            }
        };

        match operation {
            Operation::Receive => {
                if let Err(e) = context.complete_receive(n) {
                    warn!(
                        "[Manager {}] dropping connection {}: {}",
                        self.index,
                        context.connection.id(),
                        e
                    );
                    self.remove_connection(key);
                    return;
                }
                if let Err(e) = issue_receive(&mut self.port, key, context) {
                    error!(
                        "[Manager {}] receive submission for socket {} failed: {}",
                        self.index,
                        context.id(),
                        errno::describe(&e)
                    );
                    self.remove_connection(key);
                }
            }
            Operation::Send => {
                trace!("[Manager {}] socket {} sent {} bytes", self.index, context.id(), n);
                if context.complete_send(n) {
                    if let Err(e) = issue_send(&mut self.port, key, context) {
                        error!(
                            "[Manager {}] send submission for socket {} failed: {}",
                            self.index,
                            context.id(),
                            errno::describe(&e)
                        );
                        self.remove_connection(key);
                    }
                }
            }
        }
    }

    fn reap_closed(&mut self) {
        let closed: SmallVec<[u64; 4]> = self
            .contexts
            .iter()
            .filter(|(_, context)| !context.connection.is_open())
            .map(|(&key, _)| key)
            .collect();
        for key in closed {
            debug!("[Manager {}] closing key {} on request", self.index, key);
            self.remove_connection(key);
        }
    }

    fn remove_connection(&mut self, key: u64) {
        let Some(context) = self.contexts.remove(&key) else {
            return;
        };
        context.connection.mark_for_close();
        debug!(
            "[Manager {}] removed connection {} ({} left)",
            self.index,
            context.connection.id(),
            self.contexts.len()
        );

        if !context.receive.in_flight && !context.send.in_flight {
            return;
        }
        for (in_flight, operation) in [
            (context.receive.in_flight, Operation::Receive),
            (context.send.in_flight, Operation::Send),
        ] {
            if in_flight {
                if let Err(e) = self.port.cancel(key, operation) {
                    warn!(
                        "[Manager {}] cancel of {:?} for key {} failed: {}",
                        self.index,
                        operation,
                        key,
                        errno::describe(&e)
                    );
                }
            }
        }
        let _ = context.socket.shutdown(Shutdown::Both);
        self.draining.insert(key, context);
    }

    /// Wait, bounded, for cancelled operations to come back.
    fn drain(&mut self) {
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while !self.draining.is_empty() && Instant::now() < deadline {
            match self.port.wait(Some(DRAIN_WAIT)) {
                Ok(Event::Completed(completion)) => self.dispatch(completion),
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        "[Manager {}] drain wait failed: {}",
                        self.index,
                        errno::describe(&e)
                    );
                    break;
                }
            }
        }
    }
}

impl Drop for CompletionManager {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect_all() {
            warn!("[Manager {}] shutdown: {}", self.index, e);
        }
        if !self.draining.is_empty() {
            // The kernel may still write into these buffers; never free them.
            warn!(
                "[Manager {}] leaking {} sockets with operations still in flight",
                self.index,
                self.draining.len()
            );
            for (_, context) in self.draining.drain() {
                std::mem::forget(context);
            }
        }
    }
}

fn finish(context: &mut SocketContext, operation: Operation) {
    match operation {
        Operation::Receive => context.receive.in_flight = false,
        Operation::Send => context.send.in_flight = false,
    }
}

fn issue_receive(
    port: &mut CompletionPort,
    key: u64,
    context: &mut SocketContext,
) -> std::io::Result<()> {
    let (buf, len) = context.receive.reassembler.receive_target();
    // SAFETY: the target is the free tail of a pool buffer owned by the
    // context's chain. The chain is not touched until this receive completes,
    // and a removed context is parked in `draining` until then.
    unsafe { port.submit_receive(key, context.id(), buf, len)? };
    context.receive.in_flight = true;
    Ok(())
}

/// Submit the next chunk if data is queued and no send is in flight.
fn issue_send(
    port: &mut CompletionPort,
    key: u64,
    context: &mut SocketContext,
) -> std::io::Result<bool> {
    if context.send.in_flight || !context.start_send() {
        return Ok(false);
    }
    let chunk = context.send_chunk();
    // SAFETY: the chunk lives in the frame's shared bytes, which the context
    // keeps until this send completes.
    unsafe { port.submit_send(key, context.id(), chunk.as_ptr(), chunk.len())? };
    context.send.in_flight = true;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::is_supported;
    use crate::connection::{ConnectionId, ConnectionStatus};
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};

    fn pair() -> (Socket, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (Socket::from(server), client)
    }

    fn manager(buffer_size: usize) -> Option<CompletionManager> {
        if !is_supported() {
            eprintln!("io_uring unavailable, skipping");
            return None;
        }
        let config = ManagerConfig::default().with_buffer_size(buffer_size);
        Some(CompletionManager::new(0, config).unwrap())
    }

    fn run_until(manager: &mut CompletionManager, done: impl Fn() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            manager
                .handle_events_with(Some(Duration::from_millis(10)))
                .unwrap();
        }
        assert!(done(), "condition not reached");
    }

    #[test]
    fn receives_and_sends_in_small_chunks() {
        let Some(mut manager) = manager(8) else { return };
        let (socket, mut client) = pair();
        let conn = Arc::new(Connection::new(ConnectionId::new(1), None));
        manager.add_connection(socket, Arc::clone(&conn)).unwrap();
        assert_eq!(conn.status(), ConnectionStatus::Opened);

        client.write_all(b"HELLOWORLD\0").unwrap();
        run_until(&mut manager, || conn.pending_inbound() == 1);

        conn.send("HELLOWORLD").unwrap();
        run_until(&mut manager, || conn.pending_outbound() == 0);
        let mut wire = [0u8; 11];
        client.read_exact(&mut wire).unwrap();
        assert_eq!(&wire, b"HELLOWORLD\0");
    }

    #[test]
    fn peer_close_removes_connection() {
        let Some(mut manager) = manager(64) else { return };
        let (socket, client) = pair();
        let conn = Arc::new(Connection::new(ConnectionId::new(1), None));
        manager.add_connection(socket, Arc::clone(&conn)).unwrap();

        drop(client);
        run_until(&mut manager, || !conn.is_open());
        assert!(!manager.has_connections());
        assert_eq!(conn.status(), ConnectionStatus::MarkForClose);
    }

    #[test]
    fn disconnect_all_drains_in_flight_receives() {
        let Some(mut manager) = manager(64) else { return };
        let mut clients = Vec::new();
        let mut conns = Vec::new();
        for id in 0..3 {
            let (socket, client) = pair();
            let conn = Arc::new(Connection::new(ConnectionId::new(id), None));
            manager.add_connection(socket, Arc::clone(&conn)).unwrap();
            clients.push(client);
            conns.push(conn);
        }
        assert_eq!(manager.connection_count(), 3);

        manager.disconnect_all().unwrap();
        assert!(!manager.has_connections());
        assert!(manager.draining.is_empty());
        assert_eq!(manager.pool().outstanding(), 0);
        for conn in &conns {
            assert_eq!(conn.status(), ConnectionStatus::MarkForClose);
        }
    }
}
