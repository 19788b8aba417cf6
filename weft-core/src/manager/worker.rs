//! Event manager on a dedicated thread.
//!
//! The worker owns its [`EventManager`] outright; the server talks to it
//! over a command channel. An idle worker blocks on the channel instead of
//! spinning on an empty descriptor set.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::{debug, error, warn};

use super::{EventManager, Rejected};
use crate::config::{BackendKind, ManagerConfig};
use crate::connection::Connection;
use crate::error::{Result, WeftError};
use crate::socket::Socket;

enum Command {
    Add {
        socket: Socket,
        connection: Arc<Connection>,
    },
    DisconnectAll(Sender<()>),
    Shutdown,
}

/// Handle to a manager running on its own thread.
pub struct ManagerWorker {
    index: usize,
    commands: Sender<Command>,
    handle: Option<JoinHandle<()>>,
}

impl ManagerWorker {
    /// Start manager `index` on a thread named `weft-manager-{index}`.
    ///
    /// Backend setup happens on the new thread; its failure is returned here.
    pub fn spawn(
        index: usize,
        kind: BackendKind,
        config: ManagerConfig,
        idle_wait: Duration,
    ) -> Result<Self> {
        let (commands, inbox) = flume::unbounded();
        let (ready_tx, ready_rx) = flume::bounded(1);

        let handle = thread::Builder::new()
            .name(format!("weft-manager-{index}"))
            .spawn(move || {
                let manager = match EventManager::new(kind, index, &config) {
                    Ok(manager) => {
                        let _ = ready_tx.send(Ok(()));
                        manager
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                run(index, manager, &inbox, idle_wait);
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                index,
                commands,
                handle: Some(handle),
            }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(WeftError::ManagerClosed(index))
            }
        }
    }

    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Hand a socket to the worker.
    ///
    /// Registration happens on the worker thread; if it fails there, the
    /// connection is marked for close.
    pub fn add_connection(
        &self,
        socket: Socket,
        connection: Arc<Connection>,
    ) -> std::result::Result<(), Rejected> {
        if let Err(flume::SendError(Command::Add { socket, connection })) =
            self.commands.send(Command::Add { socket, connection })
        {
            return Err(Rejected {
                socket,
                connection,
                error: WeftError::ManagerClosed(self.index),
            });
        }
        Ok(())
    }

    /// Close every socket on the worker and wait up to `timeout` for it.
    pub fn disconnect_all(&self, timeout: Duration) -> Result<()> {
        let (ack_tx, ack_rx) = flume::bounded(1);
        self.commands
            .send(Command::DisconnectAll(ack_tx))
            .map_err(|_| WeftError::ManagerClosed(self.index))?;
        ack_rx
            .recv_timeout(timeout)
            .map_err(|_| WeftError::ManagerClosed(self.index))
    }

    /// Stop the thread and wait for it. Idempotent.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.commands.send(Command::Shutdown);
            if handle.join().is_err() {
                error!("[Manager {}] worker thread panicked", self.index);
            }
        }
    }
}

impl Drop for ManagerWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(index: usize, mut manager: EventManager, inbox: &Receiver<Command>, idle_wait: Duration) {
    debug!("[Manager {}] worker started ({})", index, manager.kind());
    loop {
        let command = if manager.has_connections() {
            match inbox.try_recv() {
                Ok(command) => Some(command),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Disconnected) => break,
            }
        } else {
            match inbox.recv_timeout(idle_wait) {
                Ok(command) => Some(command),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        };

        match command {
            Some(Command::Add { socket, connection }) => {
                if let Err(rejected) = manager.add_connection(socket, connection) {
                    error!(
                        "[Manager {}] could not add connection {}: {}",
                        index,
                        rejected.connection.id(),
                        rejected.error
                    );
                    rejected.connection.mark_for_close();
                }
                continue;
            }
            Some(Command::DisconnectAll(ack)) => {
                if let Err(e) = manager.disconnect_all() {
                    warn!("[Manager {}] disconnect failed: {}", index, e);
                }
                let _ = ack.send(());
                continue;
            }
            Some(Command::Shutdown) => break,
            None => {}
        }

        if let Err(e) = manager.handle_events() {
            error!("[Manager {}] event loop error: {}", index, e);
            thread::sleep(idle_wait);
        }
    }

    if let Err(e) = manager.disconnect_all() {
        warn!("[Manager {}] shutdown: {}", index, e);
    }
    debug!("[Manager {}] worker stopped", index);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionId, ConnectionStatus};
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::time::Instant;

    fn pair() -> (Socket, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (Socket::from(server), client)
    }

    fn wait_for(done: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn worker_serves_connection_off_thread() {
        let mut worker = ManagerWorker::spawn(
            0,
            BackendKind::Poll,
            ManagerConfig::default(),
            Duration::from_millis(5),
        )
        .unwrap();
        let (socket, mut client) = pair();
        let conn = Arc::new(Connection::new(ConnectionId::new(1), None));
        worker.add_connection(socket, Arc::clone(&conn)).unwrap();

        client.write_all(b"ping\0").unwrap();
        wait_for(|| conn.pending_inbound() == 1);

        conn.send("pong").unwrap();
        let mut wire = [0u8; 5];
        client.read_exact(&mut wire).unwrap();
        assert_eq!(&wire, b"pong\0");

        worker.disconnect_all(Duration::from_secs(5)).unwrap();
        assert_eq!(conn.status(), ConnectionStatus::MarkForClose);
        worker.shutdown();
    }

    #[test]
    fn stopped_worker_hands_socket_back() {
        let mut worker = ManagerWorker::spawn(
            3,
            BackendKind::Select,
            ManagerConfig::default(),
            Duration::from_millis(5),
        )
        .unwrap();
        worker.shutdown();

        let (socket, _client) = pair();
        let conn = Arc::new(Connection::new(ConnectionId::new(1), None));
        let rejected = worker.add_connection(socket, conn).unwrap_err();
        assert!(matches!(rejected.error, WeftError::ManagerClosed(3)));
    }
}
