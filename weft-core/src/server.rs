//! Listening server.
//!
//! The server owns the listening socket, a set of event managers and the
//! list of live connections. Each accepted socket goes to the least-loaded
//! manager. Managers either run inline, driven by [`Server::handle_events`],
//! or each on its own thread.
//!
//! Message delivery always happens on the thread calling
//! [`Server::update`], so observers never run concurrently with each other.
//!
//! ```no_run
//! use weft_core::prelude::*;
//!
//! # fn main() -> weft_core::Result<()> {
//! let mut server = Server::bind_endpoint("tcp://127.0.0.1:5555", ServerConfig::default())?;
//! server.on_connection(|connection| {
//!     connection.observe(
//!         |connection, message| {
//!             let _ = connection.send(message.payload());
//!         },
//!         |_| {},
//!     );
//! });
//! loop {
//!     server.poll_once()?;
//! }
//! # }
//! ```

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::balancer::LeastLoaded;
use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionId, ConnectionIdGenerator};
use crate::endpoint::Endpoint;
use crate::errno;
use crate::error::{classify, IoDisposition, Result, WeftError};
use crate::manager::{EventManager, ManagerWorker, Rejected};
use crate::socket::Socket;

/// Accepts taken per [`Server::accept_pending`] call.
const MAX_ACCEPTS_PER_CALL: usize = 64;

/// How long [`Server::disconnect_all`] waits for a threaded manager.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

type ConnectionCallback = Box<dyn FnMut(&Arc<Connection>) + Send>;

enum ManagerSlot {
    Inline(EventManager),
    Threaded {
        worker: ManagerWorker,
        assigned: usize,
    },
}

impl ManagerSlot {
    fn load(&self) -> usize {
        match self {
            Self::Inline(manager) => manager.connection_count(),
            Self::Threaded { assigned, .. } => *assigned,
        }
    }

    fn add_connection(
        &mut self,
        socket: Socket,
        connection: Arc<Connection>,
    ) -> std::result::Result<(), Rejected> {
        match self {
            Self::Inline(manager) => manager.add_connection(socket, connection),
            Self::Threaded { worker, assigned } => {
                worker.add_connection(socket, connection)?;
                *assigned += 1;
                Ok(())
            }
        }
    }
}

struct Entry {
    connection: Arc<Connection>,
    manager: usize,
}

/// TCP server distributing connections over event managers.
pub struct Server {
    listener: Option<Socket>,
    local_addr: SocketAddr,
    config: ServerConfig,
    managers: Vec<ManagerSlot>,
    balancer: LeastLoaded,
    connections: Vec<Entry>,
    ids: ConnectionIdGenerator,
    on_connection: Option<ConnectionCallback>,
}

impl Server {
    /// Listen on `addr` and start `config.managers` managers.
    pub fn bind(addr: impl Into<Endpoint>, config: ServerConfig) -> Result<Self> {
        let addr = addr.into().addr();
        let listener = Socket::listen(
            addr,
            config.backlog,
            config.reuse_address,
            config.reuse_port,
        )?;
        let local_addr = listener.local_addr()?;

        let mut server = Self {
            listener: Some(listener),
            local_addr,
            managers: Vec::with_capacity(config.managers),
            balancer: LeastLoaded::new(),
            connections: Vec::new(),
            ids: ConnectionIdGenerator::new(),
            on_connection: None,
            config,
        };
        for _ in 0..server.config.managers {
            server.add_event_manager()?;
        }

        info!(
            "[Server] listening on {} with {} {} manager(s){}",
            local_addr,
            server.managers.len(),
            server.config.backend,
            if server.config.threaded { ", threaded" } else { "" }
        );
        Ok(server)
    }

    /// Listen on an endpoint string such as `tcp://0.0.0.0:5555`.
    pub fn bind_endpoint(endpoint: &str, config: ServerConfig) -> Result<Self> {
        Self::bind(Endpoint::parse(endpoint)?, config)
    }

    /// Start one more manager with the server's backend. Returns its index.
    pub fn add_event_manager(&mut self) -> Result<usize> {
        let index = self.managers.len();
        let slot = if self.config.threaded {
            ManagerSlot::Threaded {
                worker: ManagerWorker::spawn(
                    index,
                    self.config.backend,
                    self.config.manager.clone(),
                    self.config.idle_wait,
                )?,
                assigned: 0,
            }
        } else {
            ManagerSlot::Inline(EventManager::new(
                self.config.backend,
                index,
                &self.config.manager,
            )?)
        };
        self.managers.push(slot);
        debug!("[Server] manager {} started", index);
        Ok(index)
    }

    /// Called with every newly accepted connection before any of its
    /// messages is delivered. Install observers here.
    pub fn on_connection<F>(&mut self, callback: F)
    where
        F: FnMut(&Arc<Connection>) + Send + 'static,
    {
        self.on_connection = Some(Box::new(callback));
    }

    /// Accept one pending connection, if any.
    pub fn accept(&mut self) -> Result<Option<ConnectionId>> {
        let Some(listener) = self.listener.as_ref() else {
            return Ok(None);
        };
        let (socket, peer) = match listener.accept() {
            Ok(Some(accepted)) => accepted,
            Ok(None) => return Ok(None),
            Err(e) => match classify(&e) {
                IoDisposition::Retry | IoDisposition::Disconnect => {
                    debug!("[Server] accept: {}", errno::describe(&e));
                    return Ok(None);
                }
                IoDisposition::Fatal => {
                    warn!("[Server] accept failed: {}", errno::describe(&e));
                    return Err(e.into());
                }
            },
        };

        if self.config.nodelay {
            if let Err(e) = socket.set_nodelay(true) {
                debug!("[Server] TCP_NODELAY: {}", errno::describe(&e));
            }
        }

        let connection = Arc::new(Connection::new(self.ids.next_id(), peer));
        let id = connection.id();
        let manager = self.assign(socket, Arc::clone(&connection))?;
        debug!(
            "[Server] connection {} from {:?} -> manager {}",
            id, peer, manager
        );

        self.connections.push(Entry {
            connection: Arc::clone(&connection),
            manager,
        });
        if let Some(callback) = self.on_connection.as_mut() {
            callback(&connection);
        }
        Ok(Some(id))
    }

    /// Accept connections until none is pending. Returns how many.
    ///
    /// A socket no manager takes is closed and skipped. Other accept
    /// failures end this round; only those leaving the listener unusable
    /// are returned.
    pub fn accept_pending(&mut self) -> Result<usize> {
        let mut accepted = 0;
        for _ in 0..MAX_ACCEPTS_PER_CALL {
            match self.accept() {
                Ok(Some(_)) => accepted += 1,
                Ok(None) => break,
                Err(WeftError::NoManagerAvailable) => {}
                // EMFILE, ENOBUFS and the like: retry on the next round
                Err(WeftError::Io(e)) if !listener_broken(&e) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(accepted)
    }

    /// Run one iteration of every inline manager.
    ///
    /// Threaded managers run on their own; nothing is done for them here.
    pub fn handle_events(&mut self) -> Result<usize> {
        let mut events = 0;
        for slot in &mut self.managers {
            if let ManagerSlot::Inline(manager) = slot {
                events += manager.handle_events()?;
            }
        }
        Ok(events)
    }

    /// Deliver received messages and retire finished connections.
    ///
    /// Returns the number of connections retired.
    pub fn update(&mut self) -> usize {
        let managers = &mut self.managers;
        let before = self.connections.len();
        self.connections.retain(|entry| {
            if entry.connection.update() {
                return true;
            }
            if let Some(ManagerSlot::Threaded { assigned, .. }) = managers.get_mut(entry.manager) {
                *assigned = assigned.saturating_sub(1);
            }
            debug!("[Server] connection {} retired", entry.connection.id());
            false
        });
        before - self.connections.len()
    }

    /// Accept, handle events and update in one go.
    pub fn poll_once(&mut self) -> Result<usize> {
        let accepted = self.accept_pending()?;
        let events = self.handle_events()?;
        self.update();
        Ok(accepted + events)
    }

    /// Close every connection. `on_disconnect` fires for each.
    pub fn disconnect_all(&mut self) -> Result<()> {
        for slot in &mut self.managers {
            match slot {
                ManagerSlot::Inline(manager) => manager.disconnect_all()?,
                ManagerSlot::Threaded { worker, .. } => worker.disconnect_all(DISCONNECT_TIMEOUT)?,
            }
        }
        for entry in &self.connections {
            entry.connection.mark_for_close();
        }
        self.update();
        Ok(())
    }

    /// Stop accepting; the listening socket is closed.
    pub fn close_listener(&mut self) {
        if self.listener.take().is_some() {
            info!("[Server] stopped listening on {}", self.local_addr);
        }
    }

    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.listener.is_some()
    }

    #[must_use]
    pub fn has_connections(&self) -> bool {
        !self.connections.is_empty()
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connections(&self) -> impl Iterator<Item = &Arc<Connection>> {
        self.connections.iter().map(|entry| &entry.connection)
    }

    #[must_use]
    pub fn connection(&self, id: ConnectionId) -> Option<&Arc<Connection>> {
        self.connections
            .iter()
            .find(|entry| entry.connection.id() == id)
            .map(|entry| &entry.connection)
    }

    /// Manager index serving `id`.
    #[must_use]
    pub fn manager_of(&self, id: ConnectionId) -> Option<usize> {
        self.connections
            .iter()
            .find(|entry| entry.connection.id() == id)
            .map(|entry| entry.manager)
    }

    /// Current load of every manager, by index.
    #[must_use]
    pub fn manager_loads(&self) -> Vec<usize> {
        self.managers.iter().map(ManagerSlot::load).collect()
    }

    #[must_use]
    pub fn manager_count(&self) -> usize {
        self.managers.len()
    }

    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Give the socket to the least-loaded manager, falling back to the
    /// others if it refuses.
    fn assign(&mut self, socket: Socket, connection: Arc<Connection>) -> Result<usize> {
        let mut loads = self.manager_loads();
        let mut socket = socket;
        let mut connection = connection;

        for _ in 0..loads.len() {
            let Some(index) = self.balancer.select(&loads) else {
                break;
            };
            match self.managers[index].add_connection(socket, connection) {
                Ok(()) => return Ok(index),
                Err(rejected) => {
                    warn!(
                        "[Server] manager {} refused connection {}: {}",
                        index,
                        rejected.connection.id(),
                        rejected.error
                    );
                    loads[index] = usize::MAX;
                    socket = rejected.socket;
                    connection = rejected.connection;
                }
            }
        }

        warn!(
            "[Server] closing connection {}: no manager accepted it",
            connection.id()
        );
        Err(WeftError::NoManagerAvailable)
    }
}

/// Accept failures that leave the listening socket itself unusable.
fn listener_broken(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EBADF | libc::EINVAL | libc::ENOTSOCK | libc::EOPNOTSUPP)
    )
}

impl Drop for Server {
    fn drop(&mut self) {
        debug!(
            "[Server] shutting down {} manager(s), {} connection(s)",
            self.managers.len(),
            self.connections.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;
    use std::io::Read;
    use std::net::TcpStream;
    use std::thread;

    fn server(managers: usize) -> Server {
        let config = ServerConfig::default()
            .with_backend(BackendKind::Poll)
            .with_managers(managers);
        Server::bind("127.0.0.1:0".parse::<SocketAddr>().unwrap(), config).unwrap()
    }

    fn accept_one(server: &mut Server) -> ConnectionId {
        for _ in 0..500 {
            if let Some(id) = server.accept().unwrap() {
                return id;
            }
            thread::sleep(Duration::from_millis(2));
        }
        panic!("no connection accepted");
    }

    #[test]
    fn accept_without_client_returns_none() {
        let mut server = server(1);
        assert_eq!(server.accept().unwrap(), None);
        assert!(!server.has_connections());
    }

    #[test]
    fn spreads_connections_over_managers() {
        let mut server = server(3);
        let addr = server.local_addr();
        let mut clients = Vec::new();
        for _ in 0..6 {
            clients.push(TcpStream::connect(addr).unwrap());
            accept_one(&mut server);
        }
        assert_eq!(server.manager_loads(), vec![2, 2, 2]);
        assert_eq!(server.connection_count(), 6);
    }

    #[test]
    fn callback_sees_every_connection() {
        let mut server = server(1);
        let (tx, rx) = flume::unbounded();
        server.on_connection(move |connection| {
            let _ = tx.send(connection.id());
        });

        let _client = TcpStream::connect(server.local_addr()).unwrap();
        let id = accept_one(&mut server);
        assert_eq!(rx.try_recv().unwrap(), id);
        assert!(server.connection(id).is_some());
        assert_eq!(server.manager_of(id), Some(0));
    }

    #[test]
    fn refused_socket_is_closed_and_the_loop_keeps_going() {
        let config = ServerConfig::default()
            .with_backend(BackendKind::Poll)
            .with_managers(2)
            .with_threaded(true);
        let mut server =
            Server::bind("127.0.0.1:0".parse::<SocketAddr>().unwrap(), config).unwrap();
        for slot in &mut server.managers {
            if let ManagerSlot::Threaded { worker, .. } = slot {
                worker.shutdown();
            }
        }

        let mut client = TcpStream::connect(server.local_addr()).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        for _ in 0..50 {
            server.poll_once().unwrap();
            thread::sleep(Duration::from_millis(2));
        }

        assert!(!server.has_connections());
        assert!(server.is_listening());
        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn listener_errors_are_told_apart_from_socket_errors() {
        assert!(listener_broken(&io::Error::from_raw_os_error(libc::EBADF)));
        assert!(listener_broken(&io::Error::from_raw_os_error(libc::EINVAL)));
        assert!(!listener_broken(&io::Error::from_raw_os_error(libc::EMFILE)));
        assert!(!listener_broken(&io::Error::from_raw_os_error(libc::ENOBUFS)));
    }

    #[test]
    fn closed_listener_accepts_nothing() {
        let mut server = server(1);
        server.close_listener();
        assert!(!server.is_listening());
        assert_eq!(server.accept().unwrap(), None);
    }
}
