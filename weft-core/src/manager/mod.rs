//! Event managers.
//!
//! An event manager owns a set of sockets and drives their I/O with one
//! backend. [`EventManager`] selects the loop at runtime: the readiness loop
//! over select or poll, or the completion loop over io_uring.

#[cfg(target_os = "linux")]
pub mod completion;
mod context;
pub mod readiness;
pub mod worker;

use std::fmt;
use std::sync::Arc;

use crate::config::{BackendKind, ManagerConfig};
use crate::connection::Connection;
use crate::error::{Result, WeftError};
use crate::poller::{PollBackend, SelectBackend};
use crate::socket::Socket;

#[cfg(target_os = "linux")]
pub use completion::CompletionManager;
pub use readiness::ReadinessManager;
pub use worker::ManagerWorker;

/// A socket a manager refused, handed back with its connection.
pub struct Rejected {
    pub socket: Socket,
    pub connection: Arc<Connection>,
    pub error: WeftError,
}

impl fmt::Debug for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("socket", &self.socket.id())
            .field("connection", &self.connection.id())
            .field("error", &self.error)
            .finish()
    }
}

impl From<Rejected> for WeftError {
    fn from(rejected: Rejected) -> Self {
        rejected.error
    }
}

macro_rules! dispatch {
    ($self:expr, $manager:ident => $body:expr) => {
        match $self {
            EventManager::Select($manager) => $body,
            EventManager::Poll($manager) => $body,
            #[cfg(target_os = "linux")]
            EventManager::Completion($manager) => $body,
        }
    };
}

/// Event manager with a runtime-selected backend.
pub enum EventManager {
    Select(ReadinessManager<SelectBackend>),
    Poll(ReadinessManager<PollBackend>),
    #[cfg(target_os = "linux")]
    Completion(CompletionManager),
}

impl EventManager {
    /// Build manager number `index` on the `kind` backend.
    pub fn new(kind: BackendKind, index: usize, config: &ManagerConfig) -> Result<Self> {
        match kind {
            BackendKind::Select => Ok(Self::Select(ReadinessManager::new(
                index,
                SelectBackend::new(),
                config.clone(),
            ))),
            BackendKind::Poll => Ok(Self::Poll(ReadinessManager::new(
                index,
                PollBackend::new(),
                config.clone(),
            ))),
            #[cfg(target_os = "linux")]
            BackendKind::Completion => Ok(Self::Completion(CompletionManager::new(
                index,
                config.clone(),
            )?)),
            #[cfg(not(target_os = "linux"))]
            BackendKind::Completion => Err(WeftError::UnsupportedBackend(kind.name())),
        }
    }

    #[must_use]
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Select(_) => BackendKind::Select,
            Self::Poll(_) => BackendKind::Poll,
            #[cfg(target_os = "linux")]
            Self::Completion(_) => BackendKind::Completion,
        }
    }

    /// Take ownership of `socket` and serve `connection` on it.
    pub fn add_connection(
        &mut self,
        socket: Socket,
        connection: Arc<Connection>,
    ) -> std::result::Result<(), Rejected> {
        dispatch!(self, manager => manager.add_connection(socket, connection))
    }

    /// One iteration of the manager's loop.
    pub fn handle_events(&mut self) -> Result<usize> {
        dispatch!(self, manager => manager.handle_events())
    }

    /// Close every socket; connections are marked for close.
    pub fn disconnect_all(&mut self) -> Result<()> {
        match self {
            Self::Select(manager) => manager.disconnect_all(),
            Self::Poll(manager) => manager.disconnect_all(),
            #[cfg(target_os = "linux")]
            Self::Completion(manager) => manager.disconnect_all()?,
        }
        Ok(())
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        dispatch!(self, manager => manager.connection_count())
    }

    #[must_use]
    pub fn has_connections(&self) -> bool {
        dispatch!(self, manager => manager.has_connections())
    }
}

impl fmt::Debug for EventManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventManager")
            .field("kind", &self.kind())
            .field("connections", &self.connection_count())
            .finish()
    }
}
