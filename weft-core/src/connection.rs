//! Per-peer connection state shared between a manager and the server.
//!
//! A [`Connection`] is created on accept and owned by the server's list as an
//! `Arc`. The manager that services its socket pushes reassembled messages
//! onto the inbound queue and pulls outbound messages off the other one;
//! [`Connection::update`] later delivers inbound messages to the observer on
//! the server thread.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{Result, WeftError};
use crate::framing;

/// Unique, monotonically assigned connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Issues connection ids. Owned by the server.
#[derive(Debug, Default)]
pub struct ConnectionIdGenerator {
    next: AtomicU64,
}

impl ConnectionIdGenerator {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(0),
        }
    }

    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Created, not yet registered with a manager.
    Init,
    /// Registered and exchanging traffic.
    Opened,
    /// Transport is gone; waiting for the next update to deliver and destroy.
    MarkForClose,
    /// `on_disconnect` has fired.
    Closed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => write!(f, "Init"),
            Self::Opened => write!(f, "Opened"),
            Self::MarkForClose => write!(f, "MarkForClose"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// Queued outbound message.
#[derive(Debug, Clone)]
pub struct SendMessage {
    wire: Bytes,
    sent: bool,
}

impl SendMessage {
    /// Encode `payload`. Fails if it contains the terminator.
    pub fn new(payload: &[u8]) -> Result<Self> {
        Ok(Self {
            wire: framing::encode(payload)?,
            sent: false,
        })
    }

    /// Payload without the terminator.
    #[must_use]
    pub fn payload(&self) -> Bytes {
        self.wire.slice(..self.wire.len() - 1)
    }

    /// Encoded bytes, terminator included.
    #[must_use]
    pub fn wire(&self) -> &Bytes {
        &self.wire
    }

    /// Framing has started; the message must not be issued again.
    #[must_use]
    pub const fn is_sent(&self) -> bool {
        self.sent
    }
}

/// Fully reassembled inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    payload: Bytes,
}

impl ReceivedMessage {
    #[must_use]
    pub const fn new(payload: Bytes) -> Self {
        Self { payload }
    }

    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Payload as UTF-8 text.
    pub fn as_str(&self) -> std::result::Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.payload)
    }

    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        self.payload
    }
}

/// Application callbacks for one connection.
///
/// Both methods run on the thread calling `Server::update`. The observer is
/// taken out of the connection while it runs, so calling
/// [`Connection::send`] from inside a callback is fine.
pub trait ConnectionObserver: Send {
    fn on_message(&mut self, connection: &Connection, message: &ReceivedMessage);

    fn on_disconnect(&mut self, connection: &Connection) {
        let _ = connection;
    }
}

/// Observer built from two closures.
pub struct FnObserver<M, D> {
    on_message: M,
    on_disconnect: D,
}

impl<M, D> FnObserver<M, D>
where
    M: FnMut(&Connection, &ReceivedMessage) + Send,
    D: FnMut(&Connection) + Send,
{
    pub fn new(on_message: M, on_disconnect: D) -> Self {
        Self {
            on_message,
            on_disconnect,
        }
    }
}

impl<M, D> ConnectionObserver for FnObserver<M, D>
where
    M: FnMut(&Connection, &ReceivedMessage) + Send,
    D: FnMut(&Connection) + Send,
{
    fn on_message(&mut self, connection: &Connection, message: &ReceivedMessage) {
        (self.on_message)(connection, message);
    }

    fn on_disconnect(&mut self, connection: &Connection) {
        (self.on_disconnect)(connection);
    }
}

struct State {
    status: ConnectionStatus,
    outbound: VecDeque<SendMessage>,
    inbound: VecDeque<ReceivedMessage>,
}

/// One peer.
pub struct Connection {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    state: Mutex<State>,
    observer: Mutex<Option<Box<dyn ConnectionObserver>>>,
}

impl Connection {
    #[must_use]
    pub fn new(id: ConnectionId, peer: Option<SocketAddr>) -> Self {
        Self {
            id,
            peer,
            state: Mutex::new(State {
                status: ConnectionStatus::Init,
                outbound: VecDeque::new(),
                inbound: VecDeque::new(),
            }),
            observer: Mutex::new(None),
        }
    }

    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    #[must_use]
    pub const fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.state.lock().status
    }

    /// Still registered with a manager and accepting traffic.
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(
            self.status(),
            ConnectionStatus::Init | ConnectionStatus::Opened
        )
    }

    /// Install the observer, replacing any previous one.
    pub fn set_observer<O>(&self, observer: O)
    where
        O: ConnectionObserver + 'static,
    {
        *self.observer.lock() = Some(Box::new(observer));
    }

    /// Install closure callbacks.
    pub fn observe<M, D>(&self, on_message: M, on_disconnect: D)
    where
        M: FnMut(&Connection, &ReceivedMessage) + Send + 'static,
        D: FnMut(&Connection) + Send + 'static,
    {
        self.set_observer(FnObserver::new(on_message, on_disconnect));
    }

    /// Queue `payload` for delivery to the peer.
    pub fn send(&self, payload: impl AsRef<[u8]>) -> Result<()> {
        let message = SendMessage::new(payload.as_ref())?;
        let mut state = self.state.lock();
        if !matches!(
            state.status,
            ConnectionStatus::Init | ConnectionStatus::Opened
        ) {
            return Err(WeftError::ConnectionClosed(self.id));
        }
        state.outbound.push_back(message);
        trace!(
            "[Connection {}] queued {} bytes ({} pending)",
            self.id,
            payload.as_ref().len(),
            state.outbound.len()
        );
        Ok(())
    }

    /// Ask the owning manager to close the socket.
    ///
    /// Queued inbound messages are still delivered by the next update.
    pub fn close(&self) {
        self.mark_for_close();
    }

    /// Outbound messages not yet fully written.
    #[must_use]
    pub fn pending_outbound(&self) -> usize {
        self.state.lock().outbound.len()
    }

    /// Inbound messages awaiting delivery.
    #[must_use]
    pub fn pending_inbound(&self) -> usize {
        self.state.lock().inbound.len()
    }

    /// Deliver queued messages and, if the connection is closing, fire
    /// `on_disconnect`.
    ///
    /// Returns `false` once the connection is finished and can be dropped.
    pub fn update(&self) -> bool {
        loop {
            let Some(message) = self.state.lock().inbound.pop_front() else {
                break;
            };
            self.deliver(&message);
        }

        // A manager may push a final message and mark the connection in the
        // gap above; the status flip and the last drain share one lock.
        let leftover = {
            let mut state = self.state.lock();
            match state.status {
                ConnectionStatus::MarkForClose => {
                    state.status = ConnectionStatus::Closed;
                    state.outbound.clear();
                    std::mem::take(&mut state.inbound)
                }
                ConnectionStatus::Closed => return false,
                _ => return true,
            }
        };

        for message in &leftover {
            self.deliver(message);
        }
        debug!("[Connection {}] disconnected", self.id);
        self.with_observer(|observer, connection| observer.on_disconnect(connection));
        false
    }

    fn deliver(&self, message: &ReceivedMessage) {
        self.with_observer(|observer, connection| observer.on_message(connection, message));
    }

    fn with_observer<F>(&self, f: F)
    where
        F: FnOnce(&mut dyn ConnectionObserver, &Connection),
    {
        let taken = self.observer.lock().take();
        if let Some(mut observer) = taken {
            f(observer.as_mut(), self);
            let mut slot = self.observer.lock();
            if slot.is_none() {
                *slot = Some(observer);
            }
        }
    }

    pub(crate) fn mark_opened(&self) {
        let mut state = self.state.lock();
        if state.status == ConnectionStatus::Init {
            state.status = ConnectionStatus::Opened;
        }
    }

    pub(crate) fn mark_for_close(&self) {
        let mut state = self.state.lock();
        if matches!(
            state.status,
            ConnectionStatus::Init | ConnectionStatus::Opened
        ) {
            state.status = ConnectionStatus::MarkForClose;
        }
    }

    pub(crate) fn push_received(&self, payload: Bytes) {
        trace!("[Connection {}] received {} bytes", self.id, payload.len());
        self.state
            .lock()
            .inbound
            .push_back(ReceivedMessage::new(payload));
    }

    /// Front message has not started sending yet.
    pub(crate) fn has_unsent(&self) -> bool {
        self.state
            .lock()
            .outbound
            .front()
            .is_some_and(|message| !message.sent)
    }

    /// Mark the front message as in flight and hand out its wire bytes.
    pub(crate) fn begin_send(&self) -> Option<Bytes> {
        let mut state = self.state.lock();
        let message = state.outbound.front_mut()?;
        if message.sent {
            return None;
        }
        message.sent = true;
        Some(message.wire.clone())
    }

    /// The in-flight front message is fully written.
    pub(crate) fn complete_send(&self) {
        let mut state = self.state.lock();
        if state.outbound.front().is_some_and(|message| message.sent) {
            state.outbound.pop_front();
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("status", &state.status)
            .field("outbound", &state.outbound.len())
            .field("inbound", &state.inbound.len())
            .finish()
    }
}
