//! Manager and server configuration
//!
//! Buffer sizing and loop timeouts for event managers, plus the listener and
//! load-balancing knobs of the server. Tuning the buffer size trades memory
//! per in-flight message against the number of receives per message.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::buffer::{DEFAULT_BUFFER_SIZE, DEFAULT_INITIAL_BUFFERS};

/// Small buffer size (256 bytes)
///
/// Chat-style traffic where most messages are a few dozen bytes.
pub const SMALL_BUFFER_SIZE: usize = 256;

/// Large buffer size (16KB)
///
/// Bulk payloads; fewer receives per message.
pub const LARGE_BUFFER_SIZE: usize = 16384;

/// Readiness wait per iteration (1ms)
///
/// Short enough that newly queued outbound messages are picked up promptly.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(1);

/// Completion dequeue per iteration (100ms)
pub const DEFAULT_COMPLETION_TIMEOUT: Duration = Duration::from_millis(100);

/// Submission queue depth of the completion backend
pub const DEFAULT_RING_ENTRIES: u32 = 256;

/// Listen backlog
pub const DEFAULT_BACKLOG: i32 = 128;

/// Idle wait of a threaded manager with no connections (10ms)
pub const DEFAULT_IDLE_WAIT: Duration = Duration::from_millis(10);

/// Multiplexing strategy of an event manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// `select(2)` readiness
    Select,
    /// `poll(2)` readiness
    Poll,
    /// io_uring completion queue (Linux only)
    Completion,
}

impl BackendKind {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Select => "select",
            Self::Poll => "poll",
            Self::Completion => "completion",
        }
    }

    /// Backends compiled for this platform.
    #[must_use]
    pub fn available() -> &'static [BackendKind] {
        #[cfg(target_os = "linux")]
        {
            &[Self::Select, Self::Poll, Self::Completion]
        }
        #[cfg(not(target_os = "linux"))]
        {
            &[Self::Select, Self::Poll]
        }
    }
}

impl Default for BackendKind {
    fn default() -> Self {
        Self::Poll
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "select" => Ok(Self::Select),
            "poll" => Ok(Self::Poll),
            "completion" | "uring" | "io_uring" | "iocp" => Ok(Self::Completion),
            other => Err(format!(
                "unknown backend '{other}' (expected select, poll or completion)"
            )),
        }
    }
}

/// Per-manager settings.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Size `B` of every pool buffer; also the outbound chunk size.
    pub buffer_size: usize,
    /// Buffers preallocated per manager.
    pub initial_buffers: usize,
    /// Readiness wait per iteration. `None` blocks until an event.
    pub poll_timeout: Option<Duration>,
    /// Completion dequeue per iteration. `None` blocks until a completion.
    pub completion_timeout: Option<Duration>,
    /// Submission queue depth of the completion backend.
    pub ring_entries: u32,
    /// Largest accepted inbound message; `None` for unbounded.
    pub max_message_size: Option<usize>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            initial_buffers: DEFAULT_INITIAL_BUFFERS,
            poll_timeout: Some(DEFAULT_POLL_TIMEOUT),
            completion_timeout: Some(DEFAULT_COMPLETION_TIMEOUT),
            ring_entries: DEFAULT_RING_ENTRIES,
            max_message_size: None,
        }
    }
}

impl ManagerConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for small messages
    #[must_use]
    pub fn small() -> Self {
        Self::default().with_buffer_size(SMALL_BUFFER_SIZE)
    }

    /// Preset for bulk payloads
    #[must_use]
    pub fn large() -> Self {
        Self::default().with_buffer_size(LARGE_BUFFER_SIZE)
    }

    #[must_use]
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.max(1);
        self
    }

    #[must_use]
    pub const fn with_initial_buffers(mut self, count: usize) -> Self {
        self.initial_buffers = count;
        self
    }

    #[must_use]
    pub const fn with_poll_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.poll_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_completion_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.completion_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_ring_entries(mut self, entries: u32) -> Self {
        self.ring_entries = entries;
        self
    }

    #[must_use]
    pub const fn with_max_message_size(mut self, max: Option<usize>) -> Self {
        self.max_message_size = max;
        self
    }
}

/// Server settings.
///
/// # Examples
///
/// ```
/// use weft_core::config::{BackendKind, ServerConfig};
///
/// let config = ServerConfig::default()
///     .with_backend(BackendKind::Select)
///     .with_managers(4)
///     .with_buffer_size(512);
/// assert_eq!(config.manager.buffer_size, 512);
/// ```
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub backend: BackendKind,
    /// Number of event managers; at least one.
    pub managers: usize,
    /// Run every manager on its own thread.
    pub threaded: bool,
    pub backlog: i32,
    /// `SO_REUSEADDR` on the listener.
    pub reuse_address: bool,
    /// `SO_REUSEPORT` on the listener. Off by default: with it a second
    /// server can bind the same port and take a share of the connections.
    pub reuse_port: bool,
    /// `TCP_NODELAY` on accepted sockets.
    pub nodelay: bool,
    /// Channel wait of an idle threaded manager.
    pub idle_wait: Duration,
    pub manager: ManagerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            managers: 1,
            threaded: false,
            backlog: DEFAULT_BACKLOG,
            reuse_address: true,
            reuse_port: false,
            nodelay: true,
            idle_wait: DEFAULT_IDLE_WAIT,
            manager: ManagerConfig::default(),
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// One threaded manager per CPU core.
    #[must_use]
    pub fn per_core() -> Self {
        Self::default()
            .with_managers(num_cpus::get())
            .with_threaded(true)
    }

    #[must_use]
    pub const fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    #[must_use]
    pub fn with_managers(mut self, managers: usize) -> Self {
        self.managers = managers.max(1);
        self
    }

    #[must_use]
    pub const fn with_threaded(mut self, threaded: bool) -> Self {
        self.threaded = threaded;
        self
    }

    #[must_use]
    pub const fn with_backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    #[must_use]
    pub const fn with_reuse_address(mut self, reuse: bool) -> Self {
        self.reuse_address = reuse;
        self
    }

    #[must_use]
    pub const fn with_reuse_port(mut self, reuse: bool) -> Self {
        self.reuse_port = reuse;
        self
    }

    #[must_use]
    pub const fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    #[must_use]
    pub const fn with_idle_wait(mut self, wait: Duration) -> Self {
        self.idle_wait = wait;
        self
    }

    #[must_use]
    pub fn with_manager(mut self, manager: ManagerConfig) -> Self {
        self.manager = manager;
        self
    }

    /// Shorthand for `manager.buffer_size`.
    #[must_use]
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.manager = self.manager.with_buffer_size(size);
        self
    }
}
