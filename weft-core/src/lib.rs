//! Weft Core
//!
//! Event-driven TCP connection engine:
//! - Fixed-size buffer pool and per-message buffer chains (`buffer`)
//! - Null-delimited message framing (`framing`)
//! - Connection state and message queues (`connection`)
//! - Readiness backends over select and poll (`poller`)
//! - Completion backend over io_uring, Linux only (`completion`)
//! - Event managers driving either kind of backend (`manager`)
//! - Least-loaded manager selection (`balancer`)
//! - Listening server and blocking client (`server`, `client`)
//! - Error types and OS error names (`error`, `errno`)

// Backends call into libc; each of those modules opts back in.
#![cfg_attr(not(test), deny(unsafe_code))]
// Allow some pedantic lints that are intentional in this crate
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::match_same_arms)]

#[cfg(not(unix))]
compile_error!("weft-core supports Unix-like platforms only");

pub mod balancer;
pub mod buffer;
pub mod client;
#[cfg(target_os = "linux")]
pub mod completion;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod errno;
pub mod error;
pub mod framing;
pub mod manager;
pub mod poller;
pub mod server;
pub mod socket;

pub use error::{Result, WeftError};

pub mod prelude {
    pub use crate::buffer::{BufferChain, BufferPool};
    pub use crate::client::Client;
    pub use crate::config::{BackendKind, ManagerConfig, ServerConfig};
    pub use crate::connection::{
        Connection, ConnectionId, ConnectionObserver, ConnectionStatus, ReceivedMessage,
    };
    pub use crate::endpoint::Endpoint;
    pub use crate::error::{Result, WeftError};
    pub use crate::manager::EventManager;
    pub use crate::server::Server;
}
