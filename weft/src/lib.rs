//! # Weft
//!
//! An event-driven TCP message server. Peers exchange null-delimited
//! messages; a server spreads accepted connections over event managers, each
//! driving its sockets with one I/O backend.
//!
//! ## Architecture
//!
//! - **`weft-core`**: buffer pool, framing, backends, managers, server
//! - **`weft`**: public API surface (this crate)
//!
//! ## Backends
//!
//! - **`select`** and **`poll`**: readiness loops, every Unix
//! - **`completion`**: io_uring completion loop, Linux 5.11+
//!
//! ## Quick Start
//!
//! ### Echo server
//!
//! ```rust,no_run
//! use weft::prelude::*;
//!
//! # fn main() -> weft::Result<()> {
//! let config = ServerConfig::default().with_backend(BackendKind::Poll);
//! let mut server = Server::bind_endpoint("tcp://127.0.0.1:5555", config)?;
//!
//! server.on_connection(|connection| {
//!     connection.observe(
//!         |connection, message| {
//!             let _ = connection.send(message.payload());
//!         },
//!         |connection| println!("{} left", connection.id()),
//!     );
//! });
//!
//! loop {
//!     server.poll_once()?;
//! }
//! # }
//! ```
//!
//! ### Client
//!
//! ```rust,no_run
//! use weft::prelude::*;
//!
//! # fn main() -> weft::Result<()> {
//! let mut client = Client::connect(Endpoint::localhost(5555))?;
//! client.send("hello")?;
//! if let Some(reply) = client.recv()? {
//!     println!("Received: {:?}", reply);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Threading
//!
//! With [`ServerConfig::with_threaded`] every manager runs on its own thread.
//! Observers still run only on the thread calling [`Server::update`].
//!
//! ## Safety
//!
//! - `unsafe` code is isolated to the backends in `weft-core` (`poller`,
//!   `completion`, and the completion manager)
//! - Everything above the backends is safe Rust

#![warn(missing_docs)]
#![warn(clippy::all)]

// Re-export core types
pub use bytes::Bytes;

pub use weft_core::balancer;
pub use weft_core::buffer;
pub use weft_core::client::Client;
#[cfg(target_os = "linux")]
pub use weft_core::completion;
pub use weft_core::config::{self, BackendKind, ManagerConfig, ServerConfig};
pub use weft_core::connection::{
    self, Connection, ConnectionId, ConnectionObserver, ConnectionStatus, FnObserver,
    ReceivedMessage,
};
pub use weft_core::endpoint::{Endpoint, EndpointError};
pub use weft_core::framing;
pub use weft_core::manager::{self, EventManager};
pub use weft_core::server::Server;
pub use weft_core::{Result, WeftError};

/// Tracing setup for examples, tests and benches.
pub mod dev_tracing;

/// Commonly used types.
pub mod prelude {
    pub use weft_core::prelude::*;
}
