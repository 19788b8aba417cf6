//! Helpers shared by the end-to-end tests.

#![allow(dead_code)]

use std::thread;
use std::time::{Duration, Instant};

use weft::prelude::*;

const DEADLINE: Duration = Duration::from_secs(10);

/// Backends usable on this machine.
pub fn backends() -> Vec<BackendKind> {
    BackendKind::available()
        .iter()
        .copied()
        .filter(|&kind| {
            #[cfg(target_os = "linux")]
            if kind == BackendKind::Completion && !weft::completion::is_supported() {
                println!("Skipping completion backend - io_uring unavailable");
                return false;
            }
            let _ = kind;
            true
        })
        .collect()
}

pub fn bind(config: ServerConfig) -> Server {
    weft::dev_tracing::init_tracing();
    Server::bind(Endpoint::localhost(0), config).unwrap()
}

/// Echo every message back to its sender.
pub fn echo_on_connect(server: &mut Server) {
    server.on_connection(|connection| {
        connection.observe(
            |connection, message| {
                connection.send(message.payload()).unwrap();
            },
            |_| {},
        );
    });
}

/// Drive the server until `done` holds.
pub fn serve_until(server: &mut Server, mut done: impl FnMut(&Server) -> bool) {
    let deadline = Instant::now() + DEADLINE;
    while !done(server) {
        assert!(Instant::now() < deadline, "server condition not reached in time");
        server.poll_once().unwrap();
    }
}

/// Run `client` on its own thread while the server is driven here.
pub fn with_client<T, F>(server: &mut Server, client: F) -> T
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let handle = thread::spawn(client);
    serve_until(server, |_| handle.is_finished());
    handle.join().unwrap()
}

pub fn connect(server: &Server) -> Client {
    let client = Client::connect(server.local_addr()).unwrap();
    client.set_read_timeout(Some(DEADLINE)).unwrap();
    client
}
