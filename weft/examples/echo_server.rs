//! Echo server with periodic server-initiated messages.
//!
//! Usage: `cargo run --example echo_server -- [backend] [port] [managers] [--threaded] [--seconds N]`
//!
//! - `backend`: `select`, `poll` or `completion` (default `poll`)
//! - `port`: listening port (default 3000)
//! - `managers`: number of event managers (default 1)
//!
//! Every message is echoed back. Every three seconds a random connection gets
//! "Hello from server". Pair it with the `client` example.

use std::time::{Duration, Instant};

use rand::Rng;
use tracing::info;
use weft::prelude::*;

struct Args {
    backend: BackendKind,
    port: u16,
    managers: usize,
    threaded: bool,
    run_for: Option<Duration>,
}

fn parse_args() -> std::result::Result<Args, String> {
    let mut args = Args {
        backend: BackendKind::Poll,
        port: 3000,
        managers: 1,
        threaded: false,
        run_for: None,
    };
    let mut positional = 0;
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--threaded" => args.threaded = true,
            "--seconds" => {
                let secs = iter
                    .next()
                    .ok_or("--seconds needs a value")?
                    .parse()
                    .map_err(|e| format!("--seconds: {e}"))?;
                args.run_for = Some(Duration::from_secs(secs));
            }
            value => {
                match positional {
                    0 => args.backend = value.parse()?,
                    1 => args.port = value.parse().map_err(|e| format!("port: {e}"))?,
                    2 => args.managers = value.parse().map_err(|e| format!("managers: {e}"))?,
                    _ => return Err(format!("unexpected argument '{value}'")),
                }
                positional += 1;
            }
        }
    }
    Ok(args)
}

fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    weft::dev_tracing::init_tracing_or("info");
    let args = parse_args()?;

    let config = ServerConfig::default()
        .with_backend(args.backend)
        .with_managers(args.managers)
        .with_threaded(args.threaded);
    let mut server = Server::bind(Endpoint::any(args.port), config)?;

    server.on_connection(|connection| {
        info!(target: "weft::user", "Connect: {}", connection.id());
        connection.observe(
            |connection, message| {
                info!(
                    target: "weft::user",
                    "From: {}, msg: {}",
                    connection.id(),
                    String::from_utf8_lossy(message.payload())
                );
                if let Err(e) = connection.send(message.payload()) {
                    info!(target: "weft::user", "Echo to {} failed: {}", connection.id(), e);
                }
            },
            |connection| info!(target: "weft::user", "Disconnected: {}", connection.id()),
        );
    });

    let started = Instant::now();
    let mut last_greeting = Instant::now();
    let mut rng = rand::thread_rng();

    loop {
        server.poll_once()?;
        if !server.config().threaded && server.connection_count() == 0 {
            // nothing to poll; avoid spinning on the listener
            std::thread::sleep(Duration::from_millis(1));
        }

        if last_greeting.elapsed() >= Duration::from_secs(3) {
            last_greeting = Instant::now();
            let count = server.connection_count();
            if count > 0 {
                let pick = rng.gen_range(0..count);
                if let Some(connection) = server.connections().nth(pick) {
                    let _ = connection.send("Hello from server");
                }
            }
        }

        if args.run_for.is_some_and(|limit| started.elapsed() >= limit) {
            break;
        }
    }

    server.disconnect_all()?;
    info!(target: "weft::user", "Stopped after {:?}", started.elapsed());
    Ok(())
}
