//! Load-test client for the `echo_server` example.
//!
//! Usage: `cargo run --example client -- [port] [clients] [rounds]`
//!
//! Opens `clients` connections (default 4); each sends `rounds` messages
//! (default 10) of random length and checks that every echo comes back intact.
//! Unsolicited "Hello from server" messages are logged and skipped.

use std::time::{Duration, Instant};

use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::info;
use weft::prelude::*;

const GREETING: &[u8] = b"Hello from server";

fn arg<T: std::str::FromStr>(index: usize, default: T) -> T {
    std::env::args()
        .nth(index)
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    weft::dev_tracing::init_tracing_or("info");
    let port: u16 = arg(1, 3000);
    let clients: usize = arg(2, 4);
    let rounds: usize = arg(3, 10);

    let mut connections = Vec::with_capacity(clients);
    for _ in 0..clients {
        let client = Client::connect(Endpoint::localhost(port))?;
        client.set_read_timeout(Some(Duration::from_secs(5)))?;
        info!(target: "weft::user", "connected from {}", client.local_addr()?);
        connections.push(client);
    }

    let mut rng = rand::thread_rng();
    let started = Instant::now();
    let mut bytes = 0usize;

    for round in 0..rounds {
        for client in &mut connections {
            let len = rng.gen_range(1..4096);
            let payload: String = (&mut rng)
                .sample_iter(&Alphanumeric)
                .take(len)
                .map(char::from)
                .collect();
            client.send(&payload)?;

            loop {
                let Some(reply) = client.recv()? else {
                    return Err("server closed the connection".into());
                };
                if reply == GREETING {
                    info!(target: "weft::user", "greeting during round {}", round);
                    continue;
                }
                if reply != payload.as_bytes() {
                    return Err(format!("echo mismatch in round {round}").into());
                }
                bytes += len;
                break;
            }
        }
    }

    let elapsed = started.elapsed();
    info!(
        target: "weft::user",
        "{} clients x {} rounds, {} payload bytes echoed in {:?}",
        clients,
        rounds,
        bytes,
        elapsed
    );
    for client in &connections {
        client.shutdown()?;
    }
    Ok(())
}
