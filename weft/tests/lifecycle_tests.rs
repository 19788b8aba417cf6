//! Connection lifecycle: disconnects, server-side close and load balancing.

mod common;

use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use weft::prelude::*;

fn count_disconnects(server: &mut Server) -> Arc<AtomicUsize> {
    let disconnects = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&disconnects);
    server.on_connection(move |connection| {
        let counter = Arc::clone(&counter);
        connection.observe(
            |_, _| {},
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );
    });
    disconnects
}

#[test]
fn test_peer_close_fires_disconnect_once() {
    for backend in common::backends() {
        let mut server = common::bind(ServerConfig::default().with_backend(backend));
        let disconnects = count_disconnects(&mut server);

        let client = TcpStream::connect(server.local_addr()).unwrap();
        common::serve_until(&mut server, |server| server.connection_count() == 1);

        drop(client);
        common::serve_until(&mut server, |server| !server.has_connections());
        for _ in 0..10 {
            server.poll_once().unwrap();
        }
        assert_eq!(disconnects.load(Ordering::SeqCst), 1, "backend {backend}");
        assert_eq!(server.manager_loads(), vec![0], "backend {backend}");
    }
}

#[test]
fn test_server_initiated_close() {
    for backend in common::backends() {
        let mut server = common::bind(ServerConfig::default().with_backend(backend));
        let disconnects = count_disconnects(&mut server);
        let mut client = common::connect(&server);
        common::serve_until(&mut server, |server| server.connection_count() == 1);

        let id = server.connections().next().unwrap().id();
        server.connection(id).unwrap().close();

        let closed = common::with_client(&mut server, move || client.recv().unwrap());
        assert_eq!(closed, None, "backend {backend}");
        common::serve_until(&mut server, |server| !server.has_connections());
        assert_eq!(disconnects.load(Ordering::SeqCst), 1, "backend {backend}");
    }
}

#[test]
fn test_disconnect_all() {
    for backend in common::backends() {
        let config = ServerConfig::default().with_backend(backend).with_managers(2);
        let mut server = common::bind(config);
        let disconnects = count_disconnects(&mut server);

        let clients: Vec<Client> = (0..4).map(|_| common::connect(&server)).collect();
        common::serve_until(&mut server, |server| server.connection_count() == 4);

        server.disconnect_all().unwrap();
        assert!(!server.has_connections(), "backend {backend}");
        assert_eq!(disconnects.load(Ordering::SeqCst), 4, "backend {backend}");
        assert_eq!(server.manager_loads(), vec![0, 0], "backend {backend}");

        for mut client in clients {
            assert_eq!(client.recv().unwrap(), None, "backend {backend}");
        }
    }
}

#[test]
fn test_send_after_disconnect_fails() {
    let mut server = common::bind(ServerConfig::default());
    let client = TcpStream::connect(server.local_addr()).unwrap();
    common::serve_until(&mut server, |server| server.connection_count() == 1);
    let connection = Arc::clone(server.connections().next().unwrap());

    drop(client);
    common::serve_until(&mut server, |server| !server.has_connections());
    assert_eq!(connection.status(), ConnectionStatus::Closed);
    assert!(matches!(
        connection.send("late"),
        Err(WeftError::ConnectionClosed(_))
    ));
}

fn open(server: &mut Server, clients: &mut Vec<(ConnectionId, TcpStream)>) {
    let before = server.connection_count();
    let stream = TcpStream::connect(server.local_addr()).unwrap();
    common::serve_until(server, |server| server.connection_count() == before + 1);
    let id = server.connections().last().unwrap().id();
    clients.push((id, stream));
}

#[test]
fn test_least_loaded_assignment() {
    let config = ServerConfig::default()
        .with_backend(BackendKind::Poll)
        .with_managers(3);
    let mut server = common::bind(config);
    let mut clients: Vec<(ConnectionId, TcpStream)> = Vec::new();

    for _ in 0..6 {
        open(&mut server, &mut clients);
    }
    assert_eq!(server.manager_loads(), vec![2, 2, 2]);

    // free two slots on manager 1
    let on_manager_one: Vec<usize> = clients
        .iter()
        .enumerate()
        .filter(|(_, (id, _))| server.manager_of(*id) == Some(1))
        .map(|(index, _)| index)
        .collect();
    for index in on_manager_one.into_iter().rev() {
        clients.remove(index);
    }
    common::serve_until(&mut server, |server| server.connection_count() == 4);
    assert_eq!(server.manager_loads(), vec![2, 0, 2]);

    // new connections fill the emptied manager first
    for _ in 0..2 {
        open(&mut server, &mut clients);
        let (id, _) = clients.last().unwrap();
        assert_eq!(server.manager_of(*id), Some(1));
    }

    // then spread evenly again
    for _ in 0..3 {
        open(&mut server, &mut clients);
    }
    assert_eq!(server.manager_loads(), vec![3, 3, 3]);
}
