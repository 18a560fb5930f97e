//! Socket harness shared by the connection-level integration tests

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use futures::StreamExt;
use parcel_net::config::{AcceptMode, ConnectionParameters, ServerConfig};
use parcel_net::connection::{event_channel, Connection, ConnectionEvent};
use parcel_net::service::{server_event_channel, Client, Server, ServerEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::UnboundedReceiverStream;

pub const WAIT: Duration = Duration::from_secs(10);

pub type Events = UnboundedReceiverStream<ConnectionEvent>;

/// Parameters for quick local tests: no keep-alive, short confirm timeout
pub fn params() -> ConnectionParameters {
    ConnectionParameters {
        confirm_timeout: Duration::from_secs(2),
        alive_period: Duration::ZERO,
        ..ConnectionParameters::default()
    }
}

pub fn server_config() -> ServerConfig {
    ServerConfig {
        address: "127.0.0.1:0".to_string(),
        accept_mode: AcceptMode::Listener,
        ..ServerConfig::default()
    }
}

/// Both ends of one connection together with their event streams
pub struct Pair {
    pub server: Server,
    pub server_events: UnboundedReceiverStream<ServerEvent>,
    pub client: Connection,
    pub client_events: Events,
    pub remote: Connection,
    pub remote_events: Events,
}

/// Bind a server that starts every connection, and connect one client to it
pub async fn pair(
    server_params: ConnectionParameters,
    client_params: ConnectionParameters,
    config: ServerConfig,
) -> Pair {
    let server = Server::bind("127.0.0.1:0", server_params, config).await.unwrap();
    let (server_listener, mut server_events) = server_event_channel();
    server.add_listener(server_listener);
    server.add_listener(Arc::new(|_: &Server, event: &ServerEvent| {
        if let ServerEvent::ConnectionAvailable(pending) = event {
            let pending = pending.clone();
            tokio::spawn(async move {
                let _ = pending.start().await;
            });
        }
    }));
    let (remote_listener, remote_events) = event_channel();
    server.add_connection_listener(remote_listener);

    let mut client = Client::new(client_params);
    let (client_listener, client_events) = event_channel();
    client.add_listener(client_listener);
    let connection = client.connect(server.local_addr()).await.unwrap();

    let remote = loop {
        match tokio::time::timeout(WAIT, server_events.next()).await.unwrap() {
            Some(ServerEvent::ConnectionAdded(c)) => break c,
            Some(_) => continue,
            None => panic!("server events ended"),
        }
    };

    let mut pair = Pair {
        server,
        server_events,
        client: connection,
        client_events,
        remote,
        remote_events,
    };
    expect_connected(&mut pair.client_events).await;
    expect_connected(&mut pair.remote_events).await;
    pair
}

pub async fn default_pair() -> Pair {
    pair(params(), params(), server_config()).await
}

pub async fn next_event(events: &mut Events) -> ConnectionEvent {
    tokio::time::timeout(WAIT, events.next())
        .await
        .expect("timed out waiting for an event")
        .expect("event stream ended")
}

async fn expect_connected(events: &mut Events) {
    let first = next_event(events).await;
    assert!(matches!(first, ConnectionEvent::Connected), "first event was {first:?}");
}

/// Skip events until one matches `pred`
pub async fn wait_for<F>(events: &mut Events, mut pred: F) -> ConnectionEvent
where
    F: FnMut(&ConnectionEvent) -> bool,
{
    loop {
        let event = next_event(events).await;
        if pred(&event) {
            return event;
        }
    }
}

/// Poll `check` until it holds or the wait runs out
pub async fn eventually<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

/// Fresh scratch directory under the system temp dir
pub fn scratch_dir(tag: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("parcel-net-{tag}-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}
