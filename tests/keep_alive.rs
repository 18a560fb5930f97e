//! Keep-alive, idle detection and abnormal termination against scripted peers

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use common::{pair, params, server_config, wait_for, Events, WAIT};
use futures::{SinkExt, StreamExt};
use parcel_net::config::{ConnectionParameters, TEMPO_UNLIMITED};
use parcel_net::connection::{event_channel, CloseCause, Connection, ConnectionEvent};
use parcel_net::core::codec::ParcelCodec;
use parcel_net::core::parcel::Priority;
use parcel_net::protocol::handshake::{read_connect_request, send_confirm, Confirmation};
use parcel_net::protocol::signal::Signal;
use parcel_net::service::Client;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

type RawPeer = Framed<TcpStream, ParcelCodec>;

/// Connect a client to a hand-driven peer that only completes the handshake
async fn scripted(client_params: ConnectionParameters) -> (Connection, Events, RawPeer) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let peer = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(stream, ParcelCodec::default());
        read_connect_request(&mut framed, WAIT).await.unwrap();
        send_confirm(
            &mut framed,
            Confirmation {
                tempo: TEMPO_UNLIMITED,
                primacy: false,
            },
        )
        .await
        .unwrap();
        framed
    });

    let mut client = Client::new(client_params);
    let (listener, events) = event_channel();
    client.add_listener(listener);
    let connection = client.connect(addr).await.unwrap();
    let peer = peer.await.unwrap();
    (connection, events, peer)
}

async fn disconnect_cause(events: &mut Events) -> CloseCause {
    match wait_for(events, |e| matches!(e, ConnectionEvent::Disconnected { .. })).await {
        ConnectionEvent::Disconnected { cause, .. } => cause,
        _ => unreachable!(),
    }
}

async fn next_signal(peer: &mut RawPeer) -> Option<Signal> {
    let parcel = tokio::time::timeout(WAIT, peer.next()).await.ok()??.ok()?;
    Signal::from_parcel(&parcel).ok()
}

#[tokio::test]
async fn test_alive_timeout_against_silent_peer() {
    let client_params = ConnectionParameters {
        alive_period: Duration::from_secs(1),
        confirm_timeout: Duration::from_secs(1),
        ..params()
    };
    let (connection, mut events, mut peer) = scripted(client_params).await;

    // The peer sees the probe but never answers
    assert_eq!(next_signal(&mut peer).await, Some(Signal::Alive));

    assert_eq!(disconnect_cause(&mut events).await, CloseCause::AliveTimeout);
    assert!(!connection.is_connected());
}

#[tokio::test]
async fn test_answered_alive_keeps_connection() {
    let both = ConnectionParameters {
        alive_period: Duration::from_secs(1),
        confirm_timeout: Duration::from_secs(1),
        ..params()
    };
    let p = pair(both.clone(), both, server_config()).await;

    tokio::time::sleep(Duration::from_millis(4_500)).await;
    assert!(p.client.is_connected());
    assert!(p.remote.is_connected());
    assert!(p.client.metrics().signals_received >= 3);
    p.server.close();
}

#[tokio::test]
async fn test_remote_eof() {
    let (_connection, mut events, peer) = scripted(params()).await;
    drop(peer);
    assert_eq!(disconnect_cause(&mut events).await, CloseCause::RemoteEof);
}

#[tokio::test]
async fn test_garbage_is_protocol_violation() {
    let (_connection, mut events, peer) = scripted(params()).await;
    let mut stream = peer.into_inner();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: example\r\n\r\n__padding__")
        .await
        .unwrap();
    assert_eq!(
        disconnect_cause(&mut events).await,
        CloseCause::ProtocolViolation
    );
}

#[tokio::test]
async fn test_handshake_signal_after_handshake_is_violation() {
    let (_connection, mut events, mut peer) = scripted(params()).await;
    peer.send(
        Signal::Confirm {
            tempo: 0,
            primacy: false,
        }
        .to_parcel()
        .unwrap(),
    )
    .await
    .unwrap();
    assert_eq!(
        disconnect_cause(&mut events).await,
        CloseCause::ProtocolViolation
    );
}

#[tokio::test]
async fn test_unanswered_close_times_out() {
    let client_params = ConnectionParameters {
        confirm_timeout: Duration::from_secs(1),
        ..params()
    };
    let (connection, mut events, mut peer) = scripted(client_params).await;
    connection.close();

    assert!(matches!(next_signal(&mut peer).await, Some(Signal::Close { .. })));
    let closed = wait_for(&mut events, |e| matches!(e, ConnectionEvent::Closed { .. })).await;
    assert!(matches!(closed, ConnectionEvent::Closed { cause: CloseCause::LocalClose, .. }));
    assert_eq!(disconnect_cause(&mut events).await, CloseCause::CloseTimeout);
}

#[tokio::test]
async fn test_remote_close_is_echoed() {
    let (connection, mut events, mut peer) = scripted(params()).await;
    peer.send(
        Signal::Close {
            cause: CloseCause::LocalClose.code(),
            message: Some("bye".into()),
        }
        .to_parcel()
        .unwrap(),
    )
    .await
    .unwrap();

    assert!(matches!(next_signal(&mut peer).await, Some(Signal::Close { .. })));
    match wait_for(&mut events, |e| matches!(e, ConnectionEvent::Disconnected { .. })).await {
        ConnectionEvent::Disconnected { cause, message } => {
            assert_eq!(cause, CloseCause::RemoteClose);
            assert_eq!(message.as_deref(), Some("bye"));
        }
        _ => unreachable!(),
    }
    tokio::time::timeout(WAIT, connection.disconnected()).await.unwrap();
}

#[tokio::test]
async fn test_idle_reported_on_transitions_only() {
    let client_params = ConnectionParameters {
        idle_threshold: 60_000,
        idle_check_period: Duration::from_secs(1),
        ..params()
    };
    let mut p = pair(params(), client_params, server_config()).await;

    let first = wait_for(&mut p.client_events, |e| matches!(e, ConnectionEvent::Idle(_))).await;
    assert!(matches!(first, ConnectionEvent::Idle(true)));
    assert!(p.client.is_idle());

    // Further quiet checks stay silent
    let quiet = tokio::time::timeout(Duration::from_millis(2_500), async {
        wait_for(&mut p.client_events, |e| matches!(e, ConnectionEvent::Idle(_))).await
    })
    .await;
    assert!(quiet.is_err(), "unexpected idle event {quiet:?}");

    p.client
        .send_data(&vec![7u8; 200_000], Priority::Normal)
        .unwrap();
    let busy = wait_for(&mut p.client_events, |e| matches!(e, ConnectionEvent::Idle(_))).await;
    assert!(matches!(busy, ConnectionEvent::Idle(false)));
    assert!(!p.client.is_idle());
    p.server.close();
}
