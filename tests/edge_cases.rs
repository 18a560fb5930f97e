#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Edge-case tests: boundary conditions, malformed input and error formatting

use bytes::Bytes;
use parcel_net::config::{MAX_PARCEL_SIZE, PROTOCOL_VERSION};
use parcel_net::connection::state::{CloseCause, ConnectionState};
use parcel_net::connection::transfer::resolve_destination;
use parcel_net::core::parcel::{flags, Parcel, ParcelKind, Priority, HEADER_SIZE};
use parcel_net::error::ProtocolError;
use parcel_net::protocol::handshake::{check_connect_request, check_response, connect_request};
use parcel_net::protocol::signal::Signal;
use parcel_net::utils::timeout::with_timeout_error;
use std::path::Path;
use std::time::Duration;

fn object(payload: Vec<u8>) -> Parcel {
    let len = payload.len() as u64;
    Parcel::object_fragment(1, Priority::Normal, 0, len, true, Bytes::from(payload))
}

// ============================================================================
// PARCEL EDGE CASES
// ============================================================================

#[test]
fn test_parcel_empty_payload() {
    let bytes = object(vec![]).to_bytes().unwrap();
    assert_eq!(bytes.len(), HEADER_SIZE);
    let decoded = Parcel::from_bytes(&bytes).expect("Should decode empty payload");
    assert!(decoded.payload.is_empty());
    assert!(decoded.is_final());
}

#[test]
fn test_parcel_payload_exactly_max() {
    let bytes = object(vec![0xAB; MAX_PARCEL_SIZE]).to_bytes().unwrap();
    let decoded = Parcel::from_bytes(&bytes).expect("max payload decodes");
    assert_eq!(decoded.payload.len(), MAX_PARCEL_SIZE);
}

#[test]
fn test_parcel_payload_one_more_than_max_fails() {
    let err = object(vec![0; MAX_PARCEL_SIZE + 1])
        .to_bytes()
        .expect_err("oversized payload");
    assert!(matches!(err, ProtocolError::OversizedParcel(n) if n == MAX_PARCEL_SIZE + 1));
}

#[test]
fn test_parcel_declared_length_over_max_rejected() {
    let mut bytes = object(vec![1, 2, 3]).to_bytes().unwrap();
    bytes[32..36].copy_from_slice(&((MAX_PARCEL_SIZE as u32) + 1).to_be_bytes());
    assert!(matches!(
        Parcel::from_bytes(&bytes),
        Err(ProtocolError::OversizedParcel(_))
    ));
}

#[test]
fn test_parcel_unsupported_version() {
    let mut bytes = object(vec![1]).to_bytes().unwrap();
    bytes[4] = PROTOCOL_VERSION + 1;
    assert!(matches!(
        Parcel::from_bytes(&bytes),
        Err(ProtocolError::UnsupportedVersion(v)) if v == PROTOCOL_VERSION + 1
    ));
}

#[test]
fn test_parcel_unknown_kind_and_priority() {
    let mut bytes = object(vec![1]).to_bytes().unwrap();
    bytes[5] = 9;
    assert!(matches!(Parcel::from_bytes(&bytes), Err(ProtocolError::InvalidHeader)));

    let mut bytes = object(vec![1]).to_bytes().unwrap();
    bytes[6] = 3;
    assert!(matches!(Parcel::from_bytes(&bytes), Err(ProtocolError::InvalidHeader)));
}

#[test]
fn test_parcel_truncated_and_trailing() {
    let bytes = object(vec![1, 2, 3]).to_bytes().unwrap();
    assert!(Parcel::from_bytes(&bytes[..HEADER_SIZE - 1]).is_err());
    assert!(Parcel::from_bytes(&bytes[..bytes.len() - 1]).is_err());
    assert!(Parcel::from_bytes(&[]).is_err());

    let mut trailing = bytes.clone();
    trailing.push(0);
    assert!(Parcel::from_bytes(&trailing).is_err());
}

#[test]
fn test_parcel_flags() {
    let header = Parcel {
        kind: ParcelKind::File,
        priority: Priority::Low,
        flags: flags::HEADER | flags::FINAL,
        object_id: 3,
        sequence: 0,
        extent: 0,
        checksum: 0,
        payload: Bytes::new(),
    };
    assert!(header.is_header());
    assert!(header.is_final());

    let payload = Bytes::from_static(b"abc");
    let fragment = Parcel::object_fragment(1, Priority::High, 2, 10, false, payload);
    assert!(!fragment.is_header());
    assert!(!fragment.is_final());
}

#[test]
fn test_priority_ordering() {
    assert!(Priority::High > Priority::Normal);
    assert!(Priority::Normal > Priority::Low);
    assert_eq!(Priority::default(), Priority::Normal);
}

// ============================================================================
// SIGNAL AND HANDSHAKE EDGE CASES
// ============================================================================

#[test]
fn test_signal_from_object_parcel_is_violation() {
    let err = Signal::from_parcel(&object(vec![0])).expect_err("not a signal");
    assert!(matches!(err, ProtocolError::ProtocolViolation(_)));
}

#[test]
fn test_signal_garbage_body() {
    assert!(Signal::from_bytes(&[0xFF, 0xFF, 0xFF, 0xFF]).is_err());
    assert!(Signal::from_bytes(&[]).is_err());
}

#[test]
fn test_connect_request_checks() {
    let request = connect_request().to_parcel().unwrap();
    assert!(check_connect_request(&request).is_ok());

    let wrong_version = Signal::ConnectRequest {
        version: PROTOCOL_VERSION + 4,
    }
    .to_parcel()
    .unwrap();
    assert!(matches!(
        check_connect_request(&wrong_version),
        Err(ProtocolError::UnsupportedVersion(_))
    ));

    assert!(matches!(
        check_connect_request(&Signal::Alive.to_parcel().unwrap()),
        Err(ProtocolError::HandshakeError(_))
    ));
    assert!(check_connect_request(&object(b"GET / HTTP/1.1".to_vec())).is_err());
}

#[test]
fn test_response_checks() {
    let confirm = Signal::Confirm {
        tempo: 4096,
        primacy: true,
    }
    .to_parcel()
    .unwrap();
    let terms = check_response(&confirm).unwrap();
    assert_eq!(terms.tempo, 4096);
    assert!(terms.primacy);

    let reject = Signal::Reject {
        reason: "busy".into(),
    }
    .to_parcel()
    .unwrap();
    assert!(matches!(
        check_response(&reject),
        Err(ProtocolError::ConnectionRejected(reason)) if reason == "busy"
    ));

    assert!(matches!(
        check_response(&Signal::AliveEcho.to_parcel().unwrap()),
        Err(ProtocolError::HandshakeError(_))
    ));
}

// ============================================================================
// FILE DESTINATION EDGE CASES
// ============================================================================

#[test]
fn test_destination_resolution() {
    let root = Path::new("/srv/files");
    assert_eq!(
        resolve_destination(root, "a/b/c.txt").unwrap(),
        Path::new("/srv/files/a/b/c.txt")
    );
    assert_eq!(
        resolve_destination(root, "./x.bin").unwrap(),
        Path::new("/srv/files/x.bin")
    );
    assert_eq!(
        resolve_destination(root, "dir\\win.txt").unwrap(),
        Path::new("/srv/files/dir/win.txt")
    );
}

#[test]
fn test_destination_escapes_refused() {
    let root = Path::new("/srv/files");
    for bad in ["", "/etc/passwd", "../secret", "a/../../b", ".", "\\abs"] {
        assert!(
            matches!(
                resolve_destination(root, bad),
                Err(ProtocolError::InsufficientStorage(_))
            ),
            "{bad:?} should be refused"
        );
    }
}

// ============================================================================
// STATE EDGE CASES
// ============================================================================

#[test]
fn test_close_cause_codes() {
    for cause in [
        CloseCause::LocalClose,
        CloseCause::RemoteClose,
        CloseCause::Shutdown,
        CloseCause::RemoteEof,
        CloseCause::SocketError,
        CloseCause::AliveTimeout,
        CloseCause::CloseTimeout,
        CloseCause::ProtocolViolation,
    ] {
        assert_eq!(CloseCause::from_code(cause.code()), cause);
    }
    assert_eq!(CloseCause::from_code(999), CloseCause::RemoteClose);
    assert!(CloseCause::AliveTimeout.is_abnormal());
    assert!(!CloseCause::LocalClose.is_abnormal());
}

#[test]
fn test_only_connected_accepts_sends() {
    assert!(ConnectionState::Connected.accepts_sends());
    for state in [
        ConnectionState::Unconnected,
        ConnectionState::Handshaking,
        ConnectionState::Closing,
        ConnectionState::Closed,
        ConnectionState::Disconnected,
    ] {
        assert!(!state.accepts_sends(), "{state} must refuse sends");
    }
}

// ============================================================================
// TIMEOUT EDGE CASES
// ============================================================================

#[tokio::test]
async fn test_timeout_immediate_complete() {
    let result = with_timeout_error(async { Ok("done") }, Duration::from_secs(10)).await;
    assert_eq!(result.unwrap(), "done");
}

#[tokio::test(start_paused = true)]
async fn test_timeout_exceeds_duration() {
    let result = with_timeout_error(
        async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        },
        Duration::from_millis(10),
    )
    .await;

    assert!(matches!(result, Err(ProtocolError::Timeout)));
}

// ============================================================================
// ERROR FORMATTING
// ============================================================================

#[test]
fn test_error_display_formatting() {
    let errors = vec![
        ProtocolError::InvalidHeader,
        ProtocolError::UnsupportedVersion(42),
        ProtocolError::OversizedParcel(999),
        ProtocolError::ConnectionTimeout,
        ProtocolError::ConnectionRejected("full".into()),
        ProtocolError::UnregisteredObject("thing".into()),
        ProtocolError::CapacityExceeded {
            queue: "object",
            capacity: 3,
        },
        ProtocolError::FileLength(u64::MAX),
        ProtocolError::FileInProgress("a.txt".into()),
        ProtocolError::ChecksumMismatch { file_id: 4 },
        ProtocolError::Unconnected,
        ProtocolError::Io(std::io::Error::other("test error")),
    ];

    for err in errors {
        let display_str = format!("{err}");
        assert!(!display_str.is_empty(), "Error should have display format");
    }

    let capacity = ProtocolError::CapacityExceeded {
        queue: "parcel",
        capacity: 10,
    };
    assert_eq!(capacity.to_string(), "parcel queue capacity of 10 exceeded");
}
