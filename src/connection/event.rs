//! # Connection Events
//!
//! Everything a connection reports to the application travels as one
//! [`ConnectionEvent`] over a single ordered channel per connection. A
//! dedicated delivery task hands each event to the registered
//! [`ConnectionListener`]s in order, so listeners never run on the sender or
//! receiver tasks.
//!
//! ## Ordering
//! `Connected` is always first and `Disconnected` always last. `Closed` is
//! reported exactly once, before `Disconnected`. Objects can still arrive
//! between `Closed` and `Disconnected`.

use crate::connection::engine::Connection;
use crate::connection::state::CloseCause;
use crate::connection::transfer::TransferState;
use crate::core::serialization::ReceivedObject;
use crate::error::ProtocolError;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Event reported by a connection
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The handshake completed and the engine is running
    Connected,
    /// Traffic crossed the idle threshold (`true`) or came back above it (`false`)
    Idle(bool),
    /// The connection stopped sending
    Closed {
        cause: CloseCause,
        message: Option<String>,
    },
    /// The socket was released; no further events follow
    Disconnected {
        cause: CloseCause,
        message: Option<String>,
    },
    /// A complete object arrived
    ObjectReceived { id: u64, object: ReceivedObject },
    /// A PING was answered
    PingEcho(PingEcho),
    /// A file transfer changed state
    Transmission(TransmissionEvent),
}

/// Result of a PING round trip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingEcho {
    pub ping_id: u32,
    /// Wall-clock time the PING was queued
    pub sent_at: SystemTime,
    pub round_trip: Duration,
}

/// Kind of file transfer event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransmissionKind {
    /// A remote file was announced (incoming only)
    FileIncoming,
    /// The transfer was cancelled or corrupted
    FileAborted,
    /// All bytes arrived (incoming only)
    FileReceived,
    /// The remote stored the file (outgoing only)
    FileConfirmed,
    /// Storing the file failed
    FileFailed,
}

/// Direction of a file transfer seen from this side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// State change of one file transfer
#[derive(Debug, Clone)]
pub struct TransmissionEvent {
    pub kind: TransmissionKind,
    pub direction: Direction,
    pub file_id: u64,
    /// Time since the transfer started
    pub duration: Duration,
    /// Bytes moved so far
    pub transmitted: u64,
    /// Declared file length
    pub expected: u64,
    /// Path relative to the receiver's file root, if the sender gave one
    pub remote_path: Option<String>,
    /// Local file: the source on the sending side, the temp or final file on the receiving side
    pub file: Option<PathBuf>,
    /// Whether `file` is the final destination under the file root
    pub has_destination: bool,
    pub cause: Option<Arc<ProtocolError>>,
}

impl TransmissionEvent {
    /// Transfer state this event moves into
    pub fn state(&self) -> TransferState {
        match self.kind {
            TransmissionKind::FileIncoming => TransferState::Incoming,
            TransmissionKind::FileAborted => TransferState::Aborted,
            TransmissionKind::FileReceived => TransferState::Received,
            TransmissionKind::FileConfirmed => TransferState::Confirmed,
            TransmissionKind::FileFailed => TransferState::Failed,
        }
    }

    /// Whether the transfer reached a state that ends it
    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }
}

/// Receives the events of one or more connections
pub trait ConnectionListener: Send + Sync + 'static {
    fn on_event(&self, connection: &Connection, event: &ConnectionEvent);
}

impl<F> ConnectionListener for F
where
    F: Fn(&Connection, &ConnectionEvent) + Send + Sync + 'static,
{
    fn on_event(&self, connection: &Connection, event: &ConnectionEvent) {
        self(connection, event)
    }
}

/// Listener forwarding every event into a stream
#[derive(Debug, Clone)]
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<ConnectionEvent>,
}

impl ConnectionListener for ChannelListener {
    fn on_event(&self, _connection: &Connection, event: &ConnectionEvent) {
        // The stream may have been dropped by the application
        let _ = self.tx.send(event.clone());
    }
}

/// Create a listener together with the stream of events it observes
pub fn event_channel() -> (Arc<ChannelListener>, UnboundedReceiverStream<ConnectionEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Arc::new(ChannelListener { tx }),
        UnboundedReceiverStream::new(rx),
    )
}

/// Event on its way to the delivery task
///
/// Object events carry a permit of the connection's object semaphore; it is
/// released once every listener has seen the object.
pub(crate) struct Envelope {
    pub(crate) event: ConnectionEvent,
    pub(crate) _permit: Option<OwnedSemaphorePermit>,
}

impl Envelope {
    pub(crate) fn new(event: ConnectionEvent) -> Self {
        Self {
            event,
            _permit: None,
        }
    }

    pub(crate) fn with_permit(event: ConnectionEvent, permit: OwnedSemaphorePermit) -> Self {
        Self {
            event,
            _permit: Some(permit),
        }
    }
}
