//! # Connection Engine
//!
//! A started connection runs four tasks over one TCP stream:
//! - **sender**: drains the send queue, paces data by tempo, writes parcels
//! - **receiver**: reads parcels, answers signals, reassembles objects and files
//! - **monitor**: keep-alive and idle detection
//! - **delivery**: hands events to listeners in order
//!
//! A supervisor joins the first three and emits the final `Disconnected`.
//! Mutable per-connection state lives in one mutex ([`Core`]); the handle
//! given to the application, [`Connection`], is a cheap clone of an `Arc`.

use crate::config::{ConnectionParameters, MAX_FILE_LENGTH};
use crate::connection::event::{
    ConnectionEvent, ConnectionListener, Direction, Envelope, TransmissionKind,
};
use crate::connection::identity::{ConnectionId, ShortId};
use crate::connection::queue::{AfterClose, SendQueue};
use crate::connection::state::{CloseCause, ConnectionState, Side};
use crate::connection::tempo::{self, TempoController};
use crate::connection::transfer::{target_slot, OutgoingTransfer, OutgoingTransfers};
use crate::connection::{monitor, receiver, sender};
use crate::core::codec::ParcelCodec;
use crate::core::parcel::Priority;
use crate::core::serialization::ObjectRegistry;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::signal::Signal;
use crate::utils::metrics::{MetricsSnapshot, TransferMetrics};
use crate::utils::timeout::TRANSMISSION_WINDOW;
use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::SystemTime;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::{Framed, FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Mutable state of one connection
pub(crate) struct Core {
    pub(crate) state: ConnectionState,
    pub(crate) queue: SendQueue,
    pub(crate) outgoing: OutgoingTransfers,
    next_id: u64,
    next_ping: u32,
    pub(crate) pings: HashMap<u32, (Instant, SystemTime)>,
    /// Send time of the oldest unanswered ALIVE
    pub(crate) alive_pending: Option<Instant>,
    pub(crate) idle: bool,
    close_initiated: bool,
    close_cause: CloseCause,
    closed_emitted: bool,
    termination: Option<(CloseCause, Option<String>)>,
}

/// Requests handled by the receiver task
#[derive(Debug)]
pub(crate) enum ReceiverControl {
    AbortIncoming(u64),
}

/// Everything needed to start the engine after a successful handshake
pub(crate) struct EngineSetup {
    pub(crate) id: ConnectionId,
    pub(crate) side: Side,
    pub(crate) params: ConnectionParameters,
    pub(crate) registry: ObjectRegistry,
    pub(crate) listeners: Vec<Arc<dyn ConnectionListener>>,
    pub(crate) tempo: i64,
    pub(crate) primacy: bool,
    /// The remote announced tempo primacy in its CONFIRM
    pub(crate) remote_primacy: bool,
}

/// State shared by the handle and the tasks of one connection
pub(crate) struct Shared {
    pub(crate) id: ConnectionId,
    pub(crate) short_id: ShortId,
    pub(crate) side: Side,
    pub(crate) local_addr: SocketAddr,
    pub(crate) remote_addr: SocketAddr,
    pub(crate) params: ConnectionParameters,
    pub(crate) registry: ObjectRegistry,
    pub(crate) core: Mutex<Core>,
    pub(crate) wake: Notify,
    pub(crate) tempo: TempoController,
    pub(crate) primacy: bool,
    pub(crate) remote_primacy: bool,
    pub(crate) metrics: TransferMetrics,
    pub(crate) object_permits: Arc<Semaphore>,
    pub(crate) cancel: CancellationToken,
    listeners: RwLock<Vec<Arc<dyn ConnectionListener>>>,
    events: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    control: mpsc::UnboundedSender<ReceiverControl>,
    finished: CancellationToken,
    name: RwLock<Option<String>>,
    properties: RwLock<HashMap<String, String>>,
}

impl Shared {
    pub(crate) fn lock_core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn emit(&self, event: ConnectionEvent) {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = events.as_ref() {
            let _ = tx.send(Envelope::new(event));
        }
    }

    pub(crate) fn emit_with_permit(&self, event: ConnectionEvent, permit: OwnedSemaphorePermit) {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = events.as_ref() {
            let _ = tx.send(Envelope::with_permit(event, permit));
        }
    }

    pub(crate) fn push_signal(&self, signal: Signal) {
        self.lock_core().queue.push_signal(signal);
        self.wake.notify_one();
    }

    /// Queue an ALIVE, remembering when the oldest unanswered one left
    pub(crate) fn send_alive(&self, now: Instant) {
        let mut core = self.lock_core();
        if core.alive_pending.is_none() {
            core.alive_pending = Some(now);
        }
        core.queue.push_signal(Signal::Alive);
        drop(core);
        self.wake.notify_one();
    }

    /// A TEMPO from the remote: adopt it, or answer with ours when we have primacy
    pub(crate) fn on_remote_tempo(&self, speed: i64) {
        if self.primacy {
            debug!(conn = %self.short_id, requested = speed, "Tempo request overridden by primacy");
            self.push_signal(Signal::Tempo {
                speed: self.tempo.speed(),
            });
        } else if self.tempo.set(speed) {
            debug!(conn = %self.short_id, speed, "Tempo adopted from remote");
        }
    }

    fn request_close(&self, cause: CloseCause) {
        let mut core = self.lock_core();
        if core.state != ConnectionState::Connected {
            return;
        }
        core.state = ConnectionState::Closing;
        core.close_initiated = true;
        core.close_cause = cause;
        core.queue.request_close(
            Signal::Close {
                cause: cause.code(),
                message: None,
            },
            AfterClose::AwaitEcho,
        );
        drop(core);
        debug!(conn = %self.short_id, %cause, "Close requested");
        self.wake.notify_one();
    }

    /// Our CLOSE is on the wire
    pub(crate) fn mark_closed(&self) {
        let mut core = self.lock_core();
        if core.state == ConnectionState::Closing {
            core.state = ConnectionState::Closed;
        }
        if !core.closed_emitted {
            core.closed_emitted = true;
            let cause = core.close_cause;
            self.emit(ConnectionEvent::Closed {
                cause,
                message: None,
            });
        }
    }

    /// The remote sent CLOSE
    pub(crate) fn on_remote_close(&self, message: Option<String>) {
        let mut core = self.lock_core();
        if core.close_initiated {
            let cause = core.close_cause;
            drop(core);
            self.terminate(cause, None);
            return;
        }
        if core.termination.is_some() {
            return;
        }
        core.state = ConnectionState::Closing;
        core.queue.close_now(
            Signal::Close {
                cause: CloseCause::RemoteClose.code(),
                message: None,
            },
            AfterClose::Terminate {
                cause: CloseCause::RemoteClose,
                message,
            },
        );
        drop(core);
        self.wake.notify_one();
    }

    /// End an outgoing transfer with the given outcome
    ///
    /// Returns false when the transfer is unknown or already ended.
    pub(crate) fn end_outgoing(
        &self,
        file_id: u64,
        kind: TransmissionKind,
        cause: Option<ProtocolError>,
        notify_remote: Option<String>,
    ) -> bool {
        let mut core = self.lock_core();
        let Some(transfer) = core.outgoing.remove(file_id) else {
            return false;
        };
        core.queue.remove_file(file_id);
        if let Some(reason) = notify_remote {
            core.queue.push_signal(Signal::FileAbort {
                file_id,
                sender_side: true,
                reason,
            });
        }
        debug!(conn = %self.short_id, file_id, ?kind, "Outgoing transfer ended");
        self.emit(ConnectionEvent::Transmission(transfer.event(kind, cause)));
        drop(core);
        self.wake.notify_one();
        true
    }

    /// Stop the connection; idempotent
    pub(crate) fn terminate(&self, cause: CloseCause, message: Option<String>) {
        {
            let mut core = self.lock_core();
            if core.termination.is_some() {
                return;
            }
            core.termination = Some((cause, message.clone()));
            if core.state != ConnectionState::Disconnected {
                core.state = ConnectionState::Closed;
            }
            if !core.closed_emitted {
                core.closed_emitted = true;
                self.emit(ConnectionEvent::Closed {
                    cause,
                    message: message.clone(),
                });
            }
            core.queue.clear_data();
            for transfer in core.outgoing.drain() {
                self.emit(ConnectionEvent::Transmission(transfer.event(
                    TransmissionKind::FileAborted,
                    Some(ProtocolError::TransferAborted(
                        constants::ERR_TRANSFER_INTERRUPTED.into(),
                    )),
                )));
            }
            core.pings.clear();
        }

        if cause.is_abnormal() {
            warn!(conn = %self.short_id, %cause, message = ?message, "Connection terminated");
        } else {
            debug!(conn = %self.short_id, %cause, "Connection terminating");
        }
        self.cancel.cancel();
    }

    fn finish(&self) {
        let (cause, message) = {
            let mut core = self.lock_core();
            core.state = ConnectionState::Disconnected;
            core.termination.clone().unwrap_or((CloseCause::LocalClose, None))
        };
        self.emit(ConnectionEvent::Disconnected { cause, message });
        self.metrics.log_metrics(&self.short_id.to_string());
        info!(conn = %self.short_id, remote = %self.remote_addr, %cause, "Disconnected");
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.finished.cancel();
    }
}

/// Handle to a running connection
///
/// Clones refer to the same connection. Two handles are equal when their
/// local and remote socket addresses match.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<Shared>,
}

impl Connection {
    /// Start the engine over a handshaken stream
    pub(crate) fn launch(
        framed: Framed<TcpStream, ParcelCodec>,
        setup: EngineSetup,
    ) -> Result<Self> {
        let local_addr = framed.get_ref().local_addr()?;
        let remote_addr = framed.get_ref().peer_addr()?;
        let parts = framed.into_parts();
        let (read_half, write_half) = parts.io.into_split();
        let mut reader = FramedRead::new(read_half, parts.codec);
        *reader.read_buffer_mut() = parts.read_buf;
        let writer = FramedWrite::new(write_half, parts.codec);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let id = setup.id;
        let params = setup.params;

        let shared = Arc::new(Shared {
            id,
            short_id: id.short_id(),
            side: setup.side,
            local_addr,
            remote_addr,
            registry: setup.registry,
            core: Mutex::new(Core {
                state: ConnectionState::Connected,
                queue: SendQueue::new(&params),
                outgoing: OutgoingTransfers::default(),
                next_id: 1,
                next_ping: 1,
                pings: HashMap::new(),
                alive_pending: None,
                idle: false,
                close_initiated: false,
                close_cause: CloseCause::LocalClose,
                closed_emitted: false,
                termination: None,
            }),
            wake: Notify::new(),
            tempo: TempoController::new(setup.tempo),
            primacy: setup.primacy,
            remote_primacy: setup.remote_primacy,
            metrics: TransferMetrics::new(),
            object_permits: Arc::new(Semaphore::new(params.object_queue_capacity)),
            cancel: CancellationToken::new(),
            listeners: RwLock::new(setup.listeners),
            events: Mutex::new(Some(events_tx)),
            control: control_tx,
            finished: CancellationToken::new(),
            name: RwLock::new(None),
            properties: RwLock::new(HashMap::new()),
            params,
        });

        let connection = Connection {
            inner: Arc::clone(&shared),
        };
        info!(
            conn = %shared.short_id,
            side = ?shared.side,
            local = %local_addr,
            remote = %remote_addr,
            tempo = shared.tempo.speed(),
            "Connection established"
        );
        shared.emit(ConnectionEvent::Connected);

        tokio::spawn(deliver(connection.clone(), events_rx));
        let tasks = vec![
            tokio::spawn(sender::run_sender(Arc::clone(&shared), writer)),
            tokio::spawn(receiver::run_receiver(Arc::clone(&shared), reader, control_rx)),
            tokio::spawn(monitor::run_monitor(Arc::clone(&shared))),
        ];
        tokio::spawn(supervise(shared, tasks));

        Ok(connection)
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.state().accepts_sends() {
            Ok(())
        } else {
            Err(ProtocolError::Unconnected)
        }
    }

    /// Queue a registered object; returns its object ID
    ///
    /// Fails immediately when the type is unregistered, the serialized form
    /// exceeds the max serialization size, or a queue is full.
    pub fn send_object<T>(&self, object: &T, priority: Priority) -> Result<u64>
    where
        T: Serialize + 'static,
    {
        self.ensure_connected()?;
        let shared = &self.inner;
        let payload = shared
            .registry
            .serialize(object, shared.params.serialization_format)?;
        if payload.len() > shared.params.max_serialisation_size {
            return Err(ProtocolError::ObjectTooLarge {
                size: payload.len(),
                limit: shared.params.max_serialisation_size,
            });
        }

        let id = {
            let mut core = shared.lock_core();
            if !core.state.accepts_sends() {
                return Err(ProtocolError::Unconnected);
            }
            let id = core.next_id;
            core.queue.push_object(id, priority, Bytes::from(payload))?;
            core.next_id += 1;
            id
        };
        shared.wake.notify_one();
        debug!(conn = %shared.short_id, object_id = id, ?priority, "Object queued");
        Ok(id)
    }

    /// Queue a block of bytes; the remote receives a `Vec<u8>`
    pub fn send_data(&self, data: &[u8], priority: Priority) -> Result<u64> {
        self.send_object(&data.to_vec(), priority)
    }

    /// Queue a file for transfer; returns its file ID
    ///
    /// `remote_path` is relative to the receiver's file root. Without it the
    /// receiver keeps the file in its temp directory.
    #[instrument(skip(self, path), fields(conn = %self.inner.short_id, path = %path.as_ref().display()))]
    pub async fn send_file(
        &self,
        path: impl AsRef<Path>,
        remote_path: Option<&str>,
        priority: Priority,
    ) -> Result<u64> {
        self.ensure_connected()?;
        let path = path.as_ref().to_path_buf();

        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Err(ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                constants::ERR_NOT_A_FILE,
            )));
        }
        let length = metadata.len();
        if length > MAX_FILE_LENGTH {
            return Err(ProtocolError::FileLength(length));
        }
        // Fail early when the file is not readable
        drop(tokio::fs::File::open(&path).await?);

        let shared = &self.inner;
        let id = {
            let mut core = shared.lock_core();
            if !core.state.accepts_sends() {
                return Err(ProtocolError::Unconnected);
            }
            let slot = target_slot(&path, remote_path);
            if core.outgoing.slot_busy(&slot) {
                let target = remote_path
                    .map(str::to_owned)
                    .unwrap_or_else(|| path.display().to_string());
                return Err(ProtocolError::FileInProgress(target));
            }
            let id = core.next_id;
            core.queue
                .push_file(id, priority, remote_path.map(str::to_owned), length)?;
            core.next_id += 1;
            core.outgoing.insert(OutgoingTransfer::new(
                id,
                path,
                remote_path.map(str::to_owned),
                length,
            ));
            id
        };
        shared.wake.notify_one();
        debug!(file_id = id, length, "File queued");
        Ok(id)
    }

    /// Cancel a file transfer
    ///
    /// Unknown or already ended transfers are ignored. The outcome is
    /// reported as a `FileAborted` event.
    pub fn break_transfer(&self, file_id: u64, direction: Direction) {
        match direction {
            Direction::Outgoing => {
                self.inner.end_outgoing(
                    file_id,
                    TransmissionKind::FileAborted,
                    Some(ProtocolError::TransferAborted(
                        constants::ERR_LOCAL_BREAK.into(),
                    )),
                    Some(constants::ERR_LOCAL_BREAK.into()),
                );
            }
            Direction::Incoming => {
                let _ = self
                    .inner
                    .control
                    .send(ReceiverControl::AbortIncoming(file_id));
            }
        }
    }

    /// Send a PING; the answer arrives as a `PingEcho` event
    pub fn send_ping(&self) -> Result<u32> {
        self.ensure_connected()?;
        let shared = &self.inner;
        let ping_id = {
            let mut core = shared.lock_core();
            let ping_id = core.next_ping;
            core.next_ping = core.next_ping.wrapping_add(1).max(1);
            core.pings
                .insert(ping_id, (Instant::now(), SystemTime::now()));
            core.queue.push_signal(Signal::Ping { ping_id });
            ping_id
        };
        shared.wake.notify_one();
        Ok(ping_id)
    }

    /// Change the transmission speed and announce it to the remote
    ///
    /// Bytes per second; -1 is unlimited and 0 pauses data. Under a remote
    /// with tempo primacy the speed is only requested: the local speed stays
    /// until the remote answers, and its answer is adopted.
    pub fn set_tempo(&self, speed: i64) {
        let shared = &self.inner;
        let speed = tempo::normalize(speed);
        if !shared.remote_primacy {
            shared.tempo.set(speed);
        }
        if matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Closing
        ) {
            shared.push_signal(Signal::Tempo { speed });
        }
    }

    /// Current transmission speed
    pub fn tempo(&self) -> i64 {
        self.inner.tempo.speed()
    }

    /// Close after every queued item has been sent
    ///
    /// Completion is observed through the `Closed` and `Disconnected` events.
    pub fn close(&self) {
        self.inner.request_close(CloseCause::LocalClose);
    }

    pub(crate) fn shutdown(&self) {
        self.inner.request_close(CloseCause::Shutdown);
    }

    /// Wait until the connection is disconnected
    pub async fn disconnected(&self) {
        self.inner.finished.cancelled().await;
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock_core().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn short_id(&self) -> ShortId {
        self.inner.short_id
    }

    pub fn side(&self) -> Side {
        self.inner.side
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    /// The clamped parameters this connection runs with
    pub fn parameters(&self) -> &ConnectionParameters {
        &self.inner.params
    }

    pub fn registry(&self) -> &ObjectRegistry {
        &self.inner.registry
    }

    pub fn name(&self) -> Option<String> {
        self.inner
            .name
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self
            .inner
            .name
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(name.into());
    }

    pub fn property(&self, key: &str) -> Option<String> {
        self.inner
            .properties
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Store a property, returning the previous value
    pub fn set_property(&self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.inner
            .properties
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value.into())
    }

    pub fn remove_property(&self, key: &str) -> Option<String> {
        self.inner
            .properties
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Whether parcels moved in either direction within the last second
    pub fn is_transmitting(&self) -> bool {
        self.state() != ConnectionState::Disconnected
            && self.inner.metrics.since_last_activity() < TRANSMISSION_WINDOW
    }

    /// Whether the latest idle check found traffic below the idle threshold
    pub fn is_idle(&self) -> bool {
        self.inner.lock_core().idle
    }

    /// Objects and files waiting to be sent
    pub fn pending_items(&self) -> usize {
        self.inner.lock_core().queue.pending_items()
    }

    /// Outgoing file transfers not yet confirmed, failed or aborted
    pub fn active_outgoing_transfers(&self) -> usize {
        self.inner.lock_core().outgoing.len()
    }

    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Remove a listener previously added with the same `Arc`
    pub fn remove_listener(&self, listener: &Arc<dyn ConnectionListener>) -> bool {
        let mut listeners = self
            .inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.inner.local_addr == other.inner.local_addr
            && self.inner.remote_addr == other.inner.remote_addr
    }
}

impl Eq for Connection {}

impl Hash for Connection {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.local_addr.hash(state);
        self.inner.remote_addr.hash(state);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.short_id.to_string())
            .field("side", &self.inner.side)
            .field("local", &self.inner.local_addr)
            .field("remote", &self.inner.remote_addr)
            .field("state", &self.state())
            .finish()
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} -> {}",
            self.inner.short_id, self.inner.local_addr, self.inner.remote_addr
        )
    }
}

async fn deliver(connection: Connection, mut events: mpsc::UnboundedReceiver<Envelope>) {
    while let Some(envelope) = events.recv().await {
        let listeners: Vec<Arc<dyn ConnectionListener>> = connection
            .inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in &listeners {
            listener.on_event(&connection, &envelope.event);
        }
    }
}

async fn supervise(shared: Arc<Shared>, tasks: Vec<JoinHandle<()>>) {
    let mut running: FuturesUnordered<JoinHandle<()>> = tasks.into_iter().collect();
    while let Some(result) = running.next().await {
        if let Err(e) = result {
            error!(conn = %shared.short_id, error = %e, "Connection task failed");
            shared.terminate(CloseCause::SocketError, Some(e.to_string()));
        }
    }
    shared.finish();
}
