//! Parcel server
//!
//! One accept task takes TCP sockets and reads their CONNECT-REQUEST. A
//! valid request becomes a [`ServerConnection`]: the socket is held until the
//! application starts or rejects it, or until the confirm timeout rejects it
//! automatically. Started connections join the server's registry and leave it
//! when they disconnect.
//!
//! Pending connections are delivered in one of two ways, set by
//! [`AcceptMode`]: pushed to server listeners as
//! [`ServerEvent::ConnectionAvailable`], or queued for [`Server::accept`].

use crate::config::{
    AcceptMode, ConnectionParameters, NetworkConfig, ServerConfig, TEMPO_UNLIMITED,
};
use crate::connection::engine::{Connection, EngineSetup};
use crate::connection::event::{ConnectionEvent, ConnectionListener};
use crate::connection::identity::ConnectionId;
use crate::connection::state::{ConnectionState, Side};
use crate::core::codec::ParcelCodec;
use crate::core::parcel::Priority;
use crate::core::serialization::ObjectRegistry;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::handshake::{read_connect_request, send_confirm, send_reject, Confirmation};
use crate::utils::timeout::with_timeout_error;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Event reported by a server
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A client completed its connection request and awaits a decision
    ConnectionAvailable(ServerConnection),
    /// A connection was started and registered
    ConnectionAdded(Connection),
    /// A registered connection disconnected
    ConnectionRemoved(Connection),
    /// The server stopped accepting
    Closed,
}

/// Receives server events
pub trait ServerListener: Send + Sync + 'static {
    fn on_event(&self, server: &Server, event: &ServerEvent);
}

impl<F> ServerListener for F
where
    F: Fn(&Server, &ServerEvent) + Send + Sync + 'static,
{
    fn on_event(&self, server: &Server, event: &ServerEvent) {
        self(server, event)
    }
}

/// Server listener forwarding every event into a stream
#[derive(Debug, Clone)]
pub struct ServerChannelListener {
    tx: mpsc::UnboundedSender<ServerEvent>,
}

impl ServerListener for ServerChannelListener {
    fn on_event(&self, _server: &Server, event: &ServerEvent) {
        let _ = self.tx.send(event.clone());
    }
}

/// Create a server listener together with the stream of events it observes
pub fn server_event_channel() -> (
    Arc<ServerChannelListener>,
    UnboundedReceiverStream<ServerEvent>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Arc::new(ServerChannelListener { tx }),
        UnboundedReceiverStream::new(rx),
    )
}

struct ServerShared {
    local_addr: SocketAddr,
    params: ConnectionParameters,
    config: ServerConfig,
    registry: ObjectRegistry,
    tempo: AtomicI64,
    connections: RwLock<HashMap<ConnectionId, Connection>>,
    /// Handshaken sockets waiting for a start or reject decision
    undecided: AtomicUsize,
    listeners: RwLock<Vec<Arc<dyn ServerListener>>>,
    connection_listeners: RwLock<Vec<Arc<dyn ConnectionListener>>>,
    events: Mutex<Option<mpsc::UnboundedSender<ServerEvent>>>,
    accept_tx: mpsc::Sender<ServerConnection>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<ServerConnection>>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl ServerShared {
    fn emit(&self, event: ServerEvent) {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = events.as_ref() {
            let _ = tx.send(event);
        }
    }

    fn occupied(&self) -> usize {
        let registered = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        registered + self.undecided.load(Ordering::SeqCst)
    }

    fn snapshot(&self) -> Vec<Connection> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

/// TCP server handing out parcel connections
///
/// The accept and event tasks run until [`Server::close`] is called.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerShared>,
}

impl Server {
    /// Listen on `addr`
    ///
    /// `params` are clamped once and applied to every connection.
    #[instrument(skip(addr, params, config))]
    pub async fn bind(
        addr: impl ToSocketAddrs,
        params: ConnectionParameters,
        config: ServerConfig,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let params = params.clamped();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_queue_capacity.max(1));
        let tempo = if params.transmission_speed < 0 {
            TEMPO_UNLIMITED
        } else {
            params.transmission_speed
        };

        let server = Server {
            inner: Arc::new(ServerShared {
                local_addr,
                params,
                config,
                registry: ObjectRegistry::new(),
                tempo: AtomicI64::new(tempo),
                connections: RwLock::new(HashMap::new()),
                undecided: AtomicUsize::new(0),
                listeners: RwLock::new(Vec::new()),
                connection_listeners: RwLock::new(Vec::new()),
                events: Mutex::new(Some(events_tx)),
                accept_tx,
                accept_rx: tokio::sync::Mutex::new(accept_rx),
                cancel: CancellationToken::new(),
                closed: AtomicBool::new(false),
            }),
        };

        info!(
            address = %local_addr,
            mode = ?server.inner.config.accept_mode,
            max_connections = server.inner.config.max_connections,
            "Listening"
        );
        tokio::spawn(dispatch(server.clone(), events_rx));
        tokio::spawn(accept_loop(Arc::clone(&server.inner), listener));
        Ok(server)
    }

    /// Listen on the address and settings of a loaded configuration
    pub async fn from_config(config: &NetworkConfig) -> Result<Self> {
        Self::bind(
            config.server.address.as_str(),
            config.connection.clone(),
            config.server.clone(),
        )
        .await
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// The clamped parameters applied to every connection
    pub fn parameters(&self) -> &ConnectionParameters {
        &self.inner.params
    }

    /// Type registry shared by every connection of this server
    pub fn registry(&self) -> &ObjectRegistry {
        &self.inner.registry
    }

    pub fn add_listener(&self, listener: Arc<dyn ServerListener>) {
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Attach a listener to every connection started from now on
    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.inner
            .connection_listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Wait up to `timeout` for a pending connection
    ///
    /// Only available in [`AcceptMode::Accept`]. Returns `None` on timeout.
    pub async fn accept(&self, timeout: Duration) -> Result<Option<ServerConnection>> {
        if self.inner.config.accept_mode != AcceptMode::Accept {
            return Err(ProtocolError::ConfigError(
                "accept() requires accept_mode = \"accept\"".to_string(),
            ));
        }
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ProtocolError::Custom(constants::ERR_SERVER_CLOSED.into()));
        }

        let deadline = tokio::time::Instant::now() + timeout;
        let mut queue = self.inner.accept_rx.lock().await;
        loop {
            match tokio::time::timeout_at(deadline, queue.recv()).await {
                Err(_) => return Ok(None),
                Ok(None) => return Err(ProtocolError::Custom(constants::ERR_SERVER_CLOSED.into())),
                // Skip sockets already rejected by the confirm timeout
                Ok(Some(pending)) if pending.is_pending() => return Ok(Some(pending)),
                Ok(Some(_)) => continue,
            }
        }
    }

    /// Snapshot of the registered connections
    pub fn connections(&self) -> Vec<Connection> {
        self.inner.snapshot()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Connection> {
        self.inner
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.inner
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Queue an object on every connection
    ///
    /// Returns the connections that refused it together with their error.
    pub fn send_object_to_all<T>(
        &self,
        object: &T,
        priority: Priority,
    ) -> Vec<(ConnectionId, ProtocolError)>
    where
        T: Serialize + 'static,
    {
        self.inner
            .snapshot()
            .into_iter()
            .filter_map(|c| c.send_object(object, priority).err().map(|e| (c.id(), e)))
            .collect()
    }

    /// Send a PING on every connection
    pub fn send_ping_to_all(&self) -> Vec<(ConnectionId, ProtocolError)> {
        self.inner
            .snapshot()
            .into_iter()
            .filter_map(|c| c.send_ping().err().map(|e| (c.id(), e)))
            .collect()
    }

    /// Set the server tempo and apply it to every connection
    pub fn set_tempo_all(&self, speed: i64) {
        let speed = if speed < 0 { TEMPO_UNLIMITED } else { speed };
        self.inner.tempo.store(speed, Ordering::SeqCst);
        for connection in self.inner.snapshot() {
            connection.set_tempo(speed);
        }
        debug!(speed, "Server tempo set");
    }

    /// Tempo announced to new connections
    pub fn tempo(&self) -> i64 {
        self.inner.tempo.load(Ordering::SeqCst)
    }

    /// Close every registered connection; the server keeps accepting
    pub fn close_all_connections(&self) {
        let connections = self.inner.snapshot();
        info!(count = connections.len(), "Closing all connections");
        for connection in connections {
            connection.shutdown();
        }
    }

    /// Stop accepting and close every connection
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(address = %self.inner.local_addr, "Shutting down server");
        self.inner.cancel.cancel();
        self.close_all_connections();
        self.inner.emit(ServerEvent::Closed);
        self.inner
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.inner.local_addr)
            .field("connections", &self.connection_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn dispatch(server: Server, mut events: mpsc::UnboundedReceiver<ServerEvent>) {
    while let Some(event) = events.recv().await {
        let listeners: Vec<Arc<dyn ServerListener>> = server
            .inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in &listeners {
            listener.on_event(&server, &event);
        }
    }
}

async fn accept_loop(shared: Arc<ServerShared>, listener: TcpListener) {
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(screen(Arc::clone(&shared), stream, peer));
                }
                Err(e) => {
                    error!(error = %e, "Error accepting connection");
                }
            }
        }
    }
    debug!(address = %shared.local_addr, "Accept loop stopped");
}

/// Server half of the handshake up to the application's decision
async fn screen(shared: Arc<ServerShared>, stream: TcpStream, peer: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
    }
    let local_addr = match stream.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            warn!(peer = %peer, error = %e, "Socket lost before handshake");
            return;
        }
    };
    let mut framed = Framed::new(stream, ParcelCodec::default());

    match read_connect_request(&mut framed, shared.params.confirm_timeout).await {
        Ok(()) => {}
        Err(ProtocolError::UnsupportedVersion(version)) => {
            warn!(peer = %peer, version, "Rejecting unsupported protocol version");
            let reason = format!("Unsupported protocol version {version}");
            reject_screened(&shared, &mut framed, &reason).await;
            return;
        }
        Err(e) => {
            debug!(peer = %peer, error = %e, "Handshake failed");
            return;
        }
    }

    if shared.cancel.is_cancelled() {
        reject_screened(&shared, &mut framed, constants::ERR_SERVER_CLOSED).await;
        return;
    }
    if shared.occupied() >= shared.config.max_connections {
        warn!(peer = %peer, limit = shared.config.max_connections, "Rejecting client, server full");
        reject_screened(&shared, &mut framed, constants::ERR_SERVER_FULL).await;
        return;
    }

    shared.undecided.fetch_add(1, Ordering::SeqCst);
    let pending = ServerConnection {
        inner: Arc::new(PendingShared {
            id: ConnectionId::new(),
            local_addr,
            remote_addr: peer,
            server: Arc::downgrade(&shared),
            slot: Mutex::new(Some(Pending {
                framed,
                listeners: Vec::new(),
            })),
        }),
    };
    debug!(peer = %peer, id = %pending.id().short_id(), "Connection awaiting decision");

    let timer = pending.clone();
    let confirm_timeout = shared.params.confirm_timeout;
    tokio::spawn(async move {
        tokio::time::sleep(confirm_timeout).await;
        if timer.reject(constants::ERR_NO_DECISION).await.is_ok() {
            info!(peer = %timer.remote_addr(), "Connection rejected, no decision in time");
        }
    });

    match shared.config.accept_mode {
        AcceptMode::Listener => shared.emit(ServerEvent::ConnectionAvailable(pending)),
        AcceptMode::Accept => {
            if shared.accept_tx.try_send(pending.clone()).is_err() {
                warn!(peer = %peer, "Accept queue full, dropping socket");
                pending.discard();
            }
        }
    }
}

/// Refuse a screened socket without letting a stalled client hold the task
async fn reject_screened(
    shared: &ServerShared,
    framed: &mut Framed<TcpStream, ParcelCodec>,
    reason: &str,
) {
    let sent = with_timeout_error(send_reject(framed, reason), shared.params.confirm_timeout);
    if let Err(e) = sent.await {
        debug!(error = %e, "REJECT not delivered");
    }
}

struct Pending {
    framed: Framed<TcpStream, ParcelCodec>,
    listeners: Vec<Arc<dyn ConnectionListener>>,
}

struct PendingShared {
    id: ConnectionId,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    server: Weak<ServerShared>,
    slot: Mutex<Option<Pending>>,
}

/// A client waiting for the application to start or reject it
///
/// Without a decision within the confirm timeout the client is rejected.
#[derive(Clone)]
pub struct ServerConnection {
    inner: Arc<PendingShared>,
}

impl ServerConnection {
    /// Identifier the connection keeps once started
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    /// Whether neither start nor reject has happened yet
    pub fn is_pending(&self) -> bool {
        self.inner
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Attach a listener that sees this connection from its first event
    ///
    /// Returns false once the connection is decided.
    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) -> bool {
        let mut slot = self.inner.slot.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_mut() {
            Some(pending) => {
                pending.listeners.push(listener);
                true
            }
            None => false,
        }
    }

    fn take(&self) -> Result<Pending> {
        let pending = self
            .inner
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| ProtocolError::HandshakeError(constants::ERR_ALREADY_DECIDED.into()))?;
        Ok(pending)
    }

    /// Release the slot this socket held against the connection limit
    fn settle(&self) {
        if let Some(server) = self.inner.server.upgrade() {
            server.undecided.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn discard(&self) {
        if self.take().is_ok() {
            self.settle();
        }
    }

    /// Confirm the connection and start its engine
    #[instrument(skip(self), fields(peer = %self.inner.remote_addr))]
    pub async fn start(&self) -> Result<Connection> {
        let pending = self.take()?;
        let result = self.launch(pending).await;
        self.settle();
        result
    }

    async fn launch(&self, mut pending: Pending) -> Result<Connection> {
        let server = self.inner.server.upgrade();
        let Some(server) = server.filter(|s| !s.closed.load(Ordering::SeqCst)) else {
            let _ = send_reject(&mut pending.framed, constants::ERR_SERVER_CLOSED).await;
            return Err(ProtocolError::Custom(constants::ERR_SERVER_CLOSED.into()));
        };

        let confirmation = Confirmation {
            tempo: server.tempo.load(Ordering::SeqCst),
            primacy: server.config.tempo_primacy,
        };
        send_confirm(&mut pending.framed, confirmation).await?;

        let mut listeners: Vec<Arc<dyn ConnectionListener>> = vec![Arc::new(RegistryWatcher {
            server: Arc::downgrade(&server),
        })];
        listeners.extend(
            server
                .connection_listeners
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .cloned(),
        );
        listeners.extend(pending.listeners);

        let connection = Connection::launch(
            pending.framed,
            EngineSetup {
                id: self.inner.id,
                side: Side::Server,
                params: server.params.clone(),
                registry: server.registry.clone(),
                listeners,
                tempo: confirmation.tempo,
                primacy: confirmation.primacy,
                remote_primacy: false,
            },
        )?;

        server
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(connection.id(), connection.clone());
        // Disconnected before it was registered
        if connection.state() == ConnectionState::Disconnected {
            server
                .connections
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&connection.id());
        } else {
            server.emit(ServerEvent::ConnectionAdded(connection.clone()));
        }
        Ok(connection)
    }

    /// Refuse the connection with a reason sent to the client
    #[instrument(skip(self), fields(peer = %self.inner.remote_addr))]
    pub async fn reject(&self, reason: &str) -> Result<()> {
        let mut pending = self.take()?;
        self.settle();
        send_reject(&mut pending.framed, reason).await
    }
}

impl fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConnection")
            .field("id", &self.inner.id.short_id().to_string())
            .field("remote", &self.inner.remote_addr)
            .field("pending", &self.is_pending())
            .finish()
    }
}

/// Removes a connection from the registry once it disconnects
struct RegistryWatcher {
    server: Weak<ServerShared>,
}

impl ConnectionListener for RegistryWatcher {
    fn on_event(&self, connection: &Connection, event: &ConnectionEvent) {
        if !matches!(event, ConnectionEvent::Disconnected { .. }) {
            return;
        }
        let Some(server) = self.server.upgrade() else {
            return;
        };
        let removed = server
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&connection.id());
        if removed.is_some() {
            server.emit(ServerEvent::ConnectionRemoved(connection.clone()));
        }
    }
}
