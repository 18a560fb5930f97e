use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpSocket;
use tokio_util::codec::Framed;
use tracing::{debug, instrument};

use crate::config::{ConnectionParameters, NetworkConfig};
use crate::connection::engine::{Connection, EngineSetup};
use crate::connection::event::ConnectionListener;
use crate::connection::identity::ConnectionId;
use crate::connection::state::Side;
use crate::core::codec::ParcelCodec;
use crate::core::serialization::ObjectRegistry;
use crate::error::{ProtocolError, Result};
use crate::protocol::handshake::client_handshake;

/// Client for connecting to parcel servers
///
/// One client can open any number of connections; each captures a clamped
/// copy of the client's parameters when it connects.
#[derive(Clone)]
pub struct Client {
    params: ConnectionParameters,
    local_addr: Option<SocketAddr>,
    registry: ObjectRegistry,
    listeners: Vec<Arc<dyn ConnectionListener>>,
}

impl Client {
    pub fn new(params: ConnectionParameters) -> Self {
        Self {
            params,
            local_addr: None,
            registry: ObjectRegistry::new(),
            listeners: Vec::new(),
        }
    }

    /// Client with the connection parameters and local address of a configuration
    pub fn from_config(config: &NetworkConfig) -> Result<Self> {
        let mut client = Self::new(config.connection.clone());
        if let Some(local) = &config.client.local_address {
            let addr = local.parse::<SocketAddr>().map_err(|e| {
                ProtocolError::ConfigError(format!("Invalid local address '{local}': {e}"))
            })?;
            client = client.bind(addr);
        }
        Ok(client)
    }

    /// Bind outgoing sockets to a local address before connecting
    pub fn bind(mut self, local_addr: SocketAddr) -> Self {
        self.local_addr = Some(local_addr);
        self
    }

    /// Use a registry shared with other clients or servers
    pub fn with_registry(mut self, registry: ObjectRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry(&self) -> &ObjectRegistry {
        &self.registry
    }

    pub fn parameters(&self) -> &ConnectionParameters {
        &self.params
    }

    /// Parameters for connections opened from now on
    pub fn set_parameters(&mut self, params: ConnectionParameters) {
        self.params = params;
    }

    /// Attach a listener to every connection opened from now on
    pub fn add_listener(&mut self, listener: Arc<dyn ConnectionListener>) {
        self.listeners.push(listener);
    }

    /// Connect and handshake
    ///
    /// Both the TCP connect and the wait for CONFIRM are bounded by the
    /// confirm timeout.
    #[instrument(skip(self))]
    pub async fn connect(&self, remote: SocketAddr) -> Result<Connection> {
        let params = self.params.clamped();

        let socket = if remote.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if let Some(local) = self.local_addr {
            socket.set_reuseaddr(true)?;
            socket.bind(local)?;
        }

        let stream = tokio::time::timeout(params.confirm_timeout, socket.connect(remote))
            .await
            .map_err(|_| ProtocolError::ConnectionTimeout)??;
        stream.set_nodelay(true)?;

        let mut framed = Framed::new(stream, ParcelCodec::default());
        let confirmation = client_handshake(&mut framed, params.confirm_timeout).await?;
        debug!(
            tempo = confirmation.tempo,
            primacy = confirmation.primacy,
            "Connection confirmed"
        );

        let tempo = if confirmation.primacy {
            confirmation.tempo
        } else {
            params.transmission_speed
        };
        Connection::launch(
            framed,
            EngineSetup {
                id: ConnectionId::new(),
                side: Side::Client,
                params,
                registry: self.registry.clone(),
                listeners: self.listeners.clone(),
                tempo,
                primacy: false,
                remote_primacy: confirmation.primacy,
            },
        )
    }

    /// Connect to an address given as text, e.g. `"127.0.0.1:9000"`
    pub async fn connect_to(&self, addr: &str) -> Result<Connection> {
        let remote = addr
            .parse::<SocketAddr>()
            .map_err(|e| ProtocolError::ConfigError(format!("Invalid address '{addr}': {e}")))?;
        self.connect(remote).await
    }
}
