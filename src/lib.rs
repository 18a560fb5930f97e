//! # parcel-net
//!
//! Connection engine for exchanging objects, files and control signals over
//! TCP. Everything on the wire is a *parcel*: a fixed header plus a payload of
//! at most 256 KiB. Large objects and files are split into parcels and
//! reassembled on the other side.
//!
//! ## Features
//! - Registered object types, serialized with bincode or JSON
//! - File transfers with CRC-32 verification and relocation under a file root
//! - Priority lanes with bounded queues that fail fast instead of blocking
//! - Tempo control (bytes per second) with optional server primacy
//! - Keep-alive, ping round trips and idle detection
//! - Ordered events per connection, delivered off the I/O tasks
//!
//! ## Example
//! ```no_run
//! use parcel_net::config::{ConnectionParameters, ServerConfig};
//! use parcel_net::connection::{event_channel, ConnectionEvent};
//! use parcel_net::core::parcel::Priority;
//! use parcel_net::service::{server_event_channel, Client, Server, ServerEvent};
//! use futures::StreamExt;
//!
//! # async fn run() -> parcel_net::error::Result<()> {
//! let params = ConnectionParameters::default();
//! let server = Server::bind("127.0.0.1:0", params, ServerConfig::default()).await?;
//! let (listener, mut server_events) = server_event_channel();
//! server.add_listener(listener);
//!
//! let client = Client::new(ConnectionParameters::default());
//! let addr = server.local_addr();
//! // The client waits for CONFIRM, so the server side decides concurrently
//! let connecting = tokio::spawn(async move { client.connect(addr).await });
//!
//! if let Some(ServerEvent::ConnectionAvailable(pending)) = server_events.next().await {
//!     let (events, mut stream) = event_channel();
//!     pending.add_listener(events);
//!     pending.start().await?;
//!     let connection = connecting.await.expect("connect task")?;
//!
//!     connection.send_object(&String::from("hello"), Priority::Normal)?;
//!     while let Some(event) = stream.next().await {
//!         if let ConnectionEvent::ObjectReceived { object, .. } = event {
//!             assert_eq!(object.downcast_ref::<String>().map(String::as_str), Some("hello"));
//!             break;
//!         }
//!     }
//!     connection.close();
//!     connection.disconnected().await;
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod utils;

pub use crate::config::{ConnectionParameters, NetworkConfig};
pub use crate::connection::{Connection, ConnectionEvent, ConnectionListener};
pub use crate::core::parcel::{Parcel, Priority};
pub use crate::core::serialization::{ObjectRegistry, ReceivedObject, SerializationFormat};
pub use crate::error::{ProtocolError, Result};
pub use crate::service::{Client, Server, ServerConnection, ServerEvent};
