//! # Service Layer
//!
//! Entry points that turn TCP sockets into connections.
//!
//! - **Server**: accepts clients, lets the application start or reject them,
//!   and keeps a registry of started connections for multiplex operations
//! - **Client**: connects to a server and runs the client half of the handshake

pub mod client;
pub mod server;

pub use client::Client;
pub use server::{
    server_event_channel, Server, ServerChannelListener, ServerConnection, ServerEvent,
    ServerListener,
};
