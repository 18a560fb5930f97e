//! # Connection Layer
//!
//! A handshaken TCP stream becomes a [`Connection`]: a handle to the tasks
//! that send, receive and monitor parcels for it.
//!
//! ## Components
//! - **Engine**: the `Connection` handle, shared state and task supervision
//! - **Queue**: priority lanes, capacity limits and fragmentation of outgoing data
//! - **Transfer**: outgoing file bookkeeping and incoming file reassembly
//! - **Tempo**: transmission speed and the sender's pacing clock
//! - **Event**: events and listeners
//! - **State / Identity**: lifecycle states, close causes and connection IDs

pub mod engine;
pub mod event;
pub mod identity;
mod monitor;
mod queue;
mod receiver;
mod sender;
pub mod state;
mod tempo;
pub mod transfer;

pub use engine::Connection;
pub use event::{
    event_channel, ChannelListener, ConnectionEvent, ConnectionListener, Direction, PingEcho,
    TransmissionEvent, TransmissionKind,
};
pub use identity::{ConnectionId, ShortId};
pub use state::{CloseCause, ConnectionState, Side};
pub use transfer::TransferState;
