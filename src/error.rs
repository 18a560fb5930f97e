//! # Error Types
//!
//! Error handling for the connection engine.
//!
//! This module defines every error variant that can surface from protocol
//! operations, from socket level I/O failures to refused handshakes and
//! aborted file transfers.
//!
//! ## Error Categories
//! - **I/O Errors**: Network and file system failures
//! - **Framing Errors**: Invalid parcel headers, unsupported versions, oversized parcels
//! - **Handshake Errors**: Non-protocol peers, rejections, confirm timeouts
//! - **Send Errors**: Unregistered objects, full queues, unconnected state
//! - **Transfer Errors**: File length, file in progress, storage and abort conditions
//!
//! Local conditions (one file failing to store, one multiplex target being
//! unreachable) are reported to the caller or as events. Fatal conditions end
//! the affected connection only.
//!
//! ## Example Usage
//! ```rust
//! use parcel_net::error::{ProtocolError, Result};
//! use std::fs::File;
//! use std::io::Read;
//! use tracing::{info, error};
//!
//! fn read_file(path: &str) -> Result<String> {
//!     let mut file = File::open(path).map_err(ProtocolError::Io)?;
//!     let mut contents = String::new();
//!     file.read_to_string(&mut contents).map_err(ProtocolError::Io)?;
//!     Ok(contents)
//! }
//!
//! fn main() {
//!     match read_file("example.txt") {
//!         Ok(contents) => info!(contents, "Successfully read file"),
//!         Err(e) => error!(error=%e, "Error reading file"),
//!     }
//! }
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Synchronization
    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";

    /// Handshake errors
    pub const ERR_PEER_CLOSED_HANDSHAKE: &str =
        "Remote closed the socket before answering the connection request";
    pub const ERR_NOT_A_CONNECT_REQUEST: &str = "First parcel was not a connection request";
    pub const ERR_UNEXPECTED_SIGNAL: &str = "Unexpected signal during handshake";
    pub const ERR_NO_DECISION: &str = "No accept decision within confirm timeout";
    pub const ERR_ALREADY_DECIDED: &str = "Connection was already started or rejected";
    pub const ERR_SERVER_FULL: &str = "Server connection limit reached";
    pub const ERR_SERVER_CLOSED: &str = "Server is closed";

    /// Transfer errors
    pub const ERR_NOT_A_FILE: &str = "Path does not denote a regular file";
    pub const ERR_PREMATURE_END: &str = "File stream ended before the declared length";
    pub const ERR_LENGTH_OVERRUN: &str = "File stream exceeded the declared length";
    pub const ERR_NO_FILE_ROOT: &str = "No file root directory configured";
    pub const ERR_PATH_OUTSIDE_ROOT: &str = "Remote path resolves outside the file root";
    pub const ERR_SOURCE_SHRANK: &str = "Source file ended before its announced length";
    pub const ERR_LOCAL_BREAK: &str = "Transfer cancelled locally";
    pub const ERR_TRANSFER_INTERRUPTED: &str = "Connection ended during transfer";

    /// Connection errors
    pub const ERR_ALIVE_TIMEOUT: &str = "No ALIVE echo received within alive timeout";
    pub const ERR_CLOSE_TIMEOUT: &str = "Remote did not confirm close in time";
    pub const ERR_REMOTE_EOF: &str = "Remote closed the socket";
}

/// Primary error type for all protocol operations.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Deserialize error: {0}")]
    DeserializeError(String),

    #[error("Invalid parcel header")]
    InvalidHeader,

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("Parcel too large: {0} bytes")]
    OversizedParcel(usize),

    #[error("Handshake failed: {0}")]
    HandshakeError(String),

    #[error("Connection rejected by remote: {0}")]
    ConnectionRejected(String),

    #[error("Connection timed out waiting for confirmation")]
    ConnectionTimeout,

    #[error("Object type is not registered: {0}")]
    UnregisteredObject(String),

    #[error("Serialized object of {size} bytes exceeds limit of {limit}")]
    ObjectTooLarge { size: usize, limit: usize },

    #[error("{queue} queue capacity of {capacity} exceeded")]
    CapacityExceeded { queue: &'static str, capacity: usize },

    #[error("File length {0} exceeds the maximum transferable length")]
    FileLength(u64),

    #[error("A transfer for {0} is already in progress")]
    FileInProgress(String),

    #[error("Insufficient storage: {0}")]
    InsufficientStorage(String),

    #[error("Transfer aborted by remote: {0}")]
    RemoteAbort(String),

    #[error("Transfer aborted: {0}")]
    TransferAborted(String),

    #[error("Checksum mismatch on file {file_id}")]
    ChecksumMismatch { file_id: u64 },

    #[error("Operation requires a connected connection")]
    Unconnected,

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
