//! # Control Signals
//!
//! Signals are the control plane of a connection. Each one travels alone in a
//! SIGNAL parcel as a bincode-encoded [`Signal`] and is always sent ahead of
//! queued object and file data.

use crate::core::parcel::{Parcel, ParcelKind};
use crate::error::{ProtocolError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Control message exchanged between two connection engines
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Signal {
    /// First parcel of a client after the TCP connect
    ConnectRequest { version: u8 },
    /// Server accepted the connection; carries its tempo and whether it has primacy
    Confirm { tempo: i64, primacy: bool },
    /// Server refused the connection
    Reject { reason: String },
    /// Orderly shutdown request, answered with a CLOSE of the peer
    Close { cause: i32, message: Option<String> },
    /// Keep-alive probe
    Alive,
    /// Answer to [`Signal::Alive`]
    AliveEcho,
    /// Round-trip probe requested by the application
    Ping { ping_id: u32 },
    /// Answer to [`Signal::Ping`]
    PingEcho { ping_id: u32 },
    /// Transmission speed in bytes per second (-1 unlimited, 0 paused)
    Tempo { speed: i64 },
    /// A file transfer was cancelled; `sender_side` is true when the file's sender aborted
    FileAbort {
        file_id: u64,
        sender_side: bool,
        reason: String,
    },
    /// The receiver stored an incoming file
    FileConfirm { file_id: u64 },
    /// The receiver could not store an incoming file
    FileFail { file_id: u64, reason: String },
}

impl Signal {
    /// Opcode of the signal, stable across versions and used in logs
    pub fn opcode(&self) -> u8 {
        match self {
            Signal::ConnectRequest { .. } => 0x01,
            Signal::Confirm { .. } => 0x02,
            Signal::Reject { .. } => 0x03,
            Signal::Close { .. } => 0x04,
            Signal::Alive => 0x10,
            Signal::AliveEcho => 0x11,
            Signal::Ping { .. } => 0x12,
            Signal::PingEcho { .. } => 0x13,
            Signal::Tempo { .. } => 0x20,
            Signal::FileAbort { .. } => 0x30,
            Signal::FileConfirm { .. } => 0x31,
            Signal::FileFail { .. } => 0x32,
        }
    }

    /// Human-readable signal name
    pub fn name(&self) -> &'static str {
        match self {
            Signal::ConnectRequest { .. } => "CONNECT-REQUEST",
            Signal::Confirm { .. } => "CONFIRM",
            Signal::Reject { .. } => "REJECT",
            Signal::Close { .. } => "CLOSE",
            Signal::Alive => "ALIVE",
            Signal::AliveEcho => "ALIVE-ECHO",
            Signal::Ping { .. } => "PING",
            Signal::PingEcho { .. } => "PING-ECHO",
            Signal::Tempo { .. } => "TEMPO",
            Signal::FileAbort { .. } => "FILE-ABORT",
            Signal::FileConfirm { .. } => "FILE-CONFIRM",
            Signal::FileFail { .. } => "FILE-FAIL",
        }
    }

    /// Wrap the signal into a SIGNAL parcel
    pub fn to_parcel(&self) -> Result<Parcel> {
        let body = bincode::serialize(self)?;
        Ok(Parcel::signal(Bytes::from(body)))
    }

    /// Decode the signal carried by a SIGNAL parcel
    pub fn from_parcel(parcel: &Parcel) -> Result<Self> {
        if parcel.kind != ParcelKind::Signal {
            return Err(ProtocolError::ProtocolViolation(format!(
                "Expected a signal parcel, got {:?}",
                parcel.kind
            )));
        }
        Self::from_bytes(&parcel.payload)
    }

    /// Decode a signal body
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}
