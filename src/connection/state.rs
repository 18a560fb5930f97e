//! Connection lifecycle states and termination causes

use std::fmt;

/// Lifecycle of a connection
///
/// ```text
/// UNCONNECTED -> HANDSHAKING -> CONNECTED -> CLOSING -> CLOSED -> DISCONNECTED
/// ```
/// A connection never returns to an earlier state and is never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Unconnected,
    Handshaking,
    Connected,
    /// Local close requested, queued items are draining
    Closing,
    /// CLOSE sent, waiting for the remote's CLOSE
    Closed,
    /// Socket released, final state
    Disconnected,
}

impl ConnectionState {
    /// Whether objects and files may be queued
    pub fn accepts_sends(self) -> bool {
        self == ConnectionState::Connected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Unconnected => "UNCONNECTED",
            ConnectionState::Handshaking => "HANDSHAKING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Closing => "CLOSING",
            ConnectionState::Closed => "CLOSED",
            ConnectionState::Disconnected => "DISCONNECTED",
        };
        f.write_str(s)
    }
}

/// Why a connection was closed or disconnected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCause {
    /// `close()` was called on this side
    LocalClose,
    /// The remote sent CLOSE first
    RemoteClose,
    /// The owning server shut down
    Shutdown,
    /// The remote closed the socket without CLOSE
    RemoteEof,
    /// Reading from or writing to the socket failed
    SocketError,
    /// No ALIVE-ECHO within the alive timeout
    AliveTimeout,
    /// The remote did not answer our CLOSE in time
    CloseTimeout,
    /// The remote sent malformed or out-of-order data
    ProtocolViolation,
}

impl CloseCause {
    /// Code carried in the CLOSE signal
    pub fn code(self) -> i32 {
        match self {
            CloseCause::LocalClose => 0,
            CloseCause::RemoteClose => 1,
            CloseCause::Shutdown => 2,
            CloseCause::RemoteEof => 3,
            CloseCause::SocketError => 4,
            CloseCause::AliveTimeout => 5,
            CloseCause::CloseTimeout => 6,
            CloseCause::ProtocolViolation => 7,
        }
    }

    /// Decode a CLOSE code; unknown codes read as a plain remote close
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => CloseCause::LocalClose,
            2 => CloseCause::Shutdown,
            3 => CloseCause::RemoteEof,
            4 => CloseCause::SocketError,
            5 => CloseCause::AliveTimeout,
            6 => CloseCause::CloseTimeout,
            7 => CloseCause::ProtocolViolation,
            _ => CloseCause::RemoteClose,
        }
    }

    /// Whether the connection ended without an orderly CLOSE exchange
    pub fn is_abnormal(self) -> bool {
        !matches!(
            self,
            CloseCause::LocalClose | CloseCause::RemoteClose | CloseCause::Shutdown
        )
    }
}

impl fmt::Display for CloseCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseCause::LocalClose => "local close",
            CloseCause::RemoteClose => "remote close",
            CloseCause::Shutdown => "server shutdown",
            CloseCause::RemoteEof => "remote end of stream",
            CloseCause::SocketError => "socket error",
            CloseCause::AliveTimeout => "alive timeout",
            CloseCause::CloseTimeout => "close timeout",
            CloseCause::ProtocolViolation => "protocol violation",
        };
        f.write_str(s)
    }
}

/// Which end of the TCP connection this engine runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Client,
    Server,
}
