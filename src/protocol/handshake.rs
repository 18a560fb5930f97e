//! Connection handshake
//!
//! The client opens with CONNECT-REQUEST and waits up to the confirm timeout
//! for CONFIRM or REJECT. The server validates the request and then lets the
//! application decide; the decision is sent with [`send_confirm`] or
//! [`send_reject`].
//!
//! The pure checks are separated from the async drivers so the state machine
//! can be tested without sockets.

use crate::config::PROTOCOL_VERSION;
use crate::core::codec::ParcelCodec;
use crate::core::parcel::Parcel;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::signal::Signal;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, instrument, warn};

/// Terms announced by the server in its CONFIRM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirmation {
    /// Server tempo at the time of confirmation
    pub tempo: i64,
    /// Whether the server's tempo overrides the client's
    pub primacy: bool,
}

/// The signal a client opens the handshake with
pub fn connect_request() -> Signal {
    Signal::ConnectRequest {
        version: PROTOCOL_VERSION,
    }
}

/// Validate the first parcel a server receives
pub fn check_connect_request(parcel: &Parcel) -> Result<()> {
    let signal = Signal::from_parcel(parcel)
        .map_err(|_| ProtocolError::HandshakeError(constants::ERR_NOT_A_CONNECT_REQUEST.into()))?;
    match signal {
        Signal::ConnectRequest { version } if version == PROTOCOL_VERSION => Ok(()),
        Signal::ConnectRequest { version } => Err(ProtocolError::UnsupportedVersion(version)),
        _ => Err(ProtocolError::HandshakeError(
            constants::ERR_NOT_A_CONNECT_REQUEST.into(),
        )),
    }
}

/// Interpret the server's answer to a connection request
pub fn check_response(parcel: &Parcel) -> Result<Confirmation> {
    let signal = Signal::from_parcel(parcel)
        .map_err(|e| ProtocolError::HandshakeError(e.to_string()))?;
    match signal {
        Signal::Confirm { tempo, primacy } => Ok(Confirmation { tempo, primacy }),
        Signal::Reject { reason } => Err(ProtocolError::ConnectionRejected(reason)),
        other => Err(ProtocolError::HandshakeError(format!(
            "{}: {}",
            constants::ERR_UNEXPECTED_SIGNAL,
            other.name()
        ))),
    }
}

/// Drive the client half of the handshake over a freshly connected stream
#[instrument(skip(framed), level = "debug")]
pub async fn client_handshake<S>(
    framed: &mut Framed<S, ParcelCodec>,
    confirm_timeout: Duration,
) -> Result<Confirmation>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    framed
        .send(connect_request().to_parcel()?)
        .await
        .map_err(|e| ProtocolError::HandshakeError(e.to_string()))?;
    debug!("CONNECT-REQUEST sent, awaiting confirmation");

    match tokio::time::timeout(confirm_timeout, framed.next()).await {
        Err(_) => Err(ProtocolError::ConnectionTimeout),
        Ok(None) => Err(ProtocolError::HandshakeError(
            constants::ERR_PEER_CLOSED_HANDSHAKE.into(),
        )),
        Ok(Some(Err(e))) => Err(ProtocolError::HandshakeError(e.to_string())),
        Ok(Some(Ok(parcel))) => check_response(&parcel),
    }
}

/// Read and validate the client's connection request
#[instrument(skip(framed), level = "debug")]
pub async fn read_connect_request<S>(
    framed: &mut Framed<S, ParcelCodec>,
    confirm_timeout: Duration,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::time::timeout(confirm_timeout, framed.next()).await {
        Err(_) => Err(ProtocolError::ConnectionTimeout),
        Ok(None) => Err(ProtocolError::HandshakeError(
            constants::ERR_PEER_CLOSED_HANDSHAKE.into(),
        )),
        Ok(Some(Err(e))) => Err(ProtocolError::HandshakeError(e.to_string())),
        Ok(Some(Ok(parcel))) => check_connect_request(&parcel),
    }
}

/// Accept the connection
pub async fn send_confirm<S>(
    framed: &mut Framed<S, ParcelCodec>,
    confirmation: Confirmation,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let signal = Signal::Confirm {
        tempo: confirmation.tempo,
        primacy: confirmation.primacy,
    };
    framed.send(signal.to_parcel()?).await
}

/// Refuse the connection; the caller drops the stream afterwards
pub async fn send_reject<S>(framed: &mut Framed<S, ParcelCodec>, reason: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let signal = Signal::Reject {
        reason: reason.to_string(),
    };
    framed.send(signal.to_parcel()?).await?;
    if let Err(e) = framed.close().await {
        warn!(error = %e, "Failed to flush REJECT");
    }
    Ok(())
}
