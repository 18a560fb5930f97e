//! # Parcel Codec
//!
//! Tokio codec that frames [`Parcel`]s over a byte stream.
//!
//! Decoding is zero-copy: once a complete frame is buffered, the payload is
//! split off the read buffer and frozen, so no payload bytes are copied.
//! The header is validated before the payload is awaited, which bounds the
//! memory a misbehaving peer can make us reserve.

use crate::config::MAX_PARCEL_SIZE;
use crate::core::parcel::{Parcel, ParcelHeader, HEADER_SIZE};
use crate::error::ProtocolError;
use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Framing codec for parcels
#[derive(Debug, Clone, Copy)]
pub struct ParcelCodec {
    max_payload: usize,
}

impl ParcelCodec {
    /// Codec accepting payloads up to `max_payload` bytes (capped at the protocol maximum)
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload: max_payload.min(MAX_PARCEL_SIZE),
        }
    }
}

impl Default for ParcelCodec {
    fn default() -> Self {
        Self::new(MAX_PARCEL_SIZE)
    }
}

impl Decoder for ParcelCodec {
    type Item = Parcel;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            src.reserve(HEADER_SIZE - src.len());
            return Ok(None);
        }

        let (header, payload_len) = ParcelHeader::parse(&src[..HEADER_SIZE])?;
        if payload_len > self.max_payload {
            return Err(ProtocolError::OversizedParcel(payload_len));
        }

        let frame_len = HEADER_SIZE + payload_len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(payload_len).freeze();
        Ok(Some(header.with_payload(payload)))
    }
}

impl Encoder<Parcel> for ParcelCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Parcel, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload.len() > self.max_payload {
            return Err(ProtocolError::OversizedParcel(item.payload.len()));
        }
        item.write_into(dst)
    }
}
