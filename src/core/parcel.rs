//! # Parcel
//!
//! The transmission unit of the protocol. Every wire exchange (signals,
//! object fragments, file fragments) travels as one parcel.
//!
//! ## Wire Format
//! ```text
//! [Magic(4)] [Version(1)] [Kind(1)] [Priority(1)] [Flags(1)]
//! [Id(8)] [Sequence(4)] [Extent(8)] [Checksum(4)] [Length(4)] [Payload(N)]
//! ```
//! All integers are big-endian. The header is [`HEADER_SIZE`] bytes.
//!
//! ## Field meaning per kind
//! - **Signal**: `id`, `sequence`, `extent` and `checksum` are zero
//! - **Object**: `id` is the object ID, `sequence` the fragment index and
//!   `extent` the total serialized length
//! - **File**: `id` is the file ID, `extent` the cumulative length including
//!   this fragment (the declared file length on the HEADER parcel) and
//!   `checksum` the running CRC-32 of all data so far

use crate::config::{MAGIC_BYTES, MAX_PARCEL_SIZE, PROTOCOL_VERSION};
use crate::error::{ProtocolError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Size of the fixed parcel header in bytes
pub const HEADER_SIZE: usize = 36;

/// Parcel flag bits
pub mod flags {
    /// Last fragment of an object or file
    pub const FINAL: u8 = 0x01;
    /// File announcement carrying the remote path and declared length
    pub const HEADER: u8 = 0x02;
}

/// Kind of content carried by a parcel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ParcelKind {
    Signal = 0,
    Object = 1,
    File = 2,
}

impl ParcelKind {
    /// Decode the kind byte of a header
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(ParcelKind::Signal),
            1 => Some(ParcelKind::Object),
            2 => Some(ParcelKind::File),
            _ => None,
        }
    }
}

/// Send priority of an object or file
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
}

impl Priority {
    /// Decode the priority byte of a header
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Priority::Low),
            1 => Some(Priority::Normal),
            2 => Some(Priority::High),
            _ => None,
        }
    }

    /// Lane index inside a channel, highest priority first
    pub(crate) fn lane(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

/// A framed transmission unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parcel {
    pub kind: ParcelKind,
    pub priority: Priority,
    pub flags: u8,
    pub object_id: u64,
    pub sequence: u32,
    pub extent: u64,
    pub checksum: u32,
    pub payload: Bytes,
}

impl Parcel {
    /// A signal parcel around an encoded signal body
    pub fn signal(payload: Bytes) -> Self {
        Self {
            kind: ParcelKind::Signal,
            priority: Priority::High,
            flags: flags::FINAL,
            object_id: 0,
            sequence: 0,
            extent: 0,
            checksum: 0,
            payload,
        }
    }

    /// One fragment of a serialized object
    pub fn object_fragment(
        object_id: u64,
        priority: Priority,
        sequence: u32,
        total_len: u64,
        is_final: bool,
        payload: Bytes,
    ) -> Self {
        Self {
            kind: ParcelKind::Object,
            priority,
            flags: if is_final { flags::FINAL } else { 0 },
            object_id,
            sequence,
            extent: total_len,
            checksum: 0,
            payload,
        }
    }

    /// Whether this is the last fragment of its object or file
    pub fn is_final(&self) -> bool {
        self.flags & flags::FINAL != 0
    }

    /// Whether this is a file announcement
    pub fn is_header(&self) -> bool {
        self.flags & flags::HEADER != 0
    }

    /// Length of this parcel on the wire
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Append the encoded parcel to `dst`
    pub fn write_into(&self, dst: &mut BytesMut) -> Result<()> {
        if self.payload.len() > MAX_PARCEL_SIZE {
            return Err(ProtocolError::OversizedParcel(self.payload.len()));
        }
        dst.reserve(self.wire_len());
        dst.put_slice(&MAGIC_BYTES);
        dst.put_u8(PROTOCOL_VERSION);
        dst.put_u8(self.kind as u8);
        dst.put_u8(self.priority as u8);
        dst.put_u8(self.flags);
        dst.put_u64(self.object_id);
        dst.put_u32(self.sequence);
        dst.put_u64(self.extent);
        dst.put_u32(self.checksum);
        dst.put_u32(self.payload.len() as u32);
        dst.put_slice(&self.payload);
        Ok(())
    }

    /// Encode the parcel into a fresh buffer
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        self.write_into(&mut buf)?;
        Ok(buf.to_vec())
    }

    /// Decode one complete parcel from `data`
    ///
    /// Trailing bytes after the declared payload are rejected.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let (header, payload_len) = ParcelHeader::parse(data)?;
        if data.len() != HEADER_SIZE + payload_len {
            return Err(ProtocolError::InvalidHeader);
        }
        Ok(header.with_payload(Bytes::copy_from_slice(&data[HEADER_SIZE..])))
    }
}

/// Decoded header fields, waiting for their payload
#[derive(Debug, Clone, Copy)]
pub(crate) struct ParcelHeader {
    kind: ParcelKind,
    priority: Priority,
    flags: u8,
    object_id: u64,
    sequence: u32,
    extent: u64,
    checksum: u32,
}

impl ParcelHeader {
    /// Parse and validate the first [`HEADER_SIZE`] bytes of `data`,
    /// returning the header and its declared payload length
    pub(crate) fn parse(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::InvalidHeader);
        }
        let mut buf = &data[..HEADER_SIZE];

        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if magic != MAGIC_BYTES {
            return Err(ProtocolError::InvalidHeader);
        }

        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        let kind = ParcelKind::from_byte(buf.get_u8()).ok_or(ProtocolError::InvalidHeader)?;
        let priority = Priority::from_byte(buf.get_u8()).ok_or(ProtocolError::InvalidHeader)?;
        let flags = buf.get_u8();
        let object_id = buf.get_u64();
        let sequence = buf.get_u32();
        let extent = buf.get_u64();
        let checksum = buf.get_u32();
        let length = buf.get_u32() as usize;

        if length > MAX_PARCEL_SIZE {
            return Err(ProtocolError::OversizedParcel(length));
        }

        Ok((
            Self {
                kind,
                priority,
                flags,
                object_id,
                sequence,
                extent,
                checksum,
            },
            length,
        ))
    }

    pub(crate) fn with_payload(self, payload: Bytes) -> Parcel {
        Parcel {
            kind: self.kind,
            priority: self.priority,
            flags: self.flags,
            object_id: self.object_id,
            sequence: self.sequence,
            extent: self.extent,
            checksum: self.checksum,
            payload,
        }
    }
}
