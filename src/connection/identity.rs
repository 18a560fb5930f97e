//! Connection identity
//!
//! Every connection gets a random 128-bit identifier when it is created. The
//! identifier never crosses the wire; it keys server registries and log
//! lines. The [`ShortId`] is a CRC-32 digest of it, used as a compact tag in
//! logs and displays.

use crc::{Crc, CRC_32_ISO_HDLC};
use std::fmt;
use uuid::Uuid;

const SHORT_ID_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Process-local identifier of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Fresh random identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Four-byte digest for display
    pub fn short_id(&self) -> ShortId {
        ShortId(SHORT_ID_CRC.checksum(self.0.as_bytes()))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// CRC-32 tag of a [`ConnectionId`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShortId(pub u32);

impl ShortId {
    /// The digest as big-endian bytes
    pub fn to_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for ShortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_id_is_stable() {
        let id = ConnectionId::new();
        assert_eq!(id.short_id(), id.short_id());
        assert_eq!(id.short_id().to_string().len(), 8);
    }

    #[test]
    fn test_ids_are_unique() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_short_id_matches_crc_of_uuid() {
        let id = ConnectionId::new();
        let expected = Crc::<u32>::new(&CRC_32_ISO_HDLC).checksum(id.as_uuid().as_bytes());
        assert_eq!(id.short_id().0, expected);
    }
}
