//! # Core Protocol Components
//!
//! Low-level parcel handling, codecs, and object serialization.
//!
//! This module provides the foundation of the protocol: parcel framing,
//! encoding/decoding, and the registry that turns application objects into
//! parcel payloads.
//!
//! ## Components
//! - **Parcel**: Binary transmission unit with magic bytes and a fixed header
//! - **Codec**: Tokio codec for framing over byte streams
//! - **Serialization**: Format selection and the object type registry
//!
//! ## Wire Format
//! ```text
//! [Magic(4)] [Version(1)] [Kind(1)] [Priority(1)] [Flags(1)]
//! [Id(8)] [Sequence(4)] [Extent(8)] [Checksum(4)] [Length(4)] [Payload(N)]
//! ```
//!
//! ## Security
//! - Maximum payload size: 256KB (prevents memory exhaustion)
//! - Magic bytes prevent accidental misinterpretation
//! - Length validation before allocation

pub mod codec;
pub mod parcel;
pub mod serialization;
