//! # Protocol Layer
//!
//! Control signals and the connection handshake.
//!
//! ## Components
//! - **Signal**: Control messages (keep-alive, ping, tempo, close, file acknowledgements)
//! - **Handshake**: CONNECT-REQUEST / CONFIRM / REJECT exchange with confirm timeout

pub mod handshake;
pub mod signal;
