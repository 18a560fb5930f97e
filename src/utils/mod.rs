//! # Utility Modules
//!
//! Supporting utilities used throughout the connection engine.
//!
//! ## Components
//! - **Logging**: Structured logging configuration
//! - **Metrics**: Thread-safe per-connection traffic counters
//! - **Timeout**: Timing constants and async timeout wrappers

pub mod logging;
pub mod metrics;
pub mod timeout;

pub use metrics::{MetricsSnapshot, TransferMetrics};
