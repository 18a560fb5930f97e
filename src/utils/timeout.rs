//! Timing constants and async timeout wrappers.

use crate::error::{ProtocolError, Result};
use std::future::Future;
use std::time::Duration;

/// Default maximum wait for handshake confirmation
pub const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(10);

/// Lower bound of the confirm timeout
pub const MIN_CONFIRM_TIMEOUT: Duration = Duration::from_secs(1);

/// Default interval between ALIVE signals
pub const DEFAULT_ALIVE_PERIOD: Duration = Duration::from_secs(20);

/// Alive period bounds (zero disables keep-alive and is not clamped)
pub const MIN_ALIVE_PERIOD: Duration = Duration::from_secs(1);
pub const MAX_ALIVE_PERIOD: Duration = Duration::from_secs(300);

/// Default interval of idle evaluation
pub const DEFAULT_IDLE_CHECK_PERIOD: Duration = Duration::from_secs(60);

/// Lower bound of the idle check period
pub const MIN_IDLE_CHECK_PERIOD: Duration = Duration::from_secs(1);

/// Resolution of the monitor task
pub const MONITOR_TICK: Duration = Duration::from_millis(100);

/// Socket activity younger than this counts as "transmitting"
pub const TRANSMISSION_WINDOW: Duration = Duration::from_secs(1);

/// Run a future with a timeout, mapping expiry to `ProtocolError::Timeout`
pub async fn with_timeout_error<F, T>(future: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}
