//! Async timeout helpers and default durations.

use crate::error::{ProtocolError, Result};
use std::future::Future;
use std::time::Duration;

/// Default timeout for opening a transport
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default heartbeat interval
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// Await `future` for at most `duration`, mapping expiry to `OperationTimeout`
pub async fn with_timeout_error<F, T>(future: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::OperationTimeout),
    }
}
