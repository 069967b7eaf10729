//! Wall-clock helpers for expiry and timestamp checks

use crate::error::{constants, ProtocolError, Result};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Get the current timestamp in milliseconds
///
/// # Errors
/// Returns a `ProtocolError::Custom` if the system time is earlier than UNIX_EPOCH
pub fn current_timestamp() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .map_err(|_| ProtocolError::Custom(constants::ERR_SYSTEM_TIME.into()))
}

/// Millisecond timestamp `ttl` from now, saturating
pub fn expiry_from_now(ttl: Duration) -> Result<(u64, u64)> {
    let now = current_timestamp()?;
    let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
    Ok((now, now.saturating_add(ttl_ms)))
}

/// Whether a millisecond timestamp lies in the past
pub fn is_past(timestamp_ms: u64) -> bool {
    current_timestamp().map_or(true, |now| now >= timestamp_ms)
}
