//! Retry utilities: backoff builders shared by the reconnect and poll loops.
//!
//! Uses `backon` builders so the schedules can be swapped without touching
//! the loops. Both schedules are constant: broker outages are retried at a
//! fixed cadence forever.

use std::time::Duration;

use backon::{BackoffBuilder, ConstantBuilder};

/// Default delay between broker reconnect attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(5000);

/// Default pause after a failed long-poll receive.
pub const DEFAULT_POLL_ERROR_BACKOFF: Duration = Duration::from_millis(5000);

/// Constant backoff for broker reconnects.
///
/// - Fixed delay (5000ms by default)
/// - No attempt limit
/// - No jitter
pub fn reconnect_backoff(delay: Duration) -> ConstantBuilder {
    ConstantBuilder::default()
        .with_delay(delay)
        .with_max_times(usize::MAX)
}

/// Constant backoff after a receive-level transport error in the poll loop.
pub fn poll_error_backoff(delay: Duration) -> ConstantBuilder {
    ConstantBuilder::default()
        .with_delay(delay)
        .with_max_times(usize::MAX)
}

/// Infinite iterator of delays from a constant builder.
///
/// Falls back to `delay` should the builder ever run dry.
pub fn delays(builder: ConstantBuilder, delay: Duration) -> impl Iterator<Item = Duration> {
    builder.build().chain(std::iter::repeat(delay))
}
