//! Retry utilities: backoff builders for storage calls and lock acquisition.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Standard backoff for transient storage failures.
///
/// - Min delay: 10ms
/// - Max delay: 500ms
/// - Max attempts: 5
/// - Jitter enabled
pub fn storage_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_millis(500))
        .with_max_times(5)
        .with_jitter()
}

/// Backoff between distributed lock acquisition attempts.
///
/// Attempts are unbounded here; callers bound the total wait with a deadline.
///
/// - Min delay: 5ms
/// - Max delay: 250ms
/// - Jitter enabled
pub fn lock_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(5))
        .with_max_delay(Duration::from_millis(250))
        .without_max_times()
        .with_jitter()
}

/// Backoff while waiting for another process to finish sealing a timeline.
///
/// - Min delay: 5ms
/// - Max delay: 200ms
/// - Max attempts: 20
pub fn seal_wait_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(5))
        .with_max_delay(Duration::from_millis(200))
        .with_max_times(20)
}
