//! Retry/backoff policy (spec §4.D), factored into a pure function so it is
//! unit-testable without any I/O. The teacher has no equivalent helper —
//! `hf_download_file` retries nothing — so this is new code in the
//! teacher's idiom (plain functions, explicit `Option` instead of
//! exceptions), driven by the exponential-delay constants spec.md §6
//! specifies (`INITIAL_RETRY_DELAY_MS`, `MAX_RETRY_DELAY_MS`, `MAX_RETRIES`).

use std::time::Duration;

use crate::config::{INITIAL_RETRY_DELAY_MS, MAX_RETRIES, MAX_RETRY_DELAY_MS};
use crate::error::DownloadError;

/// Decide whether attempt `attempt` (1-based, the attempt that just failed
/// with `error`) should be retried, and if so after how long. Returns
/// `None` when retries are exhausted or the error is not retryable.
pub fn decide(attempt: u32, error: &DownloadError) -> Option<Duration> {
    if attempt > MAX_RETRIES {
        return None;
    }
    if !error.retryable() {
        return None;
    }

    let delay_ms = INITIAL_RETRY_DELAY_MS.saturating_mul(1u64 << (attempt - 1));
    Some(Duration::from_millis(delay_ms.min(MAX_RETRY_DELAY_MS)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backs_off_exponentially_up_to_the_cap() {
        let err = DownloadError::Timeout {
            operation: "shard fetch".into(),
        };
        assert_eq!(decide(1, &err), Some(Duration::from_millis(1000)));
        assert_eq!(decide(2, &err), Some(Duration::from_millis(2000)));
        assert_eq!(decide(3, &err), Some(Duration::from_millis(4000)));
        assert_eq!(decide(4, &err), None); // MAX_RETRIES retries exhausted after attempt 4
    }

    #[test]
    fn does_not_retry_non_retryable_http_status() {
        let err = DownloadError::Http { status: 404 };
        assert_eq!(decide(1, &err), None);
    }

    #[test]
    fn retries_http_429() {
        let err = DownloadError::Http { status: 429 };
        assert!(decide(1, &err).is_some());
    }

    #[test]
    fn never_retries_cancellation() {
        assert_eq!(decide(1, &DownloadError::Cancelled), None);
    }
}
