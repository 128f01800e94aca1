//! Shared retry helpers for LLM clients.
//!
//! Provides a backoff configuration and a rate-limit-aware delay adjuster
//! for use with `backon::Retryable`.

use std::time::Duration;

use backon::ExponentialBuilder;

use crate::errors::ProviderError;

/// Standard backoff: 1s → 2s → 4s … capped at 30s, 3 retries, with jitter.
pub fn provider_backoff() -> ExponentialBuilder {
    ExponentialBuilder::new()
        .with_min_delay(Duration::from_secs(1))
        .with_max_delay(Duration::from_secs(30))
        .with_factor(2.0)
        .with_jitter()
        .with_max_times(3)
}

/// If the error is `RateLimit`, ensure the delay is at least the
/// server-requested `retry_after`.
///
/// Signature matches `backon::Retry::adjust`: returning `None` aborts the retry.
pub fn adjust_for_rate_limit(
    err: &ProviderError,
    dur: Option<Duration>,
) -> Option<Duration> {
    match (err.retry_after(), dur) {
        (Some(requested), Some(d)) => Some(d.max(requested)),
        (_, dur) => dur,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adjust_rate_limited_uses_max() {
        let err = ProviderError::RateLimit {
            status: 429,
            retry_after_secs: 5,
        };
        // Backoff suggests 1s, but the server says 5s → use 5s.
        let result = adjust_for_rate_limit(&err, Some(Duration::from_secs(1)));
        assert_eq!(result, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_adjust_rate_limited_backoff_already_larger() {
        let err = ProviderError::RateLimit {
            status: 429,
            retry_after_secs: 1,
        };
        let result = adjust_for_rate_limit(&err, Some(Duration::from_secs(2)));
        assert_eq!(result, Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_adjust_non_rate_limited_passes_through() {
        let err = ProviderError::ServiceUnavailable {
            status: 503,
            message: "overloaded".into(),
        };
        let result = adjust_for_rate_limit(&err, Some(Duration::from_secs(1)));
        assert_eq!(result, Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_adjust_none_passes_through() {
        let err = ProviderError::ServiceUnavailable {
            status: 500,
            message: "error".into(),
        };
        assert_eq!(adjust_for_rate_limit(&err, None), None);
    }
}
