//! Support utilities for [`keen_retry`]'s retry API.
//!
//! The extraction client reports every attempt as a
//! [`keen_retry::RetryResult`], so the retry loop can branch on whether an
//! error is worth retrying instead of retrying everything uniformly.

use keen_retry::RetryResult;
use reqwest::StatusCode;

/// Build a [`RetryResult::Ok`] value.
pub fn retry_result_ok<T, E>(output: T) -> RetryResult<(), (), T, E> {
    RetryResult::Ok {
        reported_input: (),
        output,
    }
}

/// Build a [`RetryResult::Transient`] value.
pub fn retry_result_transient<T, E>(error: E) -> RetryResult<(), (), T, E> {
    RetryResult::Transient { input: (), error }
}

/// Build a [`RetryResult::Fatal`] value.
pub fn retry_result_fatal<T, E>(error: E) -> RetryResult<(), (), T, E> {
    RetryResult::Fatal { input: (), error }
}

/// Is this error a known transient error?
///
/// By default, we assume errors are not transient until they've been observed
/// in the wild and determined to be worth retrying. This prevents us from
/// burning retries on errors that will never resolve, like a bad credential.
pub trait IsKnownTransient {
    /// Is this error likely to be transient?
    fn is_known_transient(&self) -> bool;
}

impl IsKnownTransient for reqwest::Error {
    fn is_known_transient(&self) -> bool {
        if let Some(status) = self.status() {
            status.is_known_transient()
        } else {
            // Timeouts, connection resets and other transport-level failures.
            // `reqwest` doesn't expose enough detail to be certain which of
            // these are permanent, so give them all a second chance.
            true
        }
    }
}

impl IsKnownTransient for StatusCode {
    fn is_known_transient(&self) -> bool {
        let transient_failures = [
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::GATEWAY_TIMEOUT,
        ];
        transient_failures.contains(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_and_bad_request_statuses_are_not_transient() {
        assert!(!StatusCode::UNAUTHORIZED.is_known_transient());
        assert!(!StatusCode::BAD_REQUEST.is_known_transient());
        assert!(StatusCode::TOO_MANY_REQUESTS.is_known_transient());
        assert!(StatusCode::SERVICE_UNAVAILABLE.is_known_transient());
    }
}
