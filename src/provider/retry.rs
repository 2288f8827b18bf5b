//! Retry classification for provider diagnostics.
//!
//! The plugin protocol reports failures as free-form diagnostics, so the only
//! portable signal is the error code embedded in the rendered message. The
//! code sets below are copied from the AWS SDK v1 retryer, which the pinned
//! Terraform AWS provider is built on.

use std::time::Duration;

pub(crate) const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

const RETRYABLE_CODES: &[&str] = &[
    "RequestError",
    "RequestTimeout",
    "ResponseTimeout",
    // Glacier's flavor of RequestTimeout
    "RequestTimeoutException",
];

const THROTTLE_CODES: &[&str] = &[
    "ProvisionedThroughputExceededException",
    // SNS, XRay, ResourceGroupsTagging API
    "ThrottledException",
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
    "RequestThrottled",
    "RequestThrottledException",
    // Lambda functions
    "TooManyRequestsException",
    // Route53
    "PriorRequestNotComplete",
    "TransactionInProgressException",
    "EC2ThrottledException",
];

const CREDS_EXPIRED_CODES: &[&str] = &["ExpiredToken", "ExpiredTokenException", "RequestExpired"];

/// Returns true if the operation that produced this error message is worth
/// retrying within its budget.
pub fn should_retry(message: &str) -> bool {
    is_code_retryable(message) || is_code_throttle(message)
}

fn is_code_retryable(message: &str) -> bool {
    contains_any(message, RETRYABLE_CODES) || is_code_expired_creds(message)
}

fn is_code_throttle(message: &str) -> bool {
    contains_any(message, THROTTLE_CODES)
}

fn is_code_expired_creds(message: &str) -> bool {
    contains_any(message, CREDS_EXPIRED_CODES)
}

fn contains_any(message: &str, codes: &[&str]) -> bool {
    codes.iter().any(|code| message.contains(code))
}

pub(crate) fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}
