//! # Error Classifier
//!
//! Decides whether a remote failure is worth retrying.
//!
//! Rate limiting (429), gateway and availability faults (502, 503, 504) and
//! not-found (404) are transient. A 502 that wraps a downstream broker status
//! is classified by the broker status instead, so a proxied 429 is transient
//! and a proxied 400 is not. A 422 `ConcurrentOperationInProgress` and
//! failures without any response are transient too. Everything else is not.

use crate::sm::SmError;

const TRANSIENT_STATUSES: [u16; 5] = [429, 502, 503, 504, 404];

const CONCURRENT_OPERATION_IN_PROGRESS: &str = "ConcurrentOperationInProgress";

#[must_use]
pub fn is_transient(error: &SmError) -> bool {
    match error {
        SmError::Transport(_) => true,
        SmError::Api { .. } => match error.effective_status() {
            Some(status) if TRANSIENT_STATUSES.contains(&status) => true,
            Some(422) => error.error_type() == Some(CONCURRENT_OPERATION_IN_PROGRESS),
            _ => false,
        },
        SmError::MalformedResponse(_) | SmError::InvalidRequest(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_plain_statuses() {
        for status in [429, 502, 503, 504, 404] {
            assert!(is_transient(&SmError::api(status, "x")), "{status}");
        }
        for status in [400, 401, 403, 409, 410, 422, 500] {
            assert!(!is_transient(&SmError::api(status, "x")), "{status}");
        }
    }

    #[test]
    fn test_bad_gateway_is_classified_by_broker_status() {
        assert!(is_transient(&SmError::broker(502, 429, "rate limited")));
        assert!(is_transient(&SmError::broker(502, 503, "broker down")));
        assert!(!is_transient(&SmError::broker(502, 400, "bad request")));
    }

    #[test]
    fn test_rate_limit_with_retry_after_is_still_transient() {
        let err = SmError::Api {
            status: 429,
            error_type: None,
            description: "slow down".to_string(),
            broker_status: None,
            broker_error: None,
            retry_after: Some(Duration::from_secs(30)),
        };
        assert!(is_transient(&err));
    }

    #[test]
    fn test_concurrent_operation_is_transient() {
        let err = SmError::Api {
            status: 422,
            error_type: Some("ConcurrentOperationInProgress".to_string()),
            description: "operation in progress".to_string(),
            broker_status: None,
            broker_error: None,
            retry_after: None,
        };
        assert!(is_transient(&err));
    }

    #[test]
    fn test_transport_and_malformed() {
        assert!(is_transient(&SmError::Transport("connection refused".to_string())));
        assert!(!is_transient(&SmError::MalformedResponse("not json".to_string())));
    }
}
