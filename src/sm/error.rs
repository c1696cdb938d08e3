//! # Remote Errors
//!
//! Failure type of every `ServiceManagerClient` call.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SmError {
    /// The remote system answered with an error status
    #[error("service manager request failed with status {status}: {description}")]
    Api {
        status: u16,
        /// Error type reported by the remote system (e.g. `ConcurrentOperationInProgress`)
        error_type: Option<String>,
        description: String,
        /// Status reported by the downstream broker when proxied through a 502
        broker_status: Option<u16>,
        broker_error: Option<String>,
        retry_after: Option<Duration>,
    },
    #[error("malformed response from service manager: {0}")]
    MalformedResponse(String),
    #[error("service manager unreachable: {0}")]
    Transport(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl SmError {
    /// Plain API error without broker details
    #[must_use]
    pub fn api(status: u16, description: impl Into<String>) -> Self {
        SmError::Api {
            status,
            error_type: None,
            description: description.into(),
            broker_status: None,
            broker_error: None,
            retry_after: None,
        }
    }

    /// API error as proxied from the downstream broker
    #[must_use]
    pub fn broker(status: u16, broker_status: u16, description: impl Into<String>) -> Self {
        SmError::Api {
            status,
            error_type: None,
            description: description.into(),
            broker_status: Some(broker_status),
            broker_error: None,
            retry_after: None,
        }
    }

    /// HTTP status of the response, if there was one
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            SmError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Status used for classification: a 502 carrying a broker status is unwrapped
    #[must_use]
    pub fn effective_status(&self) -> Option<u16> {
        match self {
            SmError::Api {
                status: 502,
                broker_status: Some(broker),
                ..
            } => Some(*broker),
            SmError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    #[must_use]
    pub fn error_type(&self) -> Option<&str> {
        match self {
            SmError::Api { error_type, .. } => error_type.as_deref(),
            _ => None,
        }
    }

    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SmError::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// The remote resource does not exist (any more)
    #[must_use]
    pub fn is_gone(&self) -> bool {
        matches!(self.status(), Some(404) | Some(410))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_status_unwraps_bad_gateway_only() {
        assert_eq!(SmError::broker(502, 429, "x").effective_status(), Some(429));
        assert_eq!(SmError::broker(400, 429, "x").effective_status(), Some(400));
        assert_eq!(SmError::api(502, "x").effective_status(), Some(502));
        assert_eq!(
            SmError::Transport("refused".to_string()).effective_status(),
            None
        );
    }

    #[test]
    fn test_is_gone() {
        assert!(SmError::api(404, "x").is_gone());
        assert!(SmError::api(410, "x").is_gone());
        assert!(!SmError::api(400, "x").is_gone());
    }
}
