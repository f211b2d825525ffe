//! Policy API failure classes

use crate::retry::{RetryDecision, RetryableError};
use std::time::Duration;
use thiserror::Error;

/// Result type alias for policy API calls
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Classified policy API failure
///
/// Callers dispatch on the variant, never on the message.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    /// The addressed profile or entry does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// The API key was rejected
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The entry already exists
    #[error("already exists: {0}")]
    Duplicate(String),

    /// Too many requests
    #[error("rate limited{}", retry_suffix(.retry_after))]
    RateLimited { retry_after: Option<Duration> },

    /// Network failure, timeout or server error
    #[error("transient failure: {0}")]
    Transient(String),
}

fn retry_suffix(retry_after: &Option<Duration>) -> String {
    retry_after
        .map(|d| format!(", retry after {}s", d.as_secs()))
        .unwrap_or_default()
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound(_))
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, ApiError::Duplicate(_))
    }
}

impl RetryableError for ApiError {
    fn retry_decision(&self) -> RetryDecision {
        match self {
            ApiError::RateLimited {
                retry_after: Some(d),
            } => RetryDecision::RetryAfter(*d),
            ApiError::RateLimited { retry_after: None } => RetryDecision::Retry,
            ApiError::Transient(_) => RetryDecision::Retry,
            ApiError::NotFound(_) | ApiError::Auth(_) | ApiError::Duplicate(_) => {
                RetryDecision::NoRetry
            }
        }
    }
}
