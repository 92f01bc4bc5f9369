// SPDX-License-Identifier: GPL-3.0-or-later

use harmony_domain::ErrorCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Provider failure classes. `Transient` and `RateLimited` are retried by
/// the gateway; the rest surface immediately.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("transient provider failure: {0}")]
    Transient(String),

    #[error("permanent provider failure: {0}")]
    Permanent(String),

    #[error("rate limited by provider")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("provider authentication failed: {0}")]
    Auth(String),

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::RateLimited { .. })
    }

    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::RateLimited { .. } => ErrorCode::RateLimited,
            Self::Transient(_) | Self::Permanent(_) | Self::InvalidResponse(_) => {
                ErrorCode::DependencyError
            }
            Self::Auth(_) => ErrorCode::DependencyError,
        }
    }

    /// Stable label for `api.dependency` events.
    pub fn class(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::Permanent(_) => "permanent",
            Self::RateLimited { .. } => "rate_limited",
            Self::Auth(_) => "auth",
            Self::InvalidResponse(_) => "permanent",
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() || error.is_connect() {
            Self::Transient(error.to_string())
        } else if error.is_decode() {
            Self::InvalidResponse(error.to_string())
        } else {
            Self::Transient(error.to_string())
        }
    }
}

/// Map an HTTP status plus body excerpt into a classified failure.
pub(crate) fn classify_status(status: reqwest::StatusCode, body: &str, retry_after_ms: Option<u64>) -> ProviderError {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return ProviderError::RateLimited { retry_after_ms };
    }
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return ProviderError::Auth(format!("status {status}"));
    }
    if status.is_server_error() {
        return ProviderError::Transient(format!("status {status}: {body}"));
    }
    ProviderError::Permanent(format!("status {status}: {body}"))
}
