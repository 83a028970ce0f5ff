use std::any::Any;
use std::time::Duration;

use advisor_contracts::ErrorResponse;
use axum::http::StatusCode;

use crate::aggregator::{AggregateError, UpstreamFailure};
use crate::rate_limit::RateLimitError;
use crate::validation::ValidationError;

const INVALID_INPUT: &str = "Invalid input";
const INTERNAL_ERROR: &str = "An internal error occurred";

/// Every way a gateway call can fail. The client-facing shape of each variant
/// is decided by [`normalize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    Validation(String),
    SessionExpired,
    SessionNotFound,
    RateLimitExceeded { retry_after: Duration },
    UpstreamError(String),
    UpstreamTimeout,
    EmptyResponse,
    Cancelled,
    Internal(String),
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Validation(_) => "ERR_VALIDATION",
            GatewayError::SessionExpired => "ERR_SESSION_EXPIRED",
            GatewayError::SessionNotFound => "ERR_SESSION_NOT_FOUND",
            GatewayError::RateLimitExceeded { .. } => "ERR_RATE_LIMITED",
            GatewayError::UpstreamError(_) => "ERR_UPSTREAM",
            GatewayError::UpstreamTimeout => "ERR_UPSTREAM_TIMEOUT",
            GatewayError::EmptyResponse => "ERR_EMPTY_RESPONSE",
            GatewayError::Cancelled => "ERR_CANCELLED",
            GatewayError::Internal(_) => "ERR_INTERNAL",
        }
    }

    /// Rejections are decided locally before any downstream call is made.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            GatewayError::Validation(_)
                | GatewayError::SessionExpired
                | GatewayError::SessionNotFound
                | GatewayError::RateLimitExceeded { .. }
        )
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Validation(_)
            | GatewayError::SessionExpired
            | GatewayError::SessionNotFound => StatusCode::BAD_REQUEST,
            GatewayError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::UpstreamError(_)
            | GatewayError::UpstreamTimeout
            | GatewayError::EmptyResponse
            | GatewayError::Cancelled
            | GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GatewayError::RateLimitExceeded { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "handler panicked".to_string());
        GatewayError::Internal(format!("panic: {}", message))
    }
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayError::Validation(reason) => write!(f, "validation failed: {}", reason),
            GatewayError::SessionExpired => write!(f, "session expired"),
            GatewayError::SessionNotFound => write!(f, "session not found"),
            GatewayError::RateLimitExceeded { retry_after } => {
                write!(f, "rate limit exceeded, retry after {}ms", retry_after.as_millis())
            }
            GatewayError::UpstreamError(detail) => write!(f, "agent service error: {}", detail),
            GatewayError::UpstreamTimeout => write!(f, "agent service timed out"),
            GatewayError::EmptyResponse => write!(f, "agent service returned no fragments"),
            GatewayError::Cancelled => write!(f, "request cancelled"),
            GatewayError::Internal(detail) => write!(f, "internal error: {}", detail),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<ValidationError> for GatewayError {
    fn from(value: ValidationError) -> Self {
        GatewayError::Validation(value.to_string())
    }
}

impl From<RateLimitError> for GatewayError {
    fn from(value: RateLimitError) -> Self {
        match value {
            RateLimitError::Exceeded { retry_after } => {
                GatewayError::RateLimitExceeded { retry_after }
            }
            RateLimitError::UnknownSession => GatewayError::SessionNotFound,
        }
    }
}

impl From<UpstreamFailure> for GatewayError {
    fn from(value: UpstreamFailure) -> Self {
        GatewayError::UpstreamError(value.to_string())
    }
}

impl From<AggregateError> for GatewayError {
    fn from(value: AggregateError) -> Self {
        match value {
            AggregateError::Empty => GatewayError::EmptyResponse,
            AggregateError::Cancelled => GatewayError::Cancelled,
            AggregateError::Upstream(failure) => failure.into(),
            AggregateError::Malformed(reason) => {
                GatewayError::UpstreamError(format!("malformed fragment: {}", reason))
            }
            AggregateError::Terminated => {
                GatewayError::Internal("aggregator used after completion".to_string())
            }
        }
    }
}

/// Maps an error onto the client-facing taxonomy. Server-side failures carry a
/// generic message only.
pub fn normalize(err: &GatewayError) -> ErrorResponse {
    let status = err.status().as_u16();
    let (error, details) = match err {
        GatewayError::Validation(reason) => (INVALID_INPUT, Some(reason.clone())),
        GatewayError::SessionExpired => (
            "Session expired",
            Some("start a new conversation".to_string()),
        ),
        GatewayError::SessionNotFound => (
            "Session not found",
            Some("start a new conversation".to_string()),
        ),
        GatewayError::RateLimitExceeded { retry_after } => (
            "Rate limit exceeded",
            Some(format!(
                "retry after {} seconds",
                retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0)
            )),
        ),
        GatewayError::UpstreamError(_)
        | GatewayError::UpstreamTimeout
        | GatewayError::EmptyResponse
        | GatewayError::Cancelled
        | GatewayError::Internal(_) => (INTERNAL_ERROR, None),
    };

    ErrorResponse {
        error: error.to_string(),
        status,
        details,
    }
}
