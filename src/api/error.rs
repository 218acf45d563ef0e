//! API error type and its HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::api::types::ApiErrorResponse;
use crate::error::Error;

/// Error returned by handlers.
#[derive(Debug)]
pub enum ApiError {
    /// 400.
    BadRequest(String),
    /// 409.
    Conflict(String),
    /// 429. The caller should retry later.
    TooManyRequests(String),
    /// 503.
    Unavailable(String),
    /// 500.
    Internal(String),
}

impl ApiError {
    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> &str {
        match self {
            ApiError::BadRequest(m)
            | ApiError::Conflict(m)
            | ApiError::TooManyRequests(m)
            | ApiError::Unavailable(m)
            | ApiError::Internal(m) => m,
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let message = err.to_string();
        match err {
            Error::Validation(_) => ApiError::BadRequest(message),
            Error::Conflict(_) => ApiError::Conflict(message),
            Error::CapacityExceeded { .. } => ApiError::TooManyRequests(message),
            Error::Cancelled(_) => ApiError::Unavailable(message),
            _ => ApiError::Internal(message),
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(status = %status, error = %self, "request failed");
        } else {
            tracing::debug!(status = %status, error = %self, "request rejected");
        }

        let body = ApiErrorResponse {
            error: self.message().to_string(),
            retryable: matches!(
                self,
                ApiError::TooManyRequests(_) | ApiError::Unavailable(_)
            ),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping() {
        let cases = [
            (Error::Validation("x".into()), StatusCode::BAD_REQUEST),
            (Error::Conflict("x".into()), StatusCode::CONFLICT),
            (Error::CapacityExceeded { max: 2 }, StatusCode::TOO_MANY_REQUESTS),
            (Error::Cancelled("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (Error::Remote("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test]
    fn test_capacity_message_names_limit() {
        let api = ApiError::from(Error::CapacityExceeded { max: 2 });
        assert!(api.to_string().contains('2'), "{api}");
    }
}
