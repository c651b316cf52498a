use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("offer expired")]
    OfferExpired,

    #[error("rate limited, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: i64 },

    #[error("invalid code, {attempts_remaining} attempts remaining")]
    InvalidCode { attempts_remaining: u32 },

    #[error("maximum verification attempts exceeded")]
    MaxAttemptsExceeded,

    #[error("no active challenge for this phone")]
    NoActiveChallenge,

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable code; clients match on this, not the message.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "not_found",
            AppError::Forbidden(_) => "forbidden",
            AppError::InvalidTransition(_) => "invalid_transition",
            AppError::OfferExpired => "offer_expired",
            AppError::RateLimited { .. } => "rate_limited",
            AppError::InvalidCode { .. } => "invalid_code",
            AppError::MaxAttemptsExceeded => "max_attempts_exceeded",
            AppError::NoActiveChallenge => "no_active_challenge",
            AppError::Validation(_) => "validation_error",
            AppError::Internal(_) => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::InvalidTransition(_) => StatusCode::CONFLICT,
            AppError::OfferExpired => StatusCode::GONE,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::InvalidCode { .. } => StatusCode::BAD_REQUEST,
            AppError::MaxAttemptsExceeded => StatusCode::TOO_MANY_REQUESTS,
            AppError::NoActiveChallenge => StatusCode::NOT_FOUND,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // Internal detail stays in the logs, never in the response body.
        let message = match &self {
            AppError::Internal(detail) => {
                tracing::error!(detail, "internal error");
                "internal error".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(json!({
            "code": self.code(),
            "error": message,
        }));

        (self.status(), body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_variant_has_a_stable_code() {
        let cases = [
            (AppError::NotFound("x".into()), "not_found"),
            (AppError::Forbidden("x".into()), "forbidden"),
            (
                AppError::InvalidTransition("cancel from ready".into()),
                "invalid_transition",
            ),
            (AppError::OfferExpired, "offer_expired"),
            (AppError::RateLimited { retry_after_secs: 3 }, "rate_limited"),
            (AppError::InvalidCode { attempts_remaining: 2 }, "invalid_code"),
            (AppError::MaxAttemptsExceeded, "max_attempts_exceeded"),
            (AppError::NoActiveChallenge, "no_active_challenge"),
            (AppError::Validation("x".into()), "validation_error"),
            (AppError::Internal("x".into()), "internal"),
        ];
        for (err, code) in cases {
            assert_eq!(err.code(), code);
        }
    }
}
