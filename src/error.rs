//! Error types and error codes for the gate and relay

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::fmt;

/// Error codes returned by the API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Identity is temporarily blacklisted
    Forbidden,
    /// Rate cap for the tier exceeded
    RateLimited,
    /// Missing or invalid client token
    TokenRequired,
    /// Malformed signature headers
    BadSignature,
    /// Target URL or a redirect hop failed the safety predicate
    UnsafeUrl,
    /// Invalid relay request parameters
    InvalidRequest,
    /// Request or response body over the configured cap
    PayloadTooLarge,
    /// Outbound fetch exceeded its deadline
    Timeout,
    /// DNS/connect/TLS failure reaching the target
    ConnectFailed,
    /// Unknown/internal error
    Unknown,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Forbidden => write!(f, "FORBIDDEN"),
            ErrorCode::RateLimited => write!(f, "RATE_LIMITED"),
            ErrorCode::TokenRequired => write!(f, "TOKEN_REQUIRED"),
            ErrorCode::BadSignature => write!(f, "BAD_SIGNATURE"),
            ErrorCode::UnsafeUrl => write!(f, "UNSAFE_URL"),
            ErrorCode::InvalidRequest => write!(f, "INVALID_REQUEST"),
            ErrorCode::PayloadTooLarge => write!(f, "PAYLOAD_TOO_LARGE"),
            ErrorCode::Timeout => write!(f, "TIMEOUT"),
            ErrorCode::ConnectFailed => write!(f, "CONNECT_FAILED"),
            ErrorCode::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Standard error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: ErrorCode,
    /// Freshly minted client token, present on 401 rejections only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, code: ErrorCode) -> Self {
        Self {
            error: error.into(),
            code,
            token: None,
        }
    }

    pub fn with_token(mut self, token: String) -> Self {
        self.token = Some(token);
        self
    }
}

/// API error with HTTP status code
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub response: ErrorResponse,
}

impl ApiError {
    pub fn new(status: StatusCode, error: impl Into<String>, code: ErrorCode) -> Self {
        Self {
            status,
            response: ErrorResponse::new(error, code),
        }
    }

    /// Blacklist and required-header rejections. Deliberately generic:
    /// the triggering rule is never disclosed to the caller.
    pub fn forbidden() -> Self {
        Self::new(StatusCode::FORBIDDEN, "Access denied", ErrorCode::Forbidden)
    }

    pub fn rate_limited() -> Self {
        Self::new(
            StatusCode::TOO_MANY_REQUESTS,
            "Too many requests, slow down",
            ErrorCode::RateLimited,
        )
    }

    /// 401 carrying the replacement token for the bootstrap handshake
    pub fn token_required(token: String) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            response: ErrorResponse::new(
                "Missing or invalid client token",
                ErrorCode::TokenRequired,
            )
            .with_token(token),
        }
    }

    pub fn bad_signature() -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "Invalid request signature",
            ErrorCode::BadSignature,
        )
    }

    /// Safety rejection. Always the same message no matter which rule matched.
    pub fn unsafe_url() -> Self {
        Self::new(
            StatusCode::FORBIDDEN,
            "URL not allowed",
            ErrorCode::UnsafeUrl,
        )
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message, ErrorCode::InvalidRequest)
    }

    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            message,
            ErrorCode::PayloadTooLarge,
        )
    }

    pub fn timeout() -> Self {
        Self::new(
            StatusCode::GATEWAY_TIMEOUT,
            "Request timed out",
            ErrorCode::Timeout,
        )
    }

    pub fn connect_failed() -> Self {
        Self::new(
            StatusCode::BAD_GATEWAY,
            "Failed to connect to target server",
            ErrorCode::ConnectFailed,
        )
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            message,
            ErrorCode::Unknown,
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.response)).into_response()
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.response.code, self.response.error)
    }
}

impl std::error::Error for ApiError {}

/// Classify an outbound client error into a sanitized API error.
///
/// The raw error text (internal hostnames, resolver detail) is logged by
/// the caller, never forwarded.
pub fn classify_fetch_error(err: &reqwest::Error) -> ApiError {
    if err.is_timeout() {
        ApiError::timeout()
    } else if err.is_connect() || err.is_request() {
        ApiError::connect_failed()
    } else {
        ApiError::unknown("Upstream request failed")
    }
}
