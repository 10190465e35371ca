//! Error taxonomy for the broker
//!
//! Every failure a request can hit maps onto one [`BrokerError`] variant, and
//! every variant renders into a direct HTTP response. Validation and security
//! failures carry a client-facing description; internal faults are logged with
//! full context and rendered without detail.

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use tokio::time::Instant;
use tracing::error;

use crate::config::ConfigError;
use crate::continuation::ContinuationError;
use crate::gate::DenyReason;

/// Result type for broker operations
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// Broker error kinds
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BrokerError {
    /// The security gate refused the request
    #[error("request denied by security gate: {0}")]
    SecurityDenied(DenyReason),

    /// Malformed or missing OAuth parameters
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The redirect URI failed validation; never answered with a redirect
    #[error("invalid redirect_uri: {0}")]
    InvalidRedirect(String),

    /// The continuation state on a callback could not be trusted
    #[error("invalid continuation state: {0}")]
    InvalidContinuationState(#[from] ContinuationError),

    /// Bearer token failed verification
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// The upstream identity provider could not be reached or timed out
    #[error("upstream provider unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Unexpected internal fault
    #[error("internal error: {0}")]
    Server(String),

    /// Broker configuration is unusable
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl BrokerError {
    /// Convenience constructor for internal faults
    pub fn server(message: impl Into<String>) -> Self {
        Self::Server(message.into())
    }

    /// Taxonomy name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SecurityDenied(_) => "security_denied",
            Self::InvalidRequest(_) => "invalid_request",
            Self::InvalidRedirect(_) => "invalid_redirect",
            Self::InvalidContinuationState(_) => "invalid_continuation_state",
            Self::InvalidToken(_) => "invalid_token",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::Server(_) | Self::Config(_) => "server_error",
        }
    }

    /// HTTP status for the direct response
    pub fn status(&self) -> StatusCode {
        match self {
            Self::SecurityDenied(DenyReason::RateLimit { .. }) => StatusCode::TOO_MANY_REQUESTS,
            Self::SecurityDenied(_) => StatusCode::FORBIDDEN,
            Self::InvalidRequest(_)
            | Self::InvalidRedirect(_)
            | Self::InvalidContinuationState(_) => StatusCode::BAD_REQUEST,
            Self::InvalidToken(_) => StatusCode::UNAUTHORIZED,
            Self::UpstreamUnavailable(_) | Self::Server(_) | Self::Config(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// The `error` member of the JSON body
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::SecurityDenied(DenyReason::RateLimit { .. }) => "rate_limit_exceeded",
            Self::SecurityDenied(DenyReason::Bot { .. }) => "bot_detected",
            Self::SecurityDenied(DenyReason::Shield { .. }) => "forbidden",
            Self::InvalidRequest(_)
            | Self::InvalidRedirect(_)
            | Self::InvalidContinuationState(_) => "invalid_request",
            Self::InvalidToken(_) => "invalid_token",
            Self::UpstreamUnavailable(_) | Self::Server(_) | Self::Config(_) => "server_error",
        }
    }

    fn public_description(&self) -> String {
        match self {
            Self::SecurityDenied(DenyReason::RateLimit { .. }) => {
                "Too many requests. Please try again later.".to_string()
            }
            Self::SecurityDenied(DenyReason::Bot { .. }) => {
                "Automated requests are not allowed.".to_string()
            }
            Self::SecurityDenied(DenyReason::Shield { .. }) => "Request blocked.".to_string(),
            Self::InvalidRequest(msg) => msg.clone(),
            Self::InvalidRedirect(msg) => format!("Invalid redirect_uri: {msg}"),
            // The decode failure reason stays in the logs
            Self::InvalidContinuationState(_) => {
                "The authorization response could not be processed.".to_string()
            }
            Self::InvalidToken(msg) => msg.clone(),
            Self::UpstreamUnavailable(_) | Self::Server(_) | Self::Config(_) => {
                "An unexpected error occurred.".to_string()
            }
        }
    }
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(target: "authgate", kind = self.kind(), error = %self, "request failed");
        }

        let mut body = json!({
            "error": self.error_code(),
            "error_description": self.public_description(),
        });

        let retry_after = match &self {
            Self::SecurityDenied(reason) => reason.retry_after_secs(Instant::now()),
            _ => None,
        };
        if let Some(secs) = retry_after {
            body["retry_after"] = json!(secs);
        }

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}
