//! `GET|POST {callback_path}`
//!
//! The upstream provider returns here. The router checks that the
//! continuation state is authentic and still names a live pending grant, then
//! forwards the browser to the provider-specific exchange route untouched.

use axum::{
    extract::{
        Form, Query, RawQuery, State,
        rejection::{FormRejection, QueryRejection},
    },
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::continuation::{ContinuationError, ContinuationState};
use crate::error::BrokerError;
use crate::redact::fingerprint;
use crate::response::{found, temporary_redirect};
use crate::state::BrokerState;

/// Parameters the upstream provider sends back
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    /// Upstream authorization code
    pub code: Option<String>,
    /// Continuation state
    pub state: Option<String>,
    /// Upstream error code
    pub error: Option<String>,
    /// Upstream error detail
    pub error_description: Option<String>,
}

impl CallbackParams {
    /// Fill absent fields from `fallback`
    #[must_use]
    pub fn or(self, fallback: Self) -> Self {
        Self {
            code: self.code.or(fallback.code),
            state: self.state.or(fallback.state),
            error: self.error.or(fallback.error),
            error_description: self.error_description.or(fallback.error_description),
        }
    }
}

/// Query parameters, or empty ones if the query does not parse
pub(crate) fn query_params(query: Result<Query<CallbackParams>, QueryRejection>) -> CallbackParams {
    query.map(|Query(params)| params).unwrap_or_default()
}

/// Form body merged over query parameters
pub(crate) fn post_params(
    query: Result<Query<CallbackParams>, QueryRejection>,
    form: Result<Form<CallbackParams>, FormRejection>,
) -> CallbackParams {
    let query = query_params(query);
    match form {
        Ok(Form(body)) => body.or(query),
        Err(rejection) => {
            debug!(
                target: "authgate::oauth",
                reason = %rejection.body_text(),
                "callback body not a form"
            );
            query
        }
    }
}

/// Verify and decode the continuation state
pub(crate) fn decode_continuation(
    state: &BrokerState,
    encoded: Option<&str>,
) -> Result<ContinuationState, ContinuationError> {
    let encoded = encoded.ok_or(ContinuationError::Missing)?;
    state.codec().decode(encoded)
}

async fn check(state: &BrokerState, params: &CallbackParams) -> Result<String, BrokerError> {
    let continuation = decode_continuation(state, params.state.as_deref())?;
    if state.pending().get(&continuation.code).await?.is_none() {
        return Err(ContinuationError::UnknownCode.into());
    }
    debug!(
        target: "authgate::oauth",
        code = %fingerprint(&continuation.code),
        "continuation state verified"
    );
    Ok(format!(
        "{}/{}",
        state.config().callback_path.trim_end_matches('/'),
        state.provider().name()
    ))
}

fn forward_target(path: String, raw_query: Option<String>) -> String {
    match raw_query {
        Some(query) if !query.is_empty() => format!("{path}?{query}"),
        _ => path,
    }
}

fn reject(err: BrokerError) -> Response {
    warn!(target: "authgate::oauth", kind = err.kind(), reason = %err, "callback rejected");
    err.into_response()
}

/// `GET {callback_path}`: `302` to the exchange route with the query intact
pub async fn callback_get(
    State(state): State<BrokerState>,
    RawQuery(raw_query): RawQuery,
    query: Result<Query<CallbackParams>, QueryRejection>,
) -> Response {
    let params = query_params(query);
    match check(&state, &params).await {
        Ok(path) => found(&forward_target(path, raw_query)),
        Err(err) => reject(err),
    }
}

/// `POST {callback_path}`: `307` so the browser replays the form body
pub async fn callback_post(
    State(state): State<BrokerState>,
    RawQuery(raw_query): RawQuery,
    query: Result<Query<CallbackParams>, QueryRejection>,
    form: Result<Form<CallbackParams>, FormRejection>,
) -> Response {
    let params = post_params(query, form);
    match check(&state, &params).await {
        Ok(path) => temporary_redirect(&forward_target(path, raw_query)),
        Err(err) => reject(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_fields_win_over_query() {
        let body = CallbackParams {
            code: Some("from-body".into()),
            ..CallbackParams::default()
        };
        let query = CallbackParams {
            code: Some("from-query".into()),
            state: Some("s".into()),
            ..CallbackParams::default()
        };
        let merged = body.or(query);
        assert_eq!(merged.code.as_deref(), Some("from-body"));
        assert_eq!(merged.state.as_deref(), Some("s"));
    }

    #[test]
    fn test_forward_target_keeps_query() {
        assert_eq!(
            forward_target("/callback/google".into(), Some("code=a&state=b".into())),
            "/callback/google?code=a&state=b"
        );
        assert_eq!(forward_target("/callback/google".into(), None), "/callback/google");
        assert_eq!(
            forward_target("/callback/google".into(), Some(String::new())),
            "/callback/google"
        );
    }
}
