//! `GET|POST {callback_path}/{provider}`
//!
//! Redeems the upstream code for an identity and hands the client its own
//! authorization code. The pending grant is taken before anything else so a
//! replayed callback finds nothing.

use axum::{
    extract::{
        Form, Path, Query, State,
        rejection::{FormRejection, QueryRejection},
    },
    response::{IntoResponse, Response},
};
use tracing::{info, warn};

use crate::callback::{CallbackParams, decode_continuation, post_params, query_params};
use crate::continuation::{ContinuationError, ContinuationState};
use crate::error::BrokerError;
use crate::grant::{AuthorizedGrant, PendingGrant};
use crate::provider::UpstreamIdentity;
use crate::redact::fingerprint;
use crate::response::{ErrorRedirect, found, with_params};
use crate::state::BrokerState;
use crate::store::mint_code;

/// Error codes forwarded from the provider as-is; anything else becomes
/// `access_denied`
pub const FORWARDED_ERRORS: [&str; 11] = [
    "invalid_request",
    "unauthorized_client",
    "access_denied",
    "unsupported_response_type",
    "invalid_scope",
    "server_error",
    "temporarily_unavailable",
    "interaction_required",
    "login_required",
    "consent_required",
    "account_selection_required",
];

/// Map an upstream error code onto one the client understands
pub fn client_error_code(upstream: &str) -> &'static str {
    FORWARDED_ERRORS
        .iter()
        .find(|known| **known == upstream)
        .copied()
        .unwrap_or("access_denied")
}

/// `GET {callback_path}/{provider}`
pub async fn exchange_get(
    State(state): State<BrokerState>,
    Path(provider): Path<String>,
    query: Result<Query<CallbackParams>, QueryRejection>,
) -> Response {
    complete(&state, &provider, query_params(query)).await
}

/// `POST {callback_path}/{provider}`
pub async fn exchange_post(
    State(state): State<BrokerState>,
    Path(provider): Path<String>,
    query: Result<Query<CallbackParams>, QueryRejection>,
    form: Result<Form<CallbackParams>, FormRejection>,
) -> Response {
    complete(&state, &provider, post_params(query, form)).await
}

async fn complete(state: &BrokerState, provider: &str, params: CallbackParams) -> Response {
    let (continuation, grant) = match claim(state, provider, &params).await {
        Ok(claimed) => claimed,
        Err(err) => {
            warn!(
                target: "authgate::oauth",
                provider,
                kind = err.kind(),
                reason = %err,
                "code exchange rejected"
            );
            return err.into_response();
        }
    };

    if let Some(upstream_error) = params.error.as_deref() {
        let error = client_error_code(upstream_error);
        info!(
            target: "authgate::oauth",
            provider,
            client_id = %grant.client_id,
            upstream_error,
            error,
            "provider returned an error"
        );
        let description = params
            .error_description
            .unwrap_or_else(|| "The identity provider did not authorize the request.".into());
        return ErrorRedirect::new(grant.redirect_uri, error, description, grant.state)
            .into_response();
    }

    let Some(upstream_code) = params.code.as_deref().filter(|c| !c.is_empty()) else {
        warn!(target: "authgate::oauth", provider, "provider returned neither code nor error");
        return ErrorRedirect::new(
            grant.redirect_uri,
            "server_error",
            "The identity provider returned no authorization code.",
            grant.state,
        )
        .into_response();
    };

    let identity = match state
        .provider()
        .exchange_code(upstream_code, &continuation.provider_redirect_uri)
        .await
    {
        Ok(identity) => identity,
        Err(err) => {
            let err = BrokerError::from(err);
            warn!(
                target: "authgate::oauth",
                provider,
                client_id = %grant.client_id,
                kind = err.kind(),
                reason = %err,
                "upstream code exchange failed"
            );
            return ErrorRedirect::new(
                grant.redirect_uri,
                "server_error",
                "Sign-in with the identity provider failed.",
                grant.state,
            )
            .into_response();
        }
    };

    match authorize_client(state, grant, identity).await {
        Ok(location) => found(&location),
        Err(err) => err.into_response(),
    }
}

/// Verify the continuation and take its pending grant
async fn claim(
    state: &BrokerState,
    provider: &str,
    params: &CallbackParams,
) -> Result<(ContinuationState, PendingGrant), BrokerError> {
    let continuation = decode_continuation(state, params.state.as_deref())?;
    if provider != state.provider().name() {
        return Err(BrokerError::InvalidRequest(format!("unknown provider `{provider}`")));
    }

    let grant = state
        .pending()
        .take(&continuation.code)
        .await?
        .ok_or(ContinuationError::UnknownCode)?;

    if grant.redirect_uri != continuation.redirect_uri
        || grant.resource != continuation.resource
        || grant.state != continuation.state
    {
        return Err(ContinuationError::Mismatch.into());
    }
    Ok((continuation, grant))
}

async fn authorize_client(
    state: &BrokerState,
    grant: PendingGrant,
    identity: UpstreamIdentity,
) -> Result<String, BrokerError> {
    let code = mint_code()?;
    let mut params = vec![("code", code.as_str())];
    if let Some(client_state) = grant.state.as_deref() {
        params.push(("state", client_state));
    }
    let location = with_params(&grant.redirect_uri, params)?;

    info!(
        target: "authgate::oauth",
        client_id = %grant.client_id,
        provider = %identity.provider,
        subject = %fingerprint(&identity.subject),
        code = %fingerprint(&code),
        "client authorized"
    );
    state
        .authorized()
        .put(code, AuthorizedGrant { grant, identity })
        .await?;
    Ok(location.into())
}
