//! `POST /token`
//!
//! Redeems a client authorization code for an access token bound to the
//! resource the grant was issued for. The code is taken from the store before
//! any check runs, so a failed attempt still burns it.

use std::fmt;
use std::time::Duration;

use axum::{
    Json,
    extract::{Form, State, rejection::FormRejection},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

use crate::config::BrokerConfig;
use crate::error::{BrokerError, BrokerResult};
use crate::grant::AuthorizedGrant;
use crate::pkce::verify_s256;
use crate::redact::fingerprint;
use crate::resource::same_resource;
use crate::state::BrokerState;
use crate::store::mint_code;
use crate::verify::{OneOrMany, TokenClaims};

/// Form body of a token request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenRequest {
    /// Must be `authorization_code`
    pub grant_type: Option<String>,
    /// Client authorization code
    pub code: Option<String>,
    /// Redirect URI used at `/authorize`
    pub redirect_uri: Option<String>,
    /// Public client identifier
    pub client_id: Option<String>,
    /// PKCE verifier
    pub code_verifier: Option<String>,
    /// RFC 8707 target resource
    pub resource: Option<String>,
}

/// Successful token response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenResponse {
    /// Signed JWT
    pub access_token: String,
    /// Always `Bearer`
    pub token_type: String,
    /// Lifetime in seconds
    pub expires_in: u64,
    /// Granted scope
    pub scope: String,
}

/// RFC 6749 section 5.2 error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenError {
    /// Error code
    pub error: &'static str,
    /// Human-readable detail
    pub description: String,
}

impl TokenError {
    fn new(error: &'static str, description: impl Into<String>) -> Self {
        Self {
            error,
            description: description.into(),
        }
    }

    fn invalid_request(description: impl Into<String>) -> Self {
        Self::new("invalid_request", description)
    }

    fn invalid_grant(description: impl Into<String>) -> Self {
        Self::new("invalid_grant", description)
    }

    fn status(&self) -> StatusCode {
        match self.error {
            "server_error" => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl From<BrokerError> for TokenError {
    fn from(err: BrokerError) -> Self {
        error!(
            target: "authgate::oauth",
            kind = err.kind(),
            error = %err,
            "token request failed"
        );
        Self::new("server_error", "An unexpected error occurred.")
    }
}

impl IntoResponse for TokenError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": self.error,
            "error_description": self.description,
        });
        no_store(self.status(), Json(body))
    }
}

fn no_store(status: StatusCode, body: impl IntoResponse) -> Response {
    let mut response = (status, body).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    response
}

/// Mints HS256 access tokens for authorized grants
pub struct AccessTokenIssuer {
    key: EncodingKey,
    issuer: String,
    ttl: Duration,
}

impl fmt::Debug for AccessTokenIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessTokenIssuer")
            .field("issuer", &self.issuer)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl AccessTokenIssuer {
    /// Issuer keyed by `token.signing_secret`
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            key: EncodingKey::from_secret(config.token.signing_secret.expose_secret().as_bytes()),
            issuer: config.token_issuer(),
            ttl: config.token.access_token_ttl(),
        }
    }

    /// `iss` of minted tokens
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Sign a token for `authorized`
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Server`] if no token id can be drawn or signing fails.
    pub fn issue(&self, authorized: &AuthorizedGrant) -> BrokerResult<TokenResponse> {
        let now = Utc::now().timestamp().max(0) as u64;
        let grant = &authorized.grant;
        let identity = &authorized.identity;

        let claims = TokenClaims {
            sub: Some(identity.subject.clone()),
            iss: Some(self.issuer.clone()),
            aud: Some(OneOrMany::One(grant.resource.clone())),
            exp: now + self.ttl.as_secs(),
            iat: Some(now),
            azp: Some(grant.client_id.clone()),
            client_id: None,
            scope: Some(grant.scope.clone()),
            scp: None,
            email: identity.email.clone(),
            provider: Some(identity.provider.clone()),
            jti: Some(mint_code()?),
        };

        let access_token = encode(&Header::new(Algorithm::HS256), &claims, &self.key)
            .map_err(|e| BrokerError::server(format!("token signing failed: {e}")))?;

        Ok(TokenResponse {
            access_token,
            token_type: "Bearer".to_string(),
            expires_in: self.ttl.as_secs(),
            scope: grant.scope.clone(),
        })
    }
}

/// Check a token request against the grant its code names
///
/// # Errors
///
/// Returns the [`TokenError`] for the first failed check.
pub fn check_grant(request: &TokenRequest, authorized: &AuthorizedGrant) -> Result<(), TokenError> {
    let grant = &authorized.grant;

    let client_id = request
        .client_id
        .as_deref()
        .ok_or_else(|| TokenError::invalid_request("client_id is required"))?;
    if client_id != grant.client_id {
        return Err(TokenError::invalid_grant("code was issued to another client"));
    }

    if request.redirect_uri.as_deref() != Some(grant.redirect_uri.as_str()) {
        return Err(TokenError::invalid_grant("redirect_uri does not match"));
    }

    match (grant.code_challenge.as_deref(), request.code_verifier.as_deref()) {
        (Some(challenge), Some(verifier)) => {
            verify_s256(verifier, challenge).map_err(|e| TokenError::invalid_grant(e.to_string()))?;
        }
        (Some(_), None) => return Err(TokenError::invalid_grant("code_verifier is required")),
        (None, Some(_)) => {
            return Err(TokenError::invalid_grant(
                "code_verifier sent for a grant without code_challenge",
            ));
        }
        (None, None) => {}
    }

    if let Some(resource) = request.resource.as_deref()
        && !same_resource(resource, &grant.resource)
    {
        return Err(TokenError::new(
            "invalid_target",
            "resource does not match the authorization request",
        ));
    }
    Ok(())
}

async fn redeem(state: &BrokerState, request: TokenRequest) -> Result<TokenResponse, TokenError> {
    match request.grant_type.as_deref() {
        Some("authorization_code") => {}
        Some(other) => {
            return Err(TokenError::new(
                "unsupported_grant_type",
                format!("grant_type `{other}` is not supported"),
            ));
        }
        None => return Err(TokenError::invalid_request("grant_type is required")),
    }

    let code = request
        .code
        .as_deref()
        .filter(|c| !c.is_empty())
        .ok_or_else(|| TokenError::invalid_request("code is required"))?;

    let authorized = state
        .authorized()
        .take(code)
        .await
        .map_err(BrokerError::from)?
        .ok_or_else(|| TokenError::invalid_grant("code is invalid or expired"))?;

    if let Err(err) = check_grant(&request, &authorized) {
        warn!(
            target: "authgate::oauth",
            client_id = %authorized.grant.client_id,
            code = %fingerprint(code),
            error = err.error,
            description = %err.description,
            "token request rejected"
        );
        return Err(err);
    }

    let response = state.issuer().issue(&authorized)?;
    info!(
        target: "authgate::oauth",
        client_id = %authorized.grant.client_id,
        scope = %response.scope,
        token = %fingerprint(&response.access_token),
        "access token issued"
    );
    Ok(response)
}

/// `POST /token`
pub async fn token(
    State(state): State<BrokerState>,
    form: Result<Form<TokenRequest>, FormRejection>,
) -> Response {
    let request = match form {
        Ok(Form(request)) => request,
        Err(rejection) => {
            return TokenError::invalid_request(rejection.body_text()).into_response();
        }
    };

    match redeem(&state, request).await {
        Ok(response) => no_store(StatusCode::OK, Json(response)),
        Err(err) => err.into_response(),
    }
}
