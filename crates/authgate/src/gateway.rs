//! Admission and bearer authentication middleware
//!
//! [`require_bearer`] guards the protected resource: gate, extract, verify,
//! then attach the verified [`AuthInfo`] to the request. Handlers read it with
//! the [`Authenticated`] extractor. The identity lives in the request's
//! extensions and is dropped with the request.
//!
//! ```ignore
//! let mcp = Router::new()
//!     .route("/mcp", post(handle))
//!     .layer(middleware::from_fn_with_state(state.clone(), require_bearer));
//!
//! async fn handle(Authenticated(auth): Authenticated) -> String {
//!     auth.client_id
//! }
//! ```

use axum::{
    Json,
    extract::{FromRequestParts, Request, State},
    http::{HeaderValue, StatusCode, header, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{debug, error, warn};

use crate::error::BrokerError;
use crate::gate::{GateProfile, RequestFacts, SecurityDecision};
use crate::metadata::WwwAuthenticate;
use crate::redact::fingerprint;
use crate::state::BrokerState;
use crate::verify::{AuthInfo, VerifyError, extract_bearer};

/// A `401`/`403` answer carrying a bearer challenge
#[derive(Debug, Clone)]
pub struct AuthChallenge {
    status: StatusCode,
    www_authenticate: String,
    error: &'static str,
    description: String,
}

impl AuthChallenge {
    /// No usable credentials were presented
    pub fn missing(state: &BrokerState) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            www_authenticate: challenge(state).build(),
            error: "unauthorized",
            description: "Valid bearer token required".to_string(),
        }
    }

    /// The token failed verification
    pub fn invalid_token(state: &BrokerState, reason: &VerifyError) -> Self {
        let description = reason.to_string();
        Self {
            status: StatusCode::UNAUTHORIZED,
            www_authenticate: challenge(state)
                .with_error("invalid_token")
                .with_error_description(description.clone())
                .build(),
            error: "invalid_token",
            description,
        }
    }

    /// The token is valid but lacks `scope`
    pub fn insufficient_scope(state: &BrokerState, scope: &str) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            www_authenticate: challenge(state)
                .with_scope(scope)
                .with_error("insufficient_scope")
                .build(),
            error: "insufficient_scope",
            description: format!("scope `{scope}` is required"),
        }
    }

    /// HTTP status
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// `WWW-Authenticate` value
    pub fn www_authenticate(&self) -> &str {
        &self.www_authenticate
    }
}

fn challenge(state: &BrokerState) -> WwwAuthenticate {
    let config = state.config();
    WwwAuthenticate::new(config.realm.as_str(), config.resource_metadata_url())
}

impl IntoResponse for AuthChallenge {
    fn into_response(self) -> Response {
        let body = json!({
            "error": self.error,
            "error_description": self.description,
        });
        let mut response = (self.status, Json(body)).into_response();
        match HeaderValue::from_str(&self.www_authenticate) {
            Ok(value) => {
                response
                    .headers_mut()
                    .insert(header::WWW_AUTHENTICATE, value);
            }
            Err(e) => error!(target: "authgate::gateway", error = %e, "unencodable challenge"),
        }
        response
    }
}

fn admit(state: &BrokerState, facts: &RequestFacts, profile: GateProfile) -> Option<Response> {
    match state.gate().evaluate(facts, profile, 1) {
        SecurityDecision::Allow => None,
        SecurityDecision::Deny(reason) => Some(BrokerError::SecurityDenied(reason).into_response()),
    }
}

fn facts_of(state: &BrokerState, request: Request) -> (RequestFacts, Request) {
    let (parts, body) = request.into_parts();
    let facts = state.gate().facts(&parts);
    (facts, http::Request::from_parts(parts, body))
}

/// Gate the `oauth` profile
pub async fn gate_oauth(
    State(state): State<BrokerState>,
    request: Request,
    next: Next,
) -> Response {
    gate(&state, GateProfile::OAuth, request, next).await
}

/// Gate the `discovery` profile
pub async fn gate_discovery(
    State(state): State<BrokerState>,
    request: Request,
    next: Next,
) -> Response {
    gate(&state, GateProfile::Discovery, request, next).await
}

async fn gate(state: &BrokerState, profile: GateProfile, request: Request, next: Next) -> Response {
    let (facts, request) = facts_of(state, request);
    if let Some(denied) = admit(state, &facts, profile) {
        return denied;
    }
    next.run(request).await
}

/// Gate the `protected` profile and authenticate the bearer token
pub async fn require_bearer(
    State(state): State<BrokerState>,
    request: Request,
    next: Next,
) -> Response {
    let (facts, mut request) = facts_of(&state, request);
    if let Some(denied) = admit(&state, &facts, GateProfile::Protected) {
        return denied;
    }

    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(extract_bearer)
        .map(str::to_string);
    let Some(token) = token else {
        debug!(target: "authgate::gateway", path = %facts.path, "no bearer token presented");
        return AuthChallenge::missing(&state).into_response();
    };

    match state.verifier().verify(&token).await {
        Ok(auth) => {
            debug!(
                target: "authgate::gateway",
                client_id = %auth.client_id,
                token = %fingerprint(&token),
                "bearer token verified"
            );
            request.extensions_mut().insert(auth);
            next.run(request).await
        }
        Err(err) if err.is_unavailable() => {
            BrokerError::UpstreamUnavailable(err.to_string()).into_response()
        }
        Err(VerifyError::InsufficientScope(scope)) => {
            warn!(
                target: "authgate::gateway",
                token = %fingerprint(&token),
                scope = %scope,
                "bearer token lacks required scope"
            );
            AuthChallenge::insufficient_scope(&state, &scope).into_response()
        }
        Err(err) => {
            warn!(
                target: "authgate::gateway",
                token = %fingerprint(&token),
                client_ip = %facts.client_ip,
                reason = %err,
                "bearer token rejected"
            );
            AuthChallenge::invalid_token(&state, &err).into_response()
        }
    }
}

/// The verified identity of the current request
#[derive(Debug, Clone)]
pub struct Authenticated(pub AuthInfo);

impl<S> FromRequestParts<S> for Authenticated
where
    S: Send + Sync,
{
    type Rejection = BrokerError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthInfo>()
            .cloned()
            .map(Authenticated)
            .ok_or_else(|| BrokerError::server("route is not behind require_bearer"))
    }
}
