//! `GET /authorize`
//!
//! Validates the client's request, parks it as a [`PendingGrant`] under a
//! fresh local code and sends the browser to the upstream provider with a
//! signed continuation state. Nothing is minted or stored until the redirect
//! URI has been accepted; once it has, parameter errors go back to the client
//! as an OAuth error redirect.

use axum::{
    extract::{Query, State, rejection::QueryRejection},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info};

use crate::continuation::ContinuationState;
use crate::error::BrokerError;
use crate::grant::PendingGrant;
use crate::pkce::{CodeChallengeMethod, validate_challenge};
use crate::redact::fingerprint;
use crate::redirect::{RedirectUriClass, classify};
use crate::resource::validate_resource_uri;
use crate::response::{ErrorRedirect, found};
use crate::state::BrokerState;
use crate::store::mint_code;

/// Longest client `state` accepted
pub const MAX_STATE_LEN: usize = 1024;

/// Query parameters of an authorization request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthorizationRequest {
    /// Must be `code`
    pub response_type: Option<String>,
    /// Public client identifier
    pub client_id: Option<String>,
    /// Where the result is delivered
    pub redirect_uri: Option<String>,
    /// Space-separated scopes
    pub scope: Option<String>,
    /// Opaque client state
    pub state: Option<String>,
    /// PKCE challenge
    pub code_challenge: Option<String>,
    /// PKCE method, `S256` only
    pub code_challenge_method: Option<String>,
    /// RFC 8707 target resource
    pub resource: Option<String>,
}

/// Why a request was refused
#[derive(Debug)]
pub enum AuthorizeRejection {
    /// Answered directly; the redirect URI is not trusted
    Direct(BrokerError),
    /// Answered through the client's redirect URI
    Redirect {
        /// Validated client redirect URI
        redirect_uri: String,
        /// OAuth error code
        error: &'static str,
        /// Human-readable detail
        description: String,
        /// Client state to echo
        state: Option<String>,
    },
}

impl IntoResponse for AuthorizeRejection {
    fn into_response(self) -> Response {
        match self {
            Self::Direct(err) => err.into_response(),
            Self::Redirect {
                redirect_uri,
                error,
                description,
                state,
            } => ErrorRedirect::new(redirect_uri, error, description, state).into_response(),
        }
    }
}

/// An authorization request that passed every check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedRequest {
    /// Client identifier
    pub client_id: String,
    /// Accepted redirect URI
    pub redirect_uri: String,
    /// Shape the redirect URI matched
    pub redirect_class: RedirectUriClass,
    /// Granted scope
    pub scope: String,
    /// Canonical resource identifier
    pub resource: String,
    /// PKCE challenge, `None` only for an allowed loopback opt-out
    pub code_challenge: Option<String>,
    /// Client state
    pub state: Option<String>,
}

/// Check an authorization request against the broker's policy
///
/// # Errors
///
/// Returns [`AuthorizeRejection::Direct`] when the redirect URI is missing or
/// not an accepted shape, and [`AuthorizeRejection::Redirect`] for every other
/// problem.
pub fn validate_request(
    state: &BrokerState,
    request: AuthorizationRequest,
) -> Result<ValidatedRequest, AuthorizeRejection> {
    let config = state.config();

    let redirect_uri = request
        .redirect_uri
        .filter(|uri| !uri.is_empty())
        .ok_or_else(|| {
            AuthorizeRejection::Direct(BrokerError::InvalidRedirect(
                "redirect_uri is required".into(),
            ))
        })?;
    let redirect_class = classify(&redirect_uri).ok_or_else(|| {
        AuthorizeRejection::Direct(BrokerError::InvalidRedirect(
            "redirect_uri is not registered".into(),
        ))
    })?;

    let client_state = request.state.filter(|s| !s.is_empty());
    let reject = |error: &'static str, description: String, state: Option<String>| {
        AuthorizeRejection::Redirect {
            redirect_uri: redirect_uri.clone(),
            error,
            description,
            state,
        }
    };

    if client_state.as_ref().is_some_and(|s| s.len() > MAX_STATE_LEN) {
        return Err(reject(
            "invalid_request",
            format!("state exceeds {MAX_STATE_LEN} characters"),
            None,
        ));
    }

    match request.response_type.as_deref() {
        Some("code") => {}
        Some(other) => {
            return Err(reject(
                "unsupported_response_type",
                format!("response_type `{other}` is not supported"),
                client_state,
            ));
        }
        None => {
            return Err(reject(
                "invalid_request",
                "response_type is required".into(),
                client_state,
            ));
        }
    }

    let Some(client_id) = request.client_id.filter(|id| !id.is_empty()) else {
        return Err(reject(
            "invalid_request",
            "client_id is required".into(),
            client_state,
        ));
    };

    let code_challenge = match (
        request.code_challenge.as_deref(),
        request.code_challenge_method.as_deref(),
    ) {
        (Some(challenge), Some(method)) => {
            if let Err(e) = method.parse::<CodeChallengeMethod>() {
                return Err(reject("invalid_request", e.to_string(), client_state));
            }
            if let Err(e) = validate_challenge(challenge) {
                return Err(reject("invalid_request", e.to_string(), client_state));
            }
            Some(challenge.to_string())
        }
        // A challenge without a method means `plain`
        (Some(_), None) => {
            return Err(reject(
                "invalid_request",
                "code_challenge_method must be S256".into(),
                client_state,
            ));
        }
        (None, Some(_)) => {
            return Err(reject(
                "invalid_request",
                "code_challenge is required".into(),
                client_state,
            ));
        }
        (None, None) if config.allow_pkce_opt_out && redirect_class.is_loopback() => {
            debug!(target: "authgate::oauth", %client_id, "loopback client opted out of PKCE");
            None
        }
        (None, None) => {
            return Err(reject(
                "invalid_request",
                "code_challenge is required".into(),
                client_state,
            ));
        }
    };

    let scope = match request.scope.as_deref().map(str::trim) {
        None | Some("") => config.default_scope.clone(),
        Some(requested) => {
            if let Some(unknown) = requested
                .split_whitespace()
                .find(|s| !config.supported_scopes.iter().any(|supported| supported == s))
            {
                return Err(reject(
                    "invalid_scope",
                    format!("scope `{unknown}` is not supported"),
                    client_state,
                ));
            }
            requested.split_whitespace().collect::<Vec<_>>().join(" ")
        }
    };

    let resource = match request.resource.as_deref() {
        None | Some("") => state.resource().to_string(),
        Some(requested) => match validate_resource_uri(requested) {
            Ok(canonical) if canonical == state.resource() => canonical,
            Ok(_) => {
                return Err(reject(
                    "invalid_target",
                    "resource is not served by this authorization server".into(),
                    client_state,
                ));
            }
            Err(e) => {
                return Err(reject("invalid_target", e.to_string(), client_state));
            }
        },
    };

    if config.require_state && client_state.is_none() {
        return Err(reject(
            "invalid_request",
            "state is required".into(),
            None,
        ));
    }

    Ok(ValidatedRequest {
        client_id,
        redirect_uri,
        redirect_class,
        scope,
        resource,
        code_challenge,
        state: client_state,
    })
}

/// `GET /authorize`
pub async fn authorize(
    State(state): State<BrokerState>,
    query: Result<Query<AuthorizationRequest>, QueryRejection>,
) -> Response {
    let request = match query {
        Ok(Query(request)) => request,
        Err(rejection) => {
            return BrokerError::InvalidRequest(rejection.body_text()).into_response();
        }
    };

    let validated = match validate_request(&state, request) {
        Ok(validated) => validated,
        Err(rejection) => {
            if let AuthorizeRejection::Redirect {
                error,
                ref description,
                ..
            } = rejection
            {
                info!(
                    target: "authgate::oauth",
                    error,
                    description = %description,
                    "authorization request rejected"
                );
            }
            return rejection.into_response();
        }
    };

    match begin_upstream(&state, validated).await {
        Ok(location) => found(&location),
        Err(err) => err.into_response(),
    }
}

async fn begin_upstream(
    state: &BrokerState,
    request: ValidatedRequest,
) -> Result<String, BrokerError> {
    let config = state.config();
    let code = mint_code()?;
    let now = Utc::now();
    let ttl = chrono::Duration::from_std(config.grant_ttl())
        .map_err(|e| BrokerError::server(format!("grant TTL out of range: {e}")))?;

    let grant = PendingGrant {
        client_id: request.client_id,
        redirect_uri: request.redirect_uri,
        scope: request.scope,
        resource: request.resource,
        code_challenge_method: request.code_challenge.as_ref().map(|_| CodeChallengeMethod::S256),
        code_challenge: request.code_challenge,
        state: request.state,
        created_at: now,
        expires_at: now + ttl,
    };

    let continuation = ContinuationState {
        code: code.clone(),
        state: grant.state.clone(),
        redirect_uri: grant.redirect_uri.clone(),
        provider_redirect_uri: config.provider_redirect_uri(),
        resource: grant.resource.clone(),
    };
    let encoded = state.codec().encode(&continuation)?;
    let upstream = state
        .provider()
        .authorize_url(&encoded, &continuation.provider_redirect_uri)
        .map_err(|e| BrokerError::server(e.to_string()))?;

    info!(
        target: "authgate::oauth",
        client_id = %grant.client_id,
        redirect_class = ?request.redirect_class,
        scope = %grant.scope,
        pkce = grant.code_challenge.is_some(),
        code = %fingerprint(&code),
        "authorization request accepted"
    );
    state.pending().put(code, grant).await?;

    Ok(upstream.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use crate::pkce::s256_challenge;
    use secrecy::SecretString;

    const LOOPBACK: &str = "http://127.0.0.1:4567/oauth/callback";

    fn state_with(adjust: impl FnOnce(&mut BrokerConfig)) -> BrokerState {
        let mut config = BrokerConfig {
            base_url: "https://mcp.example.com".into(),
            state_secret: SecretString::new("s".repeat(32)),
            ..BrokerConfig::default()
        };
        config.token.signing_secret = SecretString::new("t".repeat(32));
        config.provider.client_id = "broker-client".into();
        adjust(&mut config);
        BrokerState::new(config).unwrap()
    }

    fn request() -> AuthorizationRequest {
        AuthorizationRequest {
            response_type: Some("code".into()),
            client_id: Some("cli".into()),
            redirect_uri: Some(LOOPBACK.into()),
            scope: Some("openid mcp:read".into()),
            state: Some("xyz".into()),
            code_challenge: Some(s256_challenge(&"v".repeat(43))),
            code_challenge_method: Some("S256".into()),
            resource: None,
        }
    }

    fn redirect_error(result: Result<ValidatedRequest, AuthorizeRejection>) -> &'static str {
        match result {
            Err(AuthorizeRejection::Redirect { error, .. }) => error,
            other => panic!("expected redirect rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_valid_request() {
        let state = state_with(|_| {});
        let validated = validate_request(&state, request()).unwrap();
        assert_eq!(validated.scope, "openid mcp:read");
        assert_eq!(validated.resource, "https://mcp.example.com/mcp");
        assert_eq!(validated.redirect_class, RedirectUriClass::LoopbackOAuthCallback);
    }

    #[test]
    fn test_redirect_uri_problems_are_direct() {
        let state = state_with(|_| {});
        for uri in [None, Some(""), Some("https://evil.example.com/cb")] {
            let result = validate_request(
                &state,
                AuthorizationRequest {
                    redirect_uri: uri.map(String::from),
                    ..request()
                },
            );
            assert!(matches!(
                result,
                Err(AuthorizeRejection::Direct(BrokerError::InvalidRedirect(_)))
            ));
        }
    }

    #[test]
    fn test_parameter_errors_redirect() {
        let state = state_with(|_| {});

        let wrong_type = AuthorizationRequest {
            response_type: Some("token".into()),
            ..request()
        };
        assert_eq!(
            redirect_error(validate_request(&state, wrong_type)),
            "unsupported_response_type"
        );

        let no_client = AuthorizationRequest {
            client_id: None,
            ..request()
        };
        assert_eq!(redirect_error(validate_request(&state, no_client)), "invalid_request");

        let bad_scope = AuthorizationRequest {
            scope: Some("openid admin".into()),
            ..request()
        };
        assert_eq!(redirect_error(validate_request(&state, bad_scope)), "invalid_scope");

        let other_resource = AuthorizationRequest {
            resource: Some("https://other.example.com/mcp".into()),
            ..request()
        };
        assert_eq!(
            redirect_error(validate_request(&state, other_resource)),
            "invalid_target"
        );
    }

    #[test]
    fn test_pkce_rules() {
        let state = state_with(|_| {});

        let plain = AuthorizationRequest {
            code_challenge_method: Some("plain".into()),
            ..request()
        };
        assert_eq!(redirect_error(validate_request(&state, plain)), "invalid_request");

        let implicit_plain = AuthorizationRequest {
            code_challenge_method: None,
            ..request()
        };
        assert_eq!(
            redirect_error(validate_request(&state, implicit_plain)),
            "invalid_request"
        );

        let missing = AuthorizationRequest {
            code_challenge: None,
            code_challenge_method: None,
            ..request()
        };
        assert_eq!(
            redirect_error(validate_request(&state, missing.clone())),
            "invalid_request"
        );

        let lenient = state_with(|c| c.allow_pkce_opt_out = true);
        let validated = validate_request(&lenient, missing).unwrap();
        assert_eq!(validated.code_challenge, None);

        let deep_link = AuthorizationRequest {
            redirect_uri: Some("vscode://publisher.ext/auth".into()),
            code_challenge: None,
            code_challenge_method: None,
            ..request()
        };
        assert_eq!(
            redirect_error(validate_request(&lenient, deep_link)),
            "invalid_request"
        );
    }

    #[test]
    fn test_defaults_and_canonical_resource() {
        let state = state_with(|_| {});
        let validated = validate_request(
            &state,
            AuthorizationRequest {
                scope: None,
                resource: Some("HTTPS://MCP.example.com/mcp/".into()),
                ..request()
            },
        )
        .unwrap();
        assert_eq!(validated.scope, state.config().default_scope);
        assert_eq!(validated.resource, "https://mcp.example.com/mcp");
    }

    #[test]
    fn test_required_state() {
        let state = state_with(|c| c.require_state = true);
        let stateless = AuthorizationRequest {
            state: None,
            ..request()
        };
        assert_eq!(redirect_error(validate_request(&state, stateless)), "invalid_request");

        let huge = AuthorizationRequest {
            state: Some("s".repeat(MAX_STATE_LEN + 1)),
            ..request()
        };
        assert_eq!(redirect_error(validate_request(&state, huge)), "invalid_request");
    }
}
