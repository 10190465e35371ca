//! Bearer token verification
//!
//! Signature, issuer and expiry are the job of a [`ProviderVerifier`]. On top
//! of that [`BearerTokenVerifier`] always enforces, locally:
//!
//! - the token's `aud` names this resource (RFC 8707), compared canonically
//! - `exp` is in the future
//! - every required scope is present
//!
//! and bounds the whole check with a timeout. Every failure is a
//! [`VerifyError`]; nothing here panics or hangs.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::jwks::{JwksClient, JwksError};
use crate::resource::same_resource;

/// Token verification failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    /// Not a well-formed token
    #[error("malformed token: {0}")]
    Malformed(String),
    /// Signature, algorithm or issuer rejected
    #[error("token rejected: {0}")]
    Rejected(String),
    /// `exp` has passed
    #[error("token expired")]
    Expired,
    /// `aud` does not name this resource
    #[error("token audience does not match this resource")]
    AudienceMismatch,
    /// A required scope is missing
    #[error("insufficient scope: requires `{0}`")]
    InsufficientScope(String),
    /// Verification keys could not be obtained
    #[error("verification unavailable: {0}")]
    Unavailable(String),
    /// Verification did not finish in time
    #[error("verification timed out")]
    Timeout,
}

impl VerifyError {
    /// Whether the fault lies with the broker or provider rather than the token
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout)
    }
}

impl From<JwksError> for VerifyError {
    fn from(err: JwksError) -> Self {
        match err {
            JwksError::UnknownKey(_) => Self::Rejected(err.to_string()),
            other => Self::Unavailable(other.to_string()),
        }
    }
}

/// A claim that may be a single string or an array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    /// `"value"`
    One(String),
    /// `["a", "b"]`
    Many(Vec<String>),
}

impl OneOrMany {
    /// All values
    pub fn values(&self) -> Vec<&str> {
        match self {
            Self::One(v) => vec![v.as_str()],
            Self::Many(vs) => vs.iter().map(String::as_str).collect(),
        }
    }

    /// Whether any value equals `needle`
    pub fn contains(&self, needle: &str) -> bool {
        self.values().contains(&needle)
    }
}

/// Claims the broker reads from an access token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    /// Issuer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    /// Audience
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<OneOrMany>,
    /// Expiry, seconds since the epoch
    pub exp: u64,
    /// Issued at
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<u64>,
    /// Authorized party
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azp: Option<String>,
    /// Client id (RFC 9068)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Space-separated scopes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Scopes as some providers spell them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scp: Option<OneOrMany>,
    /// Email of the signed-in user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Upstream provider that authenticated the user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Token id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
}

impl TokenClaims {
    /// Granted scopes from `scope` and `scp`
    pub fn scopes(&self) -> BTreeSet<String> {
        let mut scopes: BTreeSet<String> = self
            .scope
            .iter()
            .flat_map(|s| s.split_whitespace())
            .map(str::to_string)
            .collect();
        if let Some(scp) = &self.scp {
            scopes.extend(
                scp.values()
                    .into_iter()
                    .flat_map(str::split_whitespace)
                    .map(str::to_string),
            );
        }
        scopes
    }
}

/// Provider-specific identity details
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct AuthExtra {
    /// Subject at the provider
    pub subject: Option<String>,
    /// Email of the signed-in user
    pub email: Option<String>,
    /// Provider name
    pub provider: Option<String>,
}

/// Verified identity for the duration of one request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthInfo {
    /// Client the token was issued to
    pub client_id: String,
    /// Granted scopes
    pub scopes: BTreeSet<String>,
    /// Token expiry
    pub expires_at: DateTime<Utc>,
    /// Resource the token is bound to
    pub resource: String,
    /// Provider details
    pub extra: AuthExtra,
}

impl AuthInfo {
    /// Whether the token grants `scope`
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.contains(scope)
    }
}

/// Signature, issuer and expiry verification
#[async_trait]
pub trait ProviderVerifier: Send + Sync + fmt::Debug {
    /// Verify a token and return its claims
    async fn verify(&self, token: &str) -> Result<TokenClaims, VerifyError>;
}

enum KeySource {
    Secret(DecodingKey),
    Jwks(JwksClient),
}

/// JWT verification against a shared HS256 secret or a JWKS endpoint
pub struct JwtProviderVerifier {
    keys: KeySource,
    issuer: Option<String>,
    leeway: Duration,
}

impl fmt::Debug for JwtProviderVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys = match &self.keys {
            KeySource::Secret(_) => "secret".to_string(),
            KeySource::Jwks(client) => client.jwks_uri().to_string(),
        };
        f.debug_struct("JwtProviderVerifier")
            .field("keys", &keys)
            .field("issuer", &self.issuer)
            .finish()
    }
}

const JWKS_ALGORITHMS: [Algorithm; 3] = [Algorithm::RS256, Algorithm::ES256, Algorithm::PS256];

impl JwtProviderVerifier {
    /// Verify HS256 tokens signed with `secret`
    pub fn with_secret(secret: &SecretString) -> Self {
        Self {
            keys: KeySource::Secret(DecodingKey::from_secret(secret.expose_secret().as_bytes())),
            issuer: None,
            leeway: Duration::from_secs(60),
        }
    }

    /// Verify asymmetric tokens against a JWKS endpoint
    pub fn with_jwks(client: JwksClient) -> Self {
        Self {
            keys: KeySource::Jwks(client),
            issuer: None,
            leeway: Duration::from_secs(60),
        }
    }

    /// Require this `iss`
    #[must_use]
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }

    /// Clock skew tolerance for `nbf` and `exp`
    #[must_use]
    pub fn with_leeway(mut self, leeway: Duration) -> Self {
        self.leeway = leeway;
        self
    }

    fn validation(&self, alg: Algorithm) -> Validation {
        let mut validation = Validation::new(alg);
        // Audience is checked canonically by BearerTokenVerifier
        validation.validate_aud = false;
        validation.leeway = self.leeway.as_secs();
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer]);
        }
        validation
    }
}

fn map_jwt_error(err: &jsonwebtoken::errors::Error) -> VerifyError {
    match err.kind() {
        ErrorKind::ExpiredSignature => VerifyError::Expired,
        ErrorKind::InvalidToken
        | ErrorKind::Base64(_)
        | ErrorKind::Json(_)
        | ErrorKind::Utf8(_)
        | ErrorKind::MissingRequiredClaim(_) => VerifyError::Malformed(err.to_string()),
        _ => VerifyError::Rejected(err.to_string()),
    }
}

#[async_trait]
impl ProviderVerifier for JwtProviderVerifier {
    async fn verify(&self, token: &str) -> Result<TokenClaims, VerifyError> {
        let header = decode_header(token).map_err(|e| VerifyError::Malformed(e.to_string()))?;

        let key = match &self.keys {
            KeySource::Secret(key) => {
                if header.alg != Algorithm::HS256 {
                    return Err(VerifyError::Rejected(format!(
                        "algorithm {:?} not allowed",
                        header.alg
                    )));
                }
                key.clone()
            }
            KeySource::Jwks(client) => {
                if !JWKS_ALGORITHMS.contains(&header.alg) {
                    return Err(VerifyError::Rejected(format!(
                        "algorithm {:?} not allowed",
                        header.alg
                    )));
                }
                let kid = header
                    .kid
                    .as_deref()
                    .ok_or_else(|| VerifyError::Malformed("token header has no kid".into()))?;
                let jwk = client.find_key(kid).await?;
                DecodingKey::from_jwk(&jwk).map_err(|e| VerifyError::Unavailable(e.to_string()))?
            }
        };

        decode::<TokenClaims>(token, &key, &self.validation(header.alg))
            .map(|data| data.claims)
            .map_err(|e| {
                debug!(target: "authgate::gateway", error = %e, "token signature check failed");
                map_jwt_error(&e)
            })
    }
}

/// Resource-bound bearer token verification
#[derive(Debug, Clone)]
pub struct BearerTokenVerifier {
    provider: Arc<dyn ProviderVerifier>,
    resource: String,
    required_scopes: Vec<String>,
    timeout: Duration,
}

impl BearerTokenVerifier {
    /// Verify tokens for `resource` (canonical identifier)
    pub fn new(provider: Arc<dyn ProviderVerifier>, resource: impl Into<String>) -> Self {
        Self {
            provider,
            resource: resource.into(),
            required_scopes: Vec::new(),
            timeout: Duration::from_secs(5),
        }
    }

    /// Scopes every token must carry
    #[must_use]
    pub fn with_required_scopes(mut self, scopes: Vec<String>) -> Self {
        self.required_scopes = scopes;
        self
    }

    /// Bound on a single verification
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Resource identifier tokens must be bound to
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Verify a raw bearer token
    ///
    /// # Errors
    ///
    /// Returns the [`VerifyError`] for the first failed check.
    pub async fn verify(&self, token: &str) -> Result<AuthInfo, VerifyError> {
        validate_format(token)?;

        let claims = tokio::time::timeout(self.timeout, self.provider.verify(token))
            .await
            .map_err(|_| VerifyError::Timeout)??;

        let now = Utc::now().timestamp();
        if i64::try_from(claims.exp).map_or(true, |exp| exp <= now) {
            return Err(VerifyError::Expired);
        }

        let bound = claims
            .aud
            .as_ref()
            .is_some_and(|aud| aud.values().iter().any(|a| same_resource(a, &self.resource)));
        if !bound {
            return Err(VerifyError::AudienceMismatch);
        }

        let scopes = claims.scopes();
        if let Some(missing) = self.required_scopes.iter().find(|s| !scopes.contains(*s)) {
            return Err(VerifyError::InsufficientScope(missing.clone()));
        }

        let expires_at = DateTime::from_timestamp(claims.exp as i64, 0)
            .ok_or_else(|| VerifyError::Malformed("exp out of range".into()))?;

        Ok(AuthInfo {
            client_id: claims
                .azp
                .or(claims.client_id)
                .or_else(|| claims.sub.clone())
                .unwrap_or_default(),
            scopes,
            expires_at,
            resource: self.resource.clone(),
            extra: AuthExtra {
                subject: claims.sub,
                email: claims.email,
                provider: claims.provider,
            },
        })
    }
}

/// Split an `Authorization` header value into its bearer token
///
/// The scheme is matched case-insensitively.
pub fn extract_bearer(header: &str) -> Option<&str> {
    let mut parts = header.split_whitespace();
    let scheme = parts.next()?;
    let token = parts.next()?;
    if parts.next().is_some() || !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    Some(token)
}

fn validate_format(token: &str) -> Result<(), VerifyError> {
    if !(10..=10_000).contains(&token.len()) {
        return Err(VerifyError::Malformed("token length out of range".into()));
    }
    let charset: HashSet<u8> = b"-._~+/=".iter().copied().collect();
    if !token.bytes().all(|b| b.is_ascii_alphanumeric() || charset.contains(&b)) {
        return Err(VerifyError::Malformed("token contains invalid characters".into()));
    }
    Ok(())
}
