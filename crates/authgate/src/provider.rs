//! Upstream identity provider
//!
//! The broker is a confidential client of one OpenID Connect provider. It
//! sends the user there with its own `client_id`, then trades the returned
//! code for an ID token at the provider's token endpoint.

use std::fmt;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::config::ProviderConfig;
use crate::error::BrokerError;
use crate::redact::{sanitize_fields, scrub};
use crate::verify::OneOrMany;

/// Identity asserted by the upstream provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamIdentity {
    /// Provider-scoped subject identifier
    pub subject: String,
    /// Email address, if released
    pub email: Option<String>,
    /// Whether the provider verified the email
    pub email_verified: Option<bool>,
    /// Display name
    pub name: Option<String>,
    /// Provider name from configuration
    pub provider: String,
}

/// Code exchange failures
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Provider settings cannot produce a request
    #[error("provider misconfigured: {0}")]
    Config(String),
    /// Network failure reaching the provider
    #[error("provider unreachable: {0}")]
    Transport(String),
    /// Provider did not answer in time
    #[error("provider timed out")]
    Timeout,
    /// Provider refused the exchange
    #[error("provider rejected code exchange with HTTP {status}: {error}")]
    Rejected {
        /// HTTP status
        status: u16,
        /// OAuth `error` code, or `unknown`
        error: String,
    },
    /// Provider answered with something unusable
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
}

impl From<ExchangeError> for BrokerError {
    fn from(err: ExchangeError) -> Self {
        match err {
            ExchangeError::Transport(_) | ExchangeError::Timeout => {
                Self::UpstreamUnavailable(err.to_string())
            }
            other => Self::Server(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// An identity provider the broker delegates sign-in to
#[async_trait]
pub trait UpstreamProvider: Send + Sync + fmt::Debug {
    /// Route segment for the provider's exchange endpoint
    fn name(&self) -> &str;

    /// Authorization URL carrying `state` and the broker's redirect URI
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::Config`] if the provider endpoint is unusable.
    fn authorize_url(&self, state: &str, redirect_uri: &str) -> Result<Url, ExchangeError>;

    /// Trade an upstream authorization code for the signed-in identity
    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<UpstreamIdentity, ExchangeError>;
}

#[derive(Debug, Deserialize)]
struct ProviderTokenResponse {
    id_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IdTokenClaims {
    sub: String,
    aud: OneOrMany,
    email: Option<String>,
    email_verified: Option<bool>,
    name: Option<String>,
}

/// Generic OpenID Connect provider over reqwest
pub struct OidcProvider {
    name: String,
    authorize_url: Url,
    token_url: Url,
    client_id: String,
    client_secret: SecretString,
    scopes: Vec<String>,
    extra_params: Vec<(String, String)>,
    http: reqwest::Client,
}

impl fmt::Debug for OidcProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OidcProvider")
            .field("name", &self.name)
            .field("authorize_url", &self.authorize_url.as_str())
            .field("token_url", &self.token_url.as_str())
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl OidcProvider {
    /// Build a provider from configuration
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::Config`] for unparseable endpoints or an HTTP
    /// client that cannot be built.
    pub fn new(config: &ProviderConfig) -> Result<Self, ExchangeError> {
        let authorize_url = Url::parse(&config.authorize_url)
            .map_err(|e| ExchangeError::Config(format!("authorize_url: {e}")))?;
        let token_url = Url::parse(&config.token_url)
            .map_err(|e| ExchangeError::Config(format!("token_url: {e}")))?;

        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(config.timeout())
            .build()
            .map_err(|e| ExchangeError::Config(e.to_string()))?;

        Ok(Self {
            name: config.name.clone(),
            authorize_url,
            token_url,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            scopes: config.scopes.clone(),
            extra_params: config
                .extra_params
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            http,
        })
    }

    fn identity_from_id_token(&self, id_token: &str) -> Result<UpstreamIdentity, ExchangeError> {
        // Received straight from the token endpoint over TLS; the payload is
        // trusted without a signature check (OIDC Core 3.1.3.7).
        let payload = id_token
            .split('.')
            .nth(1)
            .ok_or_else(|| ExchangeError::InvalidResponse("id_token is not a JWT".into()))?;
        let bytes = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(|_| ExchangeError::InvalidResponse("id_token payload is not base64url".into()))?;
        let claims: IdTokenClaims = serde_json::from_slice(&bytes)
            .map_err(|e| ExchangeError::InvalidResponse(format!("id_token claims: {e}")))?;

        if !claims.aud.contains(&self.client_id) {
            return Err(ExchangeError::InvalidResponse(
                "id_token audience does not include this client".into(),
            ));
        }
        if claims.sub.is_empty() {
            return Err(ExchangeError::InvalidResponse("id_token has empty sub".into()));
        }

        Ok(UpstreamIdentity {
            subject: claims.sub,
            email: claims.email,
            email_verified: claims.email_verified,
            name: claims.name,
            provider: self.name.clone(),
        })
    }
}

#[async_trait]
impl UpstreamProvider for OidcProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn authorize_url(&self, state: &str, redirect_uri: &str) -> Result<Url, ExchangeError> {
        if self.authorize_url.cannot_be_a_base() {
            return Err(ExchangeError::Config("authorize_url is not a base URL".into()));
        }
        let mut url = self.authorize_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", &self.client_id)
                .append_pair("redirect_uri", redirect_uri)
                .append_pair("scope", &self.scopes.join(" "))
                .append_pair("state", state);
            for (key, value) in &self.extra_params {
                query.append_pair(key, value);
            }
        }
        Ok(url)
    }

    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<UpstreamIdentity, ExchangeError> {
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.expose_secret().as_str()),
        ];

        debug!(target: "authgate::oauth", provider = %self.name, "exchanging upstream code");
        let response = self
            .http
            .post(self.token_url.clone())
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let parsed: Option<serde_json::Value> = serde_json::from_str(&body).ok();
            let error = parsed
                .as_ref()
                .and_then(|v| v.get("error"))
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string();
            let logged = parsed.map_or_else(|| scrub(&body), |v| sanitize_fields(&v).to_string());
            warn!(
                target: "authgate::oauth",
                provider = %self.name,
                status = status.as_u16(),
                body = %logged,
                "upstream code exchange rejected"
            );
            return Err(ExchangeError::Rejected {
                status: status.as_u16(),
                error,
            });
        }

        let tokens: ProviderTokenResponse = response
            .json()
            .await
            .map_err(|e| ExchangeError::InvalidResponse(e.to_string()))?;
        let id_token = tokens
            .id_token
            .ok_or_else(|| ExchangeError::InvalidResponse("no id_token in response".into()))?;

        self.identity_from_id_token(&id_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn unsigned_jwt(claims: &serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
        format!("{header}.{payload}.c2ln")
    }

    fn config(server_uri: &str) -> ProviderConfig {
        ProviderConfig {
            name: "test-idp".into(),
            authorize_url: format!("{server_uri}/authorize"),
            token_url: format!("{server_uri}/token"),
            client_id: "broker-client".into(),
            client_secret: SecretString::new("broker-secret".into()),
            ..ProviderConfig::default()
        }
    }

    #[test]
    fn test_authorize_url_carries_broker_client() {
        let provider = OidcProvider::new(&config("https://idp.example.com")).unwrap();
        let url = provider
            .authorize_url("opaque.state", "https://broker.example.com/callback")
            .unwrap();
        let pairs: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();

        assert_eq!(url.path(), "/authorize");
        assert_eq!(pairs["client_id"], "broker-client");
        assert_eq!(pairs["redirect_uri"], "https://broker.example.com/callback");
        assert_eq!(pairs["state"], "opaque.state");
        assert_eq!(pairs["scope"], "openid profile email");
        assert_eq!(pairs["access_type"], "offline");
        assert_eq!(pairs["prompt"], "consent");
    }

    #[tokio::test]
    async fn test_exchange_reads_identity() {
        let server = MockServer::start().await;
        let id_token = unsigned_jwt(&json!({
            "sub": "10769150350006150715113082367",
            "aud": "broker-client",
            "email": "jsmith@example.com",
            "email_verified": true,
        }));
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=upstream-code"))
            .and(body_string_contains("client_secret=broker-secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "ya29.opaque",
                "id_token": id_token,
                "token_type": "Bearer",
                "expires_in": 3599,
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = OidcProvider::new(&config(&server.uri())).unwrap();
        let identity = provider
            .exchange_code("upstream-code", "https://broker.example.com/callback")
            .await
            .unwrap();

        assert_eq!(identity.subject, "10769150350006150715113082367");
        assert_eq!(identity.email.as_deref(), Some("jsmith@example.com"));
        assert_eq!(identity.provider, "test-idp");
    }

    #[tokio::test]
    async fn test_exchange_rejects_foreign_audience() {
        let server = MockServer::start().await;
        let id_token = unsigned_jwt(&json!({"sub": "u1", "aud": ["someone-else"]}));
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id_token": id_token})))
            .mount(&server)
            .await;

        let provider = OidcProvider::new(&config(&server.uri())).unwrap();
        let err = provider.exchange_code("c", "https://b/cb").await.unwrap_err();
        assert!(matches!(err, ExchangeError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_exchange_surfaces_provider_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_grant",
                "error_description": "Bad Request",
            })))
            .mount(&server)
            .await;

        let provider = OidcProvider::new(&config(&server.uri())).unwrap();
        let err = provider.exchange_code("stale", "https://b/cb").await.unwrap_err();
        assert!(matches!(
            err,
            ExchangeError::Rejected { status: 400, ref error } if error == "invalid_grant"
        ));
    }

    #[tokio::test]
    async fn test_exchange_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_delay(std::time::Duration::from_secs(3)))
            .mount(&server)
            .await;

        let cfg = ProviderConfig {
            timeout_secs: 1,
            ..config(&server.uri())
        };
        let provider = OidcProvider::new(&cfg).unwrap();
        let err = provider.exchange_code("c", "https://b/cb").await.unwrap_err();
        assert!(matches!(err, ExchangeError::Timeout));
        assert!(matches!(BrokerError::from(err), BrokerError::UpstreamUnavailable(_)));
    }
}
