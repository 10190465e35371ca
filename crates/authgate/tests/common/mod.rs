//! Shared fixtures for the broker integration suites
//!
//! A wiremock server stands in for the upstream OIDC provider; every test
//! gets its own stores so flows never see each other's codes.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use authgate::config::BucketConfig;
use authgate::grant::{AuthorizedGrant, PendingGrant};
use authgate::store::MemoryGrantStore;
use authgate::verify::{OneOrMany, TokenClaims};
use authgate::{Authenticated, BrokerConfig, BrokerState};
use axum::{
    Json, Router,
    body::Body,
    extract::ConnectInfo,
    http::{Request, Response, header},
    routing::post,
};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{EncodingKey, Header, encode};
use secrecy::SecretString;
use serde_json::{Value, json};
use tower::ServiceExt;
use url::Url;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{body_string_contains, method, path},
};

pub const BROWSER_UA: &str =
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_0) AppleWebKit/605.1.15 (KHTML, like Gecko)";
pub const CLIENT_ID: &str = "mcp-cli";
pub const CLIENT_REDIRECT: &str = "http://127.0.0.1:45678/oauth/callback";
pub const BROKER_CLIENT_ID: &str = "broker-client";
pub const SIGNING_SECRET: &str = "signing-secret-signing-secret-32b";
pub const STATE_SECRET: &str = "state-secret-state-secret-state-32";
pub const RESOURCE: &str = "https://mcp.example.com/mcp";

/// RFC 7636 appendix B verifier and its S256 challenge
pub const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
pub const CHALLENGE: &str = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";

/// Mock upstream provider
pub struct MockProvider {
    pub server: MockServer,
}

impl MockProvider {
    pub async fn start() -> Self {
        Self {
            server: MockServer::start().await,
        }
    }

    /// Token endpoint that accepts `code` and asserts the given identity
    pub async fn accept_code(&self, code: &str, subject: &str, email: &str) {
        let id_token = unsigned_id_token(&json!({
            "iss": self.server.uri(),
            "aud": BROKER_CLIENT_ID,
            "sub": subject,
            "email": email,
            "email_verified": true,
            "name": "Test User",
        }));
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains(format!("code={code}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "ya29.upstream",
                "token_type": "Bearer",
                "expires_in": 3599,
                "id_token": id_token,
            })))
            .mount(&self.server)
            .await;
    }

    /// Token endpoint that refuses every code
    pub async fn reject_all(&self) {
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_grant",
                "error_description": "Bad Request",
            })))
            .mount(&self.server)
            .await;
    }

    pub fn config(&self) -> BrokerConfig {
        broker_config(&self.server.uri())
    }
}

pub fn unsigned_id_token(claims: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.signature")
}

/// Broker configuration pointing at a provider at `provider_uri`
pub fn broker_config(provider_uri: &str) -> BrokerConfig {
    let mut config = BrokerConfig {
        base_url: "https://mcp.example.com".into(),
        state_secret: SecretString::new(STATE_SECRET.into()),
        ..BrokerConfig::default()
    };
    config.token.signing_secret = SecretString::new(SIGNING_SECRET.into());
    config.provider.client_id = BROKER_CLIENT_ID.into();
    config.provider.client_secret = SecretString::new("provider-secret".into());
    config.provider.authorize_url = format!("{provider_uri}/authorize");
    config.provider.token_url = format!("{provider_uri}/token");
    config.provider.timeout_secs = 2;
    config
}

/// Generous buckets so flow tests never trip the rate limit
pub fn relaxed(mut config: BrokerConfig) -> BrokerConfig {
    config.security.protected = BucketConfig::new(1000, 1, 1000);
    config.security.oauth = BucketConfig::new(1000, 1, 1000);
    config.security.discovery = BucketConfig::new(1000, 1, 1000);
    config
}

/// State with private grant stores
pub fn isolated_state(config: BrokerConfig) -> BrokerState {
    BrokerState::builder(config)
        .pending_store(Arc::new(MemoryGrantStore::<PendingGrant>::new()))
        .authorized_store(Arc::new(MemoryGrantStore::<AuthorizedGrant>::new()))
        .build()
        .expect("test config is valid")
}

/// Echo handler for the protected resource
pub fn mcp_routes() -> Router {
    Router::new().route(
        "/mcp",
        post(|Authenticated(auth): Authenticated| async move {
            Json(json!({
                "client_id": auth.client_id,
                "subject": auth.extra.subject,
                "scopes": auth.scopes,
            }))
        }),
    )
}

pub fn app(state: BrokerState) -> Router {
    authgate::router::app(state, mcp_routes())
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::USER_AGENT, BROWSER_UA)
        .body(Body::empty())
        .expect("valid request")
}

pub fn form_post(uri: &str, body: String) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::USER_AGENT, BROWSER_UA)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(body))
        .expect("valid request")
}

pub fn bearer_post(uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::USER_AGENT, BROWSER_UA)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{}"))
        .expect("valid request")
}

/// Attach the socket peer the server would have recorded
pub fn from_peer(mut request: Request<Body>, peer: &str) -> Request<Body> {
    let addr: SocketAddr = peer.parse().expect("valid socket address");
    request.extensions_mut().insert(ConnectInfo(addr));
    request
}

pub async fn send(app: &Router, request: Request<Body>) -> Response<Body> {
    app.clone().oneshot(request).await.expect("router is infallible")
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("readable body");
    serde_json::from_slice(&bytes).expect("JSON body")
}

pub fn location(response: &Response<Body>) -> String {
    response
        .headers()
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .expect("Location header")
        .to_string()
}

/// Query parameter of an absolute or origin-relative URL
pub fn query_param(location: &str, key: &str) -> Option<String> {
    let url = Url::parse(location)
        .or_else(|_| Url::parse("http://relative.invalid").and_then(|base| base.join(location)))
        .expect("parseable location");
    url.query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

pub fn form(pairs: &[(&str, &str)]) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}

pub fn authorize_uri(extra: &[(&str, &str)]) -> String {
    let mut pairs = vec![
        ("response_type", "code"),
        ("client_id", CLIENT_ID),
        ("redirect_uri", CLIENT_REDIRECT),
        ("scope", "openid email mcp:read"),
        ("state", "client-state-123"),
        ("code_challenge", CHALLENGE),
        ("code_challenge_method", "S256"),
    ];
    for (key, value) in extra {
        pairs.retain(|(k, _)| k != key);
        if !value.is_empty() {
            pairs.push((*key, *value));
        }
    }
    format!("/authorize?{}", form(&pairs))
}

/// Drive `/authorize` through the exchange route and return the client code
pub async fn authorize_and_exchange(
    app: &Router,
    provider: &MockProvider,
    upstream_code: &str,
) -> String {
    let response = send(app, get(&authorize_uri(&[]))).await;
    assert_eq!(response.status(), 302, "authorize should redirect upstream");
    let upstream = location(&response);
    let continuation = query_param(&upstream, "state").expect("continuation state");
    assert!(upstream.starts_with(&provider.server.uri()));

    let callback = format!(
        "/callback?{}",
        form(&[("code", upstream_code), ("state", continuation.as_str())])
    );
    let forwarded = send(app, get(&callback)).await;
    assert_eq!(forwarded.status(), 302);
    let exchange = location(&forwarded);
    assert!(exchange.starts_with("/callback/google?"));

    let completed = send(app, get(&exchange)).await;
    assert_eq!(completed.status(), 302);
    let client_redirect = location(&completed);
    assert!(client_redirect.starts_with(CLIENT_REDIRECT));
    assert_eq!(
        query_param(&client_redirect, "state").as_deref(),
        Some("client-state-123")
    );
    query_param(&client_redirect, "code").expect("client code")
}

pub fn token_form(code: &str) -> String {
    form(&[
        ("grant_type", "authorization_code"),
        ("code", code),
        ("redirect_uri", CLIENT_REDIRECT),
        ("client_id", CLIENT_ID),
        ("code_verifier", VERIFIER),
    ])
}

/// HS256 token signed with the broker's key
pub fn mint(claims: &TokenClaims) -> String {
    encode(
        &Header::default(),
        claims,
        &EncodingKey::from_secret(SIGNING_SECRET.as_bytes()),
    )
    .expect("signable claims")
}

pub fn claims_for(client_id: &str, subject: &str) -> TokenClaims {
    let now = chrono::Utc::now().timestamp() as u64;
    TokenClaims {
        sub: Some(subject.into()),
        iss: Some("https://mcp.example.com".into()),
        aud: Some(OneOrMany::One(RESOURCE.into())),
        exp: now + 600,
        iat: Some(now),
        azp: Some(client_id.into()),
        client_id: None,
        scope: Some("openid mcp:read".into()),
        scp: None,
        email: None,
        provider: Some("google".into()),
        jti: None,
    }
}
