//! Discovery documents and the `WWW-Authenticate` challenge
//!
//! - RFC 9728 protected resource metadata
//! - RFC 8414 authorization server metadata
//! - RFC 6750 bearer challenge, extended with RFC 9728 `resource_metadata`

use axum::{
    Json,
    extract::State,
    http::{HeaderValue, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use crate::state::BrokerState;

/// RFC 9728 protected resource metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedResourceMetadata {
    /// Canonical resource identifier
    pub resource: String,
    /// Issuers that mint tokens for this resource
    pub authorization_servers: Vec<String>,
    /// Scopes clients may request
    pub scopes_supported: Vec<String>,
    /// Always `["header"]`
    pub bearer_methods_supported: Vec<String>,
    /// Human-readable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_name: Option<String>,
}

impl ProtectedResourceMetadata {
    /// Document for the broker behind `state`
    pub fn for_broker(state: &BrokerState) -> Self {
        let config = state.config();
        Self {
            resource: state.resource().to_string(),
            authorization_servers: vec![config.origin().to_string()],
            scopes_supported: config.supported_scopes.clone(),
            bearer_methods_supported: vec!["header".to_string()],
            resource_name: config.resource_name.clone(),
        }
    }
}

/// RFC 8414 authorization server metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationServerMetadata {
    /// Issuer identifier
    pub issuer: String,
    /// `/authorize`
    pub authorization_endpoint: String,
    /// `/token`
    pub token_endpoint: String,
    /// Always `["code"]`
    pub response_types_supported: Vec<String>,
    /// Always `["authorization_code"]`
    pub grant_types_supported: Vec<String>,
    /// Always `["S256"]`
    pub code_challenge_methods_supported: Vec<String>,
    /// Scopes clients may request
    pub scopes_supported: Vec<String>,
    /// Always `["none"]`; clients are public
    pub token_endpoint_auth_methods_supported: Vec<String>,
}

impl AuthorizationServerMetadata {
    /// Document for the broker behind `state`
    pub fn for_broker(state: &BrokerState) -> Self {
        let config = state.config();
        let origin = config.origin();
        Self {
            issuer: config.token_issuer(),
            authorization_endpoint: format!("{origin}/authorize"),
            token_endpoint: format!("{origin}/token"),
            response_types_supported: vec!["code".to_string()],
            grant_types_supported: vec!["authorization_code".to_string()],
            code_challenge_methods_supported: vec!["S256".to_string()],
            scopes_supported: config.supported_scopes.clone(),
            token_endpoint_auth_methods_supported: vec!["none".to_string()],
        }
    }
}

fn cacheable(body: impl Serialize) -> Response {
    let mut response = Json(body).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=3600"),
    );
    response
}

/// `GET /.well-known/oauth-protected-resource`
pub async fn protected_resource_metadata(State(state): State<BrokerState>) -> Response {
    cacheable(ProtectedResourceMetadata::for_broker(&state))
}

/// `GET /.well-known/oauth-authorization-server`
pub async fn authorization_server_metadata(State(state): State<BrokerState>) -> Response {
    cacheable(AuthorizationServerMetadata::for_broker(&state))
}

/// Builder for a `Bearer` challenge
///
/// ```
/// use authgate::metadata::WwwAuthenticate;
///
/// let header = WwwAuthenticate::new("MCP Server", "https://mcp.example.com/.well-known/oauth-protected-resource")
///     .with_error("invalid_token")
///     .build();
/// assert!(header.starts_with("Bearer realm=\"MCP Server\""));
/// assert!(header.ends_with("error=\"invalid_token\""));
/// ```
#[derive(Debug, Clone, Default)]
pub struct WwwAuthenticate {
    realm: String,
    metadata_uri: String,
    scope: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

impl WwwAuthenticate {
    /// Challenge pointing at the resource metadata document
    pub fn new(realm: impl Into<String>, metadata_uri: impl Into<String>) -> Self {
        Self {
            realm: realm.into(),
            metadata_uri: metadata_uri.into(),
            ..Self::default()
        }
    }

    /// Scope the client should request
    #[must_use]
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// RFC 6750 error code
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Human-readable detail
    #[must_use]
    pub fn with_error_description(mut self, description: impl Into<String>) -> Self {
        self.error_description = Some(description.into());
        self
    }

    /// Header value
    pub fn build(&self) -> String {
        let mut parts = vec![
            format!("realm=\"{}\"", quote(&self.realm)),
            format!("resource=\"{}\"", quote(&self.metadata_uri)),
            format!("resource_metadata=\"{}\"", quote(&self.metadata_uri)),
        ];
        if let Some(scope) = &self.scope {
            parts.push(format!("scope=\"{}\"", quote(scope)));
        }
        if let Some(error) = &self.error {
            parts.push(format!("error=\"{}\"", quote(error)));
        }
        if let Some(description) = &self.error_description {
            parts.push(format!("error_description=\"{}\"", quote(description)));
        }
        format!("Bearer {}", parts.join(", "))
    }
}

fn quote(value: &str) -> String {
    value
        .chars()
        .filter(|c| !c.is_control())
        .flat_map(|c| match c {
            '"' | '\\' => vec!['\\', c],
            c => vec![c],
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const METADATA: &str = "https://mcp.example.com/.well-known/oauth-protected-resource";

    #[test]
    fn test_bare_challenge() {
        assert_eq!(
            WwwAuthenticate::new("MCP Server", METADATA).build(),
            format!(
                "Bearer realm=\"MCP Server\", resource=\"{METADATA}\", resource_metadata=\"{METADATA}\""
            )
        );
    }

    #[test]
    fn test_challenge_with_error() {
        let header = WwwAuthenticate::new("MCP Server", METADATA)
            .with_scope("mcp:write")
            .with_error("insufficient_scope")
            .with_error_description("needs \"mcp:write\"")
            .build();
        assert!(header.contains("scope=\"mcp:write\""));
        assert!(header.contains("error=\"insufficient_scope\""));
        assert!(header.contains(r#"error_description="needs \"mcp:write\"""#));
    }

    #[test]
    fn test_control_characters_dropped() {
        let header = WwwAuthenticate::new("evil\r\nSet-Cookie: x", METADATA).build();
        assert!(!header.contains('\r'));
        assert!(!header.contains('\n'));
    }
}
