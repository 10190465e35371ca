//! RFC 8707 resource identifiers
//!
//! Tokens are bound to a resource by its canonical URI. Both sides of every
//! comparison (the configured resource, a client's `resource` parameter, a
//! token's `aud`) go through [`validate_resource_uri`] first, so
//! `HTTPS://MCP.Example.com:443/mcp/` and `https://mcp.example.com/mcp` are the
//! same resource.

use thiserror::Error;
use url::Url;

/// Why a resource URI was refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    /// Not an absolute URI
    #[error("invalid resource URI format: {0}")]
    Malformed(String),
    /// Not http(s), or http to a non-loopback host
    #[error("resource URI must use https scheme (http only allowed for localhost), got: {0}")]
    Scheme(String),
    /// No host component
    #[error("resource URI must have a valid host")]
    MissingHost,
    /// Contains `#...`
    #[error("resource URI must not contain fragment (#)")]
    Fragment,
}

/// Validate a resource URI and return its canonical form
///
/// Canonical form is lowercase scheme and host, the port only when it is not
/// the scheme default, and the path without a trailing slash (a bare `/` is
/// kept). Query strings are dropped.
///
/// # Errors
///
/// Returns [`ResourceError`] if the URI is not absolute, uses a scheme other
/// than https (or http to a loopback host), has no host, or has a fragment.
///
/// # Examples
///
/// ```rust
/// use authgate::resource::validate_resource_uri;
///
/// assert_eq!(
///     validate_resource_uri("HTTPS://MCP.EXAMPLE.COM:443/mcp/").unwrap(),
///     "https://mcp.example.com/mcp"
/// );
/// assert!(validate_resource_uri("http://mcp.example.com/mcp").is_err());
/// ```
pub fn validate_resource_uri(uri: &str) -> Result<String, ResourceError> {
    let url = Url::parse(uri).map_err(|e| ResourceError::Malformed(e.to_string()))?;

    match url.scheme() {
        "https" => {}
        "http" => {
            if let Some(host) = url.host_str()
                && !matches!(host, "localhost" | "127.0.0.1" | "[::1]")
            {
                return Err(ResourceError::Scheme(format!("http://{host}")));
            }
        }
        scheme => return Err(ResourceError::Scheme(scheme.to_string())),
    }

    let host = url.host_str().ok_or(ResourceError::MissingHost)?;
    if url.fragment().is_some() {
        return Err(ResourceError::Fragment);
    }

    // Url already lowercases scheme and host and elides default ports
    let port = url.port().map(|p| format!(":{p}")).unwrap_or_default();
    let path = match url.path() {
        "/" => "/",
        path => path.trim_end_matches('/'),
    };

    Ok(format!("{}://{}{port}{path}", url.scheme(), host.to_lowercase()))
}

/// Whether two resource URIs name the same resource
///
/// Unparseable input never matches.
pub fn same_resource(a: &str, b: &str) -> bool {
    match (validate_resource_uri(a), validate_resource_uri(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
