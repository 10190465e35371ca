//! Client redirect URI validation
//!
//! OAuth 2.1 forbids wildcard redirect URIs, but CLI and editor clients listen
//! on ephemeral loopback ports. Instead of wildcards the validator accepts a
//! closed set of URI *shapes*, each a [`RedirectUriClass`]. Anything outside
//! the set is rejected before a code is minted or a redirect is issued.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

/// Exact URIs registered for first-party clients
pub const FIXED_REDIRECT_URIS: [&str; 6] = [
    "http://127.0.0.1:3334/oauth/callback",
    "http://localhost:3334/oauth/callback",
    "http://127.0.0.1:33418/",
    "http://localhost:33418/",
    "http://localhost:3000/api/auth/callback",
    "http://127.0.0.1:3000/api/auth/callback",
];

static LOOPBACK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^http://(?:127\.0\.0\.1|localhost):([1-9][0-9]{0,4})(/|/oauth/callback|/api/auth/callback)$")
        .expect("Invalid loopback redirect pattern")
});

static EDITOR_DEEP_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(vscode|vscode-insiders)://[A-Za-z0-9][A-Za-z0-9._-]*(?:/[^\s#?]*)?(?:\?[^\s#]*)?$")
        .expect("Invalid editor deep link pattern")
});

/// Editor release channel of a deep link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EditorChannel {
    /// `vscode://`
    Stable,
    /// `vscode-insiders://`
    Insiders,
}

/// Accepted redirect URI shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RedirectUriClass {
    /// One of [`FIXED_REDIRECT_URIS`]
    Fixed,
    /// `http://{127.0.0.1|localhost}:{port}/`
    LoopbackRoot,
    /// `http://{127.0.0.1|localhost}:{port}/oauth/callback`
    LoopbackOAuthCallback,
    /// `http://{127.0.0.1|localhost}:{port}/api/auth/callback`
    LoopbackLocalDev,
    /// `vscode://…` or `vscode-insiders://…`
    EditorDeepLink(EditorChannel),
}

impl RedirectUriClass {
    /// Whether the URI targets the local machine over HTTP
    pub fn is_loopback(self) -> bool {
        !matches!(self, Self::EditorDeepLink(_))
    }
}

/// Classify a redirect URI, or `None` if it is not acceptable
pub fn classify(uri: &str) -> Option<RedirectUriClass> {
    if FIXED_REDIRECT_URIS.contains(&uri) {
        return Some(RedirectUriClass::Fixed);
    }

    if let Some(caps) = LOOPBACK.captures(uri) {
        let port: u32 = caps[1].parse().ok()?;
        if port > u32::from(u16::MAX) {
            return None;
        }
        return match &caps[2] {
            "/" => Some(RedirectUriClass::LoopbackRoot),
            "/oauth/callback" => Some(RedirectUriClass::LoopbackOAuthCallback),
            _ => Some(RedirectUriClass::LoopbackLocalDev),
        };
    }

    let caps = EDITOR_DEEP_LINK.captures(uri)?;
    let channel = match &caps[1] {
        "vscode" => EditorChannel::Stable,
        _ => EditorChannel::Insiders,
    };
    Some(RedirectUriClass::EditorDeepLink(channel))
}

/// Whether a redirect URI is acceptable
pub fn is_valid(uri: &str) -> bool {
    classify(uri).is_some()
}
