//! Redaction of credentials before they reach a log line
//!
//! Codes and continuation states may be logged as-is. Token values,
//! `Authorization` and `Cookie` headers, client secrets and code verifiers
//! never are; log a [`fingerprint`] when a value needs to be correlated.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Placeholder written in place of a secret
pub const REDACTED: &str = "[REDACTED]";

/// Field names whose values are always redacted (compared case-insensitively)
pub const SENSITIVE_KEYS: [&str; 12] = [
    "authorization",
    "cookie",
    "set-cookie",
    "access_token",
    "refresh_token",
    "id_token",
    "client_secret",
    "code_verifier",
    "password",
    "secret",
    "token",
    "api_key",
];

static JWT_LIKE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"eyJ[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+\.[A-Za-z0-9_-]*")
        .expect("Invalid JWT redaction pattern")
});

static BEARER_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bbearer\s+[A-Za-z0-9._~+/=-]+").expect("Invalid bearer redaction pattern")
});

/// Whether a field name carries a credential
pub fn is_sensitive_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    SENSITIVE_KEYS.iter().any(|s| key == *s)
        || key.ends_with("_token")
        || key.ends_with("_secret")
}

/// Replace the values of sensitive fields, recursively
pub fn sanitize_fields(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let v = if is_sensitive_key(k) {
                        Value::String(REDACTED.to_string())
                    } else {
                        sanitize_fields(v)
                    };
                    (k.clone(), v)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_fields).collect()),
        other => other.clone(),
    }
}

/// Strip JWTs and bearer credentials from free text such as an upstream error body
pub fn scrub(text: &str) -> String {
    let text = BEARER_VALUE.replace_all(text, format!("Bearer {REDACTED}"));
    JWT_LIKE.replace_all(&text, REDACTED).into_owned()
}

/// Short SHA-256 prefix for correlating a secret across log lines
pub fn fingerprint(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    digest[..6].iter().map(|b| format!("{b:02x}")).collect()
}

/// Display wrapper that never prints its contents
#[derive(Clone, Copy)]
pub struct Redacted<T>(pub T);

impl<T> fmt::Display for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl<T> fmt::Debug for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sanitize_fields_nested() {
        let input = json!({
            "error": "invalid_grant",
            "access_token": "ya29.secret",
            "nested": {"Client_Secret": "shh", "ok": 1},
            "list": [{"id_token": "eyJ..."}, {"scope": "openid"}],
        });
        let out = sanitize_fields(&input);
        assert_eq!(out["error"], "invalid_grant");
        assert_eq!(out["access_token"], REDACTED);
        assert_eq!(out["nested"]["Client_Secret"], REDACTED);
        assert_eq!(out["nested"]["ok"], 1);
        assert_eq!(out["list"][0]["id_token"], REDACTED);
        assert_eq!(out["list"][1]["scope"], "openid");
    }

    #[test]
    fn test_sensitive_key_suffixes() {
        assert!(is_sensitive_key("Authorization"));
        assert!(is_sensitive_key("upstream_refresh_token"));
        assert!(is_sensitive_key("hmac_secret"));
        assert!(!is_sensitive_key("state"));
        assert!(!is_sensitive_key("code"));
    }

    #[test]
    fn test_scrub_free_text() {
        let text = "upstream said: Bearer abc.def-123 and eyJhbGciOi.eyJzdWIiOiIx.c2ln end";
        let out = scrub(text);
        assert!(!out.contains("abc.def-123"));
        assert!(!out.contains("eyJzdWIiOiIx"));
        assert!(out.ends_with("end"));
    }

    #[test]
    fn test_fingerprint_is_stable_and_short() {
        assert_eq!(fingerprint("token"), fingerprint("token"));
        assert_ne!(fingerprint("token"), fingerprint("other"));
        assert_eq!(fingerprint("token").len(), 12);
    }

    #[test]
    fn test_redacted_hides_value() {
        let wrapped = Redacted("super-secret");
        assert_eq!(wrapped.to_string(), REDACTED);
        assert_eq!(format!("{wrapped:?}"), REDACTED);
    }
}
