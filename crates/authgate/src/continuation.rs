//! Continuation state carried through the upstream provider
//!
//! The broker keeps no session between `/authorize` and the provider's
//! callback. Everything needed to resume travels in the provider's `state`
//! parameter as `base64url(json) "." base64url(hmac_sha256(json))`. The
//! provider treats it as opaque and does not protect it, so the MAC does.
//!
//! Decoding fails closed: any structural problem, a bad tag, an unknown field
//! or an empty required field rejects the whole callback.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use ring::hmac;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest encoded state accepted
pub const MAX_ENCODED_LEN: usize = 4096;

/// Why a continuation state was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContinuationError {
    /// No `state` parameter on the callback
    #[error("state parameter missing")]
    Missing,
    /// Longer than [`MAX_ENCODED_LEN`]
    #[error("state exceeds {MAX_ENCODED_LEN} bytes")]
    TooLong,
    /// Not `payload.tag`
    #[error("state is not a payload.tag pair")]
    Malformed,
    /// Either half is not base64url
    #[error("state is not base64url")]
    Encoding,
    /// Tag does not authenticate the payload
    #[error("state integrity check failed")]
    BadSignature,
    /// Payload is not the expected JSON object
    #[error("state payload invalid: {0}")]
    Payload(String),
    /// A required field is empty
    #[error("state field `{0}` is empty")]
    EmptyField(&'static str),
    /// The local authorization code no longer resolves
    #[error("authorization code unknown or expired")]
    UnknownCode,
    /// The state names a different flow than the stored grant
    #[error("state does not match the stored grant")]
    Mismatch,
}

/// Flow context restored on the callback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContinuationState {
    /// Local authorization code keying the pending grant
    pub code: String,
    /// Client's original `state`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// Client's original redirect URI
    pub redirect_uri: String,
    /// Redirect URI registered with the provider for this flow
    pub provider_redirect_uri: String,
    /// Canonical resource identifier
    pub resource: String,
}

impl ContinuationState {
    fn check_required(&self) -> Result<(), ContinuationError> {
        for (name, value) in [
            ("code", &self.code),
            ("redirect_uri", &self.redirect_uri),
            ("provider_redirect_uri", &self.provider_redirect_uri),
            ("resource", &self.resource),
        ] {
            if value.is_empty() {
                return Err(ContinuationError::EmptyField(name));
            }
        }
        Ok(())
    }
}

/// Encodes and authenticates continuation states
#[derive(Clone)]
pub struct ContinuationCodec {
    key: hmac::Key,
}

impl std::fmt::Debug for ContinuationCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContinuationCodec").finish_non_exhaustive()
    }
}

impl ContinuationCodec {
    /// Create a codec keyed by the broker's state secret
    pub fn new(secret: &SecretString) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret.expose_secret().as_bytes()),
        }
    }

    /// Serialize and sign
    ///
    /// # Errors
    ///
    /// Returns [`ContinuationError::Payload`] if serialization fails.
    pub fn encode(&self, state: &ContinuationState) -> Result<String, ContinuationError> {
        let json =
            serde_json::to_vec(state).map_err(|e| ContinuationError::Payload(e.to_string()))?;
        let tag = hmac::sign(&self.key, &json);
        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&json),
            URL_SAFE_NO_PAD.encode(tag.as_ref())
        ))
    }

    /// Verify and deserialize
    ///
    /// # Errors
    ///
    /// Returns a [`ContinuationError`] describing the first check that failed.
    pub fn decode(&self, encoded: &str) -> Result<ContinuationState, ContinuationError> {
        if encoded.is_empty() {
            return Err(ContinuationError::Missing);
        }
        if encoded.len() > MAX_ENCODED_LEN {
            return Err(ContinuationError::TooLong);
        }

        let (payload, tag) = encoded.split_once('.').ok_or(ContinuationError::Malformed)?;
        if payload.is_empty() || tag.is_empty() || tag.contains('.') {
            return Err(ContinuationError::Malformed);
        }

        let json = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| ContinuationError::Encoding)?;
        let tag = URL_SAFE_NO_PAD
            .decode(tag)
            .map_err(|_| ContinuationError::Encoding)?;

        hmac::verify(&self.key, &json, &tag).map_err(|_| ContinuationError::BadSignature)?;

        let state: ContinuationState =
            serde_json::from_slice(&json).map_err(|e| ContinuationError::Payload(e.to_string()))?;
        state.check_required()?;
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> ContinuationCodec {
        ContinuationCodec::new(&SecretString::new("0123456789abcdef0123456789abcdef".into()))
    }

    fn sample() -> ContinuationState {
        ContinuationState {
            code: "local-code".into(),
            state: Some("client-state".into()),
            redirect_uri: "http://127.0.0.1:54321/oauth/callback".into(),
            provider_redirect_uri: "https://mcp.example.com/callback".into(),
            resource: "https://mcp.example.com/mcp".into(),
        }
    }

    fn sign_raw(codec: &ContinuationCodec, json: &str) -> String {
        let tag = hmac::sign(&codec.key, json.as_bytes());
        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(json),
            URL_SAFE_NO_PAD.encode(tag.as_ref())
        )
    }

    #[test]
    fn test_decodes_what_it_encodes() {
        let codec = codec();
        let encoded = codec.encode(&sample()).unwrap();
        assert!(encoded.bytes().all(|b| b.is_ascii_alphanumeric() || b"-_.".contains(&b)));
        assert_eq!(codec.decode(&encoded).unwrap(), sample());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let codec = codec();
        let encoded = codec.encode(&sample()).unwrap();
        let (_, tag) = encoded.split_once('.').unwrap();

        let mut forged = sample();
        forged.redirect_uri = "http://127.0.0.1:9999/".into();
        let forged_json = serde_json::to_vec(&forged).unwrap();
        let spliced = format!("{}.{tag}", URL_SAFE_NO_PAD.encode(forged_json));

        assert_eq!(codec.decode(&spliced), Err(ContinuationError::BadSignature));
    }

    #[test]
    fn test_other_key_rejected() {
        let encoded = codec().encode(&sample()).unwrap();
        let other = ContinuationCodec::new(&SecretString::new("x".repeat(32)));
        assert_eq!(other.decode(&encoded), Err(ContinuationError::BadSignature));
    }

    #[test]
    fn test_structural_failures() {
        let codec = codec();
        assert_eq!(codec.decode(""), Err(ContinuationError::Missing));
        assert_eq!(codec.decode("no-separator"), Err(ContinuationError::Malformed));
        assert_eq!(codec.decode(".tag"), Err(ContinuationError::Malformed));
        assert_eq!(codec.decode("a.b.c"), Err(ContinuationError::Malformed));
        assert_eq!(codec.decode("***.abc"), Err(ContinuationError::Encoding));
        assert_eq!(
            codec.decode(&"a".repeat(MAX_ENCODED_LEN + 1)),
            Err(ContinuationError::TooLong)
        );
    }

    #[test]
    fn test_signed_but_invalid_payloads_rejected() {
        let codec = codec();

        let missing_resource = r#"{"code":"c","redirect_uri":"r","provider_redirect_uri":"p"}"#;
        assert!(matches!(
            codec.decode(&sign_raw(&codec, missing_resource)),
            Err(ContinuationError::Payload(_))
        ));

        let empty_code = r#"{"code":"","redirect_uri":"r","provider_redirect_uri":"p","resource":"x"}"#;
        assert_eq!(
            codec.decode(&sign_raw(&codec, empty_code)),
            Err(ContinuationError::EmptyField("code"))
        );

        let extra = r#"{"code":"c","redirect_uri":"r","provider_redirect_uri":"p","resource":"x","admin":true}"#;
        assert!(matches!(
            codec.decode(&sign_raw(&codec, extra)),
            Err(ContinuationError::Payload(_))
        ));

        assert!(matches!(
            codec.decode(&sign_raw(&codec, "[1,2,3]")),
            Err(ContinuationError::Payload(_))
        ));
    }

    #[test]
    fn test_absent_client_state_round_trips() {
        let codec = codec();
        let state = ContinuationState {
            state: None,
            ..sample()
        };
        let decoded = codec.decode(&codec.encode(&state).unwrap()).unwrap();
        assert_eq!(decoded.state, None);
    }
}
