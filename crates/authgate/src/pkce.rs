//! PKCE (RFC 7636), S256 only
//!
//! `plain` is refused everywhere: at the authorization endpoint as a
//! challenge method and implicitly when a challenge arrives without a method.

use std::fmt;
use std::str::FromStr;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

/// PKCE failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PkceError {
    /// `code_challenge_method` other than `S256`
    #[error("code_challenge_method must be S256, got `{0}`")]
    UnsupportedMethod(String),
    /// Challenge is not 43-128 base64url characters
    #[error("code_challenge is malformed")]
    MalformedChallenge,
    /// Verifier is not 43-128 unreserved characters
    #[error("code_verifier is malformed")]
    MalformedVerifier,
    /// Verifier does not hash to the stored challenge
    #[error("code_verifier does not match code_challenge")]
    Mismatch,
}

/// Supported challenge method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CodeChallengeMethod {
    /// `BASE64URL(SHA256(verifier))`
    #[default]
    S256,
}

impl CodeChallengeMethod {
    /// Wire name
    pub fn as_str(self) -> &'static str {
        "S256"
    }
}

impl fmt::Display for CodeChallengeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CodeChallengeMethod {
    type Err = PkceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "S256" => Ok(Self::S256),
            other => Err(PkceError::UnsupportedMethod(other.to_string())),
        }
    }
}

const MIN_LEN: usize = 43;
const MAX_LEN: usize = 128;

/// Check a client-supplied challenge is shaped like an S256 digest encoding
///
/// # Errors
///
/// Returns [`PkceError::MalformedChallenge`] on bad length or alphabet.
pub fn validate_challenge(challenge: &str) -> Result<(), PkceError> {
    let ok = (MIN_LEN..=MAX_LEN).contains(&challenge.len())
        && challenge
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if ok { Ok(()) } else { Err(PkceError::MalformedChallenge) }
}

fn validate_verifier(verifier: &str) -> Result<(), PkceError> {
    let ok = (MIN_LEN..=MAX_LEN).contains(&verifier.len())
        && verifier
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~'));
    if ok { Ok(()) } else { Err(PkceError::MalformedVerifier) }
}

/// S256 challenge for a verifier
pub fn s256_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Verify a code verifier against the stored challenge
///
/// # Errors
///
/// Returns [`PkceError::MalformedVerifier`] or [`PkceError::Mismatch`].
pub fn verify_s256(verifier: &str, challenge: &str) -> Result<(), PkceError> {
    validate_verifier(verifier)?;
    let computed = s256_challenge(verifier);
    if bool::from(computed.as_bytes().ct_eq(challenge.as_bytes())) {
        Ok(())
    } else {
        Err(PkceError::Mismatch)
    }
}
