//! Grants held between the hops of the authorization flow

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pkce::CodeChallengeMethod;
use crate::provider::UpstreamIdentity;
use crate::store::Expiring;

/// A validated authorization request waiting for the upstream provider
///
/// Keyed in the store by the local authorization code. Never mutated after
/// creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingGrant {
    /// Client that started the flow
    pub client_id: String,
    /// Where the client wants the result delivered
    pub redirect_uri: String,
    /// Space-separated granted scope
    pub scope: String,
    /// Canonical resource identifier the eventual token is bound to
    pub resource: String,
    /// PKCE challenge; `None` when the client opted out
    pub code_challenge: Option<String>,
    /// PKCE method, present whenever `code_challenge` is
    pub code_challenge_method: Option<CodeChallengeMethod>,
    /// Client state, echoed back verbatim
    pub state: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Expiry, `created_at` plus the grant TTL
    pub expires_at: DateTime<Utc>,
}

impl Expiring for PendingGrant {
    fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

/// A pending grant bound to the identity the upstream provider asserted
///
/// Keyed by the client-facing code; redeemed once at the token endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizedGrant {
    /// The request this identity answers
    pub grant: PendingGrant,
    /// Who signed in
    pub identity: UpstreamIdentity,
}

impl Expiring for AuthorizedGrant {
    fn expires_at(&self) -> DateTime<Utc> {
        self.grant.expires_at
    }
}
