//! Shared broker state handed to every handler and middleware

use std::sync::Arc;

use tracing::warn;

use crate::config::BrokerConfig;
use crate::continuation::ContinuationCodec;
use crate::error::{BrokerError, BrokerResult};
use crate::gate::SecurityGate;
use crate::grant::{AuthorizedGrant, PendingGrant};
use crate::jwks::JwksClient;
use crate::provider::{OidcProvider, UpstreamProvider};
use crate::store::{SharedGrantStore, authorized_grants, pending_grants};
use crate::token::AccessTokenIssuer;
use crate::verify::{BearerTokenVerifier, JwtProviderVerifier, ProviderVerifier};

/// Everything a request needs, behind one `Arc`
#[derive(Debug, Clone)]
pub struct BrokerState {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    config: BrokerConfig,
    resource: String,
    gate: SecurityGate,
    codec: ContinuationCodec,
    pending: SharedGrantStore<PendingGrant>,
    authorized: SharedGrantStore<AuthorizedGrant>,
    provider: Arc<dyn UpstreamProvider>,
    verifier: BearerTokenVerifier,
    issuer: AccessTokenIssuer,
}

impl BrokerState {
    /// Start building state for `config`
    pub fn builder(config: BrokerConfig) -> BrokerStateBuilder {
        BrokerStateBuilder {
            config,
            pending: None,
            authorized: None,
            provider: None,
            provider_verifier: None,
        }
    }

    /// State with every default collaborator
    ///
    /// # Errors
    ///
    /// See [`BrokerStateBuilder::build`].
    pub fn new(config: BrokerConfig) -> BrokerResult<Self> {
        Self::builder(config).build()
    }

    /// Validated configuration
    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    /// Canonical resource identifier
    pub fn resource(&self) -> &str {
        &self.inner.resource
    }

    /// Admission gate
    pub fn gate(&self) -> &SecurityGate {
        &self.inner.gate
    }

    /// Continuation state codec
    pub fn codec(&self) -> &ContinuationCodec {
        &self.inner.codec
    }

    /// Grants awaiting the upstream provider
    pub fn pending(&self) -> &SharedGrantStore<PendingGrant> {
        &self.inner.pending
    }

    /// Grants awaiting redemption at the token endpoint
    pub fn authorized(&self) -> &SharedGrantStore<AuthorizedGrant> {
        &self.inner.authorized
    }

    /// Upstream identity provider
    pub fn provider(&self) -> &Arc<dyn UpstreamProvider> {
        &self.inner.provider
    }

    /// Bearer token verifier for the protected resource
    pub fn verifier(&self) -> &BearerTokenVerifier {
        &self.inner.verifier
    }

    /// Access token minting
    pub fn issuer(&self) -> &AccessTokenIssuer {
        &self.inner.issuer
    }
}

/// Builder for [`BrokerState`]; anything not overridden uses the defaults
pub struct BrokerStateBuilder {
    config: BrokerConfig,
    pending: Option<SharedGrantStore<PendingGrant>>,
    authorized: Option<SharedGrantStore<AuthorizedGrant>>,
    provider: Option<Arc<dyn UpstreamProvider>>,
    provider_verifier: Option<Arc<dyn ProviderVerifier>>,
}

impl BrokerStateBuilder {
    /// Replace the pending grant store
    #[must_use]
    pub fn pending_store(mut self, store: SharedGrantStore<PendingGrant>) -> Self {
        self.pending = Some(store);
        self
    }

    /// Replace the authorized grant store
    #[must_use]
    pub fn authorized_store(mut self, store: SharedGrantStore<AuthorizedGrant>) -> Self {
        self.authorized = Some(store);
        self
    }

    /// Replace the upstream provider
    #[must_use]
    pub fn provider(mut self, provider: Arc<dyn UpstreamProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Replace signature verification for bearer tokens
    #[must_use]
    pub fn provider_verifier(mut self, verifier: Arc<dyn ProviderVerifier>) -> Self {
        self.provider_verifier = Some(verifier);
        self
    }

    /// Validate the configuration and assemble the state
    ///
    /// Defaults: the process-wide in-memory stores, an [`OidcProvider`] from
    /// `[provider]`, and a [`JwtProviderVerifier`] over `token.jwks_uri` if set,
    /// otherwise over the broker's own signing secret.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Config`] for an invalid configuration and
    /// [`BrokerError::Server`] if a default collaborator cannot be built.
    pub fn build(self) -> BrokerResult<BrokerState> {
        let config = self.config;
        config.validate()?;
        let resource = config.resource_identifier()?;

        let provider = match self.provider {
            Some(provider) => provider,
            None => Arc::new(OidcProvider::new(&config.provider)?),
        };

        let provider_verifier = match self.provider_verifier {
            Some(verifier) => verifier,
            None => default_verifier(&config)?,
        };
        let verifier = BearerTokenVerifier::new(provider_verifier, resource.clone())
            .with_required_scopes(config.token.required_scopes.clone())
            .with_timeout(config.token.verify_timeout());

        let pending: SharedGrantStore<PendingGrant> = match self.pending {
            Some(store) => store,
            None => pending_grants(),
        };
        let authorized: SharedGrantStore<AuthorizedGrant> = match self.authorized {
            Some(store) => store,
            None => authorized_grants(),
        };

        Ok(BrokerState {
            inner: Arc::new(Inner {
                gate: SecurityGate::new(&config.security),
                codec: ContinuationCodec::new(&config.state_secret),
                issuer: AccessTokenIssuer::new(&config),
                resource,
                pending,
                authorized,
                provider,
                verifier,
                config,
            }),
        })
    }
}

fn default_verifier(config: &BrokerConfig) -> BrokerResult<Arc<dyn ProviderVerifier>> {
    let leeway = std::time::Duration::from_secs(config.token.leeway_secs);
    let verifier = match &config.token.jwks_uri {
        Some(uri) => {
            let client =
                JwksClient::new(uri.as_str()).map_err(|e| BrokerError::server(e.to_string()))?;
            warn!(
                target: "authgate::state",
                jwks_uri = %uri,
                "bearer tokens verified against JWKS; tokens issued at /token will be rejected by the gateway"
            );
            let verifier = JwtProviderVerifier::with_jwks(client).with_leeway(leeway);
            match &config.token.jwks_issuer {
                Some(issuer) => verifier.with_issuer(issuer.as_str()),
                None => verifier,
            }
        }
        None => JwtProviderVerifier::with_secret(&config.token.signing_secret)
            .with_issuer(config.token_issuer())
            .with_leeway(leeway),
    };
    Ok(Arc::new(verifier))
}
