//! # authgate - OAuth 2.1 Authorization Broker
//!
//! An authorization server that sits in front of a protected resource (an MCP
//! endpoint, typically) and delegates user sign-in to an upstream OpenID
//! Connect provider. Clients run a standard OAuth 2.1 authorization code flow
//! with PKCE against the broker; the broker runs its own confidential flow
//! against the provider and hands the client a token bound to the resource.
//!
//! ## Flow
//!
//! ```text
//! client ─/authorize─▶ broker ─302─▶ provider ─302─▶ {callback_path}
//!        ◀──302 code── {callback_path}/{provider} ◀─302─┘
//! client ─/token──────▶ broker  (PKCE + resource checks, JWT minted)
//! client ─Bearer──────▶ protected resource (gate + verify)
//! ```
//!
//! ## Architecture
//!
//! - [`gate`] - Request admission: shield, bot detection, token buckets
//! - [`redirect`] - Closed set of accepted redirect URI shapes
//! - [`pkce`] - S256 challenge validation and verification
//! - [`resource`] - RFC 8707 resource identifier canonicalization
//! - [`continuation`] - HMAC-signed state carried through the provider
//! - [`store`] - Single-use grant storage with expiry
//! - [`provider`] - Upstream OIDC provider client
//! - [`verify`] / [`jwks`] - Bearer token verification
//! - [`authorize`], [`callback`], [`exchange`], [`token`] - Flow endpoints
//! - [`gateway`] - Middleware for the protected resource
//! - [`metadata`] - RFC 9728 / RFC 8414 discovery documents
//! - [`router`] - Route table
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use authgate::{BrokerConfig, BrokerState, Authenticated, router::app};
//! use axum::{Router, routing::post};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BrokerConfig::from_file("authgate.toml")?;
//! let state = BrokerState::new(config)?;
//!
//! let mcp = Router::new().route(
//!     "/mcp",
//!     post(|Authenticated(auth): Authenticated| async move { auth.client_id }),
//! );
//!
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
//! // The gate keys rate limits on the peer address
//! let service = app(state, mcp).into_make_service_with_connect_info::<std::net::SocketAddr>();
//! axum::serve(listener, service).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Standards
//!
//! - **RFC 6749** / **OAuth 2.1** - Authorization code grant
//! - **RFC 7636** - PKCE (S256 only)
//! - **RFC 6750** - Bearer token usage
//! - **RFC 8707** - Resource indicators
//! - **RFC 8414** - Authorization server metadata
//! - **RFC 9728** - Protected resource metadata

pub mod authorize;
pub mod callback;
pub mod config;
pub mod continuation;
pub mod error;
pub mod exchange;
pub mod gate;
pub mod gateway;
pub mod grant;
pub mod jwks;
pub mod metadata;
pub mod pkce;
pub mod provider;
pub mod redact;
pub mod redirect;
pub mod resource;
mod response;
pub mod router;
pub mod state;
pub mod store;
pub mod token;
pub mod verify;

#[doc(inline)]
pub use config::{BrokerConfig, ConfigError, ProviderConfig, SecurityConfig, TokenConfig};

#[doc(inline)]
pub use error::{BrokerError, BrokerResult};

#[doc(inline)]
pub use gate::{DenyReason, GateMode, GateProfile, RequestFacts, SecurityDecision, SecurityGate};

#[doc(inline)]
pub use gateway::{Authenticated, require_bearer};

#[doc(inline)]
pub use state::{BrokerState, BrokerStateBuilder};

#[doc(inline)]
pub use verify::{AuthInfo, BearerTokenVerifier, VerifyError};
