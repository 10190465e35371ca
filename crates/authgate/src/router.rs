//! Route table
//!
//! | route                                       | gate        |
//! |---------------------------------------------|-------------|
//! | `GET /authorize`                            | `oauth`     |
//! | `GET\|POST {callback_path}`                 | `oauth`     |
//! | `GET\|POST {callback_path}/{provider}`      | `oauth`     |
//! | `POST /token`                               | `oauth`     |
//! | `GET /.well-known/oauth-protected-resource` | `discovery` |
//! | `GET /.well-known/oauth-authorization-server` | `discovery` |
//! | `GET /health`                               | `discovery` |
//!
//! The protected resource itself is mounted by the embedder through
//! [`protect`].

use axum::{
    Router,
    http::{HeaderName, Method, header},
    middleware,
    routing::{get, post},
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::authorize::authorize;
use crate::callback::{callback_get, callback_post};
use crate::exchange::{exchange_get, exchange_post};
use crate::gateway::{gate_discovery, gate_oauth, require_bearer};
use crate::metadata::{authorization_server_metadata, protected_resource_metadata};
use crate::state::BrokerState;
use crate::token::token;

/// Permissive CORS for browser-based clients
///
/// `WWW-Authenticate` and `Retry-After` are exposed so a client can read the
/// challenge and back off.
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static("mcp-protocol-version"),
        ])
        .expose_headers([header::WWW_AUTHENTICATE, header::RETRY_AFTER])
}

/// OAuth and discovery endpoints with CORS and request tracing
pub fn router(state: BrokerState) -> Router {
    with_http_layers(broker_routes(state))
}

/// Broker endpoints plus the protected `resource` routes
pub fn app(state: BrokerState, resource: Router) -> Router {
    let protected = protect(resource, &state);
    with_http_layers(broker_routes(state).merge(protected))
}

/// Put `routes` behind bearer authentication for the broker's resource
///
/// Unmatched paths fall through to a plain `404`.
pub fn protect(routes: Router, state: &BrokerState) -> Router {
    routes.route_layer(middleware::from_fn_with_state(state.clone(), require_bearer))
}

fn with_http_layers(router: Router) -> Router {
    router
        .layer(cors_layer())
        .layer(TraceLayer::new_for_http())
}

/// OAuth, discovery and health endpoints, each behind its gate profile
pub fn broker_routes(state: BrokerState) -> Router {
    let callback_path = state.config().callback_path.clone();
    let exchange_path = format!("{}/{{provider}}", callback_path.trim_end_matches('/'));

    let oauth = Router::new()
        .route("/authorize", get(authorize))
        .route(&callback_path, get(callback_get).post(callback_post))
        .route(&exchange_path, get(exchange_get).post(exchange_post))
        .route("/token", post(token))
        .route_layer(middleware::from_fn_with_state(state.clone(), gate_oauth));

    let discovery = Router::new()
        .route(
            "/.well-known/oauth-protected-resource",
            get(protected_resource_metadata),
        )
        .route(
            "/.well-known/oauth-authorization-server",
            get(authorization_server_metadata),
        )
        .route("/health", get(health))
        .route_layer(middleware::from_fn_with_state(state.clone(), gate_discovery));

    Router::new()
        .merge(oauth)
        .merge(discovery)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
