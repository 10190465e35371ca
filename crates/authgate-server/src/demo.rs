//! Demo protected resource
//!
//! Answers with the identity the gateway attached to the request, which is
//! enough to check a client's flow end to end.

use authgate::{AuthInfo, Authenticated};
use axum::{Json, Router, routing::get};

/// Routes served at `path`
pub fn routes(path: &str) -> Router {
    Router::new().route(path, get(whoami).post(whoami))
}

async fn whoami(Authenticated(auth): Authenticated) -> Json<AuthInfo> {
    tracing::debug!(
        target: "authgate::gateway",
        client_id = %auth.client_id,
        "demo resource served"
    );
    Json(auth)
}
