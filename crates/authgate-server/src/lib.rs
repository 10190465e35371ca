//! # authgate-server
//!
//! The `authgate` binary: loads one configuration file holding the broker
//! sections plus `[server]` and `[logging]`, installs logging, and serves the
//! broker with a demo resource behind it.
//!
//! ```text
//! authgate --config /etc/authgate/authgate.toml -v
//! AUTHGATE_PROVIDER__CLIENT_SECRET=... authgate --bind 0.0.0.0:3000
//! ```

pub mod cli;
pub mod demo;
pub mod logging;
pub mod settings;

use authgate::BrokerState;
use axum::{Router, http::StatusCode};
use tower_http::timeout::TimeoutLayer;
use tracing::{info, warn};

use crate::settings::ListenConfig;

/// Broker routes plus the demo resource, under a request deadline
pub fn build_app(state: BrokerState, listen: &ListenConfig) -> Router {
    let resource = demo::routes(&state.config().resource_path);
    authgate::router::app(state, resource).layer(TimeoutLayer::with_status_code(
        StatusCode::REQUEST_TIMEOUT,
        listen.request_timeout(),
    ))
}

/// Resolves on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Ctrl+C received, shutting down"),
        () = terminate => info!("SIGTERM received, shutting down"),
    }
}
