//! authgate entry point

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use authgate::{BrokerConfig, BrokerState, store::spawn_sweeper};
use authgate_server::{build_app, cli::Cli, settings::ServerSettings, shutdown_signal};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = ServerSettings::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    let settings = cli.apply(settings);
    let _guard = settings
        .logging
        .init()
        .context("failed to initialize logging")?;

    let config = BrokerConfig::from_file(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    let state = BrokerState::new(config).context("invalid broker configuration")?;

    info!(
        resource = %state.resource(),
        provider = %state.config().provider.name,
        mode = ?state.config().security.mode,
        "broker configured"
    );
    if cli.check {
        return Ok(());
    }

    let listener = TcpListener::bind(settings.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", settings.server.bind))?;
    info!(address = %settings.server.bind, "listening");

    let sweep_every = Duration::from_secs(60);
    let sweepers = [
        spawn_sweeper(state.pending().clone(), sweep_every),
        spawn_sweeper(state.authorized().clone(), sweep_every),
    ];

    let app = build_app(state, &settings.server);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    for sweeper in sweepers {
        sweeper.abort();
    }

    info!("shutdown complete");
    Ok(())
}
