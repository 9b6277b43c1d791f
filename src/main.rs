mod accrual;
mod api;
mod bootstrap;
mod config;
mod error;
mod ledger;
mod reconcile;
mod server;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,tower_http=debug,server=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Cancel `shutdown` on Ctrl-C or SIGTERM
async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = shutdown.cancelled() => return,
    }

    info!("🛑 Shutdown signal received");
    shutdown.cancel();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("🚀 Starting loyalty ledger");

    let config = config::Config::load().context("invalid configuration")?;

    let components = bootstrap::initialize_app_state(&config)
        .await
        .context("failed to initialize application")?;

    let shutdown = CancellationToken::new();

    let dispatcher = components
        .dispatcher
        .start(components.new_orders, shutdown.clone());
    info!("✅ Reconciliation dispatcher started");

    tokio::spawn(wait_for_signal(shutdown.clone()));

    let app = server::create_app(components.state);

    let served = server::run_server(app, &config.bind_address, shutdown.clone()).await;

    // Stop reconciliation even if the server failed on its own
    shutdown.cancel();
    if let Err(e) = dispatcher.await {
        error!("Reconciliation dispatcher panicked: {}", e);
    }

    served.context("HTTP server failed")?;
    info!("👋 Shutdown complete");
    Ok(())
}
