use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use burrow_server::{
    Authenticator, FileStoreProvider, HttpPlane, MemoryStoreProvider, ServerConfig,
    SessionConfig, SessionContext, SessionRegistry, StoreProvider,
};

/// Tunnel broker - exposes local servers through a persistent WebSocket
#[derive(Parser, Debug)]
#[command(name = "burrow-server")]
#[command(about = "Reverse tunnel broker over WebSocket")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "server.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("burrow_server=info".parse()?)
                .add_directive("burrow_protocol=info".parse()?),
        )
        .init();

    let args = Args::parse();
    tracing::info!("Starting tunnel broker with config: {}", args.config);

    // Load and resolve configuration (resolves the auth token)
    let config = ServerConfig::load_and_resolve(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config))?;

    tracing::info!("Base domain: {}", config.base_domain);
    tracing::info!("Environment: {:?}", config.env);

    let stores: Arc<dyn StoreProvider> = match &config.state_dir {
        Some(dir) => {
            tracing::info!("Session state directory: {}", dir.display());
            FileStoreProvider::new(dir)
                .with_context(|| format!("Failed to open state directory {}", dir.display()))?
        }
        None => {
            tracing::warn!("No state directory configured, session state is kept in memory");
            MemoryStoreProvider::new()
        }
    };

    let auth = Authenticator::new(config.auth_token);
    let registry = SessionRegistry::new(SessionContext {
        auth: auth.clone(),
        stores,
        config: SessionConfig::default(),
    });

    let http_plane = HttpPlane::new(registry, auth, config.base_domain, config.env);

    tracing::info!("Starting HTTP plane on {}", config.listen_addr);

    tokio::select! {
        result = http_plane.run(config.listen_addr) => {
            tracing::error!("HTTP plane stopped: {:?}", result);
            result?;
        }
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received, cleaning up...");
        }
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}
